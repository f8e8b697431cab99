use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cartograph_cache::Cache;
use cartograph_store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::Disks;

const PROBE_DEADLINE: Duration = Duration::from_secs(2);
const DISK_USED_THRESHOLD: f64 = 0.90;
const DISK_FREE_FLOOR_BYTES: u64 = 1_000_000_000;
const MEMORY_USED_THRESHOLD: f64 = 0.90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub message: String,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: OverallHealth,
    pub components: HashMap<String, ComponentHealth>,
}

/// Runs independent component probes in parallel, each bounded by its own
/// deadline so a wedged dependency can't stall the others.
pub struct HealthProbe {
    store: Arc<Store>,
    cache: Arc<Cache>,
}

impl HealthProbe {
    pub fn new(store: Arc<Store>, cache: Arc<Cache>) -> Self {
        Self { store, cache }
    }

    pub async fn check_all(&self) -> HealthReport {
        let (store, cache, disk, memory) = tokio::join!(
            probe("store", self.check_store()),
            probe("cache", self.check_cache()),
            probe("disk", check_disk()),
            probe("memory", check_memory()),
        );

        let mut components = HashMap::new();
        components.insert("store".to_string(), store);
        components.insert("cache".to_string(), cache);
        components.insert("disk".to_string(), disk);
        components.insert("memory".to_string(), memory);

        let overall = if components.values().all(|c| c.healthy) {
            OverallHealth::Healthy
        } else {
            OverallHealth::Degraded
        };

        HealthReport { overall, components }
    }

    /// Always true if the process is responding at all.
    pub fn liveness(&self) -> bool {
        true
    }

    pub async fn readiness(&self) -> bool {
        matches!(self.check_all().await.overall, OverallHealth::Healthy)
    }

    async fn check_store(&self) -> Result<String, String> {
        self.store
            .next_id("__health_probe__")
            .map(|_| "round-trip ok".to_string())
            .map_err(|e| e.to_string())
    }

    async fn check_cache(&self) -> Result<String, String> {
        self.cache
            .statistics()
            .map(|stats| format!("{} entries", stats.entries))
            .map_err(|e| e.to_string())
    }
}

async fn probe<F>(name: &str, fut: F) -> ComponentHealth
where
    F: std::future::Future<Output = Result<String, String>>,
{
    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(PROBE_DEADLINE, fut).await;
    let latency_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(message)) => ComponentHealth {
            healthy: true,
            latency_ms,
            message,
            last_check: Utc::now(),
        },
        Ok(Err(message)) => ComponentHealth {
            healthy: false,
            latency_ms,
            message,
            last_check: Utc::now(),
        },
        Err(_) => {
            tracing::error!(component = name, "health probe exceeded its deadline");
            ComponentHealth {
                healthy: false,
                latency_ms,
                message: "deadline exceeded".to_string(),
                last_check: Utc::now(),
            }
        }
    }
}

async fn check_disk() -> Result<String, String> {
    tokio::task::spawn_blocking(|| {
        let disks = Disks::new_with_refreshed_list();
        let Some(disk) = disks.list().first() else {
            return Err("no disks reported".to_string());
        };
        let total = disk.total_space();
        let available = disk.available_space();
        if total == 0 {
            return Err("disk reported zero total space".to_string());
        }
        let used_fraction = 1.0 - (available as f64 / total as f64);
        if used_fraction >= DISK_USED_THRESHOLD {
            return Err(format!("disk {:.1}% used", used_fraction * 100.0));
        }
        if available < DISK_FREE_FLOOR_BYTES {
            return Err(format!("only {} bytes free", available));
        }
        Ok(format!("{:.1}% used, {} bytes free", used_fraction * 100.0, available))
    })
    .await
    .map_err(|e| e.to_string())?
}

async fn check_memory() -> Result<String, String> {
    tokio::task::spawn_blocking(|| {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err("system reported zero total memory".to_string());
        }
        let used_fraction = system.used_memory() as f64 / total as f64;
        if used_fraction >= MEMORY_USED_THRESHOLD {
            return Err(format!("memory {:.1}% used", used_fraction * 100.0));
        }
        Ok(format!("{:.1}% used", used_fraction * 100.0))
    })
    .await
    .map_err(|e| e.to_string())?
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_core::ProgressBus;

    #[tokio::test]
    async fn healthy_store_and_cache_report_ok() {
        let store = Arc::new(Store::open_in_memory(ProgressBus::new()).unwrap());
        let cache = Arc::new(Cache::open_in_memory().unwrap());
        let probe = HealthProbe::new(store, cache);
        let report = probe.check_all().await;
        assert!(report.components["store"].healthy);
        assert!(report.components["cache"].healthy);
    }

    #[tokio::test]
    async fn readiness_matches_overall_health() {
        let store = Arc::new(Store::open_in_memory(ProgressBus::new()).unwrap());
        let cache = Arc::new(Cache::open_in_memory().unwrap());
        let probe = HealthProbe::new(store, cache);
        assert!(probe.readiness().await);
        assert!(probe.liveness());
    }
}
