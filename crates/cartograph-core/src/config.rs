use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine-wide configuration, merged from defaults, an optional
/// `cartograph.json` at the analyzed path's root, `CARTOGRAPH_*` environment
/// variables, and explicit caller overrides, in that precedence order —
/// the same layering shape as the teacher's `ConfigStore`, collapsed to the
/// single flat struct this system needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub provider_kind: String,
    pub provider_model: String,
    pub provider_base_url: Option<String>,
    pub ai_timeout_s: u64,
    pub ai_rate_rpm: u32,
    pub ai_rate_tpm: u64,
    pub ai_breaker_threshold: u32,
    pub ai_breaker_recovery_s: u64,
    pub max_concurrent_subsystems: usize,
    pub max_concurrent_modules: usize,
    pub max_concurrent_functions: usize,
    pub analysis_deadline_s: u64,
    pub cache_enabled: bool,
    pub source_extensions: Vec<String>,
    pub store_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_kind: "mock".to_string(),
            provider_model: "default".to_string(),
            provider_base_url: None,
            ai_timeout_s: 90,
            ai_rate_rpm: 50,
            ai_rate_tpm: 40_000,
            ai_breaker_threshold: 3,
            ai_breaker_recovery_s: 120,
            max_concurrent_subsystems: 4,
            max_concurrent_modules: 3,
            max_concurrent_functions: 10,
            analysis_deadline_s: 3600,
            cache_enabled: true,
            source_extensions: vec![
                "rs".into(),
                "py".into(),
                "ts".into(),
                "tsx".into(),
                "js".into(),
                "go".into(),
                "java".into(),
            ],
            store_path: ".cartograph/store.sqlite3".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration layering defaults < project file < environment <
    /// explicit overrides. `overrides` is typically CLI-flag-derived JSON;
    /// pass `Value::Null` when there are none.
    pub fn load(project_root: &Path, overrides: Value) -> anyhow::Result<Self> {
        let mut merged = serde_json::to_value(EngineConfig::default())?;

        let project_file = project_root.join("cartograph.json");
        if project_file.exists() {
            let text = std::fs::read_to_string(&project_file)
                .with_context(|| format!("reading {}", project_file.display()))?;
            let project_value: Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", project_file.display()))?;
            deep_merge(&mut merged, &project_value);
        }

        deep_merge(&mut merged, &env_overrides());
        deep_merge(&mut merged, &overrides);

        serde_json::from_value(merged).context("assembling effective configuration")
    }
}

fn env_overrides() -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in std::env::vars() {
        if let Some(field) = key.strip_prefix("CARTOGRAPH_") {
            let field = field.to_lowercase();
            map.insert(field, guess_json_scalar(&value));
        }
    }
    Value::Object(map)
}

fn guess_json_scalar(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(b) = raw.parse::<bool>() {
        return Value::from(b);
    }
    Value::String(raw.to_string())
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, overlay_value) if !overlay_value.is_null() => {
            *slot = overlay_value.clone();
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ai_rate_rpm, 50);
        assert_eq!(cfg.ai_rate_tpm, 40_000);
        assert_eq!(cfg.max_concurrent_subsystems, 4);
        assert_eq!(cfg.max_concurrent_modules, 3);
        assert_eq!(cfg.max_concurrent_functions, 10);
    }

    #[test]
    fn project_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cartograph.json"),
            r#"{"ai_rate_rpm": 10, "provider_kind": "vendor_a"}"#,
        )
        .unwrap();
        let cfg = EngineConfig::load(dir.path(), Value::Null).unwrap();
        assert_eq!(cfg.ai_rate_rpm, 10);
        assert_eq!(cfg.provider_kind, "vendor_a");
        assert_eq!(cfg.max_concurrent_modules, 3);
    }

    #[test]
    fn explicit_overrides_win_over_project_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cartograph.json"), r#"{"ai_rate_rpm": 10}"#).unwrap();
        let cfg = EngineConfig::load(dir.path(), serde_json::json!({"ai_rate_rpm": 999})).unwrap();
        assert_eq!(cfg.ai_rate_rpm, 999);
    }
}
