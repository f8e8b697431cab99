use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cartograph_types::{CoreError, CoreResult, Scope};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

/// Content-addressed store of prior analysis results, keyed by
/// `(file_sha256, scope, target_qualifier)`. A hit is only returned if the
/// current hash of the source path still matches the hash stored at write
/// time, which is the cache's core invariant (I4).
pub struct Cache {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(String),
    Miss,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub bytes: u64,
}

impl Cache {
    pub fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| CoreError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| CoreError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> CoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                cache_key TEXT PRIMARY KEY,
                file_sha256 TEXT NOT NULL,
                source_path TEXT NOT NULL,
                scope TEXT NOT NULL,
                target_qualifier TEXT NOT NULL,
                payload TEXT NOT NULL,
                tokens_used INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                last_access TEXT NOT NULL,
                access_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_source_path ON cache_entries(source_path);
            CREATE TABLE IF NOT EXISTS cache_stats (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );",
        )
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn sha256_file(path: &Path) -> CoreResult<String> {
        let bytes = std::fs::read(path)?;
        Ok(Self::sha256_bytes(&bytes))
    }

    pub fn sha256_bytes(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    fn cache_key(file_sha256: &str, scope: Scope, target_qualifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(file_sha256.as_bytes());
        hasher.update(scope.code().as_bytes());
        hasher.update(target_qualifier.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Looks up a cached result. Recomputes the source file's current hash
    /// and only returns a hit if it matches the hash recorded at insertion.
    pub fn lookup(&self, path: &Path, scope: Scope, target_qualifier: &str) -> CoreResult<CacheLookup> {
        let current_hash = match Self::sha256_file(path) {
            Ok(hash) => hash,
            Err(_) => return Ok(CacheLookup::Miss),
        };
        let key = Self::cache_key(&current_hash, scope, target_qualifier);
        let conn = self.conn.lock().expect("cache mutex poisoned");

        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT file_sha256, payload FROM cache_entries WHERE cache_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        match row {
            Some((stored_hash, payload)) if stored_hash == current_hash => {
                conn.execute(
                    "UPDATE cache_entries SET last_access = ?1, access_count = access_count + 1 WHERE cache_key = ?2",
                    params![Utc::now().to_rfc3339(), key],
                )
                .map_err(|e| CoreError::Storage(e.to_string()))?;
                bump_stat(&conn, "hits")?;
                Ok(CacheLookup::Hit(payload))
            }
            Some(_) => {
                // stored entry is stale relative to the current file; treat as miss
                bump_stat(&conn, "misses")?;
                Ok(CacheLookup::Miss)
            }
            None => {
                bump_stat(&conn, "misses")?;
                Ok(CacheLookup::Miss)
            }
        }
    }

    pub fn store(&self, path: &Path, scope: Scope, target_qualifier: &str, payload: &str, tokens_used: u64) -> CoreResult<()> {
        let current_hash = Self::sha256_file(path)?;
        let key = Self::cache_key(&current_hash, scope, target_qualifier);
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().expect("cache mutex poisoned");
        conn.execute(
            "INSERT INTO cache_entries (cache_key, file_sha256, source_path, scope, target_qualifier,
                payload, tokens_used, created_at, last_access, access_count)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?8,0)
             ON CONFLICT(cache_key) DO UPDATE SET
                payload=excluded.payload, tokens_used=excluded.tokens_used,
                file_sha256=excluded.file_sha256, last_access=excluded.last_access",
            params![
                key,
                current_hash,
                path.to_string_lossy(),
                scope.code(),
                target_qualifier,
                payload,
                tokens_used as i64,
                now,
            ],
        )
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Removes every cache entry recorded against `path`, regardless of
    /// scope or target qualifier. Used when a file is deleted or before an
    /// incremental re-analysis of a changed file.
    pub fn invalidate_file(&self, path: &Path) -> CoreResult<u64> {
        let conn = self.conn.lock().expect("cache mutex poisoned");
        let affected = conn
            .execute(
                "DELETE FROM cache_entries WHERE source_path = ?1",
                params![path.to_string_lossy()],
            )
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(affected as u64)
    }

    pub fn prune_older_than(&self, age: Duration) -> CoreResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_default();
        let conn = self.conn.lock().expect("cache mutex poisoned");
        let affected = conn
            .execute(
                "DELETE FROM cache_entries WHERE created_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(affected as u64)
    }

    pub fn statistics(&self) -> CoreResult<CacheStatistics> {
        let conn = self.conn.lock().expect("cache mutex poisoned");
        let entries: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let bytes: i64 = conn
            .query_row("SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM cache_entries", [], |row| row.get(0))
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let hits = read_stat(&conn, "hits")?;
        let misses = read_stat(&conn, "misses")?;
        Ok(CacheStatistics {
            entries: entries as u64,
            hits,
            misses,
            bytes: bytes as u64,
        })
    }
}

fn bump_stat(conn: &Connection, name: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO cache_stats(name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1",
        params![name],
    )
    .map_err(|e| CoreError::Storage(e.to_string()))?;
    Ok(())
}

fn read_stat(conn: &Connection, name: &str) -> CoreResult<u64> {
    let value: Option<i64> = conn
        .query_row("SELECT value FROM cache_stats WHERE name = ?1", params![name], |row| row.get(0))
        .optional()
        .map_err(|e| CoreError::Storage(e.to_string()))?;
    Ok(value.unwrap_or(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn store_then_lookup_is_a_hit() {
        let cache = Cache::open_in_memory().unwrap();
        let file = temp_file("fn add(a, b) { a + b }");
        cache.store(file.path(), Scope::Function, "add", "payload-1", 42).unwrap();
        match cache.lookup(file.path(), Scope::Function, "add").unwrap() {
            CacheLookup::Hit(payload) => assert_eq!(payload, "payload-1"),
            CacheLookup::Miss => panic!("expected hit"),
        }
    }

    #[test]
    fn lookup_before_store_is_a_miss() {
        let cache = Cache::open_in_memory().unwrap();
        let file = temp_file("fn div(a, b) { a / b }");
        assert!(matches!(cache.lookup(file.path(), Scope::Function, "div").unwrap(), CacheLookup::Miss));
    }

    #[test]
    fn changed_file_contents_invalidate_the_entry() {
        let cache = Cache::open_in_memory().unwrap();
        let mut file = temp_file("fn f() { 1 }");
        cache.store(file.path(), Scope::Function, "f", "stale", 10).unwrap();
        file.write_all(b" // changed").unwrap();
        file.flush().unwrap();
        assert!(matches!(cache.lookup(file.path(), Scope::Function, "f").unwrap(), CacheLookup::Miss));
    }

    #[test]
    fn invalidate_file_removes_every_scope_for_that_path() {
        let cache = Cache::open_in_memory().unwrap();
        let file = temp_file("class C { method() {} }");
        cache.store(file.path(), Scope::Class, "C", "p1", 1).unwrap();
        cache.store(file.path(), Scope::Function, "C.method", "p2", 1).unwrap();
        let removed = cache.invalidate_file(file.path()).unwrap();
        assert_eq!(removed, 2);
        assert!(matches!(cache.lookup(file.path(), Scope::Class, "C").unwrap(), CacheLookup::Miss));
    }

    #[test]
    fn statistics_track_hits_and_misses() {
        let cache = Cache::open_in_memory().unwrap();
        let file = temp_file("fn g() {}");
        cache.lookup(file.path(), Scope::Function, "g").unwrap();
        cache.store(file.path(), Scope::Function, "g", "p", 5).unwrap();
        cache.lookup(file.path(), Scope::Function, "g").unwrap();
        let stats = cache.statistics().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }
}
