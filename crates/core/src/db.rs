use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{RootFolder, ScanCache};
use crate::volume::{CanonicalPath, VolumeKey};

/// Persistent registry and scan cache.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::from_io(parent, e))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied statement behind.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS root_folders (
              id TEXT PRIMARY KEY NOT NULL,
              path TEXT NOT NULL,
              normalized_path TEXT NOT NULL,
              name TEXT NOT NULL,
              enabled INTEGER NOT NULL DEFAULT 1,
              max_depth INTEGER NOT NULL DEFAULT 0,
              last_scan_ms INTEGER,
              enabled_at_ms INTEGER,
              created_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_root_folders_normalized ON root_folders(normalized_path);

            CREATE TABLE IF NOT EXISTS scan_cache (
              cache_key TEXT PRIMARY KEY NOT NULL,
              root_id TEXT NOT NULL,
              volume_key TEXT NOT NULL,
              generated_at_ms INTEGER NOT NULL,
              tree_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_scan_cache_root ON scan_cache(root_id);
            "#,
        )?;
        Ok(())
    }

    pub fn insert_root(&self, root: &RootFolder, normalized: &CanonicalPath) -> Result<()> {
        let now = system_time_to_millis(SystemTime::now());
        self.conn().execute(
            r#"
            INSERT INTO root_folders (
              id, path, normalized_path, name, enabled, max_depth,
              last_scan_ms, enabled_at_ms, created_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                root.id,
                root.path.to_string_lossy(),
                normalized.as_str(),
                root.display_name,
                root.enabled,
                root.max_depth as i64,
                root.last_scan.map(system_time_to_millis),
                Option::<i64>::None,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn list_roots(&self) -> Result<Vec<RootFolder>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, path, name, enabled, max_depth, last_scan_ms
            FROM root_folders
            ORDER BY created_at_ms, id
            "#,
        )?;
        let rows = stmt.query_map([], row_to_root)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_root(&self, id: &str) -> Result<Option<RootFolder>> {
        let root = self
            .conn()
            .query_row(
                r#"
                SELECT id, path, name, enabled, max_depth, last_scan_ms
                FROM root_folders
                WHERE id = ?1
                "#,
                params![id],
                row_to_root,
            )
            .optional()?;
        Ok(root)
    }

    /// Id of an enabled root registered under `normalized`, if any.
    pub fn find_enabled_by_path(&self, normalized: &CanonicalPath) -> Result<Option<String>> {
        let id = self
            .conn()
            .query_row(
                "SELECT id FROM root_folders WHERE normalized_path = ?1 AND enabled = 1 LIMIT 1",
                params![normalized.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Time of the root's most recent disabled-to-enabled transition.
    pub fn enabled_at(&self, id: &str) -> Result<Option<SystemTime>> {
        let ms: Option<Option<i64>> = self
            .conn()
            .query_row(
                "SELECT enabled_at_ms FROM root_folders WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(ms.flatten().map(millis_to_system_time))
    }

    /// Returns false when no row matched.
    pub fn set_enabled(&self, id: &str, enabled: bool, enabled_at: Option<SystemTime>) -> Result<bool> {
        let changed = self.conn().execute(
            r#"
            UPDATE root_folders
            SET enabled = ?2,
                enabled_at_ms = COALESCE(?3, enabled_at_ms)
            WHERE id = ?1
            "#,
            params![id, enabled, enabled_at.map(system_time_to_millis)],
        )?;
        Ok(changed > 0)
    }

    pub fn set_max_depth(&self, id: &str, max_depth: u32) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE root_folders SET max_depth = ?2 WHERE id = ?1",
            params![id, max_depth as i64],
        )?;
        Ok(changed > 0)
    }

    pub fn set_last_scan(&self, id: &str, at: SystemTime) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE root_folders SET last_scan_ms = ?2 WHERE id = ?1",
            params![id, system_time_to_millis(at)],
        )?;
        Ok(changed > 0)
    }

    /// Deletes the root and every cache row recorded for it, in one transaction.
    pub fn delete_root(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM root_folders WHERE id = ?1", params![id])?;
        let purged = tx.execute("DELETE FROM scan_cache WHERE root_id = ?1", params![id])?;
        tx.commit()?;
        debug!(root_id = id, purged, "deleted root folder");
        Ok(removed > 0)
    }

    pub fn put_cache(&self, volume: &VolumeKey, root_id: &str, cache: &ScanCache) -> Result<()> {
        let tree_json = serde_json::to_string(&cache.tree)?;
        self.conn().execute(
            r#"
            INSERT INTO scan_cache (
              cache_key, root_id, volume_key, generated_at_ms, tree_json
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(cache_key) DO UPDATE SET
              root_id=excluded.root_id,
              volume_key=excluded.volume_key,
              generated_at_ms=excluded.generated_at_ms,
              tree_json=excluded.tree_json
            "#,
            params![
                cache_key(volume, root_id),
                root_id,
                volume.as_str(),
                system_time_to_millis(cache.generated_at),
                tree_json,
            ],
        )?;
        Ok(())
    }

    /// Undecodable rows are reported as misses.
    pub fn get_cache(&self, volume: &VolumeKey, root_id: &str) -> Result<Option<ScanCache>> {
        let key = cache_key(volume, root_id);
        let row: Option<(i64, String)> = self
            .conn()
            .query_row(
                "SELECT generated_at_ms, tree_json FROM scan_cache WHERE cache_key = ?1",
                params![key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((generated_at_ms, tree_json)) = row else {
            debug!(key = %key, "cache miss");
            return Ok(None);
        };
        match decode_tree(&key, &tree_json) {
            Ok(tree) => Ok(Some(ScanCache {
                tree,
                generated_at: millis_to_system_time(generated_at_ms),
            })),
            Err(err) => {
                warn!(%err, "ignoring cache entry");
                Ok(None)
            }
        }
    }

    pub fn purge_cache(&self, root_id: &str) -> Result<usize> {
        let purged = self
            .conn()
            .execute("DELETE FROM scan_cache WHERE root_id = ?1", params![root_id])?;
        Ok(purged)
    }

    pub fn count_cache_rows(&self, root_id: &str) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM scan_cache WHERE root_id = ?1",
            params![root_id],
            |r| r.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    #[cfg(test)]
    fn put_raw_cache(&self, volume: &VolumeKey, root_id: &str, tree_json: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO scan_cache VALUES (?1, ?2, ?3, 0, ?4)",
            params![cache_key(volume, root_id), root_id, volume.as_str(), tree_json],
        )?;
        Ok(())
    }
}

fn decode_tree(key: &str, json: &str) -> Result<crate::models::DirectoryNode> {
    serde_json::from_str(json).map_err(|e| Error::CacheCorrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn cache_key(volume: &VolumeKey, root_id: &str) -> String {
    format!("{}:{}", volume.as_str(), root_id)
}

fn row_to_root(r: &Row<'_>) -> rusqlite::Result<RootFolder> {
    let path: String = r.get(1)?;
    let max_depth: i64 = r.get(4)?;
    let last_scan_ms: Option<i64> = r.get(5)?;
    Ok(RootFolder {
        id: r.get(0)?,
        path: PathBuf::from(path),
        display_name: r.get(2)?,
        enabled: r.get(3)?,
        max_depth: max_depth.clamp(0, u32::MAX as i64) as u32,
        last_scan: last_scan_ms.map(millis_to_system_time),
    })
}

fn system_time_to_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as i64
}

fn millis_to_system_time(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DirectoryNode;
    use crate::volume::normalize;

    fn root(id: &str, path: &str) -> RootFolder {
        RootFolder {
            id: id.to_string(),
            path: PathBuf::from(path),
            display_name: "Movies".to_string(),
            enabled: true,
            max_depth: 0,
            last_scan: None,
        }
    }

    fn volume() -> VolumeKey {
        VolumeKey::new("unix:2049")
    }

    fn cache(generated_ms: u64) -> ScanCache {
        ScanCache {
            tree: DirectoryNode::empty("movies".to_string(), PathBuf::from("/movies"), None),
            generated_at: UNIX_EPOCH + Duration::from_millis(generated_ms),
        }
    }

    #[test]
    fn roots_round_trip_in_insertion_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_root(&root("b", "/b"), &normalize(Path::new("/b"))).unwrap();
        store.insert_root(&root("a", "/a/"), &normalize(Path::new("/a/"))).unwrap();

        let ids: Vec<String> = store.list_roots().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.get_root("a").unwrap().unwrap().path, PathBuf::from("/a/"));
        assert!(store.get_root("zzz").unwrap().is_none());
        assert_eq!(
            store.find_enabled_by_path(&normalize(Path::new("/a"))).unwrap(),
            Some("a".to_string())
        );
    }

    #[test]
    fn enable_toggle_and_timestamps() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_root(&root("r", "/r"), &normalize(Path::new("/r"))).unwrap();
        assert_eq!(store.enabled_at("r").unwrap(), None);

        assert!(store.set_enabled("r", false, None).unwrap());
        assert!(store.find_enabled_by_path(&normalize(Path::new("/r"))).unwrap().is_none());

        let at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert!(store.set_enabled("r", true, Some(at)).unwrap());
        assert_eq!(store.enabled_at("r").unwrap(), Some(at));
        assert!(store.set_enabled("r", true, None).unwrap());
        assert_eq!(store.enabled_at("r").unwrap(), Some(at));

        assert!(store.set_last_scan("r", at).unwrap());
        assert!(store.set_max_depth("r", 3).unwrap());
        let loaded = store.get_root("r").unwrap().unwrap();
        assert_eq!(loaded.last_scan, Some(at));
        assert_eq!(loaded.max_depth, 3);
        assert!(!store.set_max_depth("missing", 1).unwrap());
    }

    #[test]
    fn cache_is_last_writer_wins() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_cache(&volume(), "r", &cache(1_000)).unwrap();
        store.put_cache(&volume(), "r", &cache(2_000)).unwrap();

        let got = store.get_cache(&volume(), "r").unwrap().unwrap();
        assert_eq!(got, cache(2_000));
        assert_eq!(store.count_cache_rows("r").unwrap(), 1);
        assert!(store.get_cache(&volume(), "other").unwrap().is_none());
    }

    #[test]
    fn corrupt_cache_rows_are_misses() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_raw_cache(&volume(), "r", "{not json").unwrap();
        assert!(store.get_cache(&volume(), "r").unwrap().is_none());

        store.put_cache(&volume(), "r", &cache(5)).unwrap();
        assert!(store.get_cache(&volume(), "r").unwrap().is_some());
    }

    #[test]
    fn cache_rows_tolerate_missing_optional_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put_raw_cache(&volume(), "r", r#"{"name":"m","path":"/m","future_field":1}"#)
            .unwrap();
        let got = store.get_cache(&volume(), "r").unwrap().unwrap();
        assert_eq!(got.tree.name, "m");
        assert!(got.tree.children.is_empty());
    }

    #[test]
    fn delete_root_purges_its_cache() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_root(&root("r", "/r"), &normalize(Path::new("/r"))).unwrap();
        store.put_cache(&volume(), "r", &cache(5)).unwrap();

        assert!(store.delete_root("r").unwrap());
        assert!(store.get_cache(&volume(), "r").unwrap().is_none());
        assert_eq!(store.count_cache_rows("r").unwrap(), 0);
        assert!(!store.delete_root("r").unwrap());
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/videovault.db");
        SqliteStore::open(&path).unwrap();
        assert!(path.exists());
    }
}
