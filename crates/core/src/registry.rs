use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::info;
use uuid::Uuid;

use crate::db::SqliteStore;
use crate::error::{Error, Result};
use crate::models::RootFolder;
use crate::volume::normalize;

/// CRUD over registered root folders.
pub struct Registry {
    store: Arc<SqliteStore>,
    // Serializes the duplicate check with the insert.
    write_lock: Mutex<()>,
}

impl Registry {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Registers `path` and returns the new root's id. `name` defaults to the
    /// folder's own name.
    pub fn add(&self, path: &Path, name: Option<&str>) -> Result<String> {
        let md = fs::metadata(path).map_err(|e| Error::from_io(path, e))?;
        if !md.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let normalized = normalize(path);
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if self.store.find_enabled_by_path(&normalized)?.is_some() {
            return Err(Error::DuplicatePath(path.to_path_buf()));
        }

        let display_name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string()),
        };
        let root = RootFolder {
            id: Uuid::new_v4().to_string(),
            path: path.to_path_buf(),
            display_name,
            enabled: true,
            max_depth: 0,
            last_scan: None,
        };
        self.store.insert_root(&root, &normalized)?;
        info!(root_id = %root.id, path = %path.display(), "registered root folder");
        Ok(root.id)
    }

    /// Deletes the registration together with its cache entries.
    pub fn remove(&self, id: &str) -> Result<()> {
        if !self.store.delete_root(id)? {
            return Err(Error::NotFound(format!("root folder {id}")));
        }
        info!(root_id = id, "removed root folder");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<RootFolder>> {
        self.store.list_roots()
    }

    pub fn get(&self, id: &str) -> Result<RootFolder> {
        self.store
            .get_root(id)?
            .ok_or_else(|| Error::NotFound(format!("root folder {id}")))
    }

    /// Enabling a disabled root records the transition time so older caches
    /// stop being served.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<RootFolder> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.get(id)?;
        let enabled_at = if enabled && !current.enabled {
            let normalized = normalize(&current.path);
            if self.store.find_enabled_by_path(&normalized)?.is_some() {
                return Err(Error::DuplicatePath(current.path));
            }
            Some(SystemTime::now())
        } else {
            None
        };
        self.store.set_enabled(id, enabled, enabled_at)?;
        info!(root_id = id, enabled, "root folder toggled");
        self.get(id)
    }

    pub fn set_max_depth(&self, id: &str, max_depth: u32) -> Result<RootFolder> {
        if !self.store.set_max_depth(id, max_depth)? {
            return Err(Error::NotFound(format!("root folder {id}")));
        }
        self.get(id)
    }

    pub fn touch_last_scan(&self, id: &str, at: SystemTime) -> Result<()> {
        if !self.store.set_last_scan(id, at)? {
            return Err(Error::NotFound(format!("root folder {id}")));
        }
        Ok(())
    }

    pub fn enabled_at(&self, id: &str) -> Result<Option<SystemTime>> {
        self.store.enabled_at(id)
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.store.get_root(id)?.is_some())
    }
}
