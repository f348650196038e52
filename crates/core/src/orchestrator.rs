use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::cover::{apply_overrides, CoverOverrides};
use crate::db::SqliteStore;
use crate::error::{Error, Result};
use crate::merge;
use crate::models::{
    DirectoryNode, EngineStats, EnrichedVideo, ProbeOutcome, RootFolder, RootScanState, ScanCache,
    VideoInfo,
};
use crate::probe::{FfprobeProber, ProbePool, VideoProber};
use crate::registry::Registry;
use crate::volume::{volume_key, VolumeKey};
use crate::walker::Walker;

type SharedResult = std::result::Result<DirectoryNode, Arc<Error>>;

/// Identity of a file's content as far as the engine can tell without reading it.
type ContentKey = (PathBuf, u64, Option<SystemTime>);

#[derive(Default)]
struct InFlight {
    result: Mutex<Option<SharedResult>>,
    done: Condvar,
}

impl InFlight {
    fn wait(&self) -> SharedResult {
        let mut slot = lock(&self.result);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.done.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self, result: SharedResult) {
        *lock(&self.result) = Some(result);
        self.done.notify_all();
    }
}

/// Unregisters the leader's walk and wakes waiters, even if the leader unwinds.
struct LeaderGuard<'a> {
    flights: &'a Mutex<HashMap<String, Arc<InFlight>>>,
    root_id: String,
    flight: Arc<InFlight>,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        lock(self.flights).remove(&self.root_id);
        let mut slot = lock(&self.flight.result);
        if slot.is_none() {
            *slot = Some(Err(Arc::new(Error::InvalidArgument(format!(
                "walk of root folder {} was aborted",
                self.root_id
            )))));
        }
        drop(slot);
        self.flight.done.notify_all();
    }
}

/// Owns scan state for every root: cached trees, in-flight walks and enrichment.
pub struct ScanOrchestrator {
    config: EngineConfig,
    store: Arc<SqliteStore>,
    registry: Registry,
    walker: Walker,
    prober: Arc<dyn VideoProber>,
    probes: ProbePool,
    states: Mutex<HashMap<String, RootScanState>>,
    in_flight: Mutex<HashMap<String, Arc<InFlight>>>,
    // Held across cache read-merge-write sequences; never across a walk or probe.
    tree_lock: Mutex<()>,
    overrides: RwLock<CoverOverrides>,
    unreadable: Mutex<HashMap<ContentKey, String>>,
}

impl ScanOrchestrator {
    pub fn new(store: Arc<SqliteStore>, config: EngineConfig) -> Result<Self> {
        let prober = Arc::new(FfprobeProber::from_config(&config));
        Self::with_prober(store, config, prober)
    }

    pub fn with_prober(
        store: Arc<SqliteStore>,
        config: EngineConfig,
        prober: Arc<dyn VideoProber>,
    ) -> Result<Self> {
        Ok(Self {
            walker: Walker::new(&config)?,
            probes: ProbePool::new(config.probe_concurrency)?,
            registry: Registry::new(Arc::clone(&store)),
            config,
            store,
            prober,
            states: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            tree_lock: Mutex::new(()),
            overrides: RwLock::new(CoverOverrides::new()),
            unreadable: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn add_root(&self, path: &Path, name: Option<&str>) -> Result<String> {
        self.registry.add(path, name)
    }

    pub fn remove_root(&self, root_id: &str) -> Result<()> {
        {
            // Pending cache writes check membership under the same lock.
            let _write = lock(&self.tree_lock);
            self.registry.remove(root_id)?;
        }
        lock(&self.states).remove(root_id);
        Ok(())
    }

    pub fn list_roots(&self) -> Result<Vec<RootFolder>> {
        self.registry.list()
    }

    pub fn get_root(&self, root_id: &str) -> Result<RootFolder> {
        self.registry.get(root_id)
    }

    pub fn set_enabled(&self, root_id: &str, enabled: bool) -> Result<RootFolder> {
        self.registry.set_enabled(root_id, enabled)
    }

    /// Changing the depth invalidates the cached tree.
    pub fn set_max_depth(&self, root_id: &str, max_depth: u32) -> Result<RootFolder> {
        let root = self.registry.set_max_depth(root_id, max_depth)?;
        let _write = lock(&self.tree_lock);
        let purged = self.store.purge_cache(root_id)?;
        lock(&self.states).remove(root_id);
        debug!(root_id, max_depth, purged, "max depth changed");
        Ok(root)
    }

    pub fn volume_key_for(&self, root_id: &str) -> Result<VolumeKey> {
        let root = self.registry.get(root_id)?;
        volume_key(&root.path)
    }

    /// Raw cache lookup with no validity checks.
    pub fn cached_tree(&self, volume: &VolumeKey, root_id: &str) -> Result<Option<ScanCache>> {
        self.store.get_cache(volume, root_id)
    }

    pub fn scan_state(&self, root_id: &str) -> Result<RootScanState> {
        self.registry.get(root_id)?;
        Ok(lock(&self.states)
            .get(root_id)
            .copied()
            .unwrap_or(RootScanState::Unscanned))
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            walks_started: self.walker.walks_started(),
            probes_started: self.probes.probes_started(),
        }
    }

    /// Replaces the folder cover overrides. Entries whose image is gone are dropped.
    pub fn set_cover_overrides(&self, mut overrides: CoverOverrides) {
        overrides.retain_existing();
        *self.overrides.write().unwrap_or_else(PoisonError::into_inner) = overrides;
    }

    pub fn cover_overrides(&self) -> CoverOverrides {
        self.overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn find_cover_for_video(&self, video_path: &Path) -> Option<PathBuf> {
        self.walker.covers().find_cover_for_video(video_path)
    }

    /// Returns the cached tree when it is still valid, otherwise walks.
    pub fn scan(&self, root_id: &str) -> Result<DirectoryNode> {
        let root = self.usable_root(root_id)?;
        let volume = volume_key(&root.path)?;
        if let Some(cache) = self.valid_cache(&root, &volume)? {
            debug!(root_id, "serving cached tree");
            lock(&self.states).insert(root.id.clone(), RootScanState::Scanned);
            return Ok(self.present(&cache.tree));
        }
        info!(root_id, path = %root.path.display(), "no usable cache, scanning");
        let tree = self.refresh(&root)?;
        Ok(self.present(&tree))
    }

    /// Walks unconditionally, carrying forward metadata of unchanged videos.
    pub fn rescan(&self, root_id: &str) -> Result<DirectoryNode> {
        let root = self.usable_root(root_id)?;
        info!(root_id, path = %root.path.display(), "rescanning");
        let tree = self.refresh(&root)?;
        Ok(self.present(&tree))
    }

    /// Probes the videos of one directory that still lack metadata and
    /// stores the resulting tree. Results follow the directory's video order.
    pub fn enrich(&self, root_id: &str, dir: &Path) -> Result<Vec<EnrichedVideo>> {
        let root = self.usable_root(root_id)?;
        let volume = volume_key(&root.path)?;
        let tree = match self.valid_cache(&root, &volume)? {
            Some(cache) => cache.tree,
            None => self.refresh(&root)?,
        };
        let node = merge::find_node(&tree, dir)
            .ok_or_else(|| Error::NotFound(dir.display().to_string()))?
            .clone();

        let mut known: HashMap<PathBuf, ProbeOutcome> = HashMap::new();
        let mut pending = Vec::new();
        {
            let memo = lock(&self.unreadable);
            for video in &node.videos {
                if let Some(metadata) = &video.metadata {
                    known.insert(
                        video.path.clone(),
                        ProbeOutcome::Probed {
                            metadata: metadata.clone(),
                        },
                    );
                } else if let Some(reason) = memo.get(&content_key(video)) {
                    known.insert(
                        video.path.clone(),
                        ProbeOutcome::Unreadable {
                            reason: reason.clone(),
                        },
                    );
                } else {
                    pending.push(video.path.clone());
                }
            }
        }

        if pending.is_empty() {
            debug!(root_id, dir = %dir.display(), "directory already enriched");
            return Ok(in_node_order(&node, known));
        }

        info!(
            root_id,
            dir = %dir.display(),
            pending = pending.len(),
            concurrency = self.probes.concurrency(),
            "enriching directory"
        );
        let results = self.probes.probe_all(self.prober.as_ref(), &pending);
        self.remember_unreadable(&node, &results);

        {
            let _write = lock(&self.tree_lock);
            if !self.registry.contains(root_id)? {
                info!(root_id, "root folder removed during enrichment, discarding result");
                return Err(Error::NotFound(format!("root folder {root_id}")));
            }
            match self.store.get_cache(&volume, root_id)? {
                Some(latest) => {
                    let applicable = still_current(&node, &latest.tree, dir, &results);
                    let spliced = merge::splice_metadata(&latest.tree, dir, &applicable);
                    // The splice does not make the tree any fresher than its walk.
                    self.store.put_cache(
                        &volume,
                        root_id,
                        &ScanCache {
                            tree: spliced,
                            generated_at: latest.generated_at,
                        },
                    )?;
                }
                None => {
                    debug!(root_id, "cache purged during enrichment, results not stored");
                }
            }
        }

        for result in results {
            known.insert(result.path, result.outcome);
        }
        Ok(in_node_order(&node, known))
    }

    fn usable_root(&self, root_id: &str) -> Result<RootFolder> {
        let root = self.registry.get(root_id)?;
        match fs::metadata(&root.path) {
            Ok(md) if md.is_dir() => {}
            _ => return Err(Error::RootNotFound(root.path)),
        }
        if !root.enabled {
            return Err(Error::RootDisabled(root.id));
        }
        Ok(root)
    }

    /// A cache generated before the root was last re-enabled is not served.
    fn valid_cache(&self, root: &RootFolder, volume: &VolumeKey) -> Result<Option<ScanCache>> {
        let Some(cache) = self.store.get_cache(volume, &root.id)? else {
            return Ok(None);
        };
        match self.registry.enabled_at(&root.id)? {
            Some(enabled_at) if cache.generated_at < enabled_at => {
                debug!(root_id = %root.id, "cache predates re-enable, bypassing");
                Ok(None)
            }
            _ => Ok(Some(cache)),
        }
    }

    fn present(&self, tree: &DirectoryNode) -> DirectoryNode {
        let overrides = self.overrides.read().unwrap_or_else(PoisonError::into_inner);
        apply_overrides(tree, &overrides)
    }

    /// At most one walk per root runs at a time; concurrent callers share its result.
    fn refresh(&self, root: &RootFolder) -> Result<DirectoryNode> {
        let (flight, leader) = {
            let mut flights = lock(&self.in_flight);
            match flights.get(&root.id) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(InFlight::default());
                    flights.insert(root.id.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            debug!(root_id = %root.id, "joining in-flight walk");
            return flight.wait().map_err(Error::Shared);
        }

        let _guard = LeaderGuard {
            flights: &self.in_flight,
            root_id: root.id.clone(),
            flight: Arc::clone(&flight),
        };
        let result = self.walk_and_store(root).map_err(Arc::new);
        flight.finish(result.clone());
        result.map_err(Error::Shared)
    }

    fn walk_and_store(&self, root: &RootFolder) -> Result<DirectoryNode> {
        let before = {
            let mut states = lock(&self.states);
            let before = states
                .get(&root.id)
                .copied()
                .unwrap_or(RootScanState::Unscanned);
            let during = match before {
                RootScanState::Unscanned | RootScanState::Scanning => RootScanState::Scanning,
                RootScanState::Scanned | RootScanState::Rescanning => RootScanState::Rescanning,
            };
            states.insert(root.id.clone(), during);
            before
        };

        let outcome = self.walk_merge_write(root);

        let mut states = lock(&self.states);
        match &outcome {
            Ok(_) => {
                states.insert(root.id.clone(), RootScanState::Scanned);
            }
            Err(Error::NotFound(_)) => {
                states.remove(&root.id);
            }
            Err(_) => {
                let restored = match before {
                    RootScanState::Unscanned | RootScanState::Scanning => RootScanState::Unscanned,
                    RootScanState::Scanned | RootScanState::Rescanning => RootScanState::Scanned,
                };
                states.insert(root.id.clone(), restored);
            }
        }
        outcome
    }

    fn walk_merge_write(&self, root: &RootFolder) -> Result<DirectoryNode> {
        let walked = self.walker.walk(&root.path, root.max_depth)?;
        let volume = volume_key(&root.path)?;

        let _write = lock(&self.tree_lock);
        if !self.registry.contains(&root.id)? {
            info!(root_id = %root.id, "root folder removed during walk, discarding result");
            return Err(Error::NotFound(format!("root folder {}", root.id)));
        }
        let tree = match self.store.get_cache(&volume, &root.id)? {
            Some(previous) => merge::carry_forward(&previous.tree, walked),
            None => walked,
        };
        let now = SystemTime::now();
        self.store.put_cache(
            &volume,
            &root.id,
            &ScanCache {
                tree: tree.clone(),
                generated_at: now,
            },
        )?;
        self.registry.touch_last_scan(&root.id, now)?;
        info!(
            root_id = %root.id,
            volume = %volume,
            videos = tree.video_count,
            "scan stored"
        );
        Ok(tree)
    }

    fn remember_unreadable(&self, node: &DirectoryNode, results: &[EnrichedVideo]) {
        let mut memo = lock(&self.unreadable);
        for result in results {
            let ProbeOutcome::Unreadable { reason } = &result.outcome else {
                continue;
            };
            if let Some(video) = node.videos.iter().find(|v| v.path == result.path) {
                memo.insert(content_key(video), reason.clone());
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn content_key(video: &VideoInfo) -> ContentKey {
    (video.path.clone(), video.size_bytes, video.modified_time)
}

/// Keeps only results for videos that did not change on disk while probing.
fn still_current(
    probed_node: &DirectoryNode,
    latest: &DirectoryNode,
    dir: &Path,
    results: &[EnrichedVideo],
) -> Vec<EnrichedVideo> {
    let Some(latest_node) = merge::find_node(latest, dir) else {
        return Vec::new();
    };
    results
        .iter()
        .filter(|result| {
            let before = probed_node.videos.iter().find(|v| v.path == result.path);
            let now = latest_node.videos.iter().find(|v| v.path == result.path);
            matches!((before, now), (Some(b), Some(n)) if b.same_content(n))
        })
        .cloned()
        .collect()
}

fn in_node_order(node: &DirectoryNode, mut outcomes: HashMap<PathBuf, ProbeOutcome>) -> Vec<EnrichedVideo> {
    node.videos
        .iter()
        .filter_map(|video| {
            outcomes.remove(&video.path).map(|outcome| EnrichedVideo {
                path: video.path.clone(),
                outcome,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VideoMetadata;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeProber {
        calls: AtomicUsize,
    }

    impl VideoProber for FakeProber {
        fn probe(&self, path: &Path) -> Result<VideoMetadata> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if fs::metadata(path)?.len() == 0 {
                return Err(Error::UnreadableMedia {
                    path: path.to_path_buf(),
                    reason: "file is empty".to_string(),
                });
            }
            Ok(VideoMetadata {
                duration: Some(Duration::from_secs(42)),
                container_format: Some("mp4".to_string()),
                ..VideoMetadata::default()
            })
        }
    }

    /// Parks every probe until the test releases it.
    struct GatedProber {
        started: Barrier,
        release: Barrier,
    }

    impl GatedProber {
        fn new() -> Self {
            Self {
                started: Barrier::new(2),
                release: Barrier::new(2),
            }
        }
    }

    impl VideoProber for GatedProber {
        fn probe(&self, _path: &Path) -> Result<VideoMetadata> {
            self.started.wait();
            self.release.wait();
            Ok(VideoMetadata {
                codec: Some("h264".to_string()),
                ..VideoMetadata::default()
            })
        }
    }

    fn gated_setup() -> (TempDir, ScanOrchestrator, Arc<GatedProber>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let prober = Arc::new(GatedProber::new());
        let orchestrator =
            ScanOrchestrator::with_prober(store, EngineConfig::default(), prober.clone()).unwrap();
        (dir, orchestrator, prober)
    }

    fn setup() -> (TempDir, ScanOrchestrator, Arc<FakeProber>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let prober = Arc::new(FakeProber::default());
        let orchestrator =
            ScanOrchestrator::with_prober(store, EngineConfig::default(), prober.clone()).unwrap();
        (dir, orchestrator, prober)
    }

    fn touch(root: &Path, rel: &str, bytes: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn state_moves_from_unscanned_to_scanned() {
        let (dir, orch, _) = setup();
        touch(dir.path(), "a.mp4", b"data");
        let id = orch.add_root(dir.path(), None).unwrap();

        assert_eq!(orch.scan_state(&id).unwrap(), RootScanState::Unscanned);
        orch.scan(&id).unwrap();
        assert_eq!(orch.scan_state(&id).unwrap(), RootScanState::Scanned);
        orch.rescan(&id).unwrap();
        assert_eq!(orch.scan_state(&id).unwrap(), RootScanState::Scanned);
        assert!(orch.get_root(&id).unwrap().last_scan.is_some());
        assert!(matches!(orch.scan_state("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn scan_serves_cache_until_rescan() {
        let (dir, orch, _) = setup();
        touch(dir.path(), "a.mp4", b"data");
        let id = orch.add_root(dir.path(), None).unwrap();

        let first = orch.scan(&id).unwrap();
        touch(dir.path(), "b.mp4", b"data");
        let second = orch.scan(&id).unwrap();
        assert_eq!(first, second);
        assert_eq!(orch.stats().walks_started, 1);

        let fresh = orch.rescan(&id).unwrap();
        assert_eq!(fresh.video_count, 2);
        assert_eq!(orch.stats().walks_started, 2);
    }

    #[test]
    fn disabled_roots_cannot_be_scanned() {
        let (dir, orch, _) = setup();
        let id = orch.add_root(dir.path(), None).unwrap();
        orch.set_enabled(&id, false).unwrap();
        assert!(matches!(orch.scan(&id), Err(Error::RootDisabled(_))));
        assert!(matches!(orch.rescan(&id), Err(Error::RootDisabled(_))));
    }

    #[test]
    fn unreadable_files_are_markers_and_not_reprobed() {
        let (dir, orch, prober) = setup();
        touch(dir.path(), "empty.mp4", b"");
        touch(dir.path(), "good.mp4", b"data");
        let id = orch.add_root(dir.path(), None).unwrap();

        let first = orch.enrich(&id, dir.path()).unwrap();
        assert_eq!(first.len(), 2);
        assert!(matches!(first[0].outcome, ProbeOutcome::Unreadable { .. }));
        assert_eq!(first[1].outcome.metadata().unwrap().duration, Some(Duration::from_secs(42)));
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);

        let second = orch.enrich(&id, dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn enrich_of_unknown_directory_is_not_found() {
        let (dir, orch, _) = setup();
        let id = orch.add_root(dir.path(), None).unwrap();
        let err = orch.enrich(&id, &dir.path().join("nowhere")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn max_depth_change_drops_the_cache() {
        let (dir, orch, _) = setup();
        touch(dir.path(), "a/b/c.mp4", b"data");
        let id = orch.add_root(dir.path(), None).unwrap();
        assert_eq!(orch.scan(&id).unwrap().video_count, 1);

        orch.set_max_depth(&id, 1).unwrap();
        assert_eq!(orch.scan_state(&id).unwrap(), RootScanState::Unscanned);
        let shallow = orch.scan(&id).unwrap();
        assert_eq!(shallow.video_count, 0);
        assert_eq!(shallow.children.len(), 1);
    }

    #[test]
    fn overrides_change_folder_covers_on_read() {
        let (dir, orch, _) = setup();
        touch(dir.path(), "A/a1.mp4", b"data");
        touch(dir.path(), "A/a1.jpg", b"img");
        touch(dir.path(), "A/custom.png", b"img");
        let id = orch.add_root(dir.path(), None).unwrap();

        let tree = orch.scan(&id).unwrap();
        assert_eq!(tree.children[0].cover_path, Some(dir.path().join("A/a1.jpg")));

        let overrides: CoverOverrides = [
            (dir.path().join("A"), dir.path().join("A/custom.png")),
            (dir.path().to_path_buf(), dir.path().join("gone.png")),
        ]
        .into_iter()
        .collect();
        orch.set_cover_overrides(overrides);
        assert_eq!(orch.cover_overrides().len(), 1);

        let tree = orch.scan(&id).unwrap();
        assert_eq!(tree.children[0].cover_path, Some(dir.path().join("A/custom.png")));
        assert_eq!(tree.cover_path, Some(dir.path().join("A/custom.png")));
    }

    #[test]
    fn depth_change_while_probing_is_not_undone() {
        let (dir, orch, prober) = gated_setup();
        touch(dir.path(), "top.mp4", b"data");
        touch(dir.path(), "a/b/deep.mp4", b"data");
        let id = orch.add_root(dir.path(), None).unwrap();
        assert_eq!(orch.scan(&id).unwrap().video_count, 2);

        let enriched = thread::scope(|s| {
            let worker = s.spawn(|| orch.enrich(&id, dir.path()));
            prober.started.wait();
            orch.set_max_depth(&id, 1).unwrap();
            prober.release.wait();
            worker.join().unwrap()
        })
        .unwrap();
        assert_eq!(enriched.len(), 1);

        let tree = orch.scan(&id).unwrap();
        assert_eq!(tree.video_count, 1);
        assert_eq!(tree.children.len(), 1);
        assert!(tree.children[0].children.is_empty());
        assert!(tree.videos[0].metadata.is_none());
    }

    #[test]
    fn reenable_while_probing_still_forces_a_walk() {
        let (dir, orch, prober) = gated_setup();
        touch(dir.path(), "top.mp4", b"data");
        let id = orch.add_root(dir.path(), None).unwrap();
        orch.scan(&id).unwrap();
        thread::sleep(Duration::from_millis(20));

        thread::scope(|s| {
            let worker = s.spawn(|| orch.enrich(&id, dir.path()));
            prober.started.wait();
            orch.set_enabled(&id, false).unwrap();
            orch.set_enabled(&id, true).unwrap();
            prober.release.wait();
            worker.join().unwrap().unwrap();
        });
        assert_eq!(orch.stats().walks_started, 1);

        orch.scan(&id).unwrap();
        assert_eq!(orch.stats().walks_started, 2);
    }

    #[test]
    fn removal_waits_for_pending_cache_writes() {
        let (dir, orch, _) = setup();
        let id = orch.add_root(dir.path(), None).unwrap();
        let volume = orch.volume_key_for(&id).unwrap();

        thread::scope(|s| {
            let write = lock(&orch.tree_lock);
            let remover = s.spawn(|| orch.remove_root(&id));
            thread::sleep(Duration::from_millis(50));
            assert!(orch.registry.contains(&id).unwrap());
            orch.store
                .put_cache(
                    &volume,
                    &id,
                    &ScanCache {
                        tree: DirectoryNode::empty("root".to_string(), dir.path().to_path_buf(), None),
                        generated_at: SystemTime::now(),
                    },
                )
                .unwrap();
            drop(write);
            remover.join().unwrap().unwrap();
        });

        assert!(!orch.registry.contains(&id).unwrap());
        assert_eq!(orch.cached_tree(&volume, &id).unwrap(), None);
    }

    #[test]
    fn callers_join_the_walk_already_in_flight() {
        let (dir, orch, _) = setup();
        touch(dir.path(), "a.mp4", b"data");
        let id = orch.add_root(dir.path(), None).unwrap();
        let shared = DirectoryNode::empty("shared".to_string(), dir.path().to_path_buf(), None);

        let flight = Arc::new(InFlight::default());
        lock(&orch.in_flight).insert(id.clone(), Arc::clone(&flight));
        let joined = thread::scope(|s| {
            let waiter = s.spawn(|| orch.rescan(&id));
            thread::sleep(Duration::from_millis(50));
            flight.finish(Ok(shared.clone()));
            waiter.join().unwrap()
        })
        .unwrap();
        assert_eq!(joined, shared);
        assert_eq!(orch.stats().walks_started, 0);

        let failing = Arc::new(InFlight::default());
        lock(&orch.in_flight).insert(id.clone(), Arc::clone(&failing));
        failing.finish(Err(Arc::new(Error::RootNotFound(dir.path().to_path_buf()))));
        let err = orch.rescan(&id).unwrap_err();
        assert!(matches!(err, Error::Shared(_)));
        assert!(matches!(err.root_cause(), Error::RootNotFound(_)));
        assert_eq!(orch.stats().walks_started, 0);
        lock(&orch.in_flight).remove(&id);
    }
}
