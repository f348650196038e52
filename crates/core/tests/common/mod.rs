#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use videovault_core::db::SqliteStore;
use videovault_core::probe::VideoProber;
use videovault_core::{EngineConfig, Error, Result, ScanOrchestrator, VideoMetadata};

/// Test double that records how often it was asked to probe.
#[derive(Default)]
pub struct CountingProber {
    calls: AtomicUsize,
}

impl CountingProber {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VideoProber for CountingProber {
    fn probe(&self, path: &Path) -> Result<VideoMetadata> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let len = fs::metadata(path)
            .map_err(|e| Error::from_io(path, e))?
            .len();
        if len == 0 {
            return Err(Error::UnreadableMedia {
                path: path.to_path_buf(),
                reason: "file is empty".to_string(),
            });
        }
        // Stub fixtures carry no real streams, so only the size-derived fields are known.
        Ok(VideoMetadata {
            duration: Some(Duration::from_secs(len)),
            bit_rate: Some(len * 8),
            ..VideoMetadata::default()
        })
    }
}

pub struct Harness {
    pub orchestrator: Arc<ScanOrchestrator>,
    pub prober: Arc<CountingProber>,
}

pub fn harness() -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let prober = Arc::new(CountingProber::default());
    let orchestrator =
        ScanOrchestrator::with_prober(store, EngineConfig::default(), prober.clone()).unwrap();
    Harness {
        orchestrator: Arc::new(orchestrator),
        prober,
    }
}

pub fn write(root: &Path, rel: &str, bytes: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}
