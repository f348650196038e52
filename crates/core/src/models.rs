use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// A user-registered top-level directory the engine may scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFolder {
    pub id: String,
    pub path: PathBuf,
    #[serde(rename = "name")]
    pub display_name: String,
    pub enabled: bool,
    /// Directory levels below the root to descend; 0 means unlimited.
    pub max_depth: u32,
    #[serde(default)]
    pub last_scan: Option<SystemTime>,
}

/// Technical metadata produced by a [`crate::probe::VideoProber`].
///
/// Every field is optional because probing may succeed only partially.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoMetadata {
    pub duration: Option<Duration>,
    pub resolution: Option<(u32, u32)>,
    pub codec: Option<String>,
    pub audio_codec: Option<String>,
    pub container_format: Option<String>,
    pub frame_rate: Option<f64>,
    pub bit_rate: Option<u64>,
}

impl VideoMetadata {
    pub fn is_empty(&self) -> bool {
        *self == VideoMetadata::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub path: PathBuf,
    pub name: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    #[serde(default)]
    pub created_time: Option<SystemTime>,
    #[serde(default)]
    pub modified_time: Option<SystemTime>,
    #[serde(default)]
    pub cover_path: Option<PathBuf>,
    #[serde(default)]
    pub metadata: Option<VideoMetadata>,
}

impl VideoInfo {
    /// Whether `other` describes the same on-disk content (same path, size and mtime).
    pub fn same_content(&self, other: &VideoInfo) -> bool {
        self.path == other.path
            && self.size_bytes == other.size_bytes
            && self.modified_time == other.modified_time
    }

    pub fn with_metadata(&self, metadata: Option<VideoMetadata>) -> VideoInfo {
        VideoInfo {
            metadata,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "always_true")]
    pub is_directory: bool,
    #[serde(default)]
    pub children: Vec<DirectoryNode>,
    #[serde(default)]
    pub videos: Vec<VideoInfo>,
    /// Videos in this node and its whole subtree.
    #[serde(default)]
    pub video_count: usize,
    /// Image files in this node and its whole subtree.
    #[serde(default)]
    pub cover_count: usize,
    #[serde(default)]
    pub cover_path: Option<PathBuf>,
    #[serde(default)]
    pub modified_time: Option<SystemTime>,
}

fn always_true() -> bool {
    true
}

impl DirectoryNode {
    pub fn empty(name: String, path: PathBuf, modified_time: Option<SystemTime>) -> Self {
        Self {
            name,
            path,
            is_directory: true,
            children: Vec::new(),
            videos: Vec::new(),
            video_count: 0,
            cover_count: 0,
            cover_path: None,
            modified_time,
        }
    }

    pub fn walk_videos<'a>(&'a self, out: &mut Vec<&'a VideoInfo>) {
        out.extend(self.videos.iter());
        for child in &self.children {
            child.walk_videos(out);
        }
    }
}

/// Per-file result of enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Probed { metadata: VideoMetadata },
    Unreadable { reason: String },
}

impl ProbeOutcome {
    pub fn metadata(&self) -> Option<&VideoMetadata> {
        match self {
            ProbeOutcome::Probed { metadata } => Some(metadata),
            ProbeOutcome::Unreadable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedVideo {
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: ProbeOutcome,
}

/// A persisted tree for one `(volume key, root id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanCache {
    pub tree: DirectoryNode,
    pub generated_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootScanState {
    Unscanned,
    Scanning,
    Scanned,
    Rescanning,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub walks_started: u64,
    pub probes_started: u64,
}
