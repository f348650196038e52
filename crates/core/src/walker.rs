use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::EngineConfig;
use crate::cover::{directory_cover, CoverResolver};
use crate::error::{Error, Result};
use crate::models::{DirectoryNode, VideoInfo};

/// Structural scanner: builds the folder/video tree without probing media.
pub struct Walker {
    config: EngineConfig,
    covers: CoverResolver,
    pool: rayon::ThreadPool,
    walks_started: AtomicU64,
}

struct Frame {
    name: String,
    path: PathBuf,
    depth: usize,
    modified: Option<SystemTime>,
    children: Vec<DirectoryNode>,
    videos: Vec<VideoInfo>,
    images: Vec<PathBuf>,
}

impl Frame {
    fn new(path: &Path, depth: usize, modified: Option<SystemTime>) -> Self {
        Self {
            name: node_name(path),
            path: path.to_path_buf(),
            depth,
            modified,
            children: Vec::new(),
            videos: Vec::new(),
            images: Vec::new(),
        }
    }
}

impl Walker {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.walk_concurrency.max(1))
            .thread_name(|i| format!("videovault-walk-{i}"))
            .build()
            .map_err(|e| Error::InvalidArgument(format!("cannot build walk pool: {e}")))?;
        Ok(Self {
            config: config.clone(),
            covers: CoverResolver::new(config),
            pool,
            walks_started: AtomicU64::new(0),
        })
    }

    pub fn covers(&self) -> &CoverResolver {
        &self.covers
    }

    pub fn walks_started(&self) -> u64 {
        self.walks_started.load(Ordering::Relaxed)
    }

    /// Walks `root` down to `max_depth` levels (0 = unlimited).
    ///
    /// Nodes at the depth limit are present but not listed. Unreadable
    /// subdirectories become empty nodes; only a missing root is an error.
    pub fn walk(&self, root: &Path, max_depth: u32) -> Result<DirectoryNode> {
        let md = fs::metadata(root).map_err(|_| Error::RootNotFound(root.to_path_buf()))?;
        if !md.is_dir() {
            return Err(Error::RootNotFound(root.to_path_buf()));
        }
        let root_canonical =
            fs::canonicalize(root).map_err(|_| Error::RootNotFound(root.to_path_buf()))?;

        self.walks_started.fetch_add(1, Ordering::Relaxed);
        info!(root = %root.display(), max_depth, "walking root folder");

        // The root level is listed on its own so its subtrees can be walked in parallel.
        let shallow = self.walk_subtree(root, Some(1), &root_canonical);
        let tree = if max_depth == 1 {
            shallow
        } else {
            let budget = match max_depth {
                0 => None,
                n => Some(n as usize - 1),
            };
            let children: Vec<DirectoryNode> = self.pool.install(|| {
                shallow
                    .children
                    .par_iter()
                    .map(|stub| self.walk_subtree(&stub.path, budget, &root_canonical))
                    .collect()
            });
            let own_images = shallow.cover_count;
            finish_node(
                shallow.name,
                shallow.path,
                shallow.modified_time,
                shallow.videos,
                own_images,
                children,
            )
        };

        info!(
            root = %root.display(),
            videos = tree.video_count,
            covers = tree.cover_count,
            "walk finished"
        );
        Ok(tree)
    }

    fn walk_subtree(&self, dir: &Path, budget: Option<usize>, root_canonical: &Path) -> DirectoryNode {
        let mut walker = WalkDir::new(dir).follow_links(true).sort_by_file_name();
        if let Some(budget) = budget {
            walker = walker.max_depth(budget);
        }

        let mut stack: Vec<Frame> = Vec::new();
        let mut it = walker.into_iter();
        while let Some(item) = it.next() {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    if let Some(ancestor) = err.loop_ancestor() {
                        debug!(
                            path = ?err.path(),
                            ancestor = %ancestor.display(),
                            "skipping symlink cycle"
                        );
                    } else {
                        warn!(path = ?err.path(), %err, "unreadable entry, skipping");
                    }
                    continue;
                }
            };

            let depth = entry.depth();
            while stack.last().is_some_and(|frame| frame.depth >= depth) {
                close_frame(&mut stack, &self.covers);
            }

            if entry.file_type().is_dir() {
                if depth > 0 && entry.path_is_symlink() && points_at(&entry, root_canonical) {
                    debug!(path = %entry.path().display(), "skipping symlink back to the root");
                    it.skip_current_dir();
                    continue;
                }
                let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
                stack.push(Frame::new(entry.path(), depth, modified));
            } else if entry.file_type().is_file() {
                let Some(frame) = stack.last_mut() else {
                    continue;
                };
                self.classify_file(&entry, frame);
            }
        }

        while stack.len() > 1 {
            close_frame(&mut stack, &self.covers);
        }
        match stack.pop() {
            Some(frame) => finish_frame(frame, &self.covers),
            None => {
                warn!(dir = %dir.display(), "directory vanished during walk");
                DirectoryNode::empty(node_name(dir), dir.to_path_buf(), None)
            }
        }
    }

    fn classify_file(&self, entry: &DirEntry, frame: &mut Frame) {
        let path = entry.path();
        if self.covers.is_image(path) {
            frame.images.push(path.to_path_buf());
        } else if self.config.is_video(path) {
            match entry.metadata() {
                Ok(md) => frame.videos.push(VideoInfo {
                    path: path.to_path_buf(),
                    name: node_name(path),
                    size_bytes: md.len(),
                    created_time: md.created().ok(),
                    modified_time: md.modified().ok(),
                    cover_path: None,
                    metadata: None,
                }),
                Err(err) => debug!(path = %path.display(), %err, "cannot stat video, skipping"),
            }
        }
    }
}

fn points_at(entry: &DirEntry, target: &Path) -> bool {
    fs::canonicalize(entry.path())
        .map(|real| real == target)
        .unwrap_or(false)
}

fn close_frame(stack: &mut Vec<Frame>, covers: &CoverResolver) {
    if let Some(frame) = stack.pop() {
        let node = finish_frame(frame, covers);
        if let Some(parent) = stack.last_mut() {
            parent.children.push(node);
        }
    }
}

fn finish_frame(frame: Frame, covers: &CoverResolver) -> DirectoryNode {
    let videos: Vec<VideoInfo> = frame
        .videos
        .into_iter()
        .map(|mut video| {
            video.cover_path = covers.cover_in_listing(&video.path, &frame.images);
            video
        })
        .collect();
    finish_node(
        frame.name,
        frame.path,
        frame.modified,
        videos,
        frame.images.len(),
        frame.children,
    )
}

/// Post-order aggregation of counts and the folder cover.
fn finish_node(
    name: String,
    path: PathBuf,
    modified_time: Option<SystemTime>,
    videos: Vec<VideoInfo>,
    own_images: usize,
    children: Vec<DirectoryNode>,
) -> DirectoryNode {
    let video_count = videos.len() + children.iter().map(|c| c.video_count).sum::<usize>();
    let cover_count = own_images + children.iter().map(|c| c.cover_count).sum::<usize>();
    let cover_path = directory_cover(None, &videos, &children);
    DirectoryNode {
        name,
        path,
        is_directory: true,
        children,
        videos,
        video_count,
        cover_count,
        cover_path,
        modified_time,
    }
}

fn node_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
