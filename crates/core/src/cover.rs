use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::models::{DirectoryNode, VideoInfo};
use crate::volume::{normalize, CanonicalPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverFormat {
    Jpeg,
    Png,
    Bmp,
    Webp,
}

impl CoverFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(CoverFormat::Jpeg),
            "png" => Some(CoverFormat::Png),
            "bmp" => Some(CoverFormat::Bmp),
            "webp" => Some(CoverFormat::Webp),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            CoverFormat::Jpeg => "image/jpeg",
            CoverFormat::Png => "image/png",
            CoverFormat::Bmp => "image/bmp",
            CoverFormat::Webp => "image/webp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverInfo {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub format: Option<CoverFormat>,
    pub dimensions: Option<(u32, u32)>,
}

/// Client-chosen folder covers, keyed by folder path. The engine never
/// persists these; callers pass them in on every read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverOverrides(HashMap<CanonicalPath, PathBuf>);

impl CoverOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, folder: &Path, image: impl Into<PathBuf>) {
        self.0.insert(normalize(folder), image.into());
    }

    pub fn remove(&mut self, folder: &Path) -> Option<PathBuf> {
        self.0.remove(&normalize(folder))
    }

    pub fn get(&self, folder: &Path) -> Option<&PathBuf> {
        self.0.get(&normalize(folder))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Drops overrides whose image no longer exists on disk.
    pub fn retain_existing(&mut self) {
        self.0.retain(|folder, image| {
            let keep = image.is_file();
            if !keep {
                debug!(%folder, image = %image.display(), "dropping stale cover override");
            }
            keep
        });
    }
}

impl FromIterator<(PathBuf, PathBuf)> for CoverOverrides {
    fn from_iter<T: IntoIterator<Item = (PathBuf, PathBuf)>>(iter: T) -> Self {
        let mut overrides = CoverOverrides::new();
        for (folder, image) in iter {
            overrides.insert(&folder, image);
        }
        overrides
    }
}

#[derive(Debug, Clone)]
pub struct CoverResolver {
    image_extensions: Vec<String>,
    cover_names: Vec<String>,
}

impl CoverResolver {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            image_extensions: config
                .image_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            cover_names: config.cover_names.clone(),
        }
    }

    pub fn is_image(&self, path: &Path) -> bool {
        self.extension_rank(path).is_some()
    }

    /// Looks next to the video: a same-stem image first, then a well-known name.
    pub fn find_cover_for_video(&self, video_path: &Path) -> Option<PathBuf> {
        let dir = video_path.parent()?;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), %err, "cannot list directory for cover lookup");
                return None;
            }
        };
        let mut images: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.is_image(path))
            .collect();
        images.sort();
        self.cover_in_listing(video_path, &images)
    }

    /// Same as [`find_cover_for_video`](Self::find_cover_for_video), against
    /// an already-listed set of images from the video's directory.
    pub fn cover_in_listing(&self, video_path: &Path, images: &[PathBuf]) -> Option<PathBuf> {
        let stem = video_path.file_stem()?.to_string_lossy();
        self.best_match(images, |image_stem| image_stem == stem)
            .or_else(|| {
                self.cover_names.iter().find_map(|name| {
                    self.best_match(images, |image_stem| image_stem.eq_ignore_ascii_case(name))
                })
            })
    }

    fn best_match<F>(&self, images: &[PathBuf], matches_stem: F) -> Option<PathBuf>
    where
        F: Fn(&str) -> bool,
    {
        images
            .iter()
            .filter_map(|image| {
                let rank = self.extension_rank(image)?;
                let stem = image.file_stem()?.to_string_lossy();
                matches_stem(stem.as_ref()).then_some((rank, image))
            })
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, image)| image.clone())
    }

    fn extension_rank(&self, path: &Path) -> Option<usize> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.image_extensions.iter().position(|e| *e == ext)
    }
}

/// Cover for a folder: its override, else the first video cover, else the
/// first child folder that resolves to one.
pub fn find_cover_for_directory(node: &DirectoryNode, overrides: &CoverOverrides) -> Option<PathBuf> {
    overrides
        .get(&node.path)
        .cloned()
        .or_else(|| first_video_cover(&node.videos))
        .or_else(|| {
            node.children
                .iter()
                .find_map(|child| find_cover_for_directory(child, overrides))
        })
}

/// Bottom-up form of [`find_cover_for_directory`] for nodes whose children
/// already carry their resolved `cover_path`.
pub(crate) fn directory_cover(
    override_cover: Option<&PathBuf>,
    videos: &[VideoInfo],
    children: &[DirectoryNode],
) -> Option<PathBuf> {
    override_cover
        .cloned()
        .or_else(|| first_video_cover(videos))
        .or_else(|| children.iter().find_map(|c| c.cover_path.clone()))
}

fn first_video_cover(videos: &[VideoInfo]) -> Option<PathBuf> {
    videos.iter().find_map(|v| v.cover_path.clone())
}

/// Returns a copy of `tree` with every folder cover recomputed under `overrides`.
pub fn apply_overrides(tree: &DirectoryNode, overrides: &CoverOverrides) -> DirectoryNode {
    if overrides.is_empty() {
        return tree.clone();
    }
    let children: Vec<DirectoryNode> = tree
        .children
        .iter()
        .map(|child| apply_overrides(child, overrides))
        .collect();
    let cover_path = directory_cover(overrides.get(&tree.path), &tree.videos, &children);
    DirectoryNode {
        name: tree.name.clone(),
        path: tree.path.clone(),
        is_directory: true,
        children,
        videos: tree.videos.clone(),
        video_count: tree.video_count,
        cover_count: tree.cover_count,
        cover_path,
        modified_time: tree.modified_time,
    }
}

pub fn check_file_exists(path: &Path) -> bool {
    path.exists()
}

pub fn read_image(path: &Path) -> Result<Vec<u8>> {
    let md = fs::metadata(path).map_err(|e| Error::from_io(path, e))?;
    if !md.is_file() {
        return Err(Error::NotFound(path.display().to_string()));
    }
    fs::read(path).map_err(|e| Error::from_io(path, e))
}

/// MIME type from the image bytes, falling back to the file extension.
pub fn image_mime(path: &Path, bytes: &[u8]) -> &'static str {
    infer::get(bytes)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .map(|kind| kind.mime_type())
        .or_else(|| CoverFormat::from_path(path).map(CoverFormat::mime_type))
        .unwrap_or("application/octet-stream")
}

pub fn cover_info(path: &Path) -> Result<CoverInfo> {
    let md = fs::metadata(path).map_err(|e| Error::from_io(path, e))?;
    let dimensions = match image::image_dimensions(path) {
        Ok(dims) => Some(dims),
        Err(err) => {
            debug!(path = %path.display(), %err, "cannot read image dimensions");
            None
        }
    };
    Ok(CoverInfo {
        path: path.to_path_buf(),
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        size: md.len(),
        format: CoverFormat::from_path(path),
        dimensions,
    })
}
