//! Pure tree transformations. Nodes are never edited in place: every
//! function here returns a new tree and leaves its input untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::{DirectoryNode, EnrichedVideo, ProbeOutcome, VideoInfo, VideoMetadata};
use crate::volume::{normalize, CanonicalPath};

/// Copies metadata from `old` into `new` for every video whose path, size and
/// mtime are unchanged. Changed files come through without metadata.
pub fn carry_forward(old: &DirectoryNode, new: DirectoryNode) -> DirectoryNode {
    let mut previous = Vec::new();
    old.walk_videos(&mut previous);
    let index: HashMap<&Path, &VideoInfo> = previous
        .into_iter()
        .filter(|v| v.metadata.is_some())
        .map(|v| (v.path.as_path(), v))
        .collect();
    if index.is_empty() {
        return new;
    }
    rebuild(new, &|video: VideoInfo| match index.get(video.path.as_path()) {
        Some(old_video) if video.metadata.is_none() && old_video.same_content(&video) => {
            VideoInfo {
                metadata: old_video.metadata.clone(),
                ..video
            }
        }
        _ => video,
    })
}

pub fn find_node<'a>(tree: &'a DirectoryNode, dir: &Path) -> Option<&'a DirectoryNode> {
    let target = normalize(dir);
    find_normalized(tree, &target)
}

fn find_normalized<'a>(node: &'a DirectoryNode, target: &CanonicalPath) -> Option<&'a DirectoryNode> {
    let here = normalize(&node.path);
    if here == *target {
        return Some(node);
    }
    if !is_within(target, &here) {
        return None;
    }
    node.children
        .iter()
        .find_map(|child| find_normalized(child, target))
}

fn is_within(target: &CanonicalPath, ancestor: &CanonicalPath) -> bool {
    let (t, a) = (target.as_str(), ancestor.as_str());
    if a == "/" || a == "." {
        return true;
    }
    t.len() > a.len() && t.starts_with(a) && t.as_bytes()[a.len()] == b'/'
}

/// Returns a new tree in which the videos of the node at `dir` carry the
/// metadata from `results`. Unreadable outcomes leave metadata absent.
pub fn splice_metadata(tree: &DirectoryNode, dir: &Path, results: &[EnrichedVideo]) -> DirectoryNode {
    let probed: HashMap<&Path, &VideoMetadata> = results
        .iter()
        .filter_map(|r| match &r.outcome {
            ProbeOutcome::Probed { metadata } => Some((r.path.as_path(), metadata)),
            ProbeOutcome::Unreadable { .. } => None,
        })
        .collect();
    let target = normalize(dir);
    splice_node(tree, &target, &probed)
}

fn splice_node(
    node: &DirectoryNode,
    target: &CanonicalPath,
    probed: &HashMap<&Path, &VideoMetadata>,
) -> DirectoryNode {
    let here = normalize(&node.path);
    if here == *target {
        let videos = node
            .videos
            .iter()
            .map(|v| match probed.get(v.path.as_path()) {
                Some(metadata) => v.with_metadata(Some((*metadata).clone())),
                None => v.clone(),
            })
            .collect();
        return DirectoryNode {
            videos,
            ..node.clone()
        };
    }
    if !is_within(target, &here) {
        return node.clone();
    }
    DirectoryNode {
        name: node.name.clone(),
        path: node.path.clone(),
        is_directory: node.is_directory,
        children: node
            .children
            .iter()
            .map(|child| splice_node(child, target, probed))
            .collect(),
        videos: node.videos.clone(),
        video_count: node.video_count,
        cover_count: node.cover_count,
        cover_path: node.cover_path.clone(),
        modified_time: node.modified_time,
    }
}

fn rebuild(node: DirectoryNode, f: &dyn Fn(VideoInfo) -> VideoInfo) -> DirectoryNode {
    DirectoryNode {
        children: node.children.into_iter().map(|c| rebuild(c, f)).collect(),
        videos: node.videos.into_iter().map(f).collect(),
        ..node
    }
}

/// Paths of the videos directly inside `node` that still need probing.
pub fn missing_metadata(node: &DirectoryNode) -> Vec<PathBuf> {
    node.videos
        .iter()
        .filter(|v| v.metadata.is_none())
        .map(|v| v.path.clone())
        .collect()
}
