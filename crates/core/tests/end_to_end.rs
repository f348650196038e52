mod common;

use std::fs;

use common::{harness, write};
use tempfile::TempDir;
use videovault_core::cover::read_image;
use videovault_core::{DirectoryNode, ProbeOutcome};

fn movies() -> TempDir {
    let dir = TempDir::new().unwrap();
    let movies = dir.path().join("movies");
    write(&movies, "A/a1.mp4", b"not really an mp4");
    write(&movies, "A/a1.jpg", b"jpeg bytes");
    write(&movies, "B/sub/b1.mkv", b"not really an mkv");
    dir
}

fn assert_aggregates(node: &DirectoryNode) {
    let expected = node.videos.len() + node.children.iter().map(|c| c.video_count).sum::<usize>();
    assert_eq!(node.video_count, expected);
    node.children.iter().for_each(assert_aggregates);
}

#[test]
fn scan_then_enrich_movies_library() {
    let dir = movies();
    let root_path = dir.path().join("movies");
    let h = harness();
    let id = h.orchestrator.add_root(&root_path, None).unwrap();
    assert_eq!(h.orchestrator.get_root(&id).unwrap().display_name, "movies");

    let tree = h.orchestrator.scan(&id).unwrap();
    let names: Vec<&str> = tree.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);
    assert_eq!(tree.video_count, 2);
    assert_aggregates(&tree);

    let a = &tree.children[0];
    assert_eq!(a.videos.len(), 1);
    assert_eq!(a.videos[0].name, "a1.mp4");
    let cover = a.cover_path.clone().unwrap();
    assert_eq!(read_image(&cover).unwrap(), b"jpeg bytes");

    let b = &tree.children[1];
    assert_eq!(b.children[0].videos[0].name, "b1.mkv");
    assert_eq!(b.cover_path, None);

    let enriched = h.orchestrator.enrich(&id, &root_path.join("A")).unwrap();
    assert_eq!(enriched.len(), 1);
    assert_eq!(enriched[0].path, root_path.join("A/a1.mp4"));
    let metadata = enriched[0].outcome.metadata().unwrap();
    assert_eq!(metadata.resolution, None);

    let tree = h.orchestrator.scan(&id).unwrap();
    assert_eq!(tree.children[0].videos[0].metadata.as_ref(), Some(metadata));
    assert!(tree.children[1].children[0].videos[0].metadata.is_none());
}

#[test]
fn enrich_twice_probes_once() {
    let dir = movies();
    let root_path = dir.path().join("movies");
    let h = harness();
    let id = h.orchestrator.add_root(&root_path, None).unwrap();

    let first = h.orchestrator.enrich(&id, &root_path.join("A")).unwrap();
    let probes = h.prober.calls();
    assert_eq!(probes, 1);

    let second = h.orchestrator.enrich(&id, &root_path.join("A")).unwrap();
    assert_eq!(first, second);
    assert_eq!(h.prober.calls(), probes);
    assert_eq!(h.orchestrator.stats().probes_started, 1);
}

#[test]
fn zero_byte_video_is_a_per_file_marker() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "clips/empty.mp4", b"");
    write(dir.path(), "clips/ok.mp4", b"bytes");
    let h = harness();
    let id = h.orchestrator.add_root(dir.path(), None).unwrap();

    let results = h.orchestrator.enrich(&id, &dir.path().join("clips")).unwrap();
    assert_eq!(results.len(), 2);
    assert!(matches!(results[0].outcome, ProbeOutcome::Unreadable { .. }));
    assert!(matches!(results[1].outcome, ProbeOutcome::Probed { .. }));
}

#[test]
fn rescan_carries_metadata_only_for_unchanged_files() {
    let dir = movies();
    let root_path = dir.path().join("movies");
    let h = harness();
    let id = h.orchestrator.add_root(&root_path, None).unwrap();
    h.orchestrator.enrich(&id, &root_path.join("A")).unwrap();
    h.orchestrator.enrich(&id, &root_path.join("B/sub")).unwrap();

    fs::write(root_path.join("B/sub/b1.mkv"), b"re-encoded, now longer").unwrap();
    let tree = h.orchestrator.rescan(&id).unwrap();

    assert!(tree.children[0].videos[0].metadata.is_some());
    assert!(tree.children[1].children[0].videos[0].metadata.is_none());

    let before = h.prober.calls();
    h.orchestrator.enrich(&id, &root_path.join("B/sub")).unwrap();
    assert_eq!(h.prober.calls(), before + 1);
}

#[test]
fn repeated_scans_serialize_identically() {
    let dir = movies();
    let root_path = dir.path().join("movies");
    let h = harness();
    let id = h.orchestrator.add_root(&root_path, None).unwrap();

    let first = serde_json::to_string(&h.orchestrator.rescan(&id).unwrap()).unwrap();
    let second = serde_json::to_string(&h.orchestrator.rescan(&id).unwrap()).unwrap();
    assert_eq!(first, second);
}
