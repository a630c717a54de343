use nova_rule_cache::{
    compare_fingerprints, fingerprint_snapshot, read_fingerprints, read_snapshot, snapshot_path,
    write_fingerprints, write_snapshot, AccessType, Decoder, Encoder, FileSystemLocationSnapshot,
    FingerprintChange, FingerprintingStrategy, StringInterner,
};
use std::path::Path;
use tempfile::TempDir;

fn encode_snapshot(snapshot: &FileSystemLocationSnapshot) -> Vec<u8> {
    let mut out = Encoder::new();
    write_snapshot(Some(snapshot), &mut out);
    out.into_vec()
}

fn write_tree(root: &Path) {
    std::fs::create_dir_all(root.join("src/main/java/pkg")).unwrap();
    std::fs::create_dir_all(root.join("src/test")).unwrap();
    std::fs::write(root.join("build.gradle"), "apply plugin: 'java'\n").unwrap();
    std::fs::write(root.join("src/main/java/pkg/A.java"), "class A {}\n").unwrap();
    std::fs::write(root.join("src/main/java/pkg/B.java"), "class B {}\n").unwrap();
}

#[test]
fn walked_tree_survives_the_snapshot_stream() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("project");
    write_tree(&root);

    let snapshot = snapshot_path(&root).unwrap();
    let bytes = encode_snapshot(&snapshot);

    let mut interner = StringInterner::new();
    let mut input = Decoder::new(&bytes);
    let decoded = read_snapshot(&mut input, &mut interner).unwrap().unwrap();
    assert!(input.is_empty());
    assert_eq!(decoded, snapshot);
    assert_eq!(decoded.hash(), snapshot.hash());
}

#[test]
fn identical_trees_in_different_places_share_relative_fingerprints() {
    let tmp = TempDir::new().unwrap();
    let first = tmp.path().join("first");
    let second = tmp.path().join("second");
    write_tree(&first);
    write_tree(&second);

    let first = snapshot_path(&first).unwrap();
    let second = snapshot_path(&second).unwrap();
    assert_eq!(first.hash(), second.hash());

    let first = fingerprint_snapshot(&first, FingerprintingStrategy::RelativePath);
    let second = fingerprint_snapshot(&second, FingerprintingStrategy::RelativePath);
    assert!(first.values().eq(second.values()));
}

#[test]
fn fingerprint_stream_reports_changes_after_edit() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("project");
    write_tree(&root);

    let before = fingerprint_snapshot(
        &snapshot_path(&root).unwrap(),
        FingerprintingStrategy::AbsolutePath,
    );
    let mut out = Encoder::new();
    write_fingerprints(&before, &mut out);
    let bytes = out.into_vec();
    let persisted =
        read_fingerprints(&mut Decoder::new(&bytes), &mut StringInterner::new()).unwrap();
    assert_eq!(persisted, before);

    std::fs::write(root.join("src/main/java/pkg/A.java"), "class A { int x; }\n").unwrap();
    std::fs::remove_file(root.join("build.gradle")).unwrap();
    std::fs::write(root.join("src/test/ATest.java"), "class ATest {}\n").unwrap();

    let after = fingerprint_snapshot(
        &snapshot_path(&root).unwrap(),
        FingerprintingStrategy::AbsolutePath,
    );
    let changes: Vec<(String, &str)> = compare_fingerprints(&persisted, &after)
        .into_iter()
        .map(|change| match change {
            FingerprintChange::Added(path) => (path.to_string(), "added"),
            FingerprintChange::Removed(path) => (path.to_string(), "removed"),
            FingerprintChange::Modified(path) => (path.to_string(), "modified"),
        })
        .collect();

    let path = |relative: &str| root.join(relative).to_string_lossy().into_owned();
    assert_eq!(changes.len(), 3, "{changes:?}");
    assert!(changes.contains(&(path("build.gradle"), "removed")));
    assert!(changes.contains(&(path("src/main/java/pkg/A.java"), "modified")));
    assert!(changes.contains(&(path("src/test/ATest.java"), "added")));
}

#[cfg(unix)]
#[test]
fn symlinked_entries_are_marked() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("project");
    write_tree(&root);
    std::os::unix::fs::symlink(root.join("build.gradle"), root.join("link.gradle")).unwrap();

    let snapshot = snapshot_path(&root).unwrap();
    let mut accesses = Vec::new();
    snapshot.visit(&mut |node: &FileSystemLocationSnapshot, _depth: usize| {
        accesses.push((node.name().to_string(), node.access_type()));
    });
    assert!(accesses.contains(&("link.gradle".to_string(), AccessType::ViaSymlink)));
    assert!(accesses.contains(&("build.gradle".to_string(), AccessType::Direct)));

    let bytes = encode_snapshot(&snapshot);
    let decoded = read_snapshot(&mut Decoder::new(&bytes), &mut StringInterner::new())
        .unwrap()
        .unwrap();
    assert_eq!(decoded, snapshot);
}
