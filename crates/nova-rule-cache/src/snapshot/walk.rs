use super::{
    child_path, file_name_of, AccessType, DirectorySnapshot, FileSystemLocationSnapshot,
    MissingFileSnapshot, RegularFileSnapshot,
};
use crate::error::CacheError;
use crate::hash::ContentHash;
use std::fs::Metadata;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

struct PendingDirectory {
    absolute_path: Arc<str>,
    name: Arc<str>,
    access_type: AccessType,
    children: Vec<FileSystemLocationSnapshot>,
}

impl PendingDirectory {
    fn finish(self) -> FileSystemLocationSnapshot {
        FileSystemLocationSnapshot::Directory(DirectorySnapshot::new(
            self.absolute_path,
            self.name,
            self.access_type,
            self.children,
        ))
    }
}

/// Snapshot the filesystem location at `root`.
///
/// Children are visited in file-name order so the merkle hash only depends on
/// the tree's contents. Symlinks are followed; locations reached through one
/// are marked [`AccessType::ViaSymlink`]. A dangling symlink snapshots as a
/// missing location and a symlink back to an ancestor directory is skipped.
///
/// Fails with [`CacheError::NotARegularFile`] when the tree contains a FIFO,
/// socket or device.
pub fn snapshot_path(root: &Path) -> Result<FileSystemLocationSnapshot, CacheError> {
    let root_path = root.to_string_lossy().into_owned();
    let root_name = file_name_of(&root_path).to_string();

    let root_meta = match std::fs::symlink_metadata(root) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FileSystemLocationSnapshot::Missing(MissingFileSnapshot {
                absolute_path: root_path.into(),
                name: root_name.into(),
                access_type: AccessType::Direct,
            }));
        }
        Err(err) => return Err(err.into()),
    };
    let root_access = if root_meta.file_type().is_symlink() {
        AccessType::ViaSymlink
    } else {
        AccessType::Direct
    };

    // Dangling symlinks resolve to a missing location.
    let target_meta = match std::fs::metadata(root) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FileSystemLocationSnapshot::Missing(MissingFileSnapshot {
                absolute_path: root_path.into(),
                name: root_name.into(),
                access_type: root_access,
            }));
        }
        Err(err) => return Err(err.into()),
    };
    if !target_meta.is_dir() {
        return regular_file(root, root_path.into(), root_name.into(), root_access, &target_meta);
    }

    let mut stack: Vec<PendingDirectory> = vec![PendingDirectory {
        absolute_path: root_path.into(),
        name: root_name.into(),
        access_type: root_access,
        children: Vec::new(),
    }];

    let walker = WalkDir::new(root)
        .follow_links(true)
        .min_depth(1)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(ancestor) = err.loop_ancestor() {
                    tracing::debug!(
                        target = "nova.rule_cache",
                        path = ?err.path(),
                        ancestor = %ancestor.display(),
                        "skipping symlink loop while snapshotting"
                    );
                    continue;
                }
                let Some(path) = dangling_symlink(&err) else {
                    return Err(err.into());
                };
                close_to_depth(&mut stack, err.depth());
                let Some(parent) = stack.last() else {
                    continue;
                };
                let name: Arc<str> = Arc::from(file_name_lossy(path).as_str());
                let missing = FileSystemLocationSnapshot::Missing(MissingFileSnapshot {
                    absolute_path: Arc::from(child_path(&parent.absolute_path, &name)),
                    name,
                    access_type: AccessType::ViaSymlink,
                });
                push_child(&mut stack, missing);
                continue;
            }
        };
        close_to_depth(&mut stack, entry.depth());
        let Some(parent) = stack.last() else {
            continue;
        };

        let name: Arc<str> = Arc::from(entry.file_name().to_string_lossy().as_ref());
        let absolute_path: Arc<str> = Arc::from(child_path(&parent.absolute_path, &name));
        let access_type = if entry.path_is_symlink() {
            AccessType::ViaSymlink
        } else {
            AccessType::Direct
        };

        if entry.file_type().is_dir() {
            stack.push(PendingDirectory {
                absolute_path,
                name,
                access_type,
                children: Vec::new(),
            });
        } else {
            let meta = entry.metadata()?;
            let file = regular_file(entry.path(), absolute_path, name, access_type, &meta)?;
            push_child(&mut stack, file);
        }
    }

    let mut snapshot = None;
    while let Some(dir) = stack.pop() {
        let finished = dir.finish();
        if stack.is_empty() {
            snapshot = Some(finished);
        } else {
            push_child(&mut stack, finished);
        }
    }
    snapshot.ok_or_else(|| std::io::Error::other("directory walk produced no root").into())
}

/// Finish open directories until `stack` holds the root plus every directory
/// down to `depth - 1`.
fn close_to_depth(stack: &mut Vec<PendingDirectory>, depth: usize) {
    while stack.len() > depth {
        if let Some(finished) = stack.pop() {
            push_child(stack, finished.finish());
        }
    }
}

/// The path of a symlink whose target does not exist, if that is what `err`
/// reports.
fn dangling_symlink(err: &walkdir::Error) -> Option<&Path> {
    let path = err.path()?;
    let not_found = err
        .io_error()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
    let is_symlink = std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false);
    (not_found && is_symlink).then_some(path)
}

fn file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn push_child(stack: &mut [PendingDirectory], child: FileSystemLocationSnapshot) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(child);
    }
}

fn regular_file(
    path: &Path,
    absolute_path: Arc<str>,
    name: Arc<str>,
    access_type: AccessType,
    meta: &Metadata,
) -> Result<FileSystemLocationSnapshot, CacheError> {
    // FIFOs, sockets and devices would block or never end when read.
    if !meta.is_file() {
        return Err(CacheError::NotARegularFile {
            path: path.to_path_buf(),
        });
    }
    Ok(FileSystemLocationSnapshot::RegularFile(RegularFileSnapshot {
        absolute_path,
        name,
        content_hash: ContentHash::from_file(path)?,
        last_modified: last_modified_millis(path, meta),
        length: meta.len(),
        access_type,
    }))
}

fn last_modified_millis(path: &Path, meta: &Metadata) -> i64 {
    let modified = meta
        .modified()
        .map_err(|err| err.to_string())
        .and_then(|time| {
            time.duration_since(UNIX_EPOCH)
                .map_err(|err| err.to_string())
        });
    match modified {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(err) => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "nova.rule_cache",
                    path = %path.display(),
                    error = %err,
                    "failed to read file mtime; using 0 for snapshot"
                );
            }
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoder, Encoder};
    use crate::snapshot::{read_snapshot, write_snapshot, StringInterner};

    #[test]
    fn missing_root_snapshots_as_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = snapshot_path(&tmp.path().join("nope")).unwrap();
        assert!(matches!(snapshot, FileSystemLocationSnapshot::Missing(_)));
        assert_eq!(snapshot.name().as_ref(), "nope");
    }

    #[test]
    fn single_file_root() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();
        let FileSystemLocationSnapshot::RegularFile(file) = snapshot_path(&path).unwrap() else {
            panic!("expected regular file");
        };
        assert_eq!(file.content_hash, ContentHash::from_bytes(b"abc"));
        assert_eq!(file.length, 3);
        assert_eq!(file.name.as_ref(), "a.txt");
    }

    #[test]
    fn directory_tree_is_sorted_and_paths_are_joined() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("b/nested")).unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        std::fs::write(root.join("c.txt"), b"c").unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("b/nested/deep.txt"), b"deep").unwrap();

        let snapshot = snapshot_path(&root).unwrap();
        let FileSystemLocationSnapshot::Directory(dir) = &snapshot else {
            panic!("expected directory");
        };
        let names: Vec<&str> = dir.children().iter().map(|c| c.name().as_ref()).collect();
        assert_eq!(names, vec!["a.txt", "b", "c.txt", "empty"]);

        snapshot.visit(&mut |node: &FileSystemLocationSnapshot, _depth: usize| {
            assert!(Path::new(node.absolute_path().as_ref()).exists(), "{node:?}");
        });

        let mut out = Encoder::new();
        write_snapshot(Some(&snapshot), &mut out);
        let bytes = out.into_vec();
        let decoded = read_snapshot(&mut Decoder::new(&bytes), &mut StringInterner::new())
            .unwrap()
            .unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn nested_change_changes_root_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("x/y")).unwrap();
        std::fs::write(root.join("x/y/file"), b"1").unwrap();
        let before = snapshot_path(&root).unwrap();
        let unchanged = snapshot_path(&root).unwrap();
        assert_eq!(before.hash(), unchanged.hash());

        std::fs::write(root.join("x/y/file"), b"2").unwrap();
        let after = snapshot_path(&root).unwrap();
        assert_ne!(before.hash(), after.hash());
    }

    #[cfg(unix)]
    #[test]
    fn fifo_is_rejected_instead_of_read() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        let fifo = root.join("pipe");
        let status = std::process::Command::new("mkfifo")
            .arg(&fifo)
            .status()
            .unwrap();
        assert!(status.success());

        let err = snapshot_path(&root).unwrap_err();
        assert!(
            matches!(&err, CacheError::NotARegularFile { path } if path == &fifo),
            "{err:?}"
        );
        let err = snapshot_path(&fifo).unwrap_err();
        assert!(matches!(err, CacheError::NotARegularFile { .. }), "{err:?}");
    }

    #[cfg(unix)]
    #[test]
    fn socket_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("agent.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();

        let err = snapshot_path(tmp.path()).unwrap_err();
        assert!(matches!(err, CacheError::NotARegularFile { .. }), "{err:?}");
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_inside_tree_is_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::os::unix::fs::symlink(root.join("nowhere"), root.join("dangling")).unwrap();

        let snapshot = snapshot_path(&root).unwrap();
        let FileSystemLocationSnapshot::Directory(dir) = &snapshot else {
            panic!("expected directory");
        };
        let names: Vec<&str> = dir.children().iter().map(|c| c.name().as_ref()).collect();
        assert_eq!(names, vec!["a.txt", "dangling"]);
        let FileSystemLocationSnapshot::Missing(missing) = &dir.children()[1] else {
            panic!("expected missing entry, got {:?}", dir.children()[1]);
        };
        assert_eq!(missing.access_type, AccessType::ViaSymlink);
        assert_eq!(
            missing.absolute_path.as_ref(),
            child_path(&root.to_string_lossy(), "dangling")
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loop_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/file.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(&root, root.join("sub/loop")).unwrap();

        let snapshot = snapshot_path(&root).unwrap();
        let mut names = Vec::new();
        snapshot.visit(&mut |node: &FileSystemLocationSnapshot, _depth: usize| {
            names.push(node.name().to_string());
        });
        assert_eq!(names, vec!["root", "sub", "file.txt"]);
    }
}
