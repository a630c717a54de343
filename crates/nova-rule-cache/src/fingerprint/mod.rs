//! Normalized, comparison-oriented identities of filesystem locations.
//!
//! A fingerprint keeps only what a given consumer cares about: the file type,
//! the content hash and, under [`FingerprintNormalization::Default`], a
//! normalized path. Two [`FingerprintNormalization::IgnoredPath`] fingerprints
//! with the same type and content are equal wherever the files live.

mod codec;

pub use codec::{read_fingerprints, write_fingerprints};

use crate::hash::{dir_signature, missing_file_signature, ContentHash};
use crate::snapshot::FileSystemLocationSnapshot;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Fingerprints keyed by absolute path.
pub type FingerprintMap = BTreeMap<Arc<str>, FileSystemLocationFingerprint>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Directory,
    Missing,
    RegularFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FingerprintNormalization {
    /// Keeps an identity-relevant path (e.g. relative location within a
    /// source set).
    Default { normalized_path: Arc<str> },
    /// Only the content matters (e.g. unordered classpath resources).
    IgnoredPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileSystemLocationFingerprint {
    file_type: FileType,
    content_hash: ContentHash,
    normalization: FingerprintNormalization,
}

impl FileSystemLocationFingerprint {
    pub fn directory(normalization: FingerprintNormalization) -> Self {
        Self {
            file_type: FileType::Directory,
            content_hash: dir_signature(),
            normalization,
        }
    }

    pub fn missing(normalization: FingerprintNormalization) -> Self {
        Self {
            file_type: FileType::Missing,
            content_hash: missing_file_signature(),
            normalization,
        }
    }

    pub fn regular_file(
        content_hash: ContentHash,
        normalization: FingerprintNormalization,
    ) -> Self {
        Self {
            file_type: FileType::RegularFile,
            content_hash,
            normalization,
        }
    }

    /// Builds a fingerprint of the given type; directories and missing files
    /// always carry their sentinel hash.
    pub fn of_type(
        file_type: FileType,
        content_hash: ContentHash,
        normalization: FingerprintNormalization,
    ) -> Self {
        match file_type {
            FileType::Directory => Self::directory(normalization),
            FileType::Missing => Self::missing(normalization),
            FileType::RegularFile => Self::regular_file(content_hash, normalization),
        }
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn content_hash(&self) -> ContentHash {
        self.content_hash
    }

    pub fn normalization(&self) -> &FingerprintNormalization {
        &self.normalization
    }

    pub fn normalized_path(&self) -> Option<&str> {
        match &self.normalization {
            FingerprintNormalization::Default { normalized_path } => Some(normalized_path),
            FingerprintNormalization::IgnoredPath => None,
        }
    }
}

/// How paths are normalized when fingerprinting a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintingStrategy {
    AbsolutePath,
    /// Path relative to the root; a root directory normalizes to `""`.
    RelativePath,
    NameOnly,
    /// Content only. Directories carry no content and are skipped.
    IgnoredPath,
}

/// Derive the fingerprints of every location in `snapshot`.
pub fn fingerprint_snapshot(
    snapshot: &FileSystemLocationSnapshot,
    strategy: FingerprintingStrategy,
) -> FingerprintMap {
    let mut fingerprints = FingerprintMap::new();
    // Relative paths of the open directories, indexed by depth.
    let mut relative: Vec<String> = Vec::new();
    snapshot.visit(&mut |node: &FileSystemLocationSnapshot, depth: usize| {
        relative.truncate(depth);
        let relative_path = match (depth, node) {
            (0, FileSystemLocationSnapshot::Directory(_)) => String::new(),
            (0, _) => node.name().to_string(),
            _ => match relative.last() {
                Some(parent) if !parent.is_empty() => format!("{parent}/{}", node.name()),
                _ => node.name().to_string(),
            },
        };

        let file_type = match node {
            FileSystemLocationSnapshot::Directory(_) => FileType::Directory,
            FileSystemLocationSnapshot::Missing(_) => FileType::Missing,
            FileSystemLocationSnapshot::RegularFile(_) => FileType::RegularFile,
        };
        let normalization = match strategy {
            FingerprintingStrategy::AbsolutePath => FingerprintNormalization::Default {
                normalized_path: Arc::clone(node.absolute_path()),
            },
            FingerprintingStrategy::RelativePath => FingerprintNormalization::Default {
                normalized_path: Arc::from(relative_path.as_str()),
            },
            FingerprintingStrategy::NameOnly => FingerprintNormalization::Default {
                normalized_path: Arc::clone(node.name()),
            },
            FingerprintingStrategy::IgnoredPath => FingerprintNormalization::IgnoredPath,
        };
        relative.push(relative_path);

        if strategy == FingerprintingStrategy::IgnoredPath && file_type == FileType::Directory {
            return;
        }
        fingerprints.insert(
            Arc::clone(node.absolute_path()),
            FileSystemLocationFingerprint::of_type(file_type, node.hash(), normalization),
        );
    });
    fingerprints
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintChange {
    Added(Arc<str>),
    Removed(Arc<str>),
    Modified(Arc<str>),
}

/// Per-path differences between two fingerprint maps, ordered by path.
pub fn compare_fingerprints(
    previous: &FingerprintMap,
    current: &FingerprintMap,
) -> Vec<FingerprintChange> {
    let mut changes = Vec::new();
    for (path, before) in previous {
        match current.get(path) {
            None => changes.push(FingerprintChange::Removed(Arc::clone(path))),
            Some(after) if after != before => {
                changes.push(FingerprintChange::Modified(Arc::clone(path)))
            }
            Some(_) => {}
        }
    }
    for path in current.keys() {
        if !previous.contains_key(path) {
            changes.push(FingerprintChange::Added(Arc::clone(path)));
        }
    }
    changes.sort_by(|a, b| change_path(a).cmp(change_path(b)));
    changes
}

fn change_path(change: &FingerprintChange) -> &str {
    match change {
        FingerprintChange::Added(path)
        | FingerprintChange::Removed(path)
        | FingerprintChange::Modified(path) => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::child_path;
    use crate::snapshot::fixtures::{dir, file, missing};
    use std::path::MAIN_SEPARATOR;

    fn default(path: &str) -> FingerprintNormalization {
        FingerprintNormalization::Default {
            normalized_path: path.into(),
        }
    }

    #[test]
    fn ignored_path_fingerprints_compare_by_content_only() {
        let hash = ContentHash::from_bytes(b"same");
        let ignored = || FingerprintNormalization::IgnoredPath;
        let a = FileSystemLocationFingerprint::regular_file(hash, ignored());
        let b = FileSystemLocationFingerprint::regular_file(hash, ignored());
        assert_eq!(a, b);

        let other = ContentHash::from_bytes(b"other");
        let c = FileSystemLocationFingerprint::regular_file(other, ignored());
        assert_ne!(a, c);
    }

    #[test]
    fn default_fingerprints_compare_normalized_paths() {
        let hash = ContentHash::from_bytes(b"same");
        let a = FileSystemLocationFingerprint::regular_file(hash, default("src/A.java"));
        let b = FileSystemLocationFingerprint::regular_file(hash, default("src/B.java"));
        assert_ne!(a, b);
        assert_eq!(
            a,
            FileSystemLocationFingerprint::regular_file(hash, default("src/A.java"))
        );
    }

    #[test]
    fn file_type_is_part_of_identity() {
        let dir = FileSystemLocationFingerprint::directory(FingerprintNormalization::IgnoredPath);
        let missing = FileSystemLocationFingerprint::missing(FingerprintNormalization::IgnoredPath);
        assert_ne!(dir, missing);
        assert_eq!(dir.content_hash(), dir_signature());
        assert_eq!(missing.content_hash(), missing_file_signature());
    }

    #[test]
    fn relative_path_strategy_normalizes_below_root() {
        let root = format!("{MAIN_SEPARATOR}work{MAIN_SEPARATOR}project");
        let src = child_path(&root, "src");
        let tree = dir(&root, vec![dir(&src, vec![file(&src, "A.java", "a")])]);

        let fingerprints = fingerprint_snapshot(&tree, FingerprintingStrategy::RelativePath);
        let normalized: Vec<Option<&str>> = fingerprints
            .values()
            .map(FileSystemLocationFingerprint::normalized_path)
            .collect();
        assert_eq!(normalized, vec![Some(""), Some("src"), Some("src/A.java")]);
    }

    #[test]
    fn relocated_tree_has_equal_relative_fingerprints() {
        let first = format!("{MAIN_SEPARATOR}one");
        let second = format!("{MAIN_SEPARATOR}two");
        let a = dir(&first, vec![file(&first, "x", "1"), missing(&first, "y")]);
        let b = dir(&second, vec![file(&second, "x", "1"), missing(&second, "y")]);

        let a: Vec<_> = fingerprint_snapshot(&a, FingerprintingStrategy::RelativePath)
            .into_values()
            .collect();
        let b: Vec<_> = fingerprint_snapshot(&b, FingerprintingStrategy::RelativePath)
            .into_values()
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn ignored_path_strategy_skips_directories() {
        let root = format!("{MAIN_SEPARATOR}cp");
        let tree = dir(&root, vec![file(&root, "a.class", "a"), file(&root, "b.class", "b")]);
        let fingerprints = fingerprint_snapshot(&tree, FingerprintingStrategy::IgnoredPath);
        assert_eq!(fingerprints.len(), 2);
        assert!(fingerprints
            .values()
            .all(|fp| fp.file_type() == FileType::RegularFile && fp.normalized_path().is_none()));
    }

    #[test]
    fn compare_reports_added_removed_and_modified() {
        let root = format!("{MAIN_SEPARATOR}r");
        let before = dir(
            &root,
            vec![file(&root, "keep", "k"), file(&root, "edit", "1"), file(&root, "drop", "d")],
        );
        let after = dir(
            &root,
            vec![file(&root, "keep", "k"), file(&root, "edit", "2"), file(&root, "new", "n")],
        );
        let before = fingerprint_snapshot(&before, FingerprintingStrategy::AbsolutePath);
        let after = fingerprint_snapshot(&after, FingerprintingStrategy::AbsolutePath);

        let changes = compare_fingerprints(&before, &after);
        let path = |name: &str| Arc::<str>::from(child_path(&root, name));
        assert_eq!(
            changes,
            vec![
                FingerprintChange::Removed(path("drop")),
                FingerprintChange::Modified(path("edit")),
                FingerprintChange::Added(path("new")),
            ]
        );
    }
}
