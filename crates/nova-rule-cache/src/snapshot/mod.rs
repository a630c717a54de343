//! Hierarchical, merkle-hashed snapshots of a filesystem subtree.
//!
//! A [`FileSystemLocationSnapshot`] is immutable once built. Directory hashes
//! are derived from their children, so a change anywhere in the tree yields a
//! new hash for every ancestor.
//!
//! Only the root stores its absolute path verbatim; every other node's path is
//! its parent's path joined with its own name using the platform separator.

mod codec;
mod walk;

pub use codec::{read_snapshot, write_snapshot, StringInterner};
pub use walk::snapshot_path;

use crate::hash::{dir_signature, missing_file_signature, ContentHash, Hasher};
use std::path::MAIN_SEPARATOR;
use std::sync::Arc;

/// How a location was reached while snapshotting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Direct,
    ViaSymlink,
}

impl AccessType {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            AccessType::Direct => 0,
            AccessType::ViaSymlink => 1,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(AccessType::Direct),
            1 => Some(AccessType::ViaSymlink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularFileSnapshot {
    pub absolute_path: Arc<str>,
    pub name: Arc<str>,
    pub content_hash: ContentHash,
    /// Milliseconds since the unix epoch.
    pub last_modified: i64,
    pub length: u64,
    pub access_type: AccessType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFileSnapshot {
    pub absolute_path: Arc<str>,
    pub name: Arc<str>,
    pub access_type: AccessType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySnapshot {
    absolute_path: Arc<str>,
    name: Arc<str>,
    access_type: AccessType,
    merkle_hash: ContentHash,
    children: Vec<FileSystemLocationSnapshot>,
}

impl DirectorySnapshot {
    /// Build a directory, computing its merkle hash from `children`.
    pub fn new(
        absolute_path: impl Into<Arc<str>>,
        name: impl Into<Arc<str>>,
        access_type: AccessType,
        children: Vec<FileSystemLocationSnapshot>,
    ) -> Self {
        let merkle_hash = merkle_hash(&children);
        Self::with_hash(absolute_path, name, access_type, merkle_hash, children)
    }

    /// Rebuild a directory whose merkle hash is already known (e.g. decoded
    /// from a stream).
    pub fn with_hash(
        absolute_path: impl Into<Arc<str>>,
        name: impl Into<Arc<str>>,
        access_type: AccessType,
        merkle_hash: ContentHash,
        children: Vec<FileSystemLocationSnapshot>,
    ) -> Self {
        Self {
            absolute_path: absolute_path.into(),
            name: name.into(),
            access_type,
            merkle_hash,
            children,
        }
    }

    pub fn absolute_path(&self) -> &Arc<str> {
        &self.absolute_path
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    pub fn merkle_hash(&self) -> ContentHash {
        self.merkle_hash
    }

    pub fn children(&self) -> &[FileSystemLocationSnapshot] {
        &self.children
    }
}

fn merkle_hash(children: &[FileSystemLocationSnapshot]) -> ContentHash {
    let mut hasher = Hasher::new();
    hasher.put_hash(&dir_signature());
    for child in children {
        hasher.put_string(child.name());
        hasher.put_hash(&child.hash());
    }
    hasher.finish()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSystemLocationSnapshot {
    RegularFile(RegularFileSnapshot),
    Directory(DirectorySnapshot),
    Missing(MissingFileSnapshot),
}

impl FileSystemLocationSnapshot {
    pub fn absolute_path(&self) -> &Arc<str> {
        match self {
            FileSystemLocationSnapshot::RegularFile(file) => &file.absolute_path,
            FileSystemLocationSnapshot::Directory(dir) => &dir.absolute_path,
            FileSystemLocationSnapshot::Missing(missing) => &missing.absolute_path,
        }
    }

    pub fn name(&self) -> &Arc<str> {
        match self {
            FileSystemLocationSnapshot::RegularFile(file) => &file.name,
            FileSystemLocationSnapshot::Directory(dir) => &dir.name,
            FileSystemLocationSnapshot::Missing(missing) => &missing.name,
        }
    }

    pub fn access_type(&self) -> AccessType {
        match self {
            FileSystemLocationSnapshot::RegularFile(file) => file.access_type,
            FileSystemLocationSnapshot::Directory(dir) => dir.access_type,
            FileSystemLocationSnapshot::Missing(missing) => missing.access_type,
        }
    }

    /// Content hash for files, merkle hash for directories, and the missing
    /// file signature otherwise.
    pub fn hash(&self) -> ContentHash {
        match self {
            FileSystemLocationSnapshot::RegularFile(file) => file.content_hash,
            FileSystemLocationSnapshot::Directory(dir) => dir.merkle_hash,
            FileSystemLocationSnapshot::Missing(_) => missing_file_signature(),
        }
    }

    /// Pre-order traversal of this node and all its descendants.
    pub fn visit(&self, visitor: &mut impl FnMut(&FileSystemLocationSnapshot, usize)) {
        self.visit_at(0, visitor);
    }

    fn visit_at(&self, depth: usize, visitor: &mut impl FnMut(&FileSystemLocationSnapshot, usize)) {
        visitor(self, depth);
        if let FileSystemLocationSnapshot::Directory(dir) = self {
            for child in &dir.children {
                child.visit_at(depth + 1, visitor);
            }
        }
    }
}

/// Joins `name` onto `parent` with the platform separator.
pub fn child_path(parent: &str, name: &str) -> String {
    let mut path = String::with_capacity(parent.len() + 1 + name.len());
    path.push_str(parent);
    if !parent.ends_with(MAIN_SEPARATOR) {
        path.push(MAIN_SEPARATOR);
    }
    path.push_str(name);
    path
}

/// The final segment of `absolute_path`, used as the root node's name.
pub fn file_name_of(absolute_path: &str) -> &str {
    let trimmed = absolute_path.trim_end_matches(MAIN_SEPARATOR);
    match trimmed.rfind(MAIN_SEPARATOR) {
        Some(idx) => &trimmed[idx + MAIN_SEPARATOR.len_utf8()..],
        None => trimmed,
    }
}
