use super::{
    child_path, file_name_of, AccessType, DirectorySnapshot, FileSystemLocationSnapshot,
    MissingFileSnapshot, RegularFileSnapshot,
};
use crate::codec::{Decoder, Encoder};
use crate::error::DecodeError;
use std::collections::HashSet;
use std::sync::Arc;

const END: u8 = 0;
const DIR_OPEN: u8 = 1;
const DIR_CLOSE: u8 = 2;
const REGULAR_FILE: u8 = 3;
const MISSING: u8 = 4;

const STREAM: &str = "snapshot";

/// Deduplicates path strings so that decoding many snapshots of the same tree
/// shares one allocation per distinct path or name.
#[derive(Debug, Default)]
pub struct StringInterner {
    strings: HashSet<Arc<str>>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, value: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(value) {
            return Arc::clone(existing);
        }
        let interned: Arc<str> = Arc::from(value);
        self.strings.insert(Arc::clone(&interned));
        interned
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// Writes `snapshot` as a pre-order tag stream terminated by `END`.
///
/// `None` (an empty tree) encodes as the bare `END` tag.
///
/// Only the root's absolute path is written. On decode the root is named
/// after the last segment of that path, so a root whose name differs from its
/// path's file name does not survive the stream unchanged.
pub fn write_snapshot(snapshot: Option<&FileSystemLocationSnapshot>, out: &mut Encoder) {
    if let Some(root) = snapshot {
        write_node(root, root.absolute_path(), out);
    }
    out.write_byte(END);
}

fn write_node(node: &FileSystemLocationSnapshot, segment: &str, out: &mut Encoder) {
    match node {
        FileSystemLocationSnapshot::Directory(dir) => {
            out.write_byte(DIR_OPEN);
            out.write_string(segment);
            for child in dir.children() {
                write_node(child, child.name(), out);
            }
            // The merkle hash depends on the children, so it trails them.
            out.write_byte(DIR_CLOSE);
            out.write_byte(dir.access_type().to_byte());
            out.write_hash(&dir.merkle_hash());
        }
        FileSystemLocationSnapshot::RegularFile(file) => {
            out.write_byte(REGULAR_FILE);
            out.write_string(segment);
            out.write_byte(file.access_type.to_byte());
            out.write_hash(&file.content_hash);
            out.write_var_long(file.last_modified);
            out.write_var_long(file.length as i64);
        }
        FileSystemLocationSnapshot::Missing(missing) => {
            out.write_byte(MISSING);
            out.write_string(segment);
            out.write_byte(missing.access_type.to_byte());
        }
    }
}

struct OpenDirectory {
    absolute_path: Arc<str>,
    name: Arc<str>,
    /// Index into the arena where this directory's children start.
    first_child: usize,
}

/// Decodes a stream written by [`write_snapshot`].
///
/// Completed nodes wait in a flat arena until their directory closes; the
/// directory then takes the arena range starting at its `first_child` index.
pub fn read_snapshot(
    input: &mut Decoder<'_>,
    interner: &mut StringInterner,
) -> Result<Option<FileSystemLocationSnapshot>, DecodeError> {
    let mut open: Vec<OpenDirectory> = Vec::new();
    let mut arena: Vec<FileSystemLocationSnapshot> = Vec::new();
    let mut root: Option<FileSystemLocationSnapshot> = None;

    loop {
        let offset = input.position();
        let tag = input.read_byte()?;
        match tag {
            END => {
                if !open.is_empty() {
                    return Err(DecodeError::malformed(
                        STREAM,
                        format!("{} directories left open at end of stream", open.len()),
                    ));
                }
                return Ok(root);
            }
            DIR_OPEN => {
                let (absolute_path, name) = resolve_path(input, &open, &root, interner)?;
                open.push(OpenDirectory {
                    absolute_path,
                    name,
                    first_child: arena.len(),
                });
            }
            DIR_CLOSE => {
                let dir = open.pop().ok_or_else(|| {
                    DecodeError::malformed(
                        STREAM,
                        format!("directory close at offset {offset} without open"),
                    )
                })?;
                let access_type = read_access_type(input)?;
                let merkle_hash = input.read_hash()?;
                let children = arena.split_off(dir.first_child);
                let node = FileSystemLocationSnapshot::Directory(DirectorySnapshot::with_hash(
                    dir.absolute_path,
                    dir.name,
                    access_type,
                    merkle_hash,
                    children,
                ));
                complete(node, &open, &mut arena, &mut root);
            }
            REGULAR_FILE => {
                let (absolute_path, name) = resolve_path(input, &open, &root, interner)?;
                let access_type = read_access_type(input)?;
                let content_hash = input.read_hash()?;
                let last_modified = input.read_var_long()?;
                let length = input.read_var_long()? as u64;
                let node = FileSystemLocationSnapshot::RegularFile(RegularFileSnapshot {
                    absolute_path,
                    name,
                    content_hash,
                    last_modified,
                    length,
                    access_type,
                });
                complete(node, &open, &mut arena, &mut root);
            }
            MISSING => {
                let (absolute_path, name) = resolve_path(input, &open, &root, interner)?;
                let access_type = read_access_type(input)?;
                let node = FileSystemLocationSnapshot::Missing(MissingFileSnapshot {
                    absolute_path,
                    name,
                    access_type,
                });
                complete(node, &open, &mut arena, &mut root);
            }
            tag => {
                return Err(DecodeError::UnknownTag {
                    kind: "snapshot entry",
                    tag,
                    offset,
                })
            }
        }
    }
}

fn resolve_path(
    input: &mut Decoder<'_>,
    open: &[OpenDirectory],
    root: &Option<FileSystemLocationSnapshot>,
    interner: &mut StringInterner,
) -> Result<(Arc<str>, Arc<str>), DecodeError> {
    let segment = input.read_str()?;
    match open.last() {
        Some(parent) => {
            let absolute_path = interner.intern(&child_path(&parent.absolute_path, segment));
            Ok((absolute_path, interner.intern(segment)))
        }
        None if root.is_some() => Err(DecodeError::malformed(
            STREAM,
            "entry found after the root was complete",
        )),
        None => Ok((interner.intern(segment), interner.intern(file_name_of(segment)))),
    }
}

fn read_access_type(input: &mut Decoder<'_>) -> Result<AccessType, DecodeError> {
    let offset = input.position();
    let byte = input.read_byte()?;
    AccessType::from_byte(byte).ok_or(DecodeError::UnknownTag {
        kind: "access type",
        tag: byte,
        offset,
    })
}

fn complete(
    node: FileSystemLocationSnapshot,
    open: &[OpenDirectory],
    arena: &mut Vec<FileSystemLocationSnapshot>,
    root: &mut Option<FileSystemLocationSnapshot>,
) {
    if open.is_empty() {
        // `resolve_path` already rejected a second root.
        *root = Some(node);
    } else {
        arena.push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::fixtures::{dir, file, missing};
    use std::path::MAIN_SEPARATOR;

    fn encode(snapshot: Option<&FileSystemLocationSnapshot>) -> Vec<u8> {
        let mut out = Encoder::new();
        write_snapshot(snapshot, &mut out);
        out.into_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Option<FileSystemLocationSnapshot>, DecodeError> {
        let mut input = Decoder::new(bytes);
        let result = read_snapshot(&mut input, &mut StringInterner::new())?;
        assert!(input.is_empty(), "decoder left {} bytes", input.remaining());
        Ok(result)
    }

    fn root_path(name: &str) -> String {
        format!("{MAIN_SEPARATOR}{name}")
    }

    #[test]
    fn directory_with_file_round_trips() {
        let root = root_path("a");
        let tree = dir(&root, vec![file(&root, "b.txt", "hello")]);
        assert_eq!(decode(&encode(Some(&tree))).unwrap(), Some(tree));
    }

    #[test]
    fn nested_tree_with_empty_and_missing_entries_round_trips() {
        let root = root_path("project");
        let src = child_path(&root, "src");
        let empty = child_path(&src, "empty");
        let tree = dir(
            &root,
            vec![
                file(&root, "build.gradle", "plugins {}"),
                missing(&root, "gone"),
                dir(
                    &src,
                    vec![dir(&empty, vec![]), file(&src, "Main.java", "class Main {}")],
                ),
            ],
        );
        let decoded = decode(&encode(Some(&tree))).unwrap().unwrap();
        assert_eq!(decoded, tree);
        assert_eq!(decoded.hash(), tree.hash());
    }

    #[test]
    fn empty_tree_is_a_bare_end_tag() {
        assert_eq!(encode(None), vec![END]);
        assert_eq!(decode(&[END]).unwrap(), None);
    }

    #[test]
    fn missing_root_is_missing_then_end() {
        let root = root_path("nothing");
        let snapshot = FileSystemLocationSnapshot::Missing(MissingFileSnapshot {
            absolute_path: root.as_str().into(),
            name: "nothing".into(),
            access_type: AccessType::Direct,
        });
        let bytes = encode(Some(&snapshot));
        assert_eq!(bytes[0], MISSING);
        assert_eq!(bytes.last(), Some(&END));
        assert_eq!(decode(&bytes).unwrap(), Some(snapshot));
    }

    #[test]
    fn only_names_are_written_below_the_root() {
        let root = root_path("some-long-root-directory");
        let tree = dir(&root, vec![file(&root, "x", "")]);
        let bytes = encode(Some(&tree));
        let occurrences = bytes
            .windows(root.len())
            .filter(|window| *window == root.as_bytes())
            .count();
        assert_eq!(occurrences, 1);
    }

    #[test]
    fn decoding_interns_repeated_names() {
        let root = root_path("r");
        let a = child_path(&root, "a");
        let b = child_path(&root, "b");
        let tree = dir(
            &root,
            vec![
                dir(&a, vec![file(&a, "same.txt", "1")]),
                dir(&b, vec![file(&b, "same.txt", "2")]),
            ],
        );
        let bytes = encode(Some(&tree));
        let mut interner = StringInterner::new();
        let first = read_snapshot(&mut Decoder::new(&bytes), &mut interner)
            .unwrap()
            .unwrap();
        let interned = interner.len();
        let second = read_snapshot(&mut Decoder::new(&bytes), &mut interner)
            .unwrap()
            .unwrap();
        assert_eq!(interner.len(), interned);
        assert!(Arc::ptr_eq(first.absolute_path(), second.absolute_path()));
    }

    #[test]
    fn truncated_stream_fails() {
        let root = root_path("a");
        let tree = dir(&root, vec![file(&root, "b.txt", "hello")]);
        let bytes = encode(Some(&tree));
        for len in 0..bytes.len() {
            assert!(decode(&bytes[..len]).is_err(), "prefix of {len} bytes decoded");
        }
    }

    #[test]
    fn close_without_open_fails() {
        let mut out = Encoder::new();
        out.write_byte(DIR_CLOSE);
        out.write_byte(0);
        out.write_hash(&crate::hash::dir_signature());
        out.write_byte(END);
        let err = decode(out.as_slice()).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }), "{err:?}");
    }

    #[test]
    fn unclosed_directory_fails() {
        let mut out = Encoder::new();
        out.write_byte(DIR_OPEN);
        out.write_string(&root_path("a"));
        out.write_byte(END);
        let err = decode(out.as_slice()).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }), "{err:?}");
    }

    #[test]
    fn second_root_fails() {
        let root = root_path("a");
        let mut bytes = encode(Some(&missing(&root, "x")));
        bytes.pop();
        bytes.extend(encode(Some(&missing(&root, "y"))));
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }), "{err:?}");
    }

    #[test]
    fn unknown_tag_fails() {
        let err = decode(&[0x7f]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownTag {
                kind: "snapshot entry",
                tag: 0x7f,
                offset: 0,
            }
        );
    }

    #[test]
    fn root_name_is_derived_from_its_path() {
        let root = root_path("a");
        let renamed = FileSystemLocationSnapshot::Directory(DirectorySnapshot::new(
            root.as_str(),
            "custom",
            AccessType::Direct,
            vec![file(&root, "b.txt", "hello")],
        ));
        let decoded = decode(&encode(Some(&renamed))).unwrap().unwrap();
        assert_eq!(decoded.name().as_ref(), "a");
        assert_eq!(decoded.absolute_path(), renamed.absolute_path());
        assert_eq!(decoded.hash(), renamed.hash());
    }
}
