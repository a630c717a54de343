use super::{FileSystemLocationFingerprint, FileType, FingerprintMap, FingerprintNormalization};
use crate::codec::{Decoder, Encoder};
use crate::error::DecodeError;
use crate::hash::{dir_signature, missing_file_signature};
use crate::snapshot::StringInterner;
use std::sync::Arc;

const DIRECTORY: u8 = 0;
const MISSING: u8 = 1;
const REGULAR_FILE: u8 = 2;

const NORMALIZATION_DEFAULT: u8 = 0;
const NORMALIZATION_IGNORED_PATH: u8 = 1;

/// Writes a leading entry count, then per entry: path, file type, content
/// hash (regular files only), normalization and, for `Default`, the
/// normalized path.
pub fn write_fingerprints(fingerprints: &FingerprintMap, out: &mut Encoder) {
    out.write_small_int(fingerprints.len());
    for (path, fingerprint) in fingerprints {
        out.write_string(path);
        match fingerprint.file_type() {
            FileType::Directory => out.write_byte(DIRECTORY),
            FileType::Missing => out.write_byte(MISSING),
            FileType::RegularFile => {
                out.write_byte(REGULAR_FILE);
                out.write_hash(&fingerprint.content_hash());
            }
        }
        match fingerprint.normalization() {
            FingerprintNormalization::Default { normalized_path } => {
                out.write_byte(NORMALIZATION_DEFAULT);
                out.write_string(normalized_path);
            }
            FingerprintNormalization::IgnoredPath => out.write_byte(NORMALIZATION_IGNORED_PATH),
        }
    }
}

pub fn read_fingerprints(
    input: &mut Decoder<'_>,
    interner: &mut StringInterner,
) -> Result<FingerprintMap, DecodeError> {
    let count = input.read_small_int()?;
    let mut fingerprints = FingerprintMap::new();
    for _ in 0..count {
        let path = interner.intern(input.read_str()?);

        let offset = input.position();
        let (file_type, content_hash) = match input.read_byte()? {
            DIRECTORY => (FileType::Directory, dir_signature()),
            MISSING => (FileType::Missing, missing_file_signature()),
            REGULAR_FILE => (FileType::RegularFile, input.read_hash()?),
            tag => {
                return Err(DecodeError::UnknownTag {
                    kind: "file type",
                    tag,
                    offset,
                })
            }
        };

        let offset = input.position();
        let normalization = match input.read_byte()? {
            NORMALIZATION_DEFAULT => FingerprintNormalization::Default {
                normalized_path: interner.intern(input.read_str()?),
            },
            NORMALIZATION_IGNORED_PATH => FingerprintNormalization::IgnoredPath,
            tag => {
                return Err(DecodeError::UnknownTag {
                    kind: "fingerprint normalization",
                    tag,
                    offset,
                })
            }
        };

        let fingerprint =
            FileSystemLocationFingerprint::of_type(file_type, content_hash, normalization);
        if fingerprints.insert(Arc::clone(&path), fingerprint).is_some() {
            return Err(DecodeError::malformed(
                "fingerprint",
                format!("duplicate entry for {path}"),
            ));
        }
    }
    Ok(fingerprints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{fingerprint_snapshot, FingerprintingStrategy};
    use crate::hash::ContentHash;
    use crate::snapshot::child_path;
    use crate::snapshot::fixtures::{dir, file, missing};
    use std::path::MAIN_SEPARATOR;

    fn encode(fingerprints: &FingerprintMap) -> Vec<u8> {
        let mut out = Encoder::new();
        write_fingerprints(fingerprints, &mut out);
        out.into_vec()
    }

    fn decode(bytes: &[u8]) -> Result<FingerprintMap, DecodeError> {
        read_fingerprints(&mut Decoder::new(bytes), &mut StringInterner::new())
    }

    #[test]
    fn fingerprints_of_every_kind_round_trip() {
        let root = format!("{MAIN_SEPARATOR}src");
        let pkg = child_path(&root, "pkg");
        let tree = dir(
            &root,
            vec![dir(&pkg, vec![file(&pkg, "A.java", "a")]), missing(&root, "gone")],
        );
        for strategy in [
            FingerprintingStrategy::AbsolutePath,
            FingerprintingStrategy::RelativePath,
            FingerprintingStrategy::NameOnly,
            FingerprintingStrategy::IgnoredPath,
        ] {
            let fingerprints = fingerprint_snapshot(&tree, strategy);
            assert_eq!(decode(&encode(&fingerprints)).unwrap(), fingerprints, "{strategy:?}");
        }
    }

    #[test]
    fn directory_entries_do_not_store_hashes() {
        let mut fingerprints = FingerprintMap::new();
        fingerprints.insert(
            Arc::from("/d"),
            FileSystemLocationFingerprint::directory(FingerprintNormalization::IgnoredPath),
        );
        // count + path (len + 2 bytes) + type + normalization
        assert_eq!(encode(&fingerprints).len(), 1 + 3 + 1 + 1);
    }

    #[test]
    fn empty_map_round_trips() {
        let fingerprints = FingerprintMap::new();
        assert_eq!(encode(&fingerprints), vec![0]);
        assert!(decode(&[0]).unwrap().is_empty());
    }

    #[test]
    fn unknown_file_type_is_fatal() {
        let mut out = Encoder::new();
        out.write_small_int(1);
        out.write_string("/x");
        out.write_byte(9);
        let err = decode(out.as_slice()).unwrap_err();
        assert!(
            matches!(err, DecodeError::UnknownTag { kind: "file type", tag: 9, .. }),
            "{err:?}"
        );
    }

    #[test]
    fn unknown_normalization_is_fatal() {
        let mut out = Encoder::new();
        out.write_small_int(1);
        out.write_string("/x");
        out.write_byte(REGULAR_FILE);
        out.write_hash(&ContentHash::from_bytes(b"x"));
        out.write_byte(7);
        let err = decode(out.as_slice()).unwrap_err();
        assert!(
            matches!(
                err,
                DecodeError::UnknownTag {
                    kind: "fingerprint normalization",
                    tag: 7,
                    ..
                }
            ),
            "{err:?}"
        );
    }

    #[test]
    fn truncated_map_is_an_error() {
        let mut fingerprints = FingerprintMap::new();
        fingerprints.insert(
            Arc::from("/f"),
            FileSystemLocationFingerprint::regular_file(
                ContentHash::from_bytes(b"f"),
                FingerprintNormalization::Default {
                    normalized_path: "f".into(),
                },
            ),
        );
        let bytes = encode(&fingerprints);
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
