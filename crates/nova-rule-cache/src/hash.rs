use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

/// Length in bytes of every [`ContentHash`].
pub const HASH_LEN: usize = 32;

/// A SHA-256 content hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    pub const fn from_raw(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash an arbitrary byte slice.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(hasher.finalize().into())
    }

    /// Hash bytes read from `reader` without buffering the whole input.
    pub fn from_reader(mut reader: impl Read) -> Result<Self, CacheError> {
        let mut hasher = Sha256::new();
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// A well-known hash standing in for content that has no bytes of its own
    /// (directories, missing files).
    pub fn signature(name: &str) -> Self {
        let mut hasher = Hasher::new();
        hasher.put_string("SIGNATURE");
        hasher.put_string(name);
        hasher.finish()
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Content hash used for every directory fingerprint.
pub fn dir_signature() -> ContentHash {
    static SIGNATURE: OnceLock<ContentHash> = OnceLock::new();
    *SIGNATURE.get_or_init(|| ContentHash::signature("DIR"))
}

/// Content hash used for every missing-file fingerprint.
pub fn missing_file_signature() -> ContentHash {
    static SIGNATURE: OnceLock<ContentHash> = OnceLock::new();
    *SIGNATURE.get_or_init(|| ContentHash::signature("MISSING"))
}

/// Deterministic accumulator over a sequence of heterogeneous values.
///
/// Every `put_*` call writes a type marker and, for variable-length values, a
/// length prefix, so `["ab", "c"]` and `["a", "bc"]` never collide.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    const NULL: u8 = 0;
    const STRING: u8 = 1;
    const BOOL: u8 = 2;
    const LONG: u8 = 3;
    const BYTES: u8 = 4;
    const HASH: u8 = 5;
    const MARKER: u8 = 6;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_null(&mut self) {
        self.inner.update([Self::NULL]);
    }

    pub fn put_string(&mut self, value: &str) {
        self.inner.update([Self::STRING]);
        self.put_len(value.len());
        self.inner.update(value.as_bytes());
    }

    pub fn put_bool(&mut self, value: bool) {
        self.inner.update([Self::BOOL, u8::from(value)]);
    }

    pub fn put_long(&mut self, value: i64) {
        self.inner.update([Self::LONG]);
        self.inner.update(value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        self.inner.update([Self::BYTES]);
        self.put_len(value.len());
        self.inner.update(value);
    }

    pub fn put_hash(&mut self, value: &ContentHash) {
        self.inner.update([Self::HASH]);
        self.inner.update(value.as_bytes());
    }

    /// Structural marker (e.g. start of a list with `len` elements).
    pub fn put_marker(&mut self, marker: u8, len: usize) {
        self.inner.update([Self::MARKER, marker]);
        self.put_len(len);
    }

    fn put_len(&mut self, len: usize) {
        self.inner.update((len as u64).to_le_bytes());
    }

    pub fn finish(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        assert_eq!(ContentHash::from_bytes(b"abc"), ContentHash::from_bytes(b"abc"));
        assert_ne!(ContentHash::from_bytes(b"abc"), ContentHash::from_bytes(b"abd"));
    }

    #[test]
    fn reader_and_slice_agree() {
        let data = vec![7_u8; 200_000];
        let streamed = ContentHash::from_reader(std::io::Cursor::new(&data)).unwrap();
        assert_eq!(streamed, ContentHash::from_bytes(&data));
    }

    #[test]
    fn hasher_length_prefixes_strings() {
        let mut a = Hasher::new();
        a.put_string("ab");
        a.put_string("c");
        let mut b = Hasher::new();
        b.put_string("a");
        b.put_string("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn signatures_are_distinct() {
        assert_ne!(dir_signature(), missing_file_signature());
        assert_eq!(dir_signature(), ContentHash::signature("DIR"));
    }

    #[test]
    fn display_is_lowercase_hex() {
        let hash = ContentHash::from_raw([0xAB; HASH_LEN]);
        assert_eq!(hash.to_string(), "ab".repeat(HASH_LEN));
    }
}
