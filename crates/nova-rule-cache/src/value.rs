//! Immutable, hashable snapshots of caller-provided values.
//!
//! Cache keys and rule parameters are converted into a [`ValueSnapshot`] as
//! soon as they enter the cache API, so nothing the caller can still mutate is
//! ever hashed or persisted.

use crate::hash::{ContentHash, Hasher};
use crate::snapshot::FileSystemLocationSnapshot;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueSnapshot {
    Null,
    String(Arc<str>),
    Bool(bool),
    Long(i64),
    Bytes(Arc<[u8]>),
    Hash(ContentHash),
    Path(Arc<Path>),
    List(Arc<[ValueSnapshot]>),
    /// Entries sorted by key.
    Map(Arc<[(Arc<str>, ValueSnapshot)]>),
}

const LIST_MARKER: u8 = 1;
const MAP_MARKER: u8 = 2;
const PATH_MARKER: u8 = 3;

impl ValueSnapshot {
    pub fn append_to(&self, hasher: &mut Hasher) {
        match self {
            ValueSnapshot::Null => hasher.put_null(),
            ValueSnapshot::String(value) => hasher.put_string(value),
            ValueSnapshot::Bool(value) => hasher.put_bool(*value),
            ValueSnapshot::Long(value) => hasher.put_long(*value),
            ValueSnapshot::Bytes(value) => hasher.put_bytes(value),
            ValueSnapshot::Hash(value) => hasher.put_hash(value),
            ValueSnapshot::Path(value) => {
                hasher.put_marker(PATH_MARKER, 1);
                match value.to_str() {
                    Some(value) => hasher.put_string(value),
                    None => hasher.put_bytes(&raw_path_bytes(value)),
                }
            }
            ValueSnapshot::List(items) => {
                hasher.put_marker(LIST_MARKER, items.len());
                for item in items.iter() {
                    item.append_to(hasher);
                }
            }
            ValueSnapshot::Map(entries) => {
                hasher.put_marker(MAP_MARKER, entries.len());
                for (key, value) in entries.iter() {
                    hasher.put_string(key);
                    value.append_to(hasher);
                }
            }
        }
    }

    pub fn bytes(value: &[u8]) -> Self {
        ValueSnapshot::Bytes(Arc::from(value))
    }

    pub fn content_hash(&self) -> ContentHash {
        let mut hasher = Hasher::new();
        self.append_to(&mut hasher);
        hasher.finish()
    }

    pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: ToValueSnapshot,
    {
        let sorted: BTreeMap<Arc<str>, ValueSnapshot> = entries
            .into_iter()
            .map(|(key, value)| (Arc::from(key.as_ref()), value.to_value_snapshot()))
            .collect();
        ValueSnapshot::Map(sorted.into_iter().collect())
    }
}

/// Conversion into an isolated [`ValueSnapshot`].
pub trait ToValueSnapshot {
    fn to_value_snapshot(&self) -> ValueSnapshot;
}

impl ToValueSnapshot for ValueSnapshot {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        self.clone()
    }
}

impl<T: ToValueSnapshot + ?Sized> ToValueSnapshot for &T {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        (**self).to_value_snapshot()
    }
}

impl ToValueSnapshot for () {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        ValueSnapshot::Null
    }
}

impl ToValueSnapshot for str {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        ValueSnapshot::String(Arc::from(self))
    }
}

impl ToValueSnapshot for String {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        self.as_str().to_value_snapshot()
    }
}

impl ToValueSnapshot for bool {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        ValueSnapshot::Bool(*self)
    }
}

macro_rules! impl_long_snapshot {
    ($($ty:ty),*) => {
        $(
            impl ToValueSnapshot for $ty {
                fn to_value_snapshot(&self) -> ValueSnapshot {
                    ValueSnapshot::Long(i64::from(*self))
                }
            }
        )*
    };
}

impl_long_snapshot!(i8, i16, i32, i64, u8, u16, u32);

impl ToValueSnapshot for ContentHash {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        ValueSnapshot::Hash(*self)
    }
}

impl ToValueSnapshot for Path {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        ValueSnapshot::Path(Arc::from(self))
    }
}

impl ToValueSnapshot for PathBuf {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        self.as_path().to_value_snapshot()
    }
}

impl<T: ToValueSnapshot> ToValueSnapshot for Option<T> {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        match self {
            Some(value) => value.to_value_snapshot(),
            None => ValueSnapshot::Null,
        }
    }
}

impl<T: ToValueSnapshot> ToValueSnapshot for [T] {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        ValueSnapshot::List(self.iter().map(ToValueSnapshot::to_value_snapshot).collect())
    }
}

impl<T: ToValueSnapshot> ToValueSnapshot for Vec<T> {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        self.as_slice().to_value_snapshot()
    }
}

impl<K: AsRef<str>, V: ToValueSnapshot> ToValueSnapshot for BTreeMap<K, V> {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        ValueSnapshot::map(self.iter())
    }
}

impl<K: AsRef<str>, V: ToValueSnapshot> ToValueSnapshot for HashMap<K, V> {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        ValueSnapshot::map(self.iter())
    }
}

impl<A: ToValueSnapshot, B: ToValueSnapshot> ToValueSnapshot for (A, B) {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        ValueSnapshot::List(Arc::from(vec![
            self.0.to_value_snapshot(),
            self.1.to_value_snapshot(),
        ]))
    }
}

/// A filesystem location is identified by its path and its (merkle) hash.
impl ToValueSnapshot for FileSystemLocationSnapshot {
    fn to_value_snapshot(&self) -> ValueSnapshot {
        ValueSnapshot::List(Arc::from(vec![
            ValueSnapshot::String(self.absolute_path().clone()),
            ValueSnapshot::Hash(self.hash()),
        ]))
    }
}

#[cfg(unix)]
fn raw_path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(windows)]
fn raw_path_bytes(path: &Path) -> Vec<u8> {
    use std::os::windows::ffi::OsStrExt;
    path.as_os_str()
        .encode_wide()
        .flat_map(u16::to_le_bytes)
        .collect()
}

#[cfg(not(any(unix, windows)))]
fn raw_path_bytes(path: &Path) -> Vec<u8> {
    path.as_os_str().as_encoded_bytes().to_vec()
}
