//! Cross-build memoization of rule results, keyed by the content of their
//! inputs.
//!
//! Building blocks:
//! - [`FileSystemLocationSnapshot`]: merkle-hashed filesystem trees and their
//!   binary stream ([`write_snapshot`] / [`read_snapshot`])
//! - [`FileSystemLocationFingerprint`]: normalized per-path identities and
//!   their map stream ([`write_fingerprints`] / [`read_fingerprints`])
//! - [`AnyValue`]: the tagged values recorded as implicit inputs
//! - [`CachingRuleExecutor`]: the cache itself, backed by an [`EntryStore`]
//!
//! ## On-disk layout
//!
//! Stores live under `<cache_root>/<store name>/` (default cache root
//! `~/.nova/cache/rules`, overridable via `NOVA_RULE_CACHE_DIR`):
//! - `store.lock`: advisory lock held while a process has the store open
//! - `entries/<sha256 hex>.bin`: bincode envelope
//!   `{schema_version, key, payload}` around one encoded [`CachedEntry`],
//!   gated by [`ENTRY_SCHEMA_VERSION`]

mod any_value;
mod codec;
mod config;
mod entry;
mod error;
mod executor;
mod fingerprint;
mod hash;
mod lock;
mod policy;
mod snapshot;
mod store;
mod util;
mod value;

pub use any_value::{AnyValue, AnyValueCodec, ErrorValue, ExtensionPayload, ExtensionValue};
pub use codec::{Decoder, Encoder};
pub use config::{CacheConfig, DEFAULT_HOT_ENTRIES};
pub use entry::{
    decode_entry, encode_entry, BincodeResultSerializer, CachedEntry, ImplicitInput, Implicits,
    ResultSerializer,
};
pub use error::{CacheError, DecodeError, ExecutionError, Result};
pub use executor::{
    cache_key, CachingRuleExecutor, ImplicitInputRecorder, ImplicitInputValidator,
    ImplicitInputValidators, ParameterizedRule, Rule, RuleChain,
};
pub use fingerprint::{
    compare_fingerprints, fingerprint_snapshot, read_fingerprints, write_fingerprints,
    FileSystemLocationFingerprint, FileType, FingerprintChange, FingerprintMap,
    FingerprintNormalization, FingerprintingStrategy,
};
pub use hash::{dir_signature, missing_file_signature, ContentHash, Hasher, HASH_LEN};
pub use policy::{AlwaysValid, EntryInfo, ExpiryPolicy, ValidityPolicy};
pub use snapshot::{
    child_path, read_snapshot, snapshot_path, write_snapshot, AccessType, DirectorySnapshot,
    FileSystemLocationSnapshot, MissingFileSnapshot, RegularFileSnapshot, StringInterner,
};
pub use store::{EntryStore, InMemoryEntryStore, PersistentEntryStore, ENTRY_SCHEMA_VERSION};
pub use util::{atomic_write, now_millis, BINCODE_PAYLOAD_LIMIT_BYTES};
pub use value::{ToValueSnapshot, ValueSnapshot};
