use std::path::PathBuf;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors produced by the rule cache, its stores and its codecs.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("cache store {path} is already open in this process")]
    StoreLocked { path: PathBuf },

    #[error("cache store {path} has been closed")]
    StoreClosed { path: PathBuf },

    #[error("corrupt cache entry {path}: {reason}")]
    CorruptEntry { path: PathBuf, reason: String },

    #[error("cannot snapshot {path}: not a regular file")]
    NotARegularFile { path: PathBuf },

    #[error("path {path:?} is not valid unicode and cannot be encoded on this platform")]
    NonUnicodePath { path: PathBuf },

    #[error("no implicit input provider registered for service `{service}`")]
    MissingImplicitInputProvider { service: String },
}

/// Failures while reading one of the binary streams (snapshot, fingerprint
/// map, any-value, cache entry).
///
/// Decoding is all-or-nothing: none of the readers return partial values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of input: need {needed} bytes at offset {offset}, have {available}")]
    UnexpectedEof {
        needed: usize,
        offset: usize,
        available: usize,
    },

    #[error("invalid utf-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("varint at offset {offset} overflows {bits} bits")]
    VarintOverflow { offset: usize, bits: u32 },

    #[error("unknown {kind} tag {tag:#04x} at offset {offset}")]
    UnknownTag {
        kind: &'static str,
        tag: u8,
        offset: usize,
    },

    #[error("malformed {stream} stream: {reason}")]
    Malformed {
        stream: &'static str,
        reason: String,
    },

    #[error("no codec registered for extension type `{type_tag}`")]
    UnresolvedExtension { type_tag: String },
}

impl DecodeError {
    pub(crate) fn malformed(stream: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            stream,
            reason: reason.into(),
        }
    }
}

/// Error returned by [`crate::CachingRuleExecutor::execute`].
///
/// Rule failures are returned unchanged in [`ExecutionError::Rule`]; they are
/// never cached.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError<E> {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("rule execution failed")]
    Rule(#[source] E),
}

impl<E> ExecutionError<E> {
    /// Returns the rule's own error, if this failure came from a rule.
    pub fn into_rule_error(self) -> Option<E> {
        match self {
            ExecutionError::Rule(err) => Some(err),
            ExecutionError::Cache(_) => None,
        }
    }
}
