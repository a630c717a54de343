//! Tagged-union codec for the loosely-typed values recorded as implicit
//! inputs.
//!
//! A small table of well-known kinds is written as a one-byte index followed
//! by a kind-specific payload. Anything else travels as an
//! [`AnyValue::Extension`]: a stable type tag plus opaque bytes produced by an
//! [`ExtensionValue`] implementation registered with the [`AnyValueCodec`].

use crate::codec::{Decoder, Encoder};
use crate::error::{CacheError, DecodeError};
use crate::hash::ContentHash;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

const NULL: u8 = 0;
const STRING: u8 = 1;
const BOOLEAN: u8 = 2;
const LONG: u8 = 3;
const BYTES: u8 = 4;
const HASH: u8 = 5;
const PATH: u8 = 6;
const ERROR: u8 = 7;
const EXTENSION: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnyValue {
    Null,
    String(String),
    Boolean(bool),
    Long(i64),
    Bytes(Vec<u8>),
    Hash(ContentHash),
    Path(PathBuf),
    Error(ErrorValue),
    Extension(ExtensionPayload),
}

/// A captured failure: its kind (type name) and message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorValue {
    pub kind: String,
    pub message: String,
}

impl ErrorValue {
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionPayload {
    pub type_tag: String,
    pub bytes: Vec<u8>,
}

/// A value type outside the well-known table.
///
/// `TYPE_TAG` is persisted and must stay stable across releases.
pub trait ExtensionValue: Sized {
    const TYPE_TAG: &'static str;

    fn encode(&self, out: &mut Encoder);

    fn decode(input: &mut Decoder<'_>) -> Result<Self, DecodeError>;
}

impl AnyValue {
    pub fn extension<T: ExtensionValue>(value: &T) -> Self {
        let mut out = Encoder::new();
        value.encode(&mut out);
        AnyValue::Extension(ExtensionPayload {
            type_tag: T::TYPE_TAG.to_string(),
            bytes: out.into_vec(),
        })
    }

    /// Decode an extension payload as `T`.
    ///
    /// Returns `None` when this is not an extension value tagged `T::TYPE_TAG`.
    pub fn to_extension<T: ExtensionValue>(&self) -> Option<Result<T, DecodeError>> {
        match self {
            AnyValue::Extension(payload) if payload.type_tag == T::TYPE_TAG => {
                Some(decode_extension::<T>(&payload.bytes))
            }
            _ => None,
        }
    }
}

impl From<&str> for AnyValue {
    fn from(value: &str) -> Self {
        AnyValue::String(value.to_string())
    }
}

impl From<String> for AnyValue {
    fn from(value: String) -> Self {
        AnyValue::String(value)
    }
}

impl From<bool> for AnyValue {
    fn from(value: bool) -> Self {
        AnyValue::Boolean(value)
    }
}

impl From<i64> for AnyValue {
    fn from(value: i64) -> Self {
        AnyValue::Long(value)
    }
}

impl From<Vec<u8>> for AnyValue {
    fn from(value: Vec<u8>) -> Self {
        AnyValue::Bytes(value)
    }
}

impl From<ContentHash> for AnyValue {
    fn from(value: ContentHash) -> Self {
        AnyValue::Hash(value)
    }
}

impl From<PathBuf> for AnyValue {
    fn from(value: PathBuf) -> Self {
        AnyValue::Path(value)
    }
}

impl<T: Into<AnyValue>> From<Option<T>> for AnyValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(AnyValue::Null, Into::into)
    }
}

fn decode_extension<T: ExtensionValue>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut input = Decoder::new(bytes);
    let value = T::decode(&mut input)?;
    if !input.is_empty() {
        return Err(DecodeError::malformed(
            "extension",
            format!(
                "{} trailing bytes after `{}` payload",
                input.remaining(),
                T::TYPE_TAG
            ),
        ));
    }
    Ok(value)
}

fn validate_extension<T: ExtensionValue>(bytes: &[u8]) -> Result<(), DecodeError> {
    decode_extension::<T>(bytes).map(drop)
}

type ExtensionValidator = fn(&[u8]) -> Result<(), DecodeError>;

/// Reads and writes [`AnyValue`]s, resolving extension tags against the
/// registered [`ExtensionValue`] types.
#[derive(Clone, Default)]
pub struct AnyValueCodec {
    extensions: HashMap<String, ExtensionValidator>,
}

impl fmt::Debug for AnyValueCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&str> = self.extensions.keys().map(String::as_str).collect();
        tags.sort_unstable();
        f.debug_struct("AnyValueCodec")
            .field("extensions", &tags)
            .finish()
    }
}

impl AnyValueCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ExtensionValue>(mut self) -> Self {
        self.extensions
            .insert(T::TYPE_TAG.to_string(), validate_extension::<T>);
        self
    }

    pub fn write(&self, value: &AnyValue, out: &mut Encoder) -> Result<(), CacheError> {
        match value {
            AnyValue::Null => out.write_byte(NULL),
            AnyValue::String(value) => {
                out.write_byte(STRING);
                out.write_string(value);
            }
            AnyValue::Boolean(value) => {
                out.write_byte(BOOLEAN);
                out.write_bool(*value);
            }
            AnyValue::Long(value) => {
                out.write_byte(LONG);
                out.write_var_long(*value);
            }
            AnyValue::Bytes(value) => {
                out.write_byte(BYTES);
                out.write_binary(value);
            }
            AnyValue::Hash(value) => {
                out.write_byte(HASH);
                out.write_hash(value);
            }
            AnyValue::Path(value) => {
                out.write_byte(PATH);
                write_path(value, out)?;
            }
            AnyValue::Error(value) => {
                out.write_byte(ERROR);
                out.write_string(&value.kind);
                out.write_string(&value.message);
            }
            AnyValue::Extension(payload) => {
                if !self.extensions.contains_key(&payload.type_tag) {
                    return Err(DecodeError::UnresolvedExtension {
                        type_tag: payload.type_tag.clone(),
                    }
                    .into());
                }
                out.write_byte(EXTENSION);
                out.write_string(&payload.type_tag);
                out.write_binary(&payload.bytes);
            }
        }
        Ok(())
    }

    pub fn read(&self, input: &mut Decoder<'_>) -> Result<AnyValue, DecodeError> {
        let offset = input.position();
        let value = match input.read_byte()? {
            NULL => AnyValue::Null,
            STRING => AnyValue::String(input.read_string()?),
            BOOLEAN => AnyValue::Boolean(input.read_bool()?),
            LONG => AnyValue::Long(input.read_var_long()?),
            BYTES => AnyValue::Bytes(input.read_binary()?.to_vec()),
            HASH => AnyValue::Hash(input.read_hash()?),
            PATH => AnyValue::Path(read_path(input)?),
            ERROR => AnyValue::Error(ErrorValue {
                kind: input.read_string()?,
                message: input.read_string()?,
            }),
            EXTENSION => {
                let type_tag = input.read_string()?;
                let bytes = input.read_binary()?;
                let Some(validate) = self.extensions.get(&type_tag) else {
                    return Err(DecodeError::UnresolvedExtension { type_tag });
                };
                validate(bytes)?;
                AnyValue::Extension(ExtensionPayload {
                    type_tag,
                    bytes: bytes.to_vec(),
                })
            }
            tag => {
                return Err(DecodeError::UnknownTag {
                    kind: "any-value",
                    tag,
                    offset,
                })
            }
        };
        Ok(value)
    }
}

/// Paths are stored as their raw OS bytes so non-UTF-8 names survive.
#[cfg(unix)]
fn write_path(path: &Path, out: &mut Encoder) -> Result<(), CacheError> {
    use std::os::unix::ffi::OsStrExt;
    out.write_binary(path.as_os_str().as_bytes());
    Ok(())
}

#[cfg(not(unix))]
fn write_path(path: &Path, out: &mut Encoder) -> Result<(), CacheError> {
    let value = path.to_str().ok_or_else(|| CacheError::NonUnicodePath {
        path: path.to_path_buf(),
    })?;
    out.write_string(value);
    Ok(())
}

#[cfg(unix)]
fn read_path(input: &mut Decoder<'_>) -> Result<PathBuf, DecodeError> {
    use std::os::unix::ffi::OsStrExt;
    let bytes = input.read_binary()?;
    Ok(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)))
}

#[cfg(not(unix))]
fn read_path(input: &mut Decoder<'_>) -> Result<PathBuf, DecodeError> {
    Ok(PathBuf::from(input.read_str()?))
}
