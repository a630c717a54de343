//! Cached rule results and their binary encoding.
//!
//! An entry is written as a fixed-width timestamp, the implicit inputs
//! grouped by the service that recorded them, then the result in whatever
//! encoding the caller's [`ResultSerializer`] produces.

use crate::any_value::{AnyValue, AnyValueCodec};
use crate::codec::{Decoder, Encoder};
use crate::error::{CacheError, DecodeError};
use crate::util::{bincode_deserialize, bincode_serialize};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// One dependency discovered while the rule ran: what was asked and what
/// the answer was at the time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplicitInput {
    pub input: AnyValue,
    pub output: AnyValue,
}

/// Implicit inputs keyed by the name of the service that recorded them.
pub type Implicits = BTreeMap<String, Vec<ImplicitInput>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry<R> {
    /// Milliseconds since the unix epoch when the result was produced.
    pub timestamp: i64,
    pub implicits: Implicits,
    pub result: R,
}

/// Encoding of the result section of a cache entry.
pub trait ResultSerializer<R>: Send + Sync {
    fn write(&self, result: &R, out: &mut Encoder) -> Result<(), CacheError>;

    fn read(&self, input: &mut Decoder<'_>) -> Result<R, DecodeError>;
}

/// Stores the result as a length-prefixed bincode blob.
pub struct BincodeResultSerializer<R>(PhantomData<fn() -> R>);

impl<R> BincodeResultSerializer<R> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<R> Default for BincodeResultSerializer<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> std::fmt::Debug for BincodeResultSerializer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BincodeResultSerializer")
    }
}

impl<R: Serialize + DeserializeOwned> ResultSerializer<R> for BincodeResultSerializer<R> {
    fn write(&self, result: &R, out: &mut Encoder) -> Result<(), CacheError> {
        out.write_binary(&bincode_serialize(result)?);
        Ok(())
    }

    fn read(&self, input: &mut Decoder<'_>) -> Result<R, DecodeError> {
        let bytes = input.read_binary()?;
        bincode_deserialize(bytes).map_err(|err| DecodeError::malformed("result", err.to_string()))
    }
}

pub fn encode_entry<R>(
    entry: &CachedEntry<R>,
    values: &AnyValueCodec,
    results: &dyn ResultSerializer<R>,
) -> Result<Vec<u8>, CacheError> {
    let mut out = Encoder::new();
    out.write_long(entry.timestamp);
    out.write_small_int(entry.implicits.len());
    for (service, inputs) in &entry.implicits {
        out.write_string(service);
        out.write_small_int(inputs.len());
        for implicit in inputs {
            values.write(&implicit.input, &mut out)?;
            values.write(&implicit.output, &mut out)?;
        }
    }
    results.write(&entry.result, &mut out)?;
    Ok(out.into_vec())
}

/// Decode a whole entry. Trailing bytes after the result are an error.
pub fn decode_entry<R>(
    bytes: &[u8],
    values: &AnyValueCodec,
    results: &dyn ResultSerializer<R>,
) -> Result<CachedEntry<R>, DecodeError> {
    let mut input = Decoder::new(bytes);
    let timestamp = input.read_long()?;

    let services = input.read_small_int()?;
    let mut implicits = Implicits::new();
    for _ in 0..services {
        let service = input.read_string()?;
        let count = input.read_small_int()?;
        // `count` is untrusted; every pair takes at least two bytes.
        let mut inputs = Vec::with_capacity(count.min(input.remaining() / 2));
        for _ in 0..count {
            inputs.push(ImplicitInput {
                input: values.read(&mut input)?,
                output: values.read(&mut input)?,
            });
        }
        if implicits.insert(service, inputs).is_some() {
            return Err(DecodeError::malformed(
                "cache entry",
                "implicit inputs recorded twice for one service",
            ));
        }
    }

    let result = results.read(&mut input)?;
    if !input.is_empty() {
        return Err(DecodeError::malformed(
            "cache entry",
            format!("{} trailing bytes", input.remaining()),
        ));
    }
    Ok(CachedEntry {
        timestamp,
        implicits,
        result,
    })
}
