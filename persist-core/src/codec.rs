//! Codecs: converting values to and from their stored string form.
//!
//! A codec's `encode` may return `None`, meaning "remove the key" rather than
//! storing a tombstone string.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Converts between `T` and the string stored in the backend.
pub trait Codec<T>: Send + Sync {
    /// `Ok(None)` removes the key from storage.
    fn encode(&self, value: &T) -> Result<Option<String>, CodecError>;

    fn decode(&self, raw: &str) -> Result<T, CodecError>;
}

/// Stores strings as they are.
///
/// For `Option<String>`, `None` encodes to "absent" so setting `None`
/// removes the key.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Codec<String> for Identity {
    fn encode(&self, value: &String) -> Result<Option<String>, CodecError> {
        Ok(Some(value.clone()))
    }

    fn decode(&self, raw: &str) -> Result<String, CodecError> {
        Ok(raw.to_string())
    }
}

impl Codec<Option<String>> for Identity {
    fn encode(&self, value: &Option<String>) -> Result<Option<String>, CodecError> {
        Ok(value.clone())
    }

    fn decode(&self, raw: &str) -> Result<Option<String>, CodecError> {
        Ok(Some(raw.to_string()))
    }
}

/// Stores values as JSON text via `serde_json`.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Option<String>, CodecError> {
        Ok(Some(serde_json::to_string(value)?))
    }

    fn decode(&self, raw: &str) -> Result<T, CodecError> {
        Ok(serde_json::from_str(raw)?)
    }
}

type EncodeFn<T> = Box<dyn Fn(&T) -> Result<Option<String>, CodecError> + Send + Sync>;
type DecodeFn<T> = Box<dyn Fn(&str) -> Result<T, CodecError> + Send + Sync>;

/// A codec built from a pair of closures.
///
/// ```rust,ignore
/// let flag = FnCodec::new(
///     |on: &bool| Ok(on.then(|| "yes".to_string())),
///     |raw| Ok(!raw.is_empty()),
/// );
/// ```
pub struct FnCodec<T> {
    encode: EncodeFn<T>,
    decode: DecodeFn<T>,
}

impl<T> FnCodec<T> {
    pub fn new<E, D>(encode: E, decode: D) -> Self
    where
        E: Fn(&T) -> Result<Option<String>, CodecError> + Send + Sync + 'static,
        D: Fn(&str) -> Result<T, CodecError> + Send + Sync + 'static,
    {
        Self {
            encode: Box::new(encode),
            decode: Box::new(decode),
        }
    }
}

impl<T> Codec<T> for FnCodec<T> {
    fn encode(&self, value: &T) -> Result<Option<String>, CodecError> {
        (self.encode)(value)
    }

    fn decode(&self, raw: &str) -> Result<T, CodecError> {
        (self.decode)(raw)
    }
}

impl<T> fmt::Debug for FnCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnCodec")
    }
}
