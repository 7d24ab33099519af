//! Error types.
//!
//! Codec and storage failures are never swallowed: they come back from
//! `set`, from the constructors, and from event delivery.

use thiserror::Error;

/// Failure converting between an in-memory value and its stored string.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value: {0}")]
    Invalid(String),
}

impl CodecError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Failure reported by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exceeded while writing `{key}`")]
    QuotaExceeded { key: String },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Top-level error for persistent stores.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to decode `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: CodecError,
    },
    #[error("failed to encode `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: CodecError,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PersistError {
    pub fn decode(key: &str, source: CodecError) -> Self {
        Self::Decode {
            key: key.to_string(),
            source,
        }
    }

    pub fn encode(key: &str, source: CodecError) -> Self {
        Self::Encode {
            key: key.to_string(),
            source,
        }
    }
}

pub type Result<T, E = PersistError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_names_the_key() {
        let err = PersistError::decode("locale", CodecError::invalid("not a list"));
        assert_eq!(
            err.to_string(),
            "failed to decode `locale`: invalid value: not a list"
        );
    }

    #[test]
    fn storage_error_converts() {
        let err: PersistError = StorageError::QuotaExceeded { key: "big".into() }.into();
        assert!(matches!(err, PersistError::Storage(_)));
    }
}
