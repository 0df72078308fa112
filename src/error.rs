//! Error types for redbdict.

use std::io;

use thiserror::Error;

/// The result type used throughout redbdict.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for redbdict operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller misused the API: a write on a read-mode handle, a codec
    /// request against a store whose codec is already fixed, a reserved key.
    #[error("Usage error: {0}")]
    Usage(String),

    /// The requested key is not present.
    #[error("Key not found: {0}")]
    NotFound(String),

    /// A codec could not encode, decode or be reconstructed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A codec name outside the built-in catalog was requested.
    #[error("Unknown codec name: {0}")]
    UnknownCodec(String),

    /// Persisted metadata is inconsistent or unreadable.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// The handle has already released its engine resources.
    #[error("Store is closed")]
    Closed,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The storage engine reported an error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A Lua function failed to load or run.
    #[error("Script error: {0}")]
    Script(String),
}

impl Error {
    /// Creates a new usage error.
    pub fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new codec error.
    pub fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }

    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Returns true for programmer misuse.
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::Usage(_))
    }

    /// Returns true when a key was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns true for codec failures, including unknown codec names.
    pub fn is_codec(&self) -> bool {
        matches!(self, Error::Codec(_) | Error::UnknownCodec(_))
    }
}

macro_rules! storage_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(err: $ty) -> Self {
                    Error::Storage(err.to_string())
                }
            }
        )*
    };
}

storage_error!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<mlua::Error> for Error {
    fn from(err: mlua::Error) -> Self {
        Error::Script(err.to_string())
    }
}
