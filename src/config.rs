//! Configuration options for opening a store.

use std::fmt;
use std::str::FromStr;

use crate::capsule::Serializers;
use crate::codec::{CodecRequest, CodecSpec};
use crate::error::{Error, Result};

/// Access mode of a store handle, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Read-only snapshot.
    #[default]
    Read,
    /// Single long-lived write transaction.
    Write,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Read => f.write_str("read"),
            Mode::Write => f.write_str("write"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" | "read" => Ok(Mode::Read),
            "w" | "write" => Ok(Mode::Write),
            other => Err(Error::usage(format!("unknown mode {:?}, expected \"r\" or \"w\"", other))),
        }
    }
}

/// Configuration options for opening a store.
#[derive(Debug, Clone)]
pub struct Options {
    /// Read or write.
    /// Default: Mode::Read
    pub mode: Mode,

    /// Requested key codec. Must stay unset when reopening a written store.
    /// Default: unset
    pub key: CodecRequest,

    /// Requested value codec. Must stay unset when reopening a written store.
    /// Default: unset
    pub value: CodecRequest,

    /// Skip the key index on reads and ask the engine directly.
    /// Default: false
    pub unsafe_get: bool,

    /// Capacity hint for the engine page cache (in bytes).
    /// Default: 1GB
    pub map_size: usize,

    /// Entries fetched per engine range query during a sequential scan.
    /// Default: 256
    pub readahead: usize,

    /// Keep the data file inside a directory at the store path.
    /// Only consulted in write mode; read mode detects the layout.
    /// Default: false
    pub subdir: bool,

    /// Maximum reader handles sharing one opened store.
    /// Only consulted in read mode.
    /// Default: 100
    pub max_readers: usize,

    /// Make every flush durable before returning.
    /// When false, only close() forces data to disk.
    /// Default: true
    pub sync_flush: bool,

    /// Serializers used to persist and rebuild custom codec functions.
    /// Default: rich serializer enabled, empty registry
    pub serializers: Serializers,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: Mode::Read,
            key: CodecRequest::default(),
            value: CodecRequest::default(),
            unsafe_get: false,
            map_size: 1024 * 1024 * 1024, // 1GB
            readahead: 256,
            subdir: false,
            max_readers: 100,
            sync_flush: true,
            serializers: Serializers::default(),
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default options in read mode.
    pub fn read() -> Self {
        Self::default().mode(Mode::Read)
    }

    /// Default options in write mode.
    pub fn write() -> Self {
        Self::default().mode(Mode::Write)
    }

    /// Sets the access mode.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Requests one key codec for both directions.
    pub fn key_method(mut self, spec: impl Into<CodecSpec>) -> Self {
        self.key = CodecRequest::method(spec);
        self
    }

    /// Requests an explicit key encoder/decoder pair.
    pub fn key_codec(mut self, dumps: impl Into<CodecSpec>, loads: impl Into<CodecSpec>) -> Self {
        self.key = CodecRequest::pair(dumps, loads);
        self
    }

    /// Requests one value codec for both directions.
    pub fn value_method(mut self, spec: impl Into<CodecSpec>) -> Self {
        self.value = CodecRequest::method(spec);
        self
    }

    /// Requests an explicit value encoder/decoder pair.
    pub fn value_codec(mut self, dumps: impl Into<CodecSpec>, loads: impl Into<CodecSpec>) -> Self {
        self.value = CodecRequest::pair(dumps, loads);
        self
    }

    /// Sets whether reads bypass the key index.
    pub fn unsafe_get(mut self, value: bool) -> Self {
        self.unsafe_get = value;
        self
    }

    /// Sets the engine cache capacity hint.
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    /// Sets the sequential scan batch size.
    pub fn readahead(mut self, entries: usize) -> Self {
        self.readahead = entries;
        self
    }

    /// Sets whether the store lives in a directory (write mode).
    pub fn subdir(mut self, value: bool) -> Self {
        self.subdir = value;
        self
    }

    /// Sets the reader handle limit (read mode).
    pub fn max_readers(mut self, readers: usize) -> Self {
        self.max_readers = readers;
        self
    }

    /// Sets whether each flush is made durable.
    pub fn sync_flush(mut self, value: bool) -> Self {
        self.sync_flush = value;
        self
    }

    /// Sets the serializers for custom codec functions.
    pub fn serializers(mut self, serializers: Serializers) -> Self {
        self.serializers = serializers;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.map_size == 0 {
            return Err(Error::usage("map_size must be > 0"));
        }
        if self.readahead == 0 {
            return Err(Error::usage("readahead must be > 0"));
        }
        if self.max_readers == 0 {
            return Err(Error::usage("max_readers must be > 0"));
        }
        Ok(())
    }
}
