//! # redbdict - A Self-Describing Key-Value Store
//!
//! redbdict is a dictionary-like store over redb, an embedded, ordered,
//! transactional engine. On top of the engine it adds:
//!
//! - **Persisted codecs**: the encoding of keys and values is chosen once and
//!   recorded inside the store, so any later reader decodes it without
//!   being told how.
//! - **Key index**: an explicit, ordered record of the written keys. In safe
//!   mode it decides which keys exist; unsafe mode asks the engine directly.
//! - **Portable functions**: custom codecs are functions, and they are
//!   persisted too, as Lua source or as a registry name.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use redbdict::{Options, Store, Value};
//!
//! # fn main() -> Result<(), redbdict::Error> {
//! // Create a store; its codecs are fixed on first open
//! let mut store = Store::open("./data.redb", Options::write().key_method("utf8"))?;
//! store.set("x", 1)?;
//! store.set("y", "two")?;
//! store.close()?;
//!
//! // Reopen for reading, no codec arguments needed
//! let store = Store::open("./data.redb", Options::read())?;
//! assert_eq!(store.get("y")?, Value::from("two"));
//! for entry in store.sequential_iter()? {
//!     let (key, value) = entry?;
//!     println!("{:?} => {:?}", key, value);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod capsule;
pub mod codec;
pub mod config;
mod engine;
pub mod error;
pub mod index;
pub mod iterator;
mod negotiate;
pub mod store;
pub mod value;

// Re-exports
pub use capsule::{Capsule, Function, FunctionRegistry, Serializers};
pub use codec::{Builtin, Codec, CodecRequest, CodecSpec};
pub use config::{Mode, Options};
pub use error::{Error, Result};
pub use iterator::SequentialIter;
pub use store::Store;
pub use value::Value;

use std::path::Path;

/// Engine keys reserved for the store's own records. They never show up as
/// user entries.
pub const RESERVED_RECORDS: [&[u8]; 5] = [
    index::KEYS_RECORD,
    b"__key_dumps__",
    b"__key_loads__",
    b"__value_dumps__",
    b"__value_loads__",
];

/// Opens a store. Shorthand for [`Store::open`].
pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Store> {
    Store::open(path, options)
}
