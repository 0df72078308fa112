//! The store handle.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::capsule::Serializers;
use crate::codec::{Codec, Codecs};
use crate::config::{Mode, Options};
use crate::engine::{Environment, Transaction};
use crate::error::{Error, Result};
use crate::index::{KeyIndex, KEYS_RECORD};
use crate::iterator::SequentialIter;
use crate::negotiate::{negotiate, Side};
use crate::value::Value;
use crate::RESERVED_RECORDS;

/// A key-value store over one engine file.
///
/// The handle's mode is fixed when it is opened. A write-mode handle keeps one
/// engine transaction open; its changes become durable on [`Store::flush`]
/// and [`Store::close`]. Dropping a handle closes it, but errors can only be
/// observed through an explicit `close`.
///
/// # Example
///
/// ```rust,no_run
/// use redbdict::{Options, Store, Value};
///
/// # fn main() -> Result<(), redbdict::Error> {
/// let mut store = Store::open("./data.redb", Options::write())?;
/// store.set("x", 1)?;
/// store.set("y", "two")?;
/// store.close()?;
///
/// let store = Store::open("./data.redb", Options::read())?;
/// assert_eq!(store.get("x")?, Value::Int(1));
/// assert_eq!(store.len(), 2);
/// # Ok(())
/// # }
/// ```
pub struct Store {
    path: PathBuf,
    mode: Mode,
    unsafe_get: bool,
    readahead: usize,
    sync_flush: bool,
    serializers: Serializers,

    /// Resolved key and value codecs
    codecs: Codecs,

    /// In-memory key index, written back on flush
    index: KeyIndex,

    /// The persisted index could not be decoded and was reset
    index_recovered: bool,
    recovery_warned: bool,

    /// None once the engine state is gone
    txn: Option<Transaction>,
    env: Environment,
    closed: bool,
}

impl Store {
    /// Opens a store at `path`.
    ///
    /// In write mode the store is created if missing and a fresh store records
    /// its codecs before anything else. In read mode the store must exist.
    ///
    /// # Errors
    ///
    /// - Usage: invalid options or a codec request the store cannot accept.
    /// - Codec: a codec that cannot be used in this process.
    /// - Io / Storage: the engine file cannot be opened.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let env = Environment::open(&path, &options)?;
        Self::attach(env, path, options)
    }

    fn attach(env: Environment, path: PathBuf, options: Options) -> Result<Self> {
        let mode = options.mode;
        let serializers = options.serializers;
        let mut txn = env.begin(mode)?;

        let key = negotiate(&mut txn, Side::Key, &options.key, mode, &serializers)?;
        let value = negotiate(&mut txn, Side::Value, &options.value, mode, &serializers)?;
        if key.persisted || value.persisted {
            txn.commit(options.sync_flush)?;
            txn = env.begin(Mode::Write)?;
            log::info!("Recorded codecs for new store {:?}", path);
        }

        let (index, index_recovered) = match txn.get(KEYS_RECORD)? {
            Some(data) => match KeyIndex::decode(&data) {
                Ok(index) => (index, false),
                Err(e) => {
                    log::warn!("Key index of {:?} is unreadable, starting from empty: {}", path, e);
                    (KeyIndex::new(), true)
                }
            },
            None => {
                if mode == Mode::Read {
                    log::warn!("Reading an empty store at {:?}", path);
                }
                (KeyIndex::new(), false)
            }
        };

        log::info!("Opened store {:?} in {} mode with {} keys", path, mode, index.len());
        Ok(Self {
            path,
            mode,
            unsafe_get: options.unsafe_get,
            readahead: options.readahead,
            sync_flush: options.sync_flush,
            serializers,
            codecs: Codecs { key_codec: key.codec, value_codec: value.codec },
            index,
            index_recovered,
            recovery_warned: false,
            txn: Some(txn),
            env,
            closed: false,
        })
    }

    /// Opens another read-mode handle on the same engine file.
    ///
    /// The new handle sees a snapshot of what has been flushed so far and
    /// counts against `max_readers`.
    pub fn reader(&self) -> Result<Store> {
        self.txn()?;
        let options = Options::read()
            .unsafe_get(self.unsafe_get)
            .readahead(self.readahead)
            .serializers(self.serializers.clone());
        Self::attach(self.env.clone(), self.path.clone(), options)
    }

    /// Returns the value stored under `key`.
    ///
    /// In safe mode the key must be in the key index. Either way a key the
    /// engine does not hold is not found.
    pub fn get(&self, key: impl Into<Value>) -> Result<Value> {
        let key = key.into();
        let txn = self.txn()?;
        if !self.unsafe_get && !self.index.contains(&key) {
            return Err(Error::not_found(format!("{:?}", key)));
        }

        let raw = self.codecs.key_codec.dumps(&key)?;
        match txn.get(&raw)? {
            Some(data) => self.codecs.value_codec.loads(&data),
            None => Err(Error::not_found(format!("{:?}", key))),
        }
    }

    /// Like [`Store::get`], with `None` for a missing key.
    pub fn get_opt(&self, key: impl Into<Value>) -> Result<Option<Value>> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stores `value` under `key` and appends `key` to the key index.
    ///
    /// The index change is visible at once but durable only after the next
    /// flush.
    pub fn set(&mut self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        self.check_writable("write item")?;
        let key = key.into();
        let value = value.into();

        let raw_key = self.codecs.key_codec.dumps(&key)?;
        if is_reserved(&key, &raw_key) {
            return Err(Error::usage(format!("{:?} is an internal record, immutable to users", key)));
        }
        let raw_value = self.codecs.value_codec.dumps(&value)?;

        if self.index_recovered && !self.recovery_warned {
            log::warn!(
                "Writing to {:?} after its key index was reset; earlier entries may not be reconcilable",
                self.path
            );
            self.recovery_warned = true;
        }

        self.txn_mut()?.put(&raw_key, &raw_value)?;
        self.index.append(key);
        Ok(())
    }

    /// Sets every pair in `entries`.
    pub fn update<I, K, V>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Value>,
        V: Into<Value>,
    {
        self.check_writable("write item")?;
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Deletes the entry under `key` and its first occurrence in the key
    /// index.
    pub fn delete(&mut self, key: impl Into<Value>) -> Result<()> {
        self.check_writable("delete item")?;
        let key = key.into();
        if !self.index.contains(&key) {
            return Err(Error::not_found(format!("{:?}", key)));
        }

        let raw_key = self.codecs.key_codec.dumps(&key)?;
        if !self.txn_mut()?.remove(&raw_key)? {
            log::debug!("{:?} was indexed but had no engine entry", key);
        }
        self.index.remove_first(&key)
    }

    /// Returns true if `key` is in the key index.
    pub fn contains(&self, key: impl Into<Value>) -> bool {
        self.index.contains(&key.into())
    }

    /// Number of keys in the index, duplicates included.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if the key index is empty.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The indexed keys in insertion order.
    pub fn keys(&self) -> &[Value] {
        self.index.snapshot()
    }

    /// Writes the key index back and commits, then starts a new transaction.
    pub fn flush(&mut self) -> Result<()> {
        self.check_writable("flush")?;
        self.persist(self.sync_flush, true)
    }

    /// Scans every entry in engine key order.
    pub fn sequential_iter(&self) -> Result<SequentialIter<'_>> {
        Ok(SequentialIter::new(self.txn()?, &self.codecs, self.readahead))
    }

    /// Flushes (write mode) and releases the engine.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    /// Releases the engine without flushing. Everything since the last flush
    /// is rolled back.
    pub fn abort(mut self) -> Result<()> {
        self.closed = true;
        if let Some(txn) = self.txn.take() {
            txn.abort()?;
        }
        log::info!("Aborted store {:?}", self.path);
        Ok(())
    }

    /// Path the store was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the engine data file.
    pub fn data_path(&self) -> &Path {
        self.env.path()
    }

    /// Mode the store was opened in.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Codec applied to keys.
    pub fn key_codec(&self) -> &Codec {
        &self.codecs.key_codec
    }

    /// Codec applied to values.
    pub fn value_codec(&self) -> &Codec {
        &self.codecs.value_codec
    }

    /// Both codecs.
    pub fn codecs(&self) -> &Codecs {
        &self.codecs
    }

    /// Returns true if the persisted key index was unreadable at open and the
    /// handle started from an empty index.
    pub fn index_recovered(&self) -> bool {
        self.index_recovered
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.mode {
            Mode::Write => self.persist(true, false)?,
            Mode::Read => drop(self.txn.take()),
        }
        log::info!("Closed store {:?}", self.path);
        Ok(())
    }

    /// Writes the index and commits. The handle has no transaction afterwards
    /// unless `reopen` is set.
    fn persist(&mut self, durable: bool, reopen: bool) -> Result<()> {
        let data = self.index.encode()?;
        self.txn_mut()?.put(KEYS_RECORD, &data)?;

        let txn = self.txn.take().ok_or(Error::Closed)?;
        txn.commit(durable)?;
        log::info!("Flushed {} keys to {:?}", self.index.len(), self.path);

        if reopen {
            self.txn = Some(self.env.begin(Mode::Write)?);
        }
        Ok(())
    }

    fn check_writable(&self, action: &str) -> Result<()> {
        if self.mode != Mode::Write {
            return Err(Error::usage(format!("can only {} in write mode", action)));
        }
        Ok(())
    }

    fn txn(&self) -> Result<&Transaction> {
        self.txn.as_ref().ok_or(Error::Closed)
    }

    fn txn_mut(&mut self) -> Result<&mut Transaction> {
        self.txn.as_mut().ok_or(Error::Closed)
    }
}

fn is_reserved(key: &Value, raw: &[u8]) -> bool {
    let plain = match key {
        Value::Str(s) => Some(s.as_bytes()),
        Value::Bytes(b) => Some(b.as_slice()),
        _ => None,
    };
    RESERVED_RECORDS
        .iter()
        .any(|record| *record == raw || plain == Some(*record))
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Error closing store {:?} during drop: {}", self.path, e);
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("keys", &self.index.len())
            .field("codecs", &self.codecs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_path(dir: &TempDir) -> PathBuf {
        dir.path().join("store.redb")
    }

    #[test]
    fn test_open_write_and_read() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut store = Store::open(&path, Options::write()).unwrap();
        store.set("x", 1).unwrap();
        store.set("y", "two").unwrap();
        store.flush().unwrap();
        store.close().unwrap();

        let store = Store::open(&path, Options::read()).unwrap();
        assert_eq!(store.get("x").unwrap(), Value::Int(1));
        assert_eq!(store.get("y").unwrap(), Value::from("two"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.keys(), &[Value::from("x"), Value::from("y")]);
    }

    #[test]
    fn test_get_missing() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(store_path(&dir), Options::write()).unwrap();
        assert!(store.get("nope").unwrap_err().is_not_found());
        assert_eq!(store.get_opt("nope").unwrap(), None);
    }

    #[test]
    fn test_writes_need_write_mode() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        Store::open(&path, Options::write()).unwrap().close().unwrap();

        let mut store = Store::open(&path, Options::read()).unwrap();
        assert!(store.set("a", 1).unwrap_err().is_usage());
        assert!(store.delete("a").unwrap_err().is_usage());
        assert!(store.flush().unwrap_err().is_usage());
    }

    #[test]
    fn test_reserved_keys() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(store_path(&dir), Options::write()).unwrap();
        assert!(store.set("__keys__", 1).unwrap_err().is_usage());
        assert!(store.set(b"__value_loads__", 1).unwrap_err().is_usage());
        assert!(store.is_empty());
    }

    #[test]
    fn test_reserved_encoded_form() {
        let dir = TempDir::new().unwrap();
        let mut store =
            Store::open(store_path(&dir), Options::write().key_method("identity")).unwrap();
        assert!(store.set(b"__key_dumps__", 1).unwrap_err().is_usage());
        store.set(b"plain", 1).unwrap();
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(store_path(&dir), Options::write()).unwrap();
        store.set("a", 1).unwrap();
        store.delete("a").unwrap();
        assert!(!store.contains("a"));
        assert!(store.get("a").unwrap_err().is_not_found());
        assert!(store.delete("a").unwrap_err().is_not_found());
    }

    #[test]
    fn test_duplicates_append() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(store_path(&dir), Options::write()).unwrap();
        store.set("k", 1).unwrap();
        store.set("k", 2).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("k").unwrap(), Value::Int(2));

        store.delete("k").unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.contains("k"));
        // the engine entry went with the first delete
        assert!(store.get("k").unwrap_err().is_not_found());
        store.delete("k").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_update() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(store_path(&dir), Options::write()).unwrap();
        store.update([("a", 1), ("b", 2)]).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("b").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_drop_closes() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        {
            let mut store = Store::open(&path, Options::write()).unwrap();
            store.set("kept", true).unwrap();
        }
        let store = Store::open(&path, Options::read()).unwrap();
        assert_eq!(store.get("kept").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_abort_rolls_back() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let mut store = Store::open(&path, Options::write()).unwrap();
        store.set("flushed", 1).unwrap();
        store.flush().unwrap();
        store.set("lost", 2).unwrap();
        store.abort().unwrap();

        let store = Store::open(&path, Options::read()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.contains("flushed"));
        assert!(store.get_opt("lost").unwrap().is_none());
    }

    #[test]
    fn test_reader_sees_flushed_state() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(store_path(&dir), Options::write()).unwrap();
        store.set("a", 1).unwrap();
        store.flush().unwrap();
        store.set("b", 2).unwrap();

        let reader = store.reader().unwrap();
        assert_eq!(reader.mode(), Mode::Read);
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.get("a").unwrap(), Value::Int(1));
        assert!(reader.get("b").unwrap_err().is_not_found());
    }

    #[test]
    fn test_open_joins_live_handles() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let mut writer = Store::open(&path, Options::write()).unwrap();
        writer.set("a", 1).unwrap();
        writer.flush().unwrap();

        let reader = Store::open(&path, Options::read()).unwrap();
        assert_eq!(reader.get("a").unwrap(), Value::Int(1));
        assert!(Store::open(&path, Options::write()).unwrap_err().is_usage());

        writer.close().unwrap();
        let mut writer = Store::open(&path, Options::write()).unwrap();
        writer.set("b", 2).unwrap();
        assert_eq!(reader.len(), 1);
    }

    #[test]
    fn test_sequential_iter_skips_reserved() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(store_path(&dir), Options::write().readahead(2)).unwrap();
        for i in 0..5 {
            store.set(i, i * 10).unwrap();
        }
        store.flush().unwrap();

        let mut entries: Vec<(Value, Value)> =
            store.sequential_iter().unwrap().collect::<Result<_>>().unwrap();
        entries.sort_by_key(|(k, _)| k.as_int());
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[3], (Value::Int(3), Value::Int(30)));
    }

    #[test]
    fn test_subdir_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested");
        let mut store = Store::open(&path, Options::write().subdir(true)).unwrap();
        store.set("a", 1).unwrap();
        store.close().unwrap();
        assert!(path.is_dir());

        let store = Store::open(&path, Options::read()).unwrap();
        assert_eq!(store.data_path(), path.join(crate::engine::DATA_FILE));
        assert_eq!(store.get("a").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_invalid_options() {
        let dir = TempDir::new().unwrap();
        let err = Store::open(store_path(&dir), Options::write().readahead(0)).unwrap_err();
        assert!(err.is_usage());
    }
}
