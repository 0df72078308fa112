//! Binding to the embedded engine.
//!
//! Every record, user entries and reserved records alike, lives in a single
//! redb table of raw byte strings. A write-mode handle holds one long-lived
//! write transaction; a read-mode handle holds one snapshot.
//!
//! redb locks its file for a single `Database`, so every handle opened in this
//! process on the same file shares one [`Environment`].

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use redb::{
    Database, Durability, ReadOnlyTable, ReadTransaction, ReadableTable, TableDefinition,
    TableError, WriteTransaction,
};

use crate::config::{Mode, Options};
use crate::error::{Error, Result};
use crate::negotiate::MetaStore;

/// The one table holding every record.
pub(crate) const ENTRIES: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("entries");

/// Name of the data file under the subdirectory layout.
pub(crate) const DATA_FILE: &str = "data.redb";

/// An opened engine file, shared by every handle on it.
#[derive(Clone)]
pub(crate) struct Environment {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    db: Database,
    path: PathBuf,
    readers: AtomicUsize,
    max_readers: usize,
    writing: AtomicBool,
}

/// Engine files open in this process, keyed by canonical data-file path.
fn open_files() -> &'static Mutex<HashMap<PathBuf, Weak<EnvInner>>> {
    static OPEN: OnceLock<Mutex<HashMap<PathBuf, Weak<EnvInner>>>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Environment {
    /// Opens the engine file at `path`, or joins the handles already on it.
    ///
    /// In write mode the file is created if missing. In read mode it must
    /// exist, and a directory path selects the subdirectory layout. A shared
    /// file keeps the cache size and reader limit of its first opener.
    pub(crate) fn open(path: &Path, options: &Options) -> Result<Self> {
        let file = data_file(path, options)?;
        if options.mode == Mode::Read && !file.exists() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no store at {}", file.display()),
            )));
        }

        let mut open = open_files().lock();
        open.retain(|_, env| env.strong_count() > 0);
        if let Ok(canonical) = fs::canonicalize(&file) {
            if let Some(inner) = open.get(&canonical).and_then(Weak::upgrade) {
                log::debug!("Sharing engine file {}", file.display());
                return Ok(Self { inner });
            }
        }

        let mut builder = Database::builder();
        builder.set_cache_size(options.map_size);
        let db = match options.mode {
            Mode::Write => builder.create(&file)?,
            Mode::Read => builder.open(&file)?,
        };

        let inner = Arc::new(EnvInner {
            db,
            path: file,
            readers: AtomicUsize::new(0),
            max_readers: options.max_readers,
            writing: AtomicBool::new(false),
        });
        open.insert(fs::canonicalize(&inner.path)?, Arc::downgrade(&inner));
        log::debug!("Opened engine file {}", inner.path.display());
        Ok(Self { inner })
    }

    /// Path of the engine data file.
    pub(crate) fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of live read transactions.
    #[cfg(test)]
    pub(crate) fn active_readers(&self) -> usize {
        self.inner.readers.load(Ordering::Acquire)
    }

    /// Begins a transaction for `mode`.
    pub(crate) fn begin(&self, mode: Mode) -> Result<Transaction> {
        match mode {
            Mode::Write => {
                let slot = self.acquire_writer()?;
                let txn = self.inner.db.begin_write()?;
                Ok(Transaction::Write { txn, _slot: slot })
            }
            Mode::Read => {
                let slot = self.acquire_reader()?;
                let txn = self.inner.db.begin_read()?;
                Ok(Transaction::Read { txn, _slot: slot })
            }
        }
    }

    fn acquire_reader(&self) -> Result<ReaderSlot> {
        let max = self.inner.max_readers;
        self.inner
            .readers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|n| Error::usage(format!("too many readers: {} of {} in use", n, max)))?;
        Ok(ReaderSlot { env: Arc::clone(&self.inner) })
    }

    // redb's begin_write blocks while another write transaction is live
    fn acquire_writer(&self) -> Result<WriterSlot> {
        self.inner
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::usage(format!("{} already has a writer", self.inner.path.display())))?;
        Ok(WriterSlot { env: Arc::clone(&self.inner) })
    }
}

/// Frees a reader slot when the read transaction goes away.
pub(crate) struct ReaderSlot {
    env: Arc<EnvInner>,
}

impl Drop for ReaderSlot {
    fn drop(&mut self) {
        self.env.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Marks the file free for another writer when the write transaction ends.
pub(crate) struct WriterSlot {
    env: Arc<EnvInner>,
}

impl Drop for WriterSlot {
    fn drop(&mut self) {
        self.env.writing.store(false, Ordering::Release);
    }
}

fn data_file(path: &Path, options: &Options) -> Result<PathBuf> {
    match options.mode {
        Mode::Read if path.is_dir() => Ok(path.join(DATA_FILE)),
        Mode::Read => Ok(path.to_path_buf()),
        Mode::Write if options.subdir || path.is_dir() => {
            fs::create_dir_all(path)?;
            Ok(path.join(DATA_FILE))
        }
        Mode::Write => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            Ok(path.to_path_buf())
        }
    }
}

/// An open engine transaction.
pub(crate) enum Transaction {
    /// Snapshot of a read-mode handle.
    Read {
        txn: ReadTransaction,
        _slot: ReaderSlot,
    },
    /// Long-lived write transaction.
    Write {
        txn: WriteTransaction,
        _slot: WriterSlot,
    },
}

impl Transaction {
    /// Looks up a raw key.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            Transaction::Read { txn, .. } => {
                let Some(table) = read_table(txn)? else {
                    return Ok(None);
                };
                let value = table.get(key)?.map(|v| v.value().to_vec());
                Ok(value)
            }
            Transaction::Write { txn, .. } => {
                let table = txn.open_table(ENTRIES)?;
                let value = table.get(key)?.map(|v| v.value().to_vec());
                Ok(value)
            }
        }
    }

    /// Stores a raw pair, replacing any previous value.
    pub(crate) fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let txn = self.writable()?;
        let mut table = txn.open_table(ENTRIES)?;
        table.insert(key, value)?;
        Ok(())
    }

    /// Removes a raw key. Returns false if it was absent.
    pub(crate) fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let txn = self.writable()?;
        let mut table = txn.open_table(ENTRIES)?;
        let removed = table.remove(key)?.is_some();
        Ok(removed)
    }

    /// Returns up to `limit` pairs in key order, starting after `after`.
    pub(crate) fn scan(&self, after: Option<&[u8]>, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        match self {
            Transaction::Read { txn, .. } => match read_table(txn)? {
                Some(table) => scan_table(&table, after, limit),
                None => Ok(Vec::new()),
            },
            Transaction::Write { txn, .. } => {
                let table = txn.open_table(ENTRIES)?;
                scan_table(&table, after, limit)
            }
        }
    }

    /// Commits a write transaction. A non-durable commit becomes durable with
    /// the next durable one.
    pub(crate) fn commit(self, durable: bool) -> Result<()> {
        match self {
            Transaction::Read { .. } => Err(Error::usage("cannot commit in read mode")),
            Transaction::Write { mut txn, _slot } => {
                if !durable {
                    txn.set_durability(Durability::Eventual);
                }
                txn.commit()?;
                Ok(())
            }
        }
    }

    /// Discards the transaction.
    pub(crate) fn abort(self) -> Result<()> {
        match self {
            Transaction::Read { .. } => Ok(()),
            Transaction::Write { txn, .. } => Ok(txn.abort()?),
        }
    }

    fn writable(&mut self) -> Result<&mut WriteTransaction> {
        match self {
            Transaction::Write { txn, .. } => Ok(txn),
            Transaction::Read { .. } => Err(Error::usage("can only write in write mode")),
        }
    }
}

impl MetaStore for Transaction {
    fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get(key)
    }

    fn put_meta(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put(key, value)
    }
}

/// A snapshot taken before the first write has no table yet.
fn read_table(txn: &ReadTransaction) -> Result<Option<ReadOnlyTable<&'static [u8], &'static [u8]>>> {
    match txn.open_table(ENTRIES) {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn scan_table<T>(table: &T, after: Option<&[u8]>, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let range = match after {
        Some(start) => table.range(start..)?,
        None => table.iter()?,
    };

    let mut out = Vec::with_capacity(limit);
    for entry in range {
        let (k, v) = entry?;
        // range() is inclusive of the cursor key
        if after == Some(k.value()) {
            continue;
        }
        out.push((k.value().to_vec(), v.value().to_vec()));
        if out.len() >= limit {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_env(dir: &TempDir) -> Environment {
        Environment::open(&dir.path().join("store.redb"), &Options::write()).unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir);
        let mut txn = env.begin(Mode::Write).unwrap();

        txn.put(b"k", b"v").unwrap();
        assert_eq!(txn.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(txn.remove(b"k").unwrap());
        assert!(!txn.remove(b"k").unwrap());
        assert_eq!(txn.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_snapshot_before_first_write_is_empty() {
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir);
        let txn = env.begin(Mode::Read).unwrap();
        assert_eq!(txn.get(b"k").unwrap(), None);
        assert!(txn.scan(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_paged_scan() {
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir);
        let mut txn = env.begin(Mode::Write).unwrap();
        for i in 0..10u8 {
            txn.put(&[i], &[i * 2]).unwrap();
        }

        let first = txn.scan(None, 4).unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first[0], (vec![0], vec![0]));

        let last_key = first[3].0.clone();
        let second = txn.scan(Some(last_key.as_slice()), 4).unwrap();
        assert_eq!(second[0].0, vec![4]);

        let rest = txn.scan(Some(&[7u8][..]), 100).unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn test_commit_visible_to_readers() {
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir);
        let mut txn = env.begin(Mode::Write).unwrap();
        txn.put(b"a", b"1").unwrap();
        txn.commit(true).unwrap();

        let reader = env.begin(Mode::Read).unwrap();
        assert_eq!(reader.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_abort_discards() {
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir);
        let mut txn = env.begin(Mode::Write).unwrap();
        txn.put(b"a", b"1").unwrap();
        txn.abort().unwrap();

        let txn = env.begin(Mode::Write).unwrap();
        assert_eq!(txn.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_reader_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.redb");
        Environment::open(&path, &Options::write()).unwrap();

        let env = Environment::open(&path, &Options::read().max_readers(2)).unwrap();
        let a = env.begin(Mode::Read).unwrap();
        let _b = env.begin(Mode::Read).unwrap();
        assert!(env.begin(Mode::Read).err().unwrap().is_usage());

        drop(a);
        assert_eq!(env.active_readers(), 1);
        assert!(env.begin(Mode::Read).is_ok());
    }

    #[test]
    fn test_handles_share_one_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.redb");
        let writer = Environment::open(&path, &Options::write()).unwrap();
        let mut txn = writer.begin(Mode::Write).unwrap();
        txn.put(b"a", b"1").unwrap();
        txn.commit(true).unwrap();

        let first = Environment::open(&path, &Options::read()).unwrap();
        let second = Environment::open(&dir.path().join(".").join("store.redb"), &Options::read()).unwrap();
        let a = first.begin(Mode::Read).unwrap();
        let _b = second.begin(Mode::Read).unwrap();
        assert_eq!(a.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(writer.active_readers(), 2);
    }

    #[test]
    fn test_single_writer() {
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir);
        let txn = env.begin(Mode::Write).unwrap();
        assert!(env.begin(Mode::Write).err().unwrap().is_usage());

        txn.commit(true).unwrap();
        assert!(env.begin(Mode::Write).is_ok());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir);
        let mut txn = env.begin(Mode::Read).unwrap();
        assert!(txn.put(b"k", b"v").unwrap_err().is_usage());
    }

    #[test]
    fn test_subdir_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");
        let env = Environment::open(&path, &Options::write().subdir(true)).unwrap();
        assert_eq!(env.path(), path.join(DATA_FILE));
        drop(env);

        let env = Environment::open(&path, &Options::read()).unwrap();
        assert_eq!(env.path(), path.join(DATA_FILE));
    }

    #[test]
    fn test_read_missing_store() {
        let dir = TempDir::new().unwrap();
        let err = Environment::open(&dir.path().join("missing"), &Options::read()).err().unwrap();
        assert!(matches!(err, Error::Io(_)));
    }
}
