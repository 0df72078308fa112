//! Sequential scan over a store.
//!
//! Walks the engine in its native key order rather than the key index order,
//! fetching `readahead` records per engine query.

use std::collections::VecDeque;

use crate::codec::Codecs;
use crate::engine::Transaction;
use crate::error::Result;
use crate::value::Value;
use crate::RESERVED_RECORDS;

/// A lazy iterator over the decoded `(key, value)` pairs of a store.
///
/// Reserved records are skipped. The iterator stops after yielding its first
/// error.
///
/// # Example
///
/// ```rust,no_run
/// use redbdict::{Options, Store};
///
/// # fn main() -> Result<(), redbdict::Error> {
/// let store = Store::open("./data.redb", Options::read())?;
/// for entry in store.sequential_iter()? {
///     let (key, value) = entry?;
///     println!("{:?} => {:?}", key, value);
/// }
/// # Ok(())
/// # }
/// ```
pub struct SequentialIter<'a> {
    txn: &'a Transaction,
    codecs: &'a Codecs,
    page_size: usize,

    /// Last engine key fetched
    cursor: Option<Vec<u8>>,

    /// Fetched but not yet yielded records
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,

    exhausted: bool,
}

impl<'a> SequentialIter<'a> {
    pub(crate) fn new(txn: &'a Transaction, codecs: &'a Codecs, page_size: usize) -> Self {
        Self {
            txn,
            codecs,
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let page = self.txn.scan(self.cursor.as_deref(), self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.cursor = Some(last.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }

    fn decode(&self, key: &[u8], value: &[u8]) -> Result<(Value, Value)> {
        Ok((self.codecs.key_codec.loads(key)?, self.codecs.value_codec.loads(value)?))
    }
}

impl Iterator for SequentialIter<'_> {
    type Item = Result<(Value, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.buffer.is_empty() {
                if self.exhausted {
                    return None;
                }
                if let Err(e) = self.fill() {
                    self.exhausted = true;
                    return Some(Err(e));
                }
                continue;
            }

            let (key, value) = self.buffer.pop_front()?;
            if RESERVED_RECORDS.contains(&key.as_slice()) {
                continue;
            }

            let item = self.decode(&key, &value);
            if item.is_err() {
                self.exhausted = true;
                self.buffer.clear();
            }
            return Some(item);
        }
    }
}
