use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::btree::{self, Tree};
use crate::constants::{
    EnvFlags, PageFlags, Pgno, TransactionFlags, Txnid, WriteFlags, META_PAGES, PAGE_SIZE,
};
use crate::cursor::Cursor;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::freelist;
use crate::meta::Meta;
use crate::midl::Idl;
use crate::page::{overflow_page_count, Page, PageMut, PAGE_HEADER_SIZE};
use crate::types::Stat;

/// Copy-on-write bookkeeping of a write transaction
#[derive(Debug, Default)]
pub(crate) struct WriteState {
    /// Page buffers owned by this transaction, keyed by page number
    dirty: HashMap<Pgno, Vec<u8>>,
    /// Original page number -> page number of its copy
    shadows: HashMap<Pgno, Pgno>,
    /// Pages of the snapshot this transaction stopped referencing
    pub(crate) freed: Idl,
    /// Pages ready for reuse by this transaction
    pub(crate) pool: Idl,
    /// Free DB entries already drained into the pool
    pub(crate) reclaimed: Vec<Txnid>,
    /// No further Free DB entry is usable
    pub(crate) reclaim_done: bool,
    /// Pooled pages may no longer be handed out: allocate past the end only
    pub(crate) reclaim_frozen: bool,
}

/// Database transaction
///
/// Read transactions pin the snapshot that was live when they began. The
/// single write transaction builds the next snapshot out of private page
/// copies and publishes it with one meta page write on commit.
#[derive(Debug)]
pub struct Transaction<'env> {
    /// Reference to environment
    env: &'env Environment,
    /// Transaction flags
    flags: TransactionFlags,
    /// Transaction ID
    txnid: Txnid,
    /// Main tree root
    root: Pgno,
    /// Free DB root
    free_root: Pgno,
    /// Last page number in use, including pages allocated by this transaction
    last_pgno: Pgno,
    /// Last page number of the snapshot; anything past it only exists as a dirty page
    mapped_last: Pgno,
    /// Reader table slot held by a read transaction
    reader_slot: Option<usize>,
    /// Present for write transactions
    write: Option<WriteState>,
}

impl<'env> Transaction<'env> {
    /// Start the write transaction. Waits for the writer lock when
    /// `blocking`, otherwise fails with `Busy`.
    pub(crate) fn begin_write(env: &'env Environment, blocking: bool) -> Result<Self> {
        if env.flags().contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }
        let inner = env.inner()?;
        if blocking {
            inner.writer.acquire()?;
        } else if !inner.writer.try_acquire()? {
            return Err(Error::Busy);
        }

        let meta = match env.live_meta() {
            Ok(meta) => meta,
            Err(e) => {
                inner.writer.release()?;
                return Err(e);
            }
        };
        let mut flags = TransactionFlags::empty();
        if env.flags().contains(EnvFlags::NOSYNC) {
            flags |= TransactionFlags::NOSYNC;
        }
        let txnid = meta.txnid + 1;
        debug!("begin write txn {}", txnid);

        Ok(Transaction {
            env,
            flags,
            txnid,
            root: meta.root,
            free_root: meta.free_root,
            last_pgno: meta.last_pgno,
            mapped_last: meta.last_pgno,
            reader_slot: None,
            write: Some(WriteState::default()),
        })
    }

    /// Start a read transaction on the live snapshot.
    ///
    /// The slot is claimed first and the meta re-read afterwards: a commit
    /// landing in between could otherwise recycle the pages of the snapshot
    /// we are about to pin.
    pub(crate) fn begin_read(env: &'env Environment) -> Result<Self> {
        let inner = env.inner()?;
        let mut meta = env.live_meta()?;
        let slot = inner.readers.register(meta.txnid)?;
        loop {
            let current = match env.live_meta() {
                Ok(current) => current,
                Err(e) => {
                    inner.readers.unregister(slot);
                    return Err(e);
                }
            };
            if current.txnid == meta.txnid {
                break;
            }
            meta = current;
            inner.readers.update(slot, meta.txnid);
        }
        trace!("begin read txn {} in slot {}", meta.txnid, slot);

        Ok(Transaction {
            env,
            flags: TransactionFlags::RDONLY,
            txnid: meta.txnid,
            root: meta.root,
            free_root: meta.free_root,
            last_pgno: meta.last_pgno,
            mapped_last: meta.last_pgno,
            reader_slot: Some(slot),
            write: None,
        })
    }

    /// Transaction ID: the snapshot txnid for readers, the txnid a commit
    /// will publish for writers
    pub fn id(&self) -> Txnid {
        self.txnid
    }

    pub fn env(&self) -> &'env Environment {
        self.env
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(TransactionFlags::RDONLY)
    }

    /// Reader table slot of a read transaction
    pub fn reader_slot(&self) -> Option<usize> {
        self.reader_slot
    }

    /// Get the value stored under `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        btree::get(self, Tree::Main, key)
    }

    /// Store `value` under `key`, replacing any previous value unless
    /// NOOVERWRITE is given.
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        self.update(|txn| btree::put(txn, Tree::Main, key, value, flags))
    }

    /// Delete `key`. Fails with `NotFound` if it is absent.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        self.del_from(Tree::Main, key)
    }

    /// Open a read cursor over the main tree
    pub fn cursor(&self) -> Result<Cursor<'_, 'env>> {
        Cursor::open(self)
    }

    /// Open a cursor that can also delete entries
    pub fn cursor_mut(&mut self) -> Result<Cursor<'_, 'env>> {
        Cursor::open_rw(self)
    }

    /// Statistics for the main tree as seen by this transaction
    pub fn stat(&self) -> Result<Stat> {
        btree::stat(self, Tree::Main)
    }

    /// Contents of the Free DB: each entry's txnid with the pages it freed, ascending
    pub fn free_list(&self) -> Result<Vec<(Txnid, Vec<Pgno>)>> {
        freelist::entries(self)
    }

    /// Commit the transaction
    ///
    /// On error the transaction is aborted and the previous snapshot stays live.
    pub fn commit(mut self) -> Result<()> {
        let result = if self.is_readonly() {
            Ok(())
        } else {
            self.commit_write()
        };
        if let Err(e) = &result {
            warn!("commit of txn {} failed: {}", self.txnid, e);
        }
        self.finish();
        result
    }

    /// Abort the transaction, discarding every change it made
    pub fn abort(mut self) {
        if !self.is_readonly() {
            debug!("abort write txn {}", self.txnid);
        }
        self.finish();
    }

    fn commit_write(&mut self) -> Result<()> {
        if self.flags.contains(TransactionFlags::ERROR) {
            return Err(Error::BadTxn);
        }
        if !self.flags.contains(TransactionFlags::DIRTY) {
            debug!("txn {} made no changes", self.txnid);
            return Ok(());
        }

        freelist::save(self)?;

        let env = self.env;
        let sync = !self.flags.contains(TransactionFlags::NOSYNC);
        let write = self.write_state()?;
        env.grow_file(self.last_pgno)?;
        let map = &env.inner()?.map;
        for (&pgno, buf) in &write.dirty {
            map.write_pages(pgno, buf)?;
        }
        if sync {
            map.flush()?;
            env.inner()?.file.sync_data()?;
        }

        let meta = Meta {
            txnid: self.txnid,
            root: self.root,
            last_pgno: self.last_pgno,
            free_root: self.free_root,
        };
        env.write_meta(&meta, sync)?;
        debug!(
            "committed txn {}: {} pages written, {} freed, last page {}",
            self.txnid,
            write.dirty.len(),
            write.freed.len(),
            self.last_pgno
        );
        Ok(())
    }

    /// Release the reader slot or writer lock. Idempotent.
    fn finish(&mut self) {
        if self.flags.contains(TransactionFlags::FINISHED) {
            return;
        }
        self.flags |= TransactionFlags::FINISHED;
        let Ok(inner) = self.env.inner() else {
            return;
        };
        if let Some(slot) = self.reader_slot.take() {
            inner.readers.unregister(slot);
        }
        if self.write.take().is_some() {
            if let Err(e) = inner.writer.release() {
                warn!("failed to release writer lock after txn {}: {}", self.txnid, e);
            }
        }
    }

    /// Run a tree update. A failure other than the up-front key checks
    /// leaves pages half-modified, so the transaction may only abort after it.
    fn update<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.is_readonly() {
            return Err(Error::TxnReadOnly);
        }
        if self.flags.contains(TransactionFlags::ERROR) {
            return Err(Error::BadTxn);
        }
        let result = op(self);
        if let Err(e) = &result {
            if !matches!(e, Error::KeyExist | Error::NotFound | Error::BadValSize) {
                self.flags |= TransactionFlags::ERROR;
            }
        }
        result
    }

    pub(crate) fn del_from(&mut self, tree: Tree, key: &[u8]) -> Result<()> {
        self.update(|txn| btree::del(txn, tree, key))
    }

    pub(crate) fn root_of(&self, tree: Tree) -> Pgno {
        match tree {
            Tree::Main => self.root,
            Tree::Free => self.free_root,
        }
    }

    pub(crate) fn set_root(&mut self, tree: Tree, pgno: Pgno) {
        match tree {
            Tree::Main => self.root = pgno,
            Tree::Free => self.free_root = pgno,
        }
        self.flags |= TransactionFlags::DIRTY;
    }

    pub(crate) fn write_state(&self) -> Result<&WriteState> {
        self.write.as_ref().ok_or(Error::TxnReadOnly)
    }

    pub(crate) fn write_state_mut(&mut self) -> Result<&mut WriteState> {
        self.write.as_mut().ok_or(Error::TxnReadOnly)
    }

    /// `count` consecutive pages starting at `pgno`: this transaction's own
    /// copy if it has one, else the snapshot's bytes in the mapping
    pub(crate) fn page_span(&self, pgno: Pgno, count: usize) -> Result<&[u8]> {
        let len = count * PAGE_SIZE;
        if let Some(buf) = self.write.as_ref().and_then(|w| w.dirty.get(&pgno)) {
            return buf.get(..len).ok_or(Error::Corrupted);
        }
        let last = pgno.checked_add(count as Pgno - 1).ok_or(Error::PageNotFound(pgno))?;
        if pgno < META_PAGES as Pgno || last > self.mapped_last {
            return Err(Error::PageNotFound(pgno));
        }
        self.env.inner()?.map.pages(pgno, count)
    }

    pub(crate) fn page(&self, pgno: Pgno) -> Result<Page<'_>> {
        Ok(Page::new(self.page_span(pgno, 1)?))
    }

    /// Whether `pgno` is a page this transaction allocated or copied
    pub(crate) fn owns_page(&self, pgno: Pgno) -> bool {
        self.write.as_ref().is_some_and(|w| w.dirty.contains_key(&pgno))
    }

    /// Bytes of a page (or run) this transaction owns
    pub(crate) fn page_bytes_mut(&mut self, pgno: Pgno) -> Result<&mut [u8]> {
        let write = self.write_state_mut()?;
        let buf = write.dirty.get_mut(&pgno).ok_or(Error::PageNotFound(pgno))?;
        Ok(buf.as_mut_slice())
    }

    pub(crate) fn page_mut(&mut self, pgno: Pgno) -> Result<PageMut<'_>> {
        Ok(PageMut::new(self.page_bytes_mut(pgno)?))
    }

    /// Copy-on-write: get a page number whose bytes this transaction may
    /// modify and that holds the current content of `pgno`.
    ///
    /// The first touch of a snapshot page copies it to a fresh page number
    /// and records the original as freed. Touching the original or the copy
    /// again returns the same copy.
    pub(crate) fn touch(&mut self, pgno: Pgno) -> Result<Pgno> {
        let write = self.write_state()?;
        if write.dirty.contains_key(&pgno) {
            return Ok(pgno);
        }
        if let Some(&copy) = write.shadows.get(&pgno) {
            return Ok(copy);
        }

        let mut buf = page_buffer(1)?;
        buf.copy_from_slice(self.page_span(pgno, 1)?);
        let copy = self.alloc(1)?;
        PageMut::new(&mut buf).set_pgno(copy);

        let write = self.write_state_mut()?;
        write.dirty.insert(copy, buf);
        write.shadows.insert(pgno, copy);
        write.freed.insert(pgno);
        self.flags |= TransactionFlags::DIRTY;
        trace!("txn {} copied page {} to {}", self.txnid, pgno, copy);
        Ok(copy)
    }

    /// Hand out `count` consecutive page numbers: pooled pages first, then
    /// reusable Free DB entries, then fresh pages past the end of the file.
    pub(crate) fn alloc(&mut self, count: usize) -> Result<Pgno> {
        loop {
            let write = self.write_state_mut()?;
            if write.reclaim_frozen {
                break;
            }
            if let Some(pgno) = write.pool.take_run(count) {
                trace!("txn {} reused pages {}..{}", self.txnid, pgno, pgno + count as Pgno);
                return Ok(pgno);
            }
            if write.reclaim_done || !freelist::reclaim_next(self)? {
                break;
            }
        }

        let pgno = self.last_pgno + 1;
        let last = pgno + count as Pgno - 1;
        if last >= self.env.inner()?.map.page_capacity() {
            return Err(Error::MapFull);
        }
        self.last_pgno = last;
        Ok(pgno)
    }

    /// Allocate and initialize an empty tree page
    pub(crate) fn alloc_page(&mut self, flags: PageFlags) -> Result<Pgno> {
        let pgno = self.alloc(1)?;
        let mut buf = page_buffer(1)?;
        PageMut::new(&mut buf).init(pgno, flags);
        self.write_state_mut()?.dirty.insert(pgno, buf);
        self.flags |= TransactionFlags::DIRTY;
        Ok(pgno)
    }

    /// Store `data` in a new overflow run, returning its first page
    pub(crate) fn alloc_overflow(&mut self, data: &[u8]) -> Result<Pgno> {
        let count = overflow_page_count(data.len());
        let pgno = self.alloc(count)?;
        let mut buf = page_buffer(count)?;
        {
            let mut page = PageMut::new(&mut buf);
            page.init(pgno, PageFlags::OVERFLOW);
            page.set_overflow_pages(count as u32);
        }
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + data.len()].copy_from_slice(data);
        self.write_state_mut()?.dirty.insert(pgno, buf);
        self.flags |= TransactionFlags::DIRTY;
        trace!("txn {} stored {} bytes in overflow run {}+{}", self.txnid, data.len(), pgno, count);
        Ok(pgno)
    }

    pub(crate) fn free_page(&mut self, pgno: Pgno) -> Result<()> {
        self.free_run(pgno, 1)
    }

    /// Release `count` pages starting at `pgno`. Pages this transaction
    /// allocated go straight back to its pool; snapshot pages wait in the
    /// freed list until no reader can see them.
    pub(crate) fn free_run(&mut self, pgno: Pgno, count: usize) -> Result<()> {
        let write = self.write_state_mut()?;
        let pages = pgno..pgno + count as Pgno;
        if write.dirty.remove(&pgno).is_some() {
            write.shadows.retain(|_, copy| *copy != pgno);
            for p in pages {
                write.pool.insert(p);
            }
        } else {
            for p in pages {
                write.freed.insert(p);
            }
        }
        self.flags |= TransactionFlags::DIRTY;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Zeroed buffer for `count` pages
fn page_buffer(count: usize) -> Result<Vec<u8>> {
    let len = count * PAGE_SIZE;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_env(dir: &tempfile::TempDir) -> Environment {
        let mut env = Environment::new();
        env.open(dir.path().join("data"), EnvFlags::CREATE).unwrap();
        env
    }

    fn seed(env: &Environment) -> Pgno {
        let mut txn = env.begin_txn().unwrap();
        txn.put(b"alpha", b"one", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        env.begin_ro_txn().unwrap().root
    }

    #[test]
    fn test_touch_is_idempotent() {
        let dir = tempdir().unwrap();
        let env = open_env(&dir);
        let root = seed(&env);

        let mut txn = env.begin_txn().unwrap();
        let copy = txn.touch(root).unwrap();
        assert_ne!(copy, root);
        let first = txn.write_state().unwrap().dirty[&copy].as_ptr();

        assert_eq!(txn.touch(root).unwrap(), copy);
        assert_eq!(txn.touch(copy).unwrap(), copy);
        assert_eq!(txn.page_mut(copy).unwrap().as_page().pgno(), copy);
        assert_eq!(txn.write_state().unwrap().dirty[&copy].as_ptr(), first);
        assert_eq!(txn.write_state().unwrap().freed.to_ascending(), vec![root]);
    }

    #[test]
    fn test_mapping_untouched_until_commit() {
        let dir = tempdir().unwrap();
        let env = open_env(&dir);
        let root = seed(&env);
        let before = env.inner().unwrap().map.pages(root, 1).unwrap().to_vec();

        let mut txn = env.begin_txn().unwrap();
        txn.put(b"alpha", b"two", WriteFlags::empty()).unwrap();
        txn.put(b"beta", b"three", WriteFlags::empty()).unwrap();
        assert_eq!(txn.get(b"alpha").unwrap(), Some(&b"two"[..]));
        assert_eq!(env.inner().unwrap().map.pages(root, 1).unwrap(), &before[..]);
        txn.abort();

        let txn = env.begin_ro_txn().unwrap();
        assert_eq!(txn.root, root);
        assert_eq!(txn.get(b"alpha").unwrap(), Some(&b"one"[..]));
        assert_eq!(txn.get(b"beta").unwrap(), None);
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let dir = tempdir().unwrap();
        let env = open_env(&dir);
        let root = seed(&env);

        let mut txn = env.begin_ro_txn().unwrap();
        assert!(matches!(txn.put(b"k", b"v", WriteFlags::empty()), Err(Error::TxnReadOnly)));
        assert!(matches!(txn.del(b"alpha"), Err(Error::TxnReadOnly)));
        assert!(matches!(txn.touch(root), Err(Error::TxnReadOnly)));
        assert!(matches!(txn.cursor_mut(), Err(Error::TxnReadOnly)));
    }

    #[test]
    fn test_page_past_snapshot_not_found() {
        let dir = tempdir().unwrap();
        let env = open_env(&dir);
        seed(&env);

        let txn = env.begin_ro_txn().unwrap();
        assert!(matches!(txn.page(0), Err(Error::PageNotFound(0))));
        let past = txn.last_pgno + 1;
        assert!(matches!(txn.page(past), Err(Error::PageNotFound(p)) if p == past));
    }

    #[test]
    fn test_freeing_own_page_returns_it_to_pool() {
        let dir = tempdir().unwrap();
        let env = open_env(&dir);

        let mut txn = env.begin_txn().unwrap();
        let pgno = txn.alloc_page(PageFlags::LEAF).unwrap();
        txn.free_page(pgno).unwrap();
        assert!(!txn.owns_page(pgno));
        assert_eq!(txn.alloc(1).unwrap(), pgno);
    }

    #[test]
    fn test_map_full() {
        let dir = tempdir().unwrap();
        let mut env = Environment::new();
        env.set_map_size(4 * PAGE_SIZE).unwrap();
        env.open(dir.path().join("data"), EnvFlags::CREATE).unwrap();

        let mut txn = env.begin_txn().unwrap();
        txn.alloc(2).unwrap();
        assert!(matches!(txn.alloc(1), Err(Error::MapFull)));
    }

    #[test]
    fn test_failed_update_poisons_txn() {
        let dir = tempdir().unwrap();
        let mut env = Environment::new();
        env.set_map_size(4 * PAGE_SIZE).unwrap();
        env.open(dir.path().join("data"), EnvFlags::CREATE).unwrap();

        let mut txn = env.begin_txn().unwrap();
        let big = vec![7u8; 4 * PAGE_SIZE];
        assert!(matches!(txn.put(b"big", &big, WriteFlags::empty()), Err(Error::MapFull)));
        assert!(matches!(txn.put(b"k", b"v", WriteFlags::empty()), Err(Error::BadTxn)));
        assert!(matches!(txn.commit(), Err(Error::BadTxn)));
        assert_eq!(env.info().unwrap().last_txnid, 1);
    }
}
