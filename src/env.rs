use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::constants::{
    EnvFlags, Pgno, DEFAULT_MAP_SIZE, DEFAULT_MAX_READERS, MAX_KEY_SIZE, META_PAGES, PAGE_SIZE,
};
use crate::error::{Error, Result};
use crate::lock::{lock_exclusive_now, ProcessLock, ThreadLock, WriterLock};
use crate::map::Mapping;
use crate::meta::{Meta, META_SIZE};
use crate::reader::ReaderTable;
use crate::transaction::Transaction;
use crate::types::{EnvInfo, ReaderInfo, Stat};

/// Everything that only exists while the environment is open
#[derive(Debug)]
pub(crate) struct EnvInner {
    /// Data file
    pub(crate) file: File,
    /// Memory map over the data file
    pub(crate) map: Mapping,
    /// Lock file held exclusively for the lifetime of an INTRAPROCESS environment
    lock_file: Option<File>,
    /// Serializes write transactions
    pub(crate) writer: Box<dyn WriterLock>,
    /// Snapshots pinned by read transactions
    pub(crate) readers: ReaderTable,
}

/// Storage environment: one data file, its mapping, and the locks around it
#[derive(Debug)]
pub struct Environment {
    /// Path to the data file
    path: PathBuf,
    /// Environment flags
    flags: EnvFlags,
    /// Requested size of the memory map
    map_size: usize,
    /// Maximum number of concurrent readers
    max_readers: u32,
    /// Open state
    inner: Option<EnvInner>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Create a new, unopened environment with default limits
    pub fn new() -> Self {
        Environment {
            path: PathBuf::new(),
            flags: EnvFlags::empty(),
            map_size: DEFAULT_MAP_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            inner: None,
        }
    }

    /// Set the size of the memory map
    ///
    /// This bounds how large the data file may grow. Must be called before
    /// open(); an existing file larger than the requested size is mapped whole.
    pub fn set_map_size(&mut self, size: usize) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::EnvAlreadyOpen);
        }
        if size == 0 {
            return Err(Error::EnvInvalidMapSize);
        }
        self.map_size = size;
        Ok(())
    }

    /// Set the maximum number of threads/reader slots
    ///
    /// Every process sharing a data file must use the same value.
    pub fn set_max_readers(&mut self, readers: u32) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::EnvAlreadyOpen);
        }
        if readers == 0 {
            return Err(Error::EnvInvalidMaxReaders);
        }
        self.max_readers = readers;
        Ok(())
    }

    /// Get the maximum number of threads/reader slots
    pub fn max_readers(&self) -> u32 {
        self.max_readers
    }

    /// Get the maximum size of keys we can write
    pub fn max_key_size(&self) -> usize {
        MAX_KEY_SIZE
    }

    /// Open the environment
    ///
    /// An empty or missing file (with CREATE) is initialized with two meta
    /// pages. Otherwise the valid meta with the higher txnid becomes live.
    pub fn open<P: AsRef<Path>>(&mut self, path: P, flags: EnvFlags) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::EnvAlreadyOpen);
        }
        let path = path.as_ref().to_path_buf();
        let readonly = flags.contains(EnvFlags::RDONLY);

        let mut options = OpenOptions::new();
        options.read(true);
        if !readonly {
            options.write(true).create(flags.contains(EnvFlags::CREATE));
        }
        let file = options.open(&path)?;

        let mut file_len = file.metadata()?.len() as usize;
        let fresh = file_len == 0;
        if fresh {
            if readonly {
                return Err(Error::EnvNotInitialized);
            }
            file_len = META_PAGES * PAGE_SIZE;
            file.set_len(file_len as u64)?;
        } else if file_len < META_PAGES * PAGE_SIZE {
            return Err(Error::Corrupted);
        }

        let map_len = self.map_size.max(file_len).next_multiple_of(PAGE_SIZE);
        let map = Mapping::open(&file, map_len, !readonly)?;
        if fresh {
            init_meta_pages(&map)?;
            file.sync_all()?;
            info!("created {} with map size {}", path.display(), map_len);
        }

        let slots = [0, 1].map(|slot| {
            read_meta(&map, slot).and_then(|meta| within_file(meta, file_len as u64))
        });
        for (slot, meta) in slots.iter().enumerate() {
            if let Err(e) = meta {
                warn!("meta page {} of {} is invalid: {}", slot, path.display(), e);
            }
        }
        let (slot, meta) = Meta::pick_live(slots)?;

        let capacity = self.max_readers as usize;
        let (writer, readers, lock_file): (Box<dyn WriterLock>, _, _) =
            if flags.contains(EnvFlags::INTRAPROCESS) {
                let lock_file = if readonly {
                    None
                } else {
                    let lock_file = open_lock_file(&path)?;
                    lock_exclusive_now(&lock_file)?;
                    Some(lock_file)
                };
                (Box::new(ThreadLock::new()), ReaderTable::in_memory(capacity), lock_file)
            } else {
                let lock_file = open_lock_file(&path)?;
                let readers = ReaderTable::mapped(&lock_file, capacity)?;
                if !readonly {
                    // Slots of crashed processes would pin old pages forever
                    let cleared = readers.clear_stale(process_alive);
                    if cleared > 0 {
                        warn!("cleared {} stale reader slots in {}", cleared, path.display());
                    }
                }
                (Box::new(ProcessLock::new(lock_file)), readers, None)
            };

        info!(
            "opened {} (meta slot {}, txnid {}, last page {})",
            path.display(),
            slot,
            meta.txnid,
            meta.last_pgno
        );

        self.path = path;
        self.flags = flags;
        self.inner = Some(EnvInner {
            file,
            map,
            lock_file,
            writer,
            readers,
        });
        Ok(())
    }

    /// Close the environment and release the memory map.
    ///
    /// All transactions and cursors borrow the environment, so none can be
    /// live here.
    pub fn close(&mut self) {
        if let Some(inner) = self.inner.take() {
            if inner.lock_file.is_some() {
                debug!("releasing exclusive lock on {}", self.path.display());
            }
            info!("closed {}", self.path.display());
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Path of the data file passed to open()
    pub fn path(&self) -> Result<&Path> {
        self.inner()?;
        Ok(&self.path)
    }

    /// Flags passed to open()
    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    /// Begin a write transaction, waiting for the writer lock
    pub fn begin_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin_write(self, true)
    }

    /// Begin a write transaction, failing with `Busy` if another writer is active
    pub fn try_begin_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin_write(self, false)
    }

    /// Begin a read-only transaction on the latest committed snapshot
    pub fn begin_ro_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin_read(self)
    }

    /// Flush the data file to disk
    ///
    /// Useful after commits made with NOSYNC. With `force` the file metadata
    /// is synced as well.
    pub fn sync(&self, force: bool) -> Result<()> {
        let inner = self.inner()?;
        if self.flags.contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }
        inner.map.flush()?;
        if force {
            inner.file.sync_all()?;
        } else {
            inner.file.sync_data()?;
        }
        Ok(())
    }

    /// Statistics for the main tree as of the latest commit
    pub fn stat(&self) -> Result<Stat> {
        self.begin_ro_txn()?.stat()
    }

    /// Get environment information
    pub fn info(&self) -> Result<EnvInfo> {
        let inner = self.inner()?;
        let meta = self.live_meta()?;
        Ok(EnvInfo {
            map_size: inner.map.len(),
            last_pgno: meta.last_pgno,
            last_txnid: meta.txnid,
            max_readers: inner.readers.capacity() as u32,
            num_readers: inner.readers.active() as u32,
        })
    }

    /// Occupied reader slots
    pub fn reader_list(&self) -> Result<Vec<ReaderInfo>> {
        Ok(self.inner()?.readers.entries())
    }

    /// Check for stale readers
    ///
    /// Frees the slots of processes that exited without ending their read
    /// transaction. Returns the number of slots cleared.
    pub fn reader_check(&self) -> Result<usize> {
        let cleared = self.inner()?.readers.clear_stale(process_alive);
        if cleared > 0 {
            warn!("cleared {} stale reader slots in {}", cleared, self.path.display());
        }
        Ok(cleared)
    }

    pub(crate) fn inner(&self) -> Result<&EnvInner> {
        self.inner.as_ref().ok_or(Error::EnvNotInitialized)
    }

    /// Read the live meta. Both slots are copied out and validated since the
    /// writer may be rewriting the other one.
    pub(crate) fn live_meta(&self) -> Result<Meta> {
        let inner = self.inner()?;
        let slots = [0, 1].map(|slot| read_meta(&inner.map, slot));
        // Length is taken after the metas: a commit grows the file before
        // publishing, so any meta seen above fits in it
        let file_len = inner.file.metadata()?.len();
        let slots = slots.map(|meta| meta.and_then(|meta| within_file(meta, file_len)));
        Meta::pick_live(slots).map(|(_, meta)| meta)
    }

    /// Extend the data file so it covers every page up to `last_pgno`
    pub(crate) fn grow_file(&self, last_pgno: Pgno) -> Result<()> {
        let inner = self.inner()?;
        let len = (last_pgno + 1) * PAGE_SIZE as u64;
        if inner.file.metadata()?.len() < len {
            debug!("growing {} to {} bytes", self.path.display(), len);
            inner.file.set_len(len)?;
        }
        Ok(())
    }

    /// Publish `meta` in slot `txnid % 2`, the one not currently live
    pub(crate) fn write_meta(&self, meta: &Meta, sync: bool) -> Result<()> {
        let inner = self.inner()?;
        let slot = meta.txnid % 2;
        let mut page = vec![0u8; PAGE_SIZE];
        page[..META_SIZE].copy_from_slice(&meta.encode());
        inner.map.write_pages(slot, &page)?;
        if sync {
            inner.map.flush_pages(slot, 1)?;
        }
        debug!(
            "meta slot {} now txnid {} (root {}, free root {}, last page {})",
            slot, meta.txnid, meta.root, meta.free_root, meta.last_pgno
        );
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_meta(map: &Mapping, slot: Pgno) -> Result<Meta> {
    Meta::decode(&map.read_bytes(slot, META_SIZE)?)
}

/// A meta whose pages reach past the end of the file is as invalid as a
/// torn one
fn within_file(meta: Meta, file_len: u64) -> Result<Meta> {
    if (meta.last_pgno + 1).saturating_mul(PAGE_SIZE as u64) > file_len {
        return Err(Error::Corrupted);
    }
    Ok(meta)
}

/// Write the initial meta pages: txnid 0 in slot 0 and txnid 1 in slot 1
fn init_meta_pages(map: &Mapping) -> Result<()> {
    for slot in 0..META_PAGES as Pgno {
        let mut page = vec![0u8; PAGE_SIZE];
        page[..META_SIZE].copy_from_slice(&Meta::empty(slot).encode());
        map.write_pages(slot, &page)?;
    }
    map.flush()
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("-lock");
    PathBuf::from(name)
}

fn open_lock_file(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path(path))?;
    Ok(file)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_limits_rejected_after_open() {
        let dir = tempdir().unwrap();
        let mut env = Environment::new();
        assert!(matches!(env.set_map_size(0), Err(Error::EnvInvalidMapSize)));
        assert!(matches!(env.set_max_readers(0), Err(Error::EnvInvalidMaxReaders)));
        env.open(dir.path().join("data"), EnvFlags::CREATE).unwrap();
        assert!(matches!(env.set_map_size(1 << 20), Err(Error::EnvAlreadyOpen)));
        assert!(matches!(env.set_max_readers(4), Err(Error::EnvAlreadyOpen)));
        assert!(matches!(
            env.open(dir.path().join("data"), EnvFlags::CREATE),
            Err(Error::EnvAlreadyOpen)
        ));
    }

    #[test]
    fn test_create_initializes_metas() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let mut env = Environment::new();
        env.open(&path, EnvFlags::CREATE).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * PAGE_SIZE as u64);
        let map = &env.inner().unwrap().map;
        assert_eq!(read_meta(map, 0).unwrap().txnid, 0);
        let meta = read_meta(map, 1).unwrap();
        assert_eq!(meta.txnid, 1);
        assert!(within_file(meta, 2 * PAGE_SIZE as u64).is_ok());
        assert!(matches!(within_file(meta, PAGE_SIZE as u64), Err(Error::Corrupted)));
        assert_eq!(env.info().unwrap().last_txnid, 1);
        assert!(lock_path(&path).exists());
    }

    #[test]
    fn test_missing_file_without_create() {
        let dir = tempdir().unwrap();
        let mut env = Environment::new();
        assert!(matches!(
            env.open(dir.path().join("absent"), EnvFlags::empty()),
            Err(Error::Io(_))
        ));
        assert!(!env.is_open());
    }

    #[test]
    fn test_closed_env_rejects_use() {
        let dir = tempdir().unwrap();
        let mut env = Environment::new();
        assert!(matches!(env.begin_ro_txn(), Err(Error::EnvNotInitialized)));
        env.open(dir.path().join("data"), EnvFlags::CREATE).unwrap();
        env.close();
        assert!(matches!(env.info(), Err(Error::EnvNotInitialized)));
        assert!(matches!(env.begin_txn(), Err(Error::EnvNotInitialized)));
    }

    #[test]
    fn test_intraprocess_holds_file_exclusively() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let mut first = Environment::new();
        first
            .open(&path, EnvFlags::CREATE | EnvFlags::INTRAPROCESS)
            .unwrap();

        let mut second = Environment::new();
        assert!(matches!(
            second.open(&path, EnvFlags::INTRAPROCESS),
            Err(Error::Busy)
        ));

        first.close();
        second.open(&path, EnvFlags::INTRAPROCESS).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_clears_dead_readers() {
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let mut env = Environment::new();
        env.open(&path, EnvFlags::CREATE).unwrap();
        env.close();

        // A slot left behind by a process that no longer exists
        let mut lock = OpenOptions::new().write(true).open(lock_path(&path)).unwrap();
        lock.seek(SeekFrom::Start(0)).unwrap();
        lock.write_all(&1u64.to_le_bytes()).unwrap();
        lock.write_all(&u32::MAX.to_le_bytes()).unwrap();
        lock.sync_all().unwrap();
        drop(lock);

        let mut env = Environment::new();
        env.open(&path, EnvFlags::empty()).unwrap();
        assert!(env.reader_list().unwrap().is_empty());
        assert_eq!(env.info().unwrap().num_readers, 0);
    }

    #[test]
    fn test_reader_list_and_check() {
        let dir = tempdir().unwrap();
        let mut env = Environment::new();
        env.open(dir.path().join("data"), EnvFlags::CREATE).unwrap();

        let txn = env.begin_ro_txn().unwrap();
        let readers = env.reader_list().unwrap();
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0].pid, std::process::id());
        assert_eq!(readers[0].txnid, txn.id());
        // Our own process is alive, nothing to clear
        assert_eq!(env.reader_check().unwrap(), 0);
        txn.abort();
        assert!(env.reader_list().unwrap().is_empty());
    }
}
