use std::fmt;
use std::fs::File;

use fs2::FileExt;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Writer lock held from write-transaction begin to commit/abort. The
/// implementation is picked at open time from `EnvFlags::INTRAPROCESS`.
pub(crate) trait WriterLock: Send + Sync + fmt::Debug {
    /// Block until the lock is ours
    fn acquire(&self) -> Result<()>;
    /// Take the lock if it is free
    fn try_acquire(&self) -> Result<bool>;
    fn release(&self) -> Result<()>;
}

/// Writer lock shared by the threads of one process.
///
/// Unlike a guard-based mutex it can be released from whatever scope ends
/// the transaction.
#[derive(Debug, Default)]
pub(crate) struct ThreadLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl ThreadLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl WriterLock for ThreadLock {
    fn acquire(&self) -> Result<()> {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
        Ok(())
    }

    fn try_acquire(&self) -> Result<bool> {
        let mut held = self.held.lock();
        if *held {
            return Ok(false);
        }
        *held = true;
        Ok(true)
    }

    fn release(&self) -> Result<()> {
        *self.held.lock() = false;
        self.released.notify_one();
        Ok(())
    }
}

/// Writer lock shared by cooperating processes: the in-process lock plus an
/// exclusive advisory lock on the lock file.
#[derive(Debug)]
pub(crate) struct ProcessLock {
    local: ThreadLock,
    file: File,
}

impl ProcessLock {
    pub(crate) fn new(file: File) -> Self {
        ProcessLock {
            local: ThreadLock::new(),
            file,
        }
    }
}

impl WriterLock for ProcessLock {
    fn acquire(&self) -> Result<()> {
        self.local.acquire()?;
        if let Err(e) = FileExt::lock_exclusive(&self.file) {
            self.local.release()?;
            return Err(e.into());
        }
        Ok(())
    }

    fn try_acquire(&self) -> Result<bool> {
        if !self.local.try_acquire()? {
            return Ok(false);
        }
        match FileExt::try_lock_exclusive(&self.file) {
            Ok(()) => Ok(true),
            Err(e) => {
                self.local.release()?;
                if e.kind() == fs2::lock_contended_error().kind() {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn release(&self) -> Result<()> {
        let unlocked = FileExt::unlock(&self.file);
        self.local.release()?;
        unlocked.map_err(Error::from)
    }
}

/// Claim a file exclusively for as long as the returned handle lives
pub(crate) fn lock_exclusive_now(file: &File) -> Result<()> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(Error::Busy),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_thread_lock_excludes() {
        let lock = ThreadLock::new();
        lock.acquire().unwrap();
        assert!(!lock.try_acquire().unwrap());
        lock.release().unwrap();
        assert!(lock.try_acquire().unwrap());
        lock.release().unwrap();
    }

    #[test]
    fn test_thread_lock_blocks_until_release() {
        let lock = Arc::new(ThreadLock::new());
        lock.acquire().unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.acquire().unwrap();
                lock.release().unwrap();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        lock.release().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_process_lock() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("lock")).unwrap();
        let lock = ProcessLock::new(file);
        assert!(lock.try_acquire().unwrap());
        assert!(!lock.try_acquire().unwrap());
        lock.release().unwrap();
        lock.acquire().unwrap();
        lock.release().unwrap();
    }
}
