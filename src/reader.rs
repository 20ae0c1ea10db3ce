use std::fs::File;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::{MmapOptions, MmapRaw};

use crate::constants::{Txnid, CACHE_LINE};
use crate::error::{Error, Result};
use crate::types::ReaderInfo;

#[repr(C, align(64))]
#[derive(Debug, Default)]
pub(crate) struct ReaderSlot {
    /// Snapshot being read, 0 when the slot is unused
    txnid: AtomicU64,
    /// Process that owns the slot
    pid: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<ReaderSlot>() == CACHE_LINE);

#[derive(Debug)]
enum Backing {
    /// Private to this process
    Heap(Box<[ReaderSlot]>),
    /// Shared through the lock file
    Mapped(MmapRaw),
}

/// One cache-line slot per concurrent read transaction. The minimum txnid
/// over all slots is the low-water mark that gates page reuse.
#[derive(Debug)]
pub(crate) struct ReaderTable {
    backing: Backing,
    capacity: usize,
}

impl ReaderTable {
    pub(crate) fn in_memory(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| ReaderSlot::default()).collect::<Vec<_>>();
        ReaderTable {
            backing: Backing::Heap(slots.into_boxed_slice()),
            capacity,
        }
    }

    /// Map the table out of the lock file, growing the file if needed. All
    /// processes sharing the file must agree on the capacity.
    pub(crate) fn mapped(file: &File, capacity: usize) -> Result<Self> {
        let len = capacity * CACHE_LINE;
        if (file.metadata()?.len() as usize) < len {
            file.set_len(len as u64)?;
        }
        let raw = MmapOptions::new().len(len).map_raw(file)?;
        Ok(ReaderTable {
            backing: Backing::Mapped(raw),
            capacity,
        })
    }

    fn slots(&self) -> &[ReaderSlot] {
        match &self.backing {
            Backing::Heap(slots) => slots,
            // Safety: the mapping is page aligned, `capacity` slots long, and
            // zero-filled file bytes are valid atomics. All access is atomic.
            Backing::Mapped(raw) => unsafe {
                std::slice::from_raw_parts(raw.as_ptr() as *const ReaderSlot, self.capacity)
            },
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim the first free slot for `txnid`
    pub(crate) fn register(&self, txnid: Txnid) -> Result<usize> {
        debug_assert!(txnid != 0);
        for (index, slot) in self.slots().iter().enumerate() {
            if slot
                .txnid
                .compare_exchange(0, txnid, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                slot.pid.store(std::process::id(), Ordering::SeqCst);
                return Ok(index);
            }
        }
        Err(Error::ReadersFull)
    }

    /// Move an owned slot to a newer snapshot
    pub(crate) fn update(&self, index: usize, txnid: Txnid) {
        self.slots()[index].txnid.store(txnid, Ordering::SeqCst);
    }

    pub(crate) fn unregister(&self, index: usize) {
        let slot = &self.slots()[index];
        slot.pid.store(0, Ordering::SeqCst);
        slot.txnid.store(0, Ordering::SeqCst);
    }

    /// Smallest registered snapshot id, or 0 when no reader is registered
    pub(crate) fn oldest(&self) -> Txnid {
        self.slots()
            .iter()
            .map(|slot| slot.txnid.load(Ordering::SeqCst))
            .filter(|&txnid| txnid != 0)
            .min()
            .unwrap_or(0)
    }

    pub(crate) fn active(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| slot.txnid.load(Ordering::SeqCst) != 0)
            .count()
    }

    pub(crate) fn entries(&self) -> Vec<ReaderInfo> {
        self.slots()
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let txnid = slot.txnid.load(Ordering::SeqCst);
                (txnid != 0).then(|| ReaderInfo {
                    slot: index,
                    pid: slot.pid.load(Ordering::SeqCst),
                    txnid,
                })
            })
            .collect()
    }

    /// Free slots whose owning process is gone. Returns how many were cleared.
    pub(crate) fn clear_stale(&self, is_alive: impl Fn(u32) -> bool) -> usize {
        let mut cleared = 0;
        for slot in self.slots() {
            let txnid = slot.txnid.load(Ordering::SeqCst);
            let pid = slot.pid.load(Ordering::SeqCst);
            if txnid != 0
                && pid != 0
                && !is_alive(pid)
                && slot
                    .txnid
                    .compare_exchange(txnid, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                slot.pid.store(0, Ordering::SeqCst);
                cleared += 1;
            }
        }
        cleared
    }
}
