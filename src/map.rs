use std::fs::File;

use memmap2::{MmapOptions, MmapRaw};

use crate::constants::{Pgno, PAGE_SIZE};
use crate::error::{Error, Result};

/// Bounds-checked view of the memory-mapped data file.
///
/// Readers get shared slices of pages. The writer copies committed pages in
/// through `write_pages`; it only ever targets pages no live snapshot can
/// reach, plus the non-live meta page.
#[derive(Debug)]
pub(crate) struct Mapping {
    raw: MmapRaw,
    writable: bool,
}

impl Mapping {
    /// Map `len` bytes of `file`. The file may be shorter; it is grown
    /// before any page past its end is written.
    pub(crate) fn open(file: &File, len: usize, writable: bool) -> Result<Self> {
        let mut options = MmapOptions::new();
        options.len(len);
        let raw = if writable {
            options.map_raw(file)?
        } else {
            options.map_raw_read_only(file)?
        };
        Ok(Mapping { raw, writable })
    }

    pub(crate) fn len(&self) -> usize {
        self.raw.len()
    }

    /// Number of whole pages the mapping covers
    pub(crate) fn page_capacity(&self) -> Pgno {
        (self.raw.len() / PAGE_SIZE) as Pgno
    }

    fn range(&self, pgno: Pgno, len: usize) -> Result<usize> {
        let offset = (pgno as usize)
            .checked_mul(PAGE_SIZE)
            .ok_or(Error::PageNotFound(pgno))?;
        match offset.checked_add(len) {
            Some(end) if end <= self.raw.len() => Ok(offset),
            _ => Err(Error::PageNotFound(pgno)),
        }
    }

    /// `count` consecutive pages starting at `pgno`
    pub(crate) fn pages(&self, pgno: Pgno, count: usize) -> Result<&[u8]> {
        let len = count * PAGE_SIZE;
        let offset = self.range(pgno, len)?;
        // Safety: the range is inside the mapping, which lives as long as
        // `self`. Pages reachable from a snapshot are never rewritten while
        // that snapshot is registered.
        Ok(unsafe { std::slice::from_raw_parts(self.raw.as_ptr().add(offset), len) })
    }

    /// Copy `data` into the mapping starting at page `pgno`.
    ///
    /// Only the holder of the writer lock may call this.
    pub(crate) fn write_pages(&self, pgno: Pgno, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::EnvReadOnly);
        }
        let offset = self.range(pgno, data.len())?;
        // Safety: bounds checked above; the target pages are unreachable from
        // every registered reader snapshot.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.raw.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy `len` bytes out of page `pgno`. Used for meta pages, which the
    /// writer may be rewriting concurrently.
    pub(crate) fn read_bytes(&self, pgno: Pgno, len: usize) -> Result<Vec<u8>> {
        let offset = self.range(pgno, len)?;
        let mut buf = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.raw.as_ptr().add(offset), buf.as_mut_ptr(), len);
        }
        Ok(buf)
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.raw.flush()?;
        Ok(())
    }

    pub(crate) fn flush_pages(&self, pgno: Pgno, count: usize) -> Result<()> {
        let len = count * PAGE_SIZE;
        let offset = self.range(pgno, len)?;
        self.raw.flush_range(offset, len)?;
        Ok(())
    }
}
