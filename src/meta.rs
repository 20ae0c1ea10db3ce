use crate::constants::{Pgno, Txnid, FORMAT_VERSION, MAGIC, NO_PAGE};
use crate::error::{Error, Result};
use crate::page::{read_u32, read_u64, write_u32, write_u64};

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const TXNID_OFFSET: usize = 8;
const ROOT_OFFSET: usize = 16;
const LAST_PGNO_OFFSET: usize = 24;
const FREE_ROOT_OFFSET: usize = 32;
const CHECKSUM_OFFSET: usize = 40;

/// Bytes of a meta page that carry data; the rest of the page is zero
pub const META_SIZE: usize = 44;

/// One version of the database: the pointers a commit publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Meta {
    /// txnid that committed this page
    pub(crate) txnid: Txnid,
    /// Main tree root
    pub(crate) root: Pgno,
    /// Last used page in the datafile
    pub(crate) last_pgno: Pgno,
    /// Free DB root
    pub(crate) free_root: Pgno,
}

impl Meta {
    /// Meta for a freshly created file
    pub(crate) fn empty(txnid: Txnid) -> Self {
        Meta {
            txnid,
            root: NO_PAGE,
            last_pgno: 1,
            free_root: NO_PAGE,
        }
    }

    pub(crate) fn encode(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        write_u32(&mut buf, MAGIC_OFFSET, MAGIC);
        write_u32(&mut buf, VERSION_OFFSET, FORMAT_VERSION);
        write_u64(&mut buf, TXNID_OFFSET, self.txnid);
        write_u64(&mut buf, ROOT_OFFSET, self.root);
        write_u64(&mut buf, LAST_PGNO_OFFSET, self.last_pgno);
        write_u64(&mut buf, FREE_ROOT_OFFSET, self.free_root);
        let checksum = crc32fast::hash(&buf[..CHECKSUM_OFFSET]);
        write_u32(&mut buf, CHECKSUM_OFFSET, checksum);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_SIZE || read_u32(buf, MAGIC_OFFSET) != MAGIC {
            return Err(Error::Corrupted);
        }
        if read_u32(buf, VERSION_OFFSET) != FORMAT_VERSION {
            return Err(Error::VersionMismatch);
        }
        if read_u32(buf, CHECKSUM_OFFSET) != crc32fast::hash(&buf[..CHECKSUM_OFFSET]) {
            return Err(Error::Corrupted);
        }
        let meta = Meta {
            txnid: read_u64(buf, TXNID_OFFSET),
            root: read_u64(buf, ROOT_OFFSET),
            last_pgno: read_u64(buf, LAST_PGNO_OFFSET),
            free_root: read_u64(buf, FREE_ROOT_OFFSET),
        };
        if meta.last_pgno < 1 || meta.root > meta.last_pgno || meta.free_root > meta.last_pgno {
            return Err(Error::Corrupted);
        }
        Ok(meta)
    }

    /// Pick the live meta out of the two slots: the valid one with the
    /// higher txnid. Returns the slot index with it.
    pub(crate) fn pick_live(slots: [Result<Meta>; 2]) -> Result<(usize, Meta)> {
        let [first, second] = slots;
        match (first, second) {
            (Ok(a), Ok(b)) => Ok(if b.txnid > a.txnid { (1, b) } else { (0, a) }),
            (Ok(a), Err(_)) => Ok((0, a)),
            (Err(_), Ok(b)) => Ok((1, b)),
            // Prefer reporting a version mismatch over plain corruption
            (Err(Error::VersionMismatch), Err(_)) | (Err(_), Err(Error::VersionMismatch)) => {
                Err(Error::VersionMismatch)
            }
            (Err(_), Err(_)) => Err(Error::Corrupted),
        }
    }
}
