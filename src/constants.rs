use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Skip msync/fsync on commit
        const NOSYNC = 0x10000;
        /// Open the data file read-only
        const RDONLY = 0x20000;
        /// Create the data file if it does not exist
        const CREATE = 0x40000;
        /// Serialize writers with an in-process mutex only
        const INTRAPROCESS = 0x400000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        /// Fail with `KeyExist` instead of overwriting
        const NOOVERWRITE = 0x10;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransactionFlags: u32 {
        // Reuse environment flags
        const RDONLY = EnvFlags::RDONLY.bits();
        const NOSYNC = EnvFlags::NOSYNC.bits();

        // Transaction-specific flags
        const FINISHED = 0x01;
        /// An update failed halfway; only abort is allowed
        const ERROR = 0x02;
        const DIRTY = 0x04;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const LEAF = 0x01;
        const OVERFLOW = 0x04;
        /// Reserved; free pages are tracked by number in the Free DB
        const FREE = 0x10;
        const BRANCH = 0x20;
    }
}

// Cursor state flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CursorFlags: u32 {
        const INITIALIZED = 0x01;
        /// Ran off the last entry
        const EOF = 0x02;
        /// Ran off the first entry
        const BOF = 0x04;
        /// Current entry was deleted; the cursor already sits on its successor
        const DELETED = 0x08;
    }
}

/// Page number
pub type Pgno = u64;

/// Transaction id
pub type Txnid = u64;

// Page and version constants
pub const PAGE_SIZE: usize = 4096;
/// Magic number for data files
pub const MAGIC: u32 = 0xBEEF_DEAD;
/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;
/// Meta pages live at page numbers 0 and 1
pub const META_PAGES: usize = 2;
/// Root value of an empty tree. Page 0 is a meta page, never a tree page.
pub const NO_PAGE: Pgno = 0;

pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_READERS: u32 = 126;
/// Longest key accepted by put
pub const MAX_KEY_SIZE: usize = 511;
/// Cursor stack bound; a 4K page tree never gets this deep
pub const MAX_DEPTH: usize = 32;
/// Size of one reader table slot
pub const CACHE_LINE: usize = 64;
