use crate::constants::{Pgno, Txnid};

/// Cursor positioning operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    First,
    GetCurrent,
    Last,
    Next,
    Prev,
    Set,
    SetRange,
}

/// Tree statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub psize: u32,
    pub depth: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    pub entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    pub map_size: usize,
    pub last_pgno: Pgno,
    pub last_txnid: Txnid,
    pub max_readers: u32,
    pub num_readers: u32,
}

/// One occupied reader slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    pub slot: usize,
    pub pid: u32,
    pub txnid: Txnid,
}
