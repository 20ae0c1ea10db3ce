use std::cmp::Ordering;

use crate::constants::{PageFlags, Pgno, PAGE_SIZE};
use crate::error::{Error, Result};

// +--------+-----------------+ ...free... +-----------------------+
// | header | slot array -->  |            |  <-- node data        |
// +--------+-----------------+ ...........+-----------------------+
// 0        18             lower         upper                 4096

pub const PAGE_HEADER_SIZE: usize = 18;

const PGNO_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 8;
const NUM_KEYS_OFFSET: usize = 10;
const LOWER_OFFSET: usize = 12;
const UPPER_OFFSET: usize = 14;
pub(crate) const SLOT_SIZE: usize = 2;

pub const BRANCH_NODE_HEADER: usize = 10;
pub const LEAF_NODE_HEADER: usize = 4;

/// Value length bit marking a value stored in an overflow run
const BIG_VALUE: u16 = 0x8000;
/// Inline payload of a big value: overflow pgno followed by the value size
pub const BIG_VALUE_SIZE: usize = 16;

/// Largest leaf node (slot included) kept inline. Four always fit in a page,
/// so both halves of a split can take any node.
pub const MAX_NODE_SIZE: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / 4;

#[inline]
pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

#[inline]
pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[inline]
pub(crate) fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Bytes a leaf node occupies in the node area
pub(crate) fn leaf_node_size(key_len: usize, value_len: usize) -> usize {
    LEAF_NODE_HEADER + key_len + value_len
}

/// Bytes a branch node occupies in the node area
pub(crate) fn branch_node_size(key_len: usize) -> usize {
    BRANCH_NODE_HEADER + key_len
}

/// True when a leaf node with this key and value must spill to overflow pages
pub(crate) fn needs_overflow(key_len: usize, value_len: usize) -> bool {
    leaf_node_size(key_len, value_len) + SLOT_SIZE > MAX_NODE_SIZE
}

/// Pages in an overflow run holding `size` value bytes
pub(crate) fn overflow_page_count(size: usize) -> usize {
    (PAGE_HEADER_SIZE + size).div_ceil(PAGE_SIZE)
}

fn raw_node_size(node: &[u8], leaf: bool) -> usize {
    if leaf {
        let vlen = read_u16(node, 2) & !BIG_VALUE;
        leaf_node_size(read_u16(node, 0) as usize, vlen as usize)
    } else {
        branch_node_size(read_u16(node, 8) as usize)
    }
}

/// Key bytes of a raw leaf or branch node
pub(crate) fn node_key(node: &[u8], leaf: bool) -> &[u8] {
    if leaf {
        let len = read_u16(node, 0) as usize;
        &node[LEAF_NODE_HEADER..LEAF_NODE_HEADER + len]
    } else {
        let len = read_u16(node, 8) as usize;
        &node[BRANCH_NODE_HEADER..BRANCH_NODE_HEADER + len]
    }
}

/// Serialize a branch node
pub(crate) fn encode_branch_node(child: Pgno, key: &[u8]) -> Vec<u8> {
    let mut node = vec![0u8; branch_node_size(key.len())];
    write_u64(&mut node, 0, child);
    write_u16(&mut node, 8, key.len() as u16);
    node[BRANCH_NODE_HEADER..].copy_from_slice(key);
    node
}

/// Serialize a leaf node. `big` marks `value` as an overflow reference.
pub(crate) fn encode_leaf_node(key: &[u8], value: &[u8], big: bool) -> Vec<u8> {
    let mut node = vec![0u8; leaf_node_size(key.len(), value.len())];
    let vlen = value.len() as u16 | if big { BIG_VALUE } else { 0 };
    write_u16(&mut node, 0, key.len() as u16);
    write_u16(&mut node, 2, vlen);
    node[LEAF_NODE_HEADER..LEAF_NODE_HEADER + key.len()].copy_from_slice(key);
    node[LEAF_NODE_HEADER + key.len()..].copy_from_slice(value);
    node
}

/// Inline payload pointing at an overflow run
pub(crate) fn encode_big_value(pgno: Pgno, size: usize) -> [u8; BIG_VALUE_SIZE] {
    let mut payload = [0u8; BIG_VALUE_SIZE];
    write_u64(&mut payload, 0, pgno);
    write_u64(&mut payload, 8, size as u64);
    payload
}

/// Value of a leaf entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafValue<'a> {
    Inline(&'a [u8]),
    Overflow { pgno: Pgno, size: usize },
}

/// Read-only view of one page (or the first page of an overflow run)
#[derive(Debug, Clone, Copy)]
pub(crate) struct Page<'a> {
    data: &'a [u8],
}

impl<'a> Page<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        debug_assert!(data.len() >= PAGE_SIZE);
        Page { data }
    }

    pub(crate) fn pgno(&self) -> Pgno {
        read_u64(self.data, PGNO_OFFSET)
    }

    pub(crate) fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(read_u16(self.data, FLAGS_OFFSET))
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    pub(crate) fn is_branch(&self) -> bool {
        self.flags().contains(PageFlags::BRANCH)
    }

    pub(crate) fn is_overflow(&self) -> bool {
        self.flags().contains(PageFlags::OVERFLOW)
    }

    pub(crate) fn num_keys(&self) -> usize {
        read_u16(self.data, NUM_KEYS_OFFSET) as usize
    }

    /// End of the slot array
    pub(crate) fn lower(&self) -> usize {
        read_u16(self.data, LOWER_OFFSET) as usize
    }

    /// Start of the node data area
    pub(crate) fn upper(&self) -> usize {
        read_u16(self.data, UPPER_OFFSET) as usize
    }

    pub(crate) fn free_space(&self) -> usize {
        self.upper().saturating_sub(self.lower())
    }

    /// Length of an overflow run, stored across the lower/upper fields
    pub(crate) fn overflow_pages(&self) -> usize {
        read_u32(self.data, LOWER_OFFSET) as usize
    }

    /// Offset of node `index` within the page
    pub(crate) fn slot(&self, index: usize) -> usize {
        read_u16(self.data, PAGE_HEADER_SIZE + index * SLOT_SIZE) as usize
    }

    /// Raw bytes of node `index`
    pub(crate) fn node(&self, index: usize) -> &'a [u8] {
        let off = self.slot(index);
        let size = raw_node_size(&self.data[off..], self.is_leaf());
        &self.data[off..off + size]
    }

    pub(crate) fn key(&self, index: usize) -> &'a [u8] {
        node_key(self.node(index), self.is_leaf())
    }

    /// Child page number of branch entry `index`
    pub(crate) fn child(&self, index: usize) -> Pgno {
        read_u64(self.node(index), 0)
    }

    /// Value of leaf entry `index`
    pub(crate) fn value(&self, index: usize) -> LeafValue<'a> {
        let node = self.node(index);
        let klen = read_u16(node, 0) as usize;
        let vlen = read_u16(node, 2);
        let start = LEAF_NODE_HEADER + klen;
        if vlen & BIG_VALUE != 0 {
            LeafValue::Overflow {
                pgno: read_u64(node, start),
                size: read_u64(node, start + 8) as usize,
            }
        } else {
            LeafValue::Inline(&node[start..start + vlen as usize])
        }
    }

    /// Binary search over the slot array. On a miss the index is the
    /// insertion point.
    pub(crate) fn search(&self, key: &[u8]) -> (bool, usize) {
        let (mut low, mut high) = (0, self.num_keys());
        while low < high {
            let mid = low + (high - low) / 2;
            match self.key(mid).cmp(key) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return (true, mid),
            }
        }
        (false, low)
    }

    /// Branch entry whose subtree may hold `key`: the greatest key <= `key`,
    /// or entry 0 when every key is larger.
    pub(crate) fn child_index(&self, key: &[u8]) -> usize {
        match self.search(key) {
            (false, index) if index > 0 => index - 1,
            (_, index) => index,
        }
    }
}

/// Writable view over a page buffer owned by a write transaction
#[derive(Debug)]
pub(crate) struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    pub(crate) fn new(data: &'a mut [u8]) -> Self {
        debug_assert!(data.len() >= PAGE_SIZE);
        PageMut { data }
    }

    pub(crate) fn as_page(&self) -> Page<'_> {
        Page { data: self.data }
    }

    /// Turn the buffer into an empty page of the given kind
    pub(crate) fn init(&mut self, pgno: Pgno, flags: PageFlags) {
        self.data[..PAGE_HEADER_SIZE].fill(0);
        write_u64(self.data, PGNO_OFFSET, pgno);
        write_u16(self.data, FLAGS_OFFSET, flags.bits());
        self.set_num_keys(0);
        self.set_lower(PAGE_HEADER_SIZE);
        self.set_upper(PAGE_SIZE);
    }

    /// Drop every entry, keeping page number and kind
    pub(crate) fn reset(&mut self) {
        let page = self.as_page();
        let (pgno, flags) = (page.pgno(), page.flags());
        self.init(pgno, flags);
    }

    pub(crate) fn set_pgno(&mut self, pgno: Pgno) {
        write_u64(self.data, PGNO_OFFSET, pgno);
    }

    pub(crate) fn set_overflow_pages(&mut self, count: u32) {
        write_u32(self.data, LOWER_OFFSET, count);
    }

    fn set_num_keys(&mut self, n: usize) {
        write_u16(self.data, NUM_KEYS_OFFSET, n as u16);
    }

    fn set_lower(&mut self, v: usize) {
        write_u16(self.data, LOWER_OFFSET, v as u16);
    }

    fn set_upper(&mut self, v: usize) {
        write_u16(self.data, UPPER_OFFSET, v as u16);
    }

    fn set_slot(&mut self, index: usize, off: usize) {
        write_u16(self.data, PAGE_HEADER_SIZE + index * SLOT_SIZE, off as u16);
    }

    /// Open a slot at `index` and carve `size` bytes off the top of the node
    /// area. Returns the node offset.
    fn reserve(&mut self, index: usize, size: usize) -> Result<usize> {
        let page = self.as_page();
        let (n, lower, upper) = (page.num_keys(), page.lower(), page.upper());
        debug_assert!(index <= n);
        if SLOT_SIZE + size > page.free_space() {
            return Err(Error::PageFull);
        }

        let offset = upper - size;
        let start = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        let end = PAGE_HEADER_SIZE + n * SLOT_SIZE;
        self.data.copy_within(start..end, start + SLOT_SIZE);
        self.set_slot(index, offset);
        self.set_num_keys(n + 1);
        self.set_lower(lower + SLOT_SIZE);
        self.set_upper(offset);
        Ok(offset)
    }

    /// Insert an already-encoded node at `index`
    pub(crate) fn insert_raw(&mut self, index: usize, node: &[u8]) -> Result<()> {
        let off = self.reserve(index, node.len())?;
        self.data[off..off + node.len()].copy_from_slice(node);
        Ok(())
    }

    /// Append an already-encoded node after the last entry
    pub(crate) fn push_raw(&mut self, node: &[u8]) -> Result<()> {
        let n = self.as_page().num_keys();
        self.insert_raw(n, node)
    }

    pub(crate) fn insert_branch(&mut self, index: usize, key: &[u8], child: Pgno) -> Result<()> {
        let off = self.reserve(index, branch_node_size(key.len()))?;
        write_u64(self.data, off, child);
        write_u16(self.data, off + 8, key.len() as u16);
        let k = off + BRANCH_NODE_HEADER;
        self.data[k..k + key.len()].copy_from_slice(key);
        Ok(())
    }

    /// Remove entry `index`, closing the gap it leaves in the node area
    pub(crate) fn delete(&mut self, index: usize) {
        let page = self.as_page();
        let (n, lower, upper) = (page.num_keys(), page.lower(), page.upper());
        debug_assert!(index < n);
        let offset = page.slot(index);
        let size = page.node(index).len();

        // Everything between upper and the removed node shifts up by its size
        self.data.copy_within(upper..offset, upper + size);
        for i in 0..n {
            let off = self.as_page().slot(i);
            if off < offset {
                self.set_slot(i, off + size);
            }
        }

        let start = PAGE_HEADER_SIZE + (index + 1) * SLOT_SIZE;
        let end = PAGE_HEADER_SIZE + n * SLOT_SIZE;
        self.data.copy_within(start..end, start - SLOT_SIZE);
        self.set_num_keys(n - 1);
        self.set_lower(lower - SLOT_SIZE);
        self.set_upper(upper + size);
    }

    /// Repoint branch entry `index` at `child`
    pub(crate) fn set_child(&mut self, index: usize, child: Pgno) {
        let off = self.as_page().slot(index);
        write_u64(self.data, off, child);
    }

    /// Inline value bytes of leaf entry `index`, for same-size overwrites
    pub(crate) fn value_mut(&mut self, index: usize) -> &mut [u8] {
        let off = self.as_page().slot(index);
        let klen = read_u16(self.data, off) as usize;
        let vlen = (read_u16(self.data, off + 2) & !BIG_VALUE) as usize;
        let start = off + LEAF_NODE_HEADER + klen;
        &mut self.data[start..start + vlen]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_leaf(page: &mut PageMut<'_>, index: usize, key: &[u8], value: &[u8]) -> Result<()> {
        page.insert_raw(index, &encode_leaf_node(key, value, false))
    }

    fn leaf_buf() -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        PageMut::new(&mut buf).init(7, PageFlags::LEAF);
        buf
    }

    #[test]
    fn test_init_header() {
        let buf = leaf_buf();
        let page = Page::new(&buf);
        assert_eq!(page.pgno(), 7);
        assert!(page.is_leaf());
        assert!(!page.is_branch());
        assert_eq!(page.num_keys(), 0);
        assert_eq!(page.lower(), PAGE_HEADER_SIZE);
        assert_eq!(page.upper(), PAGE_SIZE);
        assert_eq!(page.free_space(), PAGE_SIZE - PAGE_HEADER_SIZE);
    }

    #[test]
    fn test_insert_keeps_slots_sorted() {
        let mut buf = leaf_buf();
        let mut page = PageMut::new(&mut buf);
        for key in [&b"m"[..], b"c", b"x", b"a"] {
            let (found, idx) = page.as_page().search(key);
            assert!(!found);
            insert_leaf(&mut page, idx, key, b"v").unwrap();
        }
        let view = page.as_page();
        let keys: Vec<&[u8]> = (0..view.num_keys()).map(|i| view.key(i)).collect();
        assert_eq!(keys, vec![&b"a"[..], b"c", b"m", b"x"]);
        assert_eq!(view.search(b"m"), (true, 2));
        assert_eq!(view.search(b"d"), (false, 2));
        assert!(view.lower() <= view.upper());
    }

    #[test]
    fn test_prefix_sorts_first() {
        let mut buf = leaf_buf();
        let mut page = PageMut::new(&mut buf);
        insert_leaf(&mut page, 0, b"abc", b"1").unwrap();
        let (_, idx) = page.as_page().search(b"ab");
        assert_eq!(idx, 0);
        insert_leaf(&mut page, idx, b"ab", b"2").unwrap();
        assert_eq!(page.as_page().key(0), b"ab");
    }

    #[test]
    fn test_delete_compacts_node_area() {
        let mut buf = leaf_buf();
        let mut page = PageMut::new(&mut buf);
        insert_leaf(&mut page, 0, b"a", b"first").unwrap();
        insert_leaf(&mut page, 1, b"b", b"second").unwrap();
        insert_leaf(&mut page, 2, b"c", b"third").unwrap();
        let before = page.as_page().free_space();

        page.delete(1);
        let view = page.as_page();
        assert_eq!(view.num_keys(), 2);
        assert_eq!(view.key(0), b"a");
        assert_eq!(view.key(1), b"c");
        assert_eq!(view.value(0), LeafValue::Inline(b"first"));
        assert_eq!(view.value(1), LeafValue::Inline(b"third"));
        assert_eq!(view.free_space(), before + SLOT_SIZE + leaf_node_size(1, 6));
    }

    #[test]
    fn test_page_full() {
        let mut buf = leaf_buf();
        let mut page = PageMut::new(&mut buf);
        let value = [0u8; 500];
        let mut inserted = 0;
        loop {
            let key = format!("key{:04}", inserted);
            match insert_leaf(&mut page, inserted, key.as_bytes(), &value) {
                Ok(()) => inserted += 1,
                Err(Error::PageFull) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(inserted, 7);
        assert!(page.as_page().lower() <= page.as_page().upper());
    }

    #[test]
    fn test_branch_child_index() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = PageMut::new(&mut buf);
        page.init(3, PageFlags::BRANCH);
        page.insert_branch(0, b"", 10).unwrap();
        page.insert_branch(1, b"g", 11).unwrap();
        page.insert_branch(2, b"p", 12).unwrap();
        let view = page.as_page();
        assert_eq!(view.child(view.child_index(b"a")), 10);
        assert_eq!(view.child(view.child_index(b"g")), 11);
        assert_eq!(view.child(view.child_index(b"h")), 11);
        assert_eq!(view.child(view.child_index(b"zzz")), 12);

        page.set_child(1, 99);
        assert_eq!(page.as_page().child(1), 99);
    }

    #[test]
    fn test_big_value_reference() {
        let mut buf = leaf_buf();
        let mut page = PageMut::new(&mut buf);
        let node = encode_leaf_node(b"big", &encode_big_value(42, 9000), true);
        page.insert_raw(0, &node).unwrap();
        assert_eq!(
            page.as_page().value(0),
            LeafValue::Overflow { pgno: 42, size: 9000 }
        );
        assert_eq!(page.as_page().node(0), &node[..]);
    }

    #[test]
    fn test_overflow_sizing() {
        assert!(!needs_overflow(8, 64));
        assert!(needs_overflow(8, 2000));
        assert_eq!(overflow_page_count(1), 1);
        assert_eq!(overflow_page_count(PAGE_SIZE - PAGE_HEADER_SIZE), 1);
        assert_eq!(overflow_page_count(PAGE_SIZE - PAGE_HEADER_SIZE + 1), 2);
    }
}
