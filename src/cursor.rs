use crate::btree::{self, Frame, Tree};
use crate::constants::{CursorFlags, Pgno, MAX_DEPTH, NO_PAGE};
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::types::CursorOp;

/// How a cursor holds its transaction
enum TxnRef<'txn, 'env> {
    Shared(&'txn Transaction<'env>),
    /// Required to delete through the cursor
    Exclusive(&'txn mut Transaction<'env>),
}

impl<'env> TxnRef<'_, 'env> {
    fn get(&self) -> &Transaction<'env> {
        match self {
            TxnRef::Shared(txn) => txn,
            TxnRef::Exclusive(txn) => txn,
        }
    }
}

/// Database cursor
///
/// Keeps the path from the root to its current leaf entry as a stack of
/// (page, index) frames. Pages carry no sibling links, so moving between
/// leaves walks up the stack and back down.
pub struct Cursor<'txn, 'env> {
    /// The transaction this cursor belongs to
    txn: TxnRef<'txn, 'env>,
    /// The tree this cursor walks
    tree: Tree,
    /// Frames from the root down to the current leaf
    stack: Vec<Frame>,
    /// Cursor state flags
    flags: CursorFlags,
}

impl<'txn, 'env> Cursor<'txn, 'env> {
    /// Create a new read cursor
    pub fn open(txn: &'txn Transaction<'env>) -> Result<Self> {
        Ok(Self::over(TxnRef::Shared(txn), Tree::Main))
    }

    /// Create a cursor that may delete entries; needs a write transaction
    pub fn open_rw(txn: &'txn mut Transaction<'env>) -> Result<Self> {
        if txn.is_readonly() {
            return Err(Error::TxnReadOnly);
        }
        Ok(Self::over(TxnRef::Exclusive(txn), Tree::Main))
    }

    /// Read cursor over another tree of the file
    pub(crate) fn with_tree(txn: &'txn Transaction<'env>, tree: Tree) -> Self {
        Self::over(TxnRef::Shared(txn), tree)
    }

    fn over(txn: TxnRef<'txn, 'env>, tree: Tree) -> Self {
        Cursor {
            txn,
            tree,
            stack: Vec::with_capacity(MAX_DEPTH),
            flags: CursorFlags::empty(),
        }
    }

    /// Close the cursor. Dropping it does the same.
    pub fn close(self) {}

    /// Position the cursor and return the entry it lands on.
    ///
    /// `key` is required by `Set` and `SetRange` and ignored otherwise.
    /// Returns `None` when there is no such entry.
    pub fn get(&mut self, op: CursorOp, key: Option<&[u8]>) -> Result<Option<(&[u8], &[u8])>> {
        let positioned = match op {
            CursorOp::First => self.seek_first()?,
            CursorOp::Last => self.seek_last()?,
            CursorOp::Next => self.move_next()?,
            CursorOp::Prev => self.move_prev()?,
            CursorOp::Set => self.seek(key.ok_or(Error::BadValSize)?, true)?,
            CursorOp::SetRange => self.seek(key.ok_or(Error::BadValSize)?, false)?,
            CursorOp::GetCurrent => self.is_positioned()?,
        };
        if !positioned {
            return Ok(None);
        }
        self.current_entry().map(Some)
    }

    /// Position at first key/data item
    pub fn first(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        self.get(CursorOp::First, None)
    }

    /// Position at last key/data item
    pub fn last(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        self.get(CursorOp::Last, None)
    }

    /// Position at next data item
    pub fn next(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        self.get(CursorOp::Next, None)
    }

    /// Position at previous data item
    pub fn prev(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        self.get(CursorOp::Prev, None)
    }

    /// Position at specified key
    pub fn set(&mut self, key: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
        self.get(CursorOp::Set, Some(key))
    }

    /// Position at the first key greater than or equal to `key`
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
        self.get(CursorOp::SetRange, Some(key))
    }

    /// Entry at the current position
    pub fn current(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        self.get(CursorOp::GetCurrent, None)
    }

    /// Delete current key/data pair
    ///
    /// The cursor moves onto the following entry, which the next `Next`
    /// returns; `Prev` returns the entry before the deleted one.
    pub fn del(&mut self) -> Result<()> {
        if !self.is_positioned()? {
            return Err(Error::NotFound);
        }
        let key = self.current_entry()?.0.to_vec();
        let tree = self.tree;
        match &mut self.txn {
            TxnRef::Exclusive(txn) => txn.del_from(tree, &key)?,
            TxnRef::Shared(_) => return Err(Error::TxnReadOnly),
        }

        if self.seek(&key, false)? {
            self.flags |= CursorFlags::DELETED;
        } else if self.seek_last()? {
            self.flags |= CursorFlags::EOF;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.flags = CursorFlags::empty();
    }

    fn page_len(&self, pgno: Pgno) -> Result<usize> {
        Ok(self.txn.get().page(pgno)?.num_keys())
    }

    fn is_positioned(&self) -> Result<bool> {
        if !self.flags.contains(CursorFlags::INITIALIZED) {
            return Ok(false);
        }
        match self.stack.last() {
            Some(top) => Ok(top.index < self.page_len(top.pgno)?),
            None => Ok(false),
        }
    }

    fn current_entry(&self) -> Result<(&[u8], &[u8])> {
        let txn = self.txn.get();
        let top = self.stack.last().ok_or(Error::NotFound)?;
        let page = txn.page(top.pgno)?;
        if !page.is_leaf() || top.index >= page.num_keys() {
            return Err(Error::Corrupted);
        }
        let value = btree::leaf_value(txn, page, top.index)?;
        Ok((page.key(top.index), value))
    }

    /// Push frames from `pgno` down to a leaf, taking the first or the last
    /// entry of each page
    fn descend_edge(&mut self, mut pgno: Pgno, last: bool) -> Result<()> {
        loop {
            if self.stack.len() >= MAX_DEPTH {
                return Err(Error::Corrupted);
            }
            let (index, child) = {
                let page = self.txn.get().page(pgno)?;
                let n = page.num_keys();
                let index = if last { n.saturating_sub(1) } else { 0 };
                if page.is_leaf() {
                    (index, None)
                } else if page.is_branch() && n > 0 {
                    (index, Some(page.child(index)))
                } else {
                    return Err(Error::Corrupted);
                }
            };
            self.stack.push(Frame { pgno, index });
            match child {
                Some(child) => pgno = child,
                None => return Ok(()),
            }
        }
    }

    /// Replace the leaf frame with the edge of the neighbouring leaf. Returns
    /// false when there is none; the stack is then left partially unwound.
    fn step_leaf(&mut self, backwards: bool) -> Result<bool> {
        self.stack.pop();
        while let Some(frame) = self.stack.last().copied() {
            let next = if backwards {
                frame.index.checked_sub(1)
            } else {
                let n = self.page_len(frame.pgno)?;
                Some(frame.index + 1).filter(|&i| i < n)
            };
            match next {
                Some(index) => {
                    let child = self.txn.get().page(frame.pgno)?.child(index);
                    if let Some(top) = self.stack.last_mut() {
                        top.index = index;
                    }
                    self.descend_edge(child, backwards)?;
                    return Ok(true);
                }
                None => {
                    self.stack.pop();
                }
            }
        }
        Ok(false)
    }

    /// Make the top frame point at an entry, moving forward over empty leaves
    fn settle_forward(&mut self) -> Result<bool> {
        loop {
            let Some(top) = self.stack.last().copied() else {
                return Ok(false);
            };
            if top.index < self.page_len(top.pgno)? {
                return Ok(true);
            }
            if !self.step_leaf(false)? {
                return Ok(false);
            }
        }
    }

    /// Make the top frame point at an entry, moving backward over empty leaves
    fn settle_backward(&mut self) -> Result<bool> {
        loop {
            let Some(top) = self.stack.last().copied() else {
                return Ok(false);
            };
            if top.index < self.page_len(top.pgno)? {
                return Ok(true);
            }
            if !self.step_leaf(true)? {
                return Ok(false);
            }
        }
    }

    fn root(&self) -> Pgno {
        self.txn.get().root_of(self.tree)
    }

    fn seek_first(&mut self) -> Result<bool> {
        self.reset();
        let root = self.root();
        if root == NO_PAGE {
            return Ok(false);
        }
        self.descend_edge(root, false)?;
        self.flags |= CursorFlags::INITIALIZED;
        if self.settle_forward()? {
            return Ok(true);
        }
        self.reset();
        Ok(false)
    }

    fn seek_last(&mut self) -> Result<bool> {
        self.reset();
        let root = self.root();
        if root == NO_PAGE {
            return Ok(false);
        }
        self.descend_edge(root, true)?;
        self.flags |= CursorFlags::INITIALIZED;
        if self.settle_backward()? {
            return Ok(true);
        }
        self.reset();
        Ok(false)
    }

    /// Descend towards `key`. With `exact` only an equal key positions the
    /// cursor; otherwise it lands on the first key >= `key`.
    fn seek(&mut self, key: &[u8], exact: bool) -> Result<bool> {
        self.reset();
        let mut pgno = self.root();
        if pgno == NO_PAGE {
            return Ok(false);
        }
        loop {
            if self.stack.len() >= MAX_DEPTH {
                return Err(Error::Corrupted);
            }
            let (found, index, child) = {
                let page = self.txn.get().page(pgno)?;
                if page.is_leaf() {
                    let (found, index) = page.search(key);
                    (found, index, None)
                } else if page.is_branch() && page.num_keys() > 0 {
                    let index = page.child_index(key);
                    (false, index, Some(page.child(index)))
                } else {
                    return Err(Error::Corrupted);
                }
            };
            self.stack.push(Frame { pgno, index });
            match child {
                Some(child) => pgno = child,
                None if exact && !found => break,
                None => {
                    self.flags |= CursorFlags::INITIALIZED;
                    if self.settle_forward()? {
                        return Ok(true);
                    }
                    break;
                }
            }
        }
        self.reset();
        Ok(false)
    }

    fn move_next(&mut self) -> Result<bool> {
        if !self.flags.contains(CursorFlags::INITIALIZED) {
            return self.seek_first();
        }
        if self.flags.contains(CursorFlags::EOF) {
            return Ok(false);
        }
        if self.flags.contains(CursorFlags::BOF) {
            // Still on the first entry
            self.flags.remove(CursorFlags::BOF);
            return self.is_positioned();
        }
        if self.flags.contains(CursorFlags::DELETED) {
            // Already on the successor of the deleted entry
            self.flags.remove(CursorFlags::DELETED);
            return self.is_positioned();
        }

        let saved = self.stack.clone();
        if let Some(top) = self.stack.last_mut() {
            top.index += 1;
        }
        if self.settle_forward()? {
            return Ok(true);
        }
        self.stack = saved;
        self.flags |= CursorFlags::EOF;
        Ok(false)
    }

    fn move_prev(&mut self) -> Result<bool> {
        if !self.flags.contains(CursorFlags::INITIALIZED) {
            return self.seek_last();
        }
        if self.flags.contains(CursorFlags::BOF) {
            return Ok(false);
        }
        if self.flags.contains(CursorFlags::EOF) {
            // Still on the last entry
            self.flags.remove(CursorFlags::EOF);
            return self.is_positioned();
        }
        self.flags.remove(CursorFlags::DELETED);

        let saved = self.stack.clone();
        let at_leaf_start = match self.stack.last_mut() {
            Some(top) if top.index > 0 => {
                top.index -= 1;
                false
            }
            Some(_) => true,
            None => return Ok(false),
        };
        if !at_leaf_start || (self.step_leaf(true)? && self.settle_backward()?) {
            return Ok(true);
        }
        self.stack = saved;
        self.flags |= CursorFlags::BOF;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{EnvFlags, WriteFlags};
    use crate::env::Environment;
    use tempfile::tempdir;

    fn filled_env(dir: &tempfile::TempDir, count: usize) -> Environment {
        let mut env = Environment::new();
        env.open(dir.path().join("data"), EnvFlags::CREATE).unwrap();
        let mut txn = env.begin_txn().unwrap();
        for i in 0..count {
            let key = format!("k{:05}", i * 2);
            txn.put(key.as_bytes(), &[b'v'; 30], WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
        env
    }

    fn key_of(entry: Option<(&[u8], &[u8])>) -> Option<String> {
        entry.map(|(k, _)| String::from_utf8(k.to_vec()).unwrap())
    }

    #[test]
    fn test_walk_both_directions() {
        let dir = tempdir().unwrap();
        let env = filled_env(&dir, 600);
        let txn = env.begin_ro_txn().unwrap();
        let mut cursor = txn.cursor().unwrap();

        let mut forward = Vec::new();
        while let Some(key) = key_of(cursor.next().unwrap()) {
            forward.push(key);
        }
        assert_eq!(forward.len(), 600);
        assert!(forward.windows(2).all(|w| w[0] < w[1]));

        // Off the end: Next stays exhausted, Prev returns the last entry
        assert!(cursor.next().unwrap().is_none());
        assert_eq!(key_of(cursor.prev().unwrap()).unwrap(), forward[599]);

        let mut backward = vec![forward[599].clone()];
        while let Some(key) = key_of(cursor.prev().unwrap()) {
            backward.push(key);
        }
        backward.reverse();
        assert_eq!(backward, forward);
        assert_eq!(key_of(cursor.next().unwrap()).unwrap(), forward[0]);
    }

    #[test]
    fn test_set_and_set_range() {
        let dir = tempdir().unwrap();
        let env = filled_env(&dir, 300);
        let txn = env.begin_ro_txn().unwrap();
        let mut cursor = txn.cursor().unwrap();

        assert_eq!(key_of(cursor.set(b"k00100").unwrap()).unwrap(), "k00100");
        assert_eq!(key_of(cursor.next().unwrap()).unwrap(), "k00102");
        assert!(cursor.set(b"k00101").unwrap().is_none());
        assert_eq!(key_of(cursor.set_range(b"k00101").unwrap()).unwrap(), "k00102");
        assert_eq!(key_of(cursor.prev().unwrap()).unwrap(), "k00100");
        assert_eq!(key_of(cursor.current().unwrap()).unwrap(), "k00100");
        assert!(cursor.set_range(b"z").unwrap().is_none());
        assert_eq!(key_of(cursor.set_range(b"a").unwrap()).unwrap(), "k00000");
        assert!(matches!(cursor.get(CursorOp::Set, None), Err(Error::BadValSize)));
    }

    #[test]
    fn test_empty_tree() {
        let dir = tempdir().unwrap();
        let env = filled_env(&dir, 0);
        let txn = env.begin_ro_txn().unwrap();
        let mut cursor = txn.cursor().unwrap();
        assert!(cursor.first().unwrap().is_none());
        assert!(cursor.last().unwrap().is_none());
        assert!(cursor.next().unwrap().is_none());
        assert!(cursor.current().unwrap().is_none());
    }

    #[test]
    fn test_delete_while_iterating() {
        let dir = tempdir().unwrap();
        let env = filled_env(&dir, 500);
        let mut txn = env.begin_txn().unwrap();
        {
            let mut cursor = txn.cursor_mut().unwrap();
            let mut seen = 0;
            while let Some((key, _)) = cursor.next().unwrap() {
                let n: usize = std::str::from_utf8(&key[1..]).unwrap().parse().unwrap();
                seen += 1;
                if n % 4 == 0 {
                    cursor.del().unwrap();
                }
            }
            assert_eq!(seen, 500);
        }
        let mut cursor = txn.cursor().unwrap();
        let mut left = 0;
        while let Some((key, _)) = cursor.next().unwrap() {
            let n: usize = std::str::from_utf8(&key[1..]).unwrap().parse().unwrap();
            assert_ne!(n % 4, 0);
            left += 1;
        }
        assert_eq!(left, 250);
    }

    #[test]
    fn test_delete_last_entry_then_prev() {
        let dir = tempdir().unwrap();
        let env = filled_env(&dir, 10);
        let mut txn = env.begin_txn().unwrap();
        let mut cursor = txn.cursor_mut().unwrap();
        assert_eq!(key_of(cursor.last().unwrap()).unwrap(), "k00018");
        cursor.del().unwrap();
        assert!(cursor.next().unwrap().is_none());
        assert_eq!(key_of(cursor.prev().unwrap()).unwrap(), "k00016");
    }

    #[test]
    fn test_read_cursor_cannot_delete() {
        let dir = tempdir().unwrap();
        let env = filled_env(&dir, 3);
        let txn = env.begin_txn().unwrap();
        let mut cursor = txn.cursor().unwrap();
        cursor.first().unwrap();
        assert!(matches!(cursor.del(), Err(Error::TxnReadOnly)));
    }
}
