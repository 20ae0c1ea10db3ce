use log::trace;

use crate::constants::{PageFlags, Pgno, WriteFlags, MAX_DEPTH, MAX_KEY_SIZE, NO_PAGE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::page::{
    encode_big_value, encode_branch_node, encode_leaf_node, needs_overflow, node_key,
    overflow_page_count, LeafValue, Page, PAGE_HEADER_SIZE, SLOT_SIZE,
};
use crate::transaction::Transaction;
use crate::types::Stat;

/// Which tree of the data file an operation works on. Updates copy the
/// root-to-leaf path first, so the transaction's snapshot is never modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tree {
    /// User keys and values
    Main,
    /// Freed page lists keyed by big-endian txnid
    Free,
}

/// Position inside one page on a root-to-leaf path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) pgno: Pgno,
    pub(crate) index: usize,
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(Error::BadValSize);
    }
    Ok(())
}

/// Descend to the leaf that holds `key` or would hold it
pub(crate) fn find_leaf<'t>(txn: &'t Transaction<'_>, tree: Tree, key: &[u8]) -> Result<Option<Page<'t>>> {
    let mut pgno = txn.root_of(tree);
    if pgno == NO_PAGE {
        return Ok(None);
    }
    for _ in 0..MAX_DEPTH {
        let page = txn.page(pgno)?;
        if page.is_leaf() {
            return Ok(Some(page));
        }
        if !page.is_branch() || page.num_keys() == 0 {
            return Err(Error::Corrupted);
        }
        pgno = page.child(page.child_index(key));
    }
    Err(Error::Corrupted)
}

/// Page count of the overflow run starting at `pgno`, from its header
fn overflow_run(txn: &Transaction<'_>, pgno: Pgno) -> Result<usize> {
    let head = txn.page(pgno)?;
    if !head.is_overflow() {
        return Err(Error::Corrupted);
    }
    Ok(head.overflow_pages())
}

/// Value of leaf entry `index`, following an overflow reference
pub(crate) fn leaf_value<'t>(txn: &'t Transaction<'_>, page: Page<'t>, index: usize) -> Result<&'t [u8]> {
    match page.value(index) {
        LeafValue::Inline(value) => Ok(value),
        LeafValue::Overflow { pgno, size } => {
            // A run may be longer than its value needs after a shrinking overwrite
            let count = overflow_page_count(size);
            if overflow_run(txn, pgno)? < count {
                return Err(Error::Corrupted);
            }
            let span = txn.page_span(pgno, count)?;
            Ok(&span[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size])
        }
    }
}

pub(crate) fn get<'t>(txn: &'t Transaction<'_>, tree: Tree, key: &[u8]) -> Result<Option<&'t [u8]>> {
    let Some(page) = find_leaf(txn, tree, key)? else {
        return Ok(None);
    };
    match page.search(key) {
        (true, index) => leaf_value(txn, page, index).map(Some),
        (false, _) => Ok(None),
    }
}

fn contains(txn: &Transaction<'_>, tree: Tree, key: &[u8]) -> Result<bool> {
    Ok(match find_leaf(txn, tree, key)? {
        Some(page) => page.search(key).0,
        None => false,
    })
}

/// Copy every page from the root to the leaf for `key`, rewriting each
/// parent's child pointer to the copy. Returns the branch frames (index =
/// child taken) and the writable leaf.
fn touch_path(txn: &mut Transaction<'_>, tree: Tree, key: &[u8]) -> Result<(Vec<Frame>, Pgno)> {
    let mut pgno = txn.touch(txn.root_of(tree))?;
    txn.set_root(tree, pgno);
    let mut path = Vec::new();
    loop {
        let (index, child) = {
            let page = txn.page(pgno)?;
            if page.is_leaf() {
                return Ok((path, pgno));
            }
            if !page.is_branch() || page.num_keys() == 0 {
                return Err(Error::Corrupted);
            }
            let index = page.child_index(key);
            (index, page.child(index))
        };
        if path.len() + 1 >= MAX_DEPTH {
            return Err(Error::Corrupted);
        }
        let copy = txn.touch(child)?;
        if copy != child {
            txn.page_mut(pgno)?.set_child(index, copy);
        }
        path.push(Frame { pgno, index });
        pgno = copy;
    }
}

/// Encode a leaf node, moving the value to an overflow run when it is too
/// large to keep inline
fn leaf_node(txn: &mut Transaction<'_>, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    if needs_overflow(key.len(), value.len()) {
        let pgno = txn.alloc_overflow(value)?;
        Ok(encode_leaf_node(key, &encode_big_value(pgno, value.len()), true))
    } else {
        Ok(encode_leaf_node(key, value, false))
    }
}

/// Free the overflow run behind leaf entry `index`, if any
fn release_value(txn: &mut Transaction<'_>, leaf: Pgno, index: usize) -> Result<()> {
    if let LeafValue::Overflow { pgno, .. } = txn.page(leaf)?.value(index) {
        let count = overflow_run(txn, pgno)?;
        txn.free_run(pgno, count)?;
    }
    Ok(())
}

enum InPlace {
    Inline,
    Overflow(Pgno),
    No,
}

/// Overwrite leaf entry `index` without changing its node size. An overflow
/// run this transaction owns is rewritten in place when the new value fits
/// in it. Returns false when the entry has to be rebuilt instead.
fn overwrite_in_place(txn: &mut Transaction<'_>, leaf: Pgno, index: usize, key: &[u8], value: &[u8]) -> Result<bool> {
    let plan = match txn.page(leaf)?.value(index) {
        LeafValue::Inline(old) if old.len() == value.len() => InPlace::Inline,
        LeafValue::Overflow { pgno, .. }
            if needs_overflow(key.len(), value.len())
                && txn.owns_page(pgno)
                && overflow_page_count(value.len()) <= overflow_run(txn, pgno)? =>
        {
            InPlace::Overflow(pgno)
        }
        _ => InPlace::No,
    };
    match plan {
        InPlace::Inline => {
            txn.page_mut(leaf)?.value_mut(index).copy_from_slice(value);
        }
        InPlace::Overflow(pgno) => {
            let run = txn.page_bytes_mut(pgno)?;
            run[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + value.len()].copy_from_slice(value);
            run[PAGE_HEADER_SIZE + value.len()..].fill(0);
            txn.page_mut(leaf)?
                .value_mut(index)
                .copy_from_slice(&encode_big_value(pgno, value.len()));
        }
        InPlace::No => return Ok(false),
    }
    Ok(true)
}

/// Insert or replace `key`
pub(crate) fn put(txn: &mut Transaction<'_>, tree: Tree, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
    check_key(key)?;
    if txn.root_of(tree) == NO_PAGE {
        let leaf = txn.alloc_page(PageFlags::LEAF)?;
        let node = leaf_node(txn, key, value)?;
        txn.page_mut(leaf)?.insert_raw(0, &node)?;
        txn.set_root(tree, leaf);
        return Ok(());
    }
    if flags.contains(WriteFlags::NOOVERWRITE) && contains(txn, tree, key)? {
        return Err(Error::KeyExist);
    }

    let (path, leaf) = touch_path(txn, tree, key)?;
    let (found, index) = txn.page(leaf)?.search(key);
    if found {
        if overwrite_in_place(txn, leaf, index, key, value)? {
            return Ok(());
        }
        release_value(txn, leaf, index)?;
        txn.page_mut(leaf)?.delete(index);
    }
    let node = leaf_node(txn, key, value)?;
    insert_node(txn, tree, path, leaf, index, node)
}

/// Insert `node` at `index` of `pgno`, splitting pages up the path as long
/// as they overflow
fn insert_node(
    txn: &mut Transaction<'_>,
    tree: Tree,
    mut path: Vec<Frame>,
    mut pgno: Pgno,
    mut index: usize,
    mut node: Vec<u8>,
) -> Result<()> {
    loop {
        match txn.page_mut(pgno)?.insert_raw(index, &node) {
            Ok(()) => return Ok(()),
            Err(Error::PageFull) => {}
            Err(e) => return Err(e),
        }

        let (right, divider) = split(txn, pgno, index, &node)?;
        node = encode_branch_node(right, &divider);
        match path.pop() {
            Some(parent) => {
                pgno = parent.pgno;
                index = parent.index + 1;
            }
            None => {
                let root = txn.alloc_page(PageFlags::BRANCH)?;
                let mut page = txn.page_mut(root)?;
                page.insert_branch(0, &[], pgno)?;
                page.insert_raw(1, &node)?;
                txn.set_root(tree, root);
                trace!("new root {} over {} and {}", root, pgno, right);
                return Ok(());
            }
        }
    }
}

/// Split `pgno` while inserting `node` at `index`. The lower half stays in
/// place and the upper half moves to a new page, returned with the key
/// that separates the two.
///
/// For branch pages the separating entry becomes the first entry of the
/// new page, keeping its child.
fn split(txn: &mut Transaction<'_>, pgno: Pgno, index: usize, node: &[u8]) -> Result<(Pgno, Vec<u8>)> {
    let (flags, mut nodes) = {
        let page = txn.page(pgno)?;
        let nodes = (0..page.num_keys())
            .map(|i| page.node(i).to_vec())
            .collect::<Vec<_>>();
        (page.flags(), nodes)
    };
    nodes.insert(index, node.to_vec());
    let at = split_point(&nodes);

    let right = txn.alloc_page(flags)?;
    {
        let mut left = txn.page_mut(pgno)?;
        left.reset();
        for entry in &nodes[..at] {
            left.push_raw(entry)?;
        }
    }
    {
        let mut page = txn.page_mut(right)?;
        for entry in &nodes[at..] {
            page.push_raw(entry)?;
        }
    }

    let divider = node_key(&nodes[at], flags.contains(PageFlags::LEAF)).to_vec();
    trace!(
        "split page {} at {} of {}: {} entries moved to {}",
        pgno,
        at,
        nodes.len(),
        nodes.len() - at,
        right
    );
    Ok((right, divider))
}

/// Index of the first node of the right half. The entry-count median when
/// both halves fit, else the first point where the left half holds at least
/// half the bytes.
fn split_point(nodes: &[Vec<u8>]) -> usize {
    let usable = PAGE_SIZE - PAGE_HEADER_SIZE;
    let cost = |node: &Vec<u8>| node.len() + SLOT_SIZE;
    let total: usize = nodes.iter().map(cost).sum();

    let median = nodes.len() / 2;
    let left: usize = nodes[..median].iter().map(cost).sum();
    if median > 0 && left <= usable && total - left <= usable {
        return median;
    }

    let mut acc = 0;
    for (i, node) in nodes.iter().enumerate() {
        acc += cost(node);
        if acc * 2 >= total {
            return (i + 1).clamp(1, nodes.len() - 1);
        }
    }
    nodes.len() - 1
}

/// Delete `key`. Fails with `NotFound` before touching any page when the
/// key is absent.
pub(crate) fn del(txn: &mut Transaction<'_>, tree: Tree, key: &[u8]) -> Result<()> {
    check_key(key).map_err(|_| Error::NotFound)?;
    if !contains(txn, tree, key)? {
        return Err(Error::NotFound);
    }

    let (path, leaf) = touch_path(txn, tree, key)?;
    let (found, index) = txn.page(leaf)?.search(key);
    if !found {
        return Err(Error::Corrupted);
    }
    release_value(txn, leaf, index)?;
    txn.page_mut(leaf)?.delete(index);
    prune(txn, tree, path, leaf)
}

/// Unlink pages a delete left empty, then collapse branch roots that are
/// down to a single child. Pages are never merged with their siblings.
fn prune(txn: &mut Transaction<'_>, tree: Tree, mut path: Vec<Frame>, mut pgno: Pgno) -> Result<()> {
    while txn.page(pgno)?.num_keys() == 0 {
        txn.free_page(pgno)?;
        match path.pop() {
            Some(parent) => {
                txn.page_mut(parent.pgno)?.delete(parent.index);
                pgno = parent.pgno;
            }
            None => {
                txn.set_root(tree, NO_PAGE);
                return Ok(());
            }
        }
    }

    loop {
        let root = txn.root_of(tree);
        let only_child = {
            let page = txn.page(root)?;
            (page.is_branch() && page.num_keys() == 1).then(|| page.child(0))
        };
        match only_child {
            Some(child) => {
                txn.free_page(root)?;
                txn.set_root(tree, child);
                trace!("root {} collapsed into {}", root, child);
            }
            None => return Ok(()),
        }
    }
}

/// Walk the whole tree, counting pages and entries
pub(crate) fn stat(txn: &Transaction<'_>, tree: Tree) -> Result<Stat> {
    let mut stat = Stat {
        psize: PAGE_SIZE as u32,
        ..Stat::default()
    };
    let root = txn.root_of(tree);
    if root == NO_PAGE {
        return Ok(stat);
    }

    let mut stack = vec![(root, 1u32)];
    while let Some((pgno, depth)) = stack.pop() {
        if depth as usize > MAX_DEPTH {
            return Err(Error::Corrupted);
        }
        stat.depth = stat.depth.max(depth);
        let page = txn.page(pgno)?;
        let n = page.num_keys();
        if page.is_branch() {
            stat.branch_pages += 1;
            stack.extend((0..n).map(|i| (page.child(i), depth + 1)));
        } else if page.is_leaf() {
            stat.leaf_pages += 1;
            stat.entries += n;
            for i in 0..n {
                if let LeafValue::Overflow { pgno, .. } = page.value(i) {
                    stat.overflow_pages += overflow_run(txn, pgno)?;
                }
            }
        } else {
            return Err(Error::Corrupted);
        }
    }
    Ok(stat)
}
