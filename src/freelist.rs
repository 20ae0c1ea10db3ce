use log::debug;

use crate::btree::{self, Tree};
use crate::constants::{Pgno, Txnid, WriteFlags};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::midl::Idl;
use crate::transaction::{Transaction, WriteState};

/// Free DB key: the committing txnid, big-endian so byte order matches
/// numeric order. Values are the freed page numbers as ascending LE u64s.
fn entry_key(txnid: Txnid) -> [u8; 8] {
    txnid.to_be_bytes()
}

fn decode_key(key: &[u8]) -> Result<Txnid> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| Error::Corrupted)?;
    Ok(Txnid::from_be_bytes(bytes))
}

/// Entries older than this may be reused: the oldest registered reader's
/// snapshot, or the writer's own txnid when nobody is reading
fn low_water(txn: &Transaction<'_>) -> Result<Txnid> {
    let oldest = txn.env().inner()?.readers.oldest();
    Ok(if oldest == 0 {
        txn.id()
    } else {
        oldest.min(txn.id())
    })
}

/// Move the next reusable Free DB entry into the pool. Returns false when
/// no remaining entry may be reused yet.
pub(crate) fn reclaim_next(txn: &mut Transaction<'_>) -> Result<bool> {
    let limit = low_water(txn)?;
    let start = txn.write_state()?.reclaimed.last().map_or(0, |&t| t + 1);

    let found = {
        let mut cursor = Cursor::with_tree(txn, Tree::Free);
        match cursor.set_range(&entry_key(start))? {
            Some((key, value)) => Some((decode_key(key)?, Idl::decode(value)?)),
            None => None,
        }
    };

    let write = txn.write_state_mut()?;
    match found {
        Some((txnid, pages)) if txnid < limit => {
            debug!("reclaiming {} pages freed by txn {}", pages.len(), txnid);
            write.pool.append_list(&pages);
            write.reclaimed.push(txnid);
            Ok(true)
        }
        _ => {
            write.reclaim_done = true;
            Ok(false)
        }
    }
}

fn pending(write: &WriteState) -> Idl {
    let mut pages = write.freed.clone();
    pages.append_list(&write.pool);
    pages
}

/// Rewrites of the commit's entry allowed to draw on the pool before
/// allocation falls back to the end of the file
const POOLED_REWRITES: usize = 4;

/// Record the commit's freed pages in the Free DB.
///
/// Entries drained into the pool are deleted first; those deletes may still
/// pull more entries in. The commit's entry is then rewritten until it stops
/// changing, since updating the Free DB copies its own pages and may take
/// pages out of the pool. Once pooled allocation is frozen the set only
/// grows, so the loop ends.
pub(crate) fn save(txn: &mut Transaction<'_>) -> Result<()> {
    let mut next = 0;
    loop {
        let Some(&txnid) = txn.write_state()?.reclaimed.get(next) else {
            break;
        };
        btree::del(txn, Tree::Free, &entry_key(txnid))?;
        next += 1;
    }
    txn.write_state_mut()?.reclaim_done = true;

    let key = entry_key(txn.id());
    let mut written: Option<Idl> = None;
    let mut rewrites = 0;
    loop {
        let pages = pending(txn.write_state()?);
        if written.as_ref() == Some(&pages) {
            break;
        }
        if rewrites == POOLED_REWRITES {
            txn.write_state_mut()?.reclaim_frozen = true;
        }
        rewrites += 1;
        if pages.is_empty() {
            if written.is_none() {
                break;
            }
            // The pool went into the Free DB itself; drop the stale entry
            btree::del(txn, Tree::Free, &key)?;
            written = None;
            continue;
        }
        btree::put(txn, Tree::Free, &key, &pages.encode(), WriteFlags::empty())?;
        written = Some(pages);
    }

    if let Some(pages) = written {
        debug!(
            "txn {} freed {} pages, reused {} entries",
            txn.id(),
            pages.len(),
            next
        );
    }
    Ok(())
}

/// Every Free DB entry in txnid order
pub(crate) fn entries(txn: &Transaction<'_>) -> Result<Vec<(Txnid, Vec<Pgno>)>> {
    let mut cursor = Cursor::with_tree(txn, Tree::Free);
    let mut out = Vec::new();
    let mut entry = cursor.first()?;
    while let Some((key, value)) = entry {
        out.push((decode_key(key)?, Idl::decode(value)?.to_ascending()));
        entry = cursor.next()?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::EnvFlags;
    use crate::env::Environment;
    use tempfile::tempdir;

    fn open_env(dir: &tempfile::TempDir) -> Environment {
        let mut env = Environment::new();
        env.open(dir.path().join("data"), EnvFlags::CREATE).unwrap();
        env
    }

    fn put_all(env: &Environment, range: std::ops::Range<usize>) {
        let mut txn = env.begin_txn().unwrap();
        for i in range {
            txn.put(format!("key{:04}", i).as_bytes(), &[1u8; 64], WriteFlags::empty())
                .unwrap();
        }
        txn.commit().unwrap();
    }

    #[test]
    fn test_keys_sort_numerically() {
        assert!(entry_key(255) < entry_key(256));
        assert_eq!(decode_key(&entry_key(0x0102_0304)).unwrap(), 0x0102_0304);
        assert!(matches!(decode_key(b"short"), Err(Error::Corrupted)));
    }

    #[test]
    fn test_entry_per_commit() {
        let dir = tempdir().unwrap();
        let env = open_env(&dir);
        put_all(&env, 0..200);
        // First commit replaced nothing that was on disk
        assert!(env.begin_ro_txn().unwrap().free_list().unwrap().is_empty());

        put_all(&env, 200..210);
        let txn = env.begin_ro_txn().unwrap();
        let list = txn.free_list().unwrap();
        assert_eq!(list.len(), 1);
        let (txnid, pages) = &list[0];
        assert_eq!(*txnid, txn.id());
        assert!(!pages.is_empty());
        assert!(pages.windows(2).all(|w| w[0] < w[1]));
        assert!(pages.iter().all(|&p| p > 1));
    }

    #[test]
    fn test_reclaim_waits_for_readers() {
        let dir = tempdir().unwrap();
        let env = open_env(&dir);
        put_all(&env, 0..200);
        put_all(&env, 0..200);

        let reader = env.begin_ro_txn().unwrap();
        let mut txn = env.begin_txn().unwrap();
        // The only entry was written by the reader's own snapshot
        assert!(!reclaim_next(&mut txn).unwrap());
        txn.abort();
        reader.abort();

        let mut txn = env.begin_txn().unwrap();
        assert!(reclaim_next(&mut txn).unwrap());
        assert!(!txn.write_state().unwrap().pool.is_empty());
        assert!(!reclaim_next(&mut txn).unwrap());
    }
}
