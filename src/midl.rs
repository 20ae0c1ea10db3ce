use crate::constants::Pgno;
use crate::error::{Error, Result};

/// ID List - a sorted array of page numbers in descending order.
///
/// The smallest page number sits at the end, so handing out pages pops the
/// low end of the file first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Idl {
    ids: Vec<Pgno>,
}

impl Idl {
    /// Build from any order; duplicates collapse
    pub(crate) fn from_unsorted(mut ids: Vec<Pgno>) -> Self {
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.dedup();
        Idl { ids }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Binary search for an ID.
    /// Returns Ok(position) when present, Err(insertion point) otherwise.
    fn search(&self, id: Pgno) -> std::result::Result<usize, usize> {
        self.ids.binary_search_by(|other| other.cmp(&id).reverse())
    }

    /// Insert keeping order. Returns false if the id was already present.
    pub(crate) fn insert(&mut self, id: Pgno) -> bool {
        match self.search(id) {
            Ok(_) => false,
            Err(pos) => {
                self.ids.insert(pos, id);
                true
            }
        }
    }

    /// Merge another list in
    pub(crate) fn append_list(&mut self, other: &Idl) {
        self.ids.extend_from_slice(&other.ids);
        self.ids.sort_unstable_by(|a, b| b.cmp(a));
        self.ids.dedup();
    }

    /// Take the smallest id
    pub(crate) fn pop(&mut self) -> Option<Pgno> {
        self.ids.pop()
    }

    /// Take the lowest run of `count` consecutive ids, returning its first id
    pub(crate) fn take_run(&mut self, count: usize) -> Option<Pgno> {
        if count == 0 || count > self.ids.len() {
            return None;
        }
        if count == 1 {
            return self.pop();
        }
        for j in (0..=self.ids.len() - count).rev() {
            let (high, low) = (self.ids[j], self.ids[j + count - 1]);
            if high - low == (count - 1) as Pgno {
                self.ids.drain(j..j + count);
                return Some(low);
            }
        }
        None
    }

    /// Ascending copy
    pub(crate) fn to_ascending(&self) -> Vec<Pgno> {
        self.ids.iter().rev().copied().collect()
    }

    /// Serialize as ascending little-endian u64s
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.ids.len() * 8);
        for id in self.ids.iter().rev() {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() % 8 != 0 {
            return Err(Error::Corrupted);
        }
        let ids = buf
            .chunks_exact(8)
            .map(|chunk| {
                let mut b = [0u8; 8];
                b.copy_from_slice(chunk);
                Pgno::from_le_bytes(b)
            })
            .collect::<Vec<_>>();
        let idl = Idl::from_unsorted(ids);
        if idl.len() * 8 != buf.len() {
            return Err(Error::Corrupted);
        }
        Ok(idl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_smallest_first() {
        let mut idl = Idl::from_unsorted(vec![9, 3, 7, 3]);
        assert_eq!(idl.len(), 3);
        assert_eq!(idl.pop(), Some(3));
        assert_eq!(idl.pop(), Some(7));
        assert_eq!(idl.pop(), Some(9));
        assert_eq!(idl.pop(), None);
    }

    #[test]
    fn test_insert_skips_duplicates() {
        let mut idl = Idl::default();
        assert!(idl.insert(5));
        assert!(idl.insert(2));
        assert!(!idl.insert(5));
        assert_eq!(idl.to_ascending(), vec![2, 5]);
    }

    #[test]
    fn test_take_run() {
        let mut idl = Idl::from_unsorted(vec![2, 4, 5, 6, 10, 11, 12, 13]);
        assert_eq!(idl.take_run(3), Some(4));
        assert_eq!(idl.to_ascending(), vec![2, 10, 11, 12, 13]);
        assert_eq!(idl.take_run(5), None);
        assert_eq!(idl.take_run(4), Some(10));
        assert_eq!(idl.to_ascending(), vec![2]);
    }

    #[test]
    fn test_encode_decode() {
        let idl = Idl::from_unsorted(vec![8, 3, 100]);
        let buf = idl.encode();
        assert_eq!(buf.len(), 24);
        assert_eq!(Idl::decode(&buf).unwrap(), idl);
        assert!(matches!(Idl::decode(&buf[..7]), Err(Error::Corrupted)));
    }
}
