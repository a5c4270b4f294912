//! Staged tree-item transaction.
//!
//! All tree mutations of a relocation pass accumulate in a `TreeOverlay`
//! over the real [`TreeStore`](crate::TreeStore) and reach it only on
//! [`commit`](TreeOverlay::commit). Dropping the overlay discards the
//! staged state, which is the whole rollback story for tree items: the
//! base store is never touched mid-pass.
//!
//! Reads during the pass observe the merged view: staged deletions hide
//! base items, staged insertions interleave in key order.

use crate::{TreeItem, TreeStore};
use cbfs_error::{BalanceError, Result};
use cbfs_types::{ItemKey, TreeId};
use std::collections::BTreeMap;

/// `Some(data)` = staged insert/replace, `None` = staged delete.
type StagedOp = Option<Vec<u8>>;

pub struct TreeOverlay<'a> {
    base: &'a mut dyn TreeStore,
    staged: BTreeMap<(TreeId, ItemKey), StagedOp>,
}

impl<'a> TreeOverlay<'a> {
    pub fn new(base: &'a mut dyn TreeStore) -> Self {
        Self {
            base,
            staged: BTreeMap::new(),
        }
    }

    /// Exact-key lookup in the merged view.
    pub fn get(&self, tree: TreeId, key: ItemKey) -> Result<Option<TreeItem>> {
        if let Some(op) = self.staged.get(&(tree, key)) {
            return Ok(op.as_ref().map(|data| TreeItem {
                key,
                data: data.clone(),
            }));
        }
        match self.base.find(tree, key)? {
            Some(item) if item.key == key => Ok(Some(item)),
            _ => Ok(None),
        }
    }

    /// First item with key at or above `key`, in the merged view.
    pub fn find(&self, tree: TreeId, key: ItemKey) -> Result<Option<TreeItem>> {
        let base = self.base_unshadowed(tree, self.base.find(tree, key)?)?;
        let staged = self.staged_at_or_above(tree, key, true);
        Ok(Self::min_candidate(base, staged))
    }

    /// First item with key strictly above `key`, in the merged view.
    pub fn next(&self, tree: TreeId, key: ItemKey) -> Result<Option<TreeItem>> {
        let base = self.base_unshadowed(tree, self.base.next(tree, key)?)?;
        let staged = self.staged_at_or_above(tree, key, false);
        Ok(Self::min_candidate(base, staged))
    }

    /// Stage an insert. The key must not be visible in the merged view.
    pub fn insert(&mut self, tree: TreeId, key: ItemKey, data: Vec<u8>) -> Result<()> {
        if self.get(tree, key)?.is_some() {
            return Err(BalanceError::storage(format!(
                "insert of existing item {key} in tree {tree}"
            )));
        }
        self.staged.insert((tree, key), Some(data));
        Ok(())
    }

    /// Stage a delete. The key must be visible in the merged view.
    pub fn delete(&mut self, tree: TreeId, key: ItemKey) -> Result<()> {
        if self.get(tree, key)?.is_none() {
            return Err(BalanceError::not_found(format!(
                "delete of missing item {key} in tree {tree}"
            )));
        }
        let base_has = matches!(self.base.find(tree, key)?, Some(item) if item.key == key);
        if base_has {
            self.staged.insert((tree, key), None);
        } else {
            // Staged-only insert being retracted.
            self.staged.remove(&(tree, key));
        }
        Ok(())
    }

    /// Apply every staged operation to the base store.
    pub fn commit(self) -> Result<()> {
        for ((tree, key), op) in self.staged {
            match op {
                Some(data) => self.base.insert(tree, key, data)?,
                None => self.base.delete(tree, key)?,
            }
        }
        Ok(())
    }

    /// Number of staged operations (diagnostics).
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Advance past base items that a staged operation shadows.
    fn base_unshadowed(
        &self,
        tree: TreeId,
        mut cur: Option<TreeItem>,
    ) -> Result<Option<TreeItem>> {
        while let Some(item) = cur {
            if !self.staged.contains_key(&(tree, item.key)) {
                return Ok(Some(item));
            }
            cur = self.base.next(tree, item.key)?;
        }
        Ok(None)
    }

    fn staged_at_or_above(&self, tree: TreeId, key: ItemKey, inclusive: bool) -> Option<TreeItem> {
        self.staged
            .range((tree, key)..)
            .take_while(|((t, _), _)| *t == tree)
            .filter(|((_, k), _)| inclusive || *k > key)
            .find_map(|((_, k), op)| {
                op.as_ref().map(|data| TreeItem {
                    key: *k,
                    data: data.clone(),
                })
            })
    }

    fn min_candidate(base: Option<TreeItem>, staged: Option<TreeItem>) -> Option<TreeItem> {
        match (base, staged) {
            (Some(b), Some(s)) => Some(if s.key <= b.key { s } else { b }),
            (b, s) => b.or(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTreeStore;

    const TREE: TreeId = TreeId(2);

    fn key(objectid: u64) -> ItemKey {
        ItemKey::new(objectid, 1, 0)
    }

    fn seeded() -> MemoryTreeStore {
        let mut store = MemoryTreeStore::new();
        store.insert(TREE, key(10), vec![10]).unwrap();
        store.insert(TREE, key(20), vec![20]).unwrap();
        store.insert(TREE, key(30), vec![30]).unwrap();
        store
    }

    #[test]
    fn staged_delete_hides_base_item() {
        let mut store = seeded();
        let mut overlay = TreeOverlay::new(&mut store);
        overlay.delete(TREE, key(20)).unwrap();

        assert!(overlay.get(TREE, key(20)).unwrap().is_none());
        let found = overlay.find(TREE, key(15)).unwrap().unwrap();
        assert_eq!(found.key, key(30));
        let next = overlay.next(TREE, key(10)).unwrap().unwrap();
        assert_eq!(next.key, key(30));
    }

    #[test]
    fn staged_insert_interleaves_in_key_order() {
        let mut store = seeded();
        let mut overlay = TreeOverlay::new(&mut store);
        overlay.insert(TREE, key(15), vec![15]).unwrap();

        let found = overlay.find(TREE, key(11)).unwrap().unwrap();
        assert_eq!(found.key, key(15));
        let next = overlay.next(TREE, key(15)).unwrap().unwrap();
        assert_eq!(next.key, key(20));
    }

    #[test]
    fn insert_duplicate_is_rejected() {
        let mut store = seeded();
        let mut overlay = TreeOverlay::new(&mut store);
        assert!(overlay.insert(TREE, key(20), vec![0]).is_err());
        overlay.delete(TREE, key(20)).unwrap();
        overlay.insert(TREE, key(20), vec![99]).unwrap();
        assert_eq!(overlay.get(TREE, key(20)).unwrap().unwrap().data, vec![99]);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let mut store = seeded();
        let mut overlay = TreeOverlay::new(&mut store);
        assert!(matches!(
            overlay.delete(TREE, key(99)),
            Err(BalanceError::NotFound(_))
        ));
    }

    #[test]
    fn drop_discards_staged_state() {
        let mut store = seeded();
        {
            let mut overlay = TreeOverlay::new(&mut store);
            overlay.delete(TREE, key(10)).unwrap();
            overlay.insert(TREE, key(40), vec![40]).unwrap();
        }
        assert!(store.find(TREE, key(10)).unwrap().is_some());
        let found = store.find(TREE, key(40)).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn commit_applies_exactly_staged_state() {
        let mut store = seeded();
        let mut overlay = TreeOverlay::new(&mut store);
        overlay.delete(TREE, key(10)).unwrap();
        overlay.insert(TREE, key(40), vec![40]).unwrap();
        // Replace an item wholesale: delete + insert under the same key.
        overlay.delete(TREE, key(30)).unwrap();
        overlay.insert(TREE, key(30), vec![33]).unwrap();
        overlay.commit().unwrap();

        assert!(store.find(TREE, key(10)).unwrap().map(|i| i.key) != Some(key(10)));
        assert_eq!(store.find(TREE, key(40)).unwrap().unwrap().data, vec![40]);
        assert_eq!(store.find(TREE, key(30)).unwrap().unwrap().data, vec![33]);
    }

    #[test]
    fn staged_only_insert_then_delete_is_a_noop() {
        let mut store = seeded();
        let mut overlay = TreeOverlay::new(&mut store);
        overlay.insert(TREE, key(25), vec![25]).unwrap();
        overlay.delete(TREE, key(25)).unwrap();
        assert_eq!(overlay.staged_len(), 0);
        overlay.commit().unwrap();
        assert!(store.find(TREE, key(25)).unwrap().map(|i| i.key) != Some(key(25)));
    }
}
