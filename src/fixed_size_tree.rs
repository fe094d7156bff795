//! B+tree with `i64` keys and values of one fixed size.
//!
//! Page layout after the common header: leaves hold `key i64, value` slots,
//! branches hold `key i64, child u64` slots. Entry counts are in the header.
//! As in variable-size trees, the key of the first branch slot is never
//! compared.

use crate::constants::{page_body_size, PageFlags, PAGE_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::meta::{get_u64, TreeRootHeader};
use crate::page::PageHeader;
use crate::transaction::Transaction;
use crate::tree::{PageChanges, TreeName};
use crate::types::TreeStats;

const MAX_DEPTH: usize = 64;

/// Decoded fixed-size page. Branch slots carry the child page as 8 bytes.
#[derive(Debug, Clone)]
struct FixedPage {
    page_number: u64,
    is_leaf: bool,
    entries: Vec<(i64, Vec<u8>)>,
}

impl FixedPage {
    fn new(page_number: u64, is_leaf: bool) -> Self {
        FixedPage {
            page_number,
            is_leaf,
            entries: Vec::new(),
        }
    }

    fn decode(page: &[u8], value_size: usize) -> Result<Self> {
        let header = PageHeader::decode(page)?;
        if !header.flags.contains(PageFlags::FIXED_SIZE) {
            return Err(Error::corrupted(format!(
                "page {} is not a fixed-size tree page",
                header.page_number
            )));
        }
        let is_leaf = header.flags.contains(PageFlags::LEAF);
        let slot = if is_leaf { value_size } else { 8 };
        let mut entries = Vec::with_capacity(header.entry_count as usize);
        let mut at = PAGE_HEADER_SIZE;
        for _ in 0..header.entry_count {
            let key = get_u64(page, at)? as i64;
            let value = page
                .get(at + 8..at + 8 + slot)
                .ok_or_else(|| Error::corrupted("fixed-size slot is out of bounds"))?
                .to_vec();
            entries.push((key, value));
            at += 8 + slot;
        }
        Ok(FixedPage {
            page_number: header.page_number,
            is_leaf,
            entries,
        })
    }

    fn encode(&self, page_size: usize) -> Vec<u8> {
        let flags = PageFlags::FIXED_SIZE
            | if self.is_leaf {
                PageFlags::LEAF
            } else {
                PageFlags::BRANCH
            };
        let mut header = PageHeader::new(self.page_number, flags);
        header.entry_count = self.entries.len() as u16;
        let mut page = vec![0u8; page_size];
        let mut at = PAGE_HEADER_SIZE;
        for (key, value) in &self.entries {
            page[at..at + 8].copy_from_slice(&key.to_le_bytes());
            page[at + 8..at + 8 + value.len()].copy_from_slice(value);
            at += 8 + value.len();
        }
        header.body_size = (at - PAGE_HEADER_SIZE) as u32;
        header.encode(&mut page);
        page
    }

    fn search(&self, key: i64) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&key, |(k, _)| *k)
    }

    fn child_index(&self, key: i64) -> usize {
        if self.entries.len() <= 1 {
            return 0;
        }
        match self.entries[1..].binary_search_by_key(&key, |(k, _)| *k) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    fn child(&self, index: usize) -> Result<u64> {
        let (_, slot) = self.entries.get(index).ok_or_else(|| {
            Error::corrupted(format!("branch page {} has no slot {}", self.page_number, index))
        })?;
        get_u64(slot, 0)
    }
}

fn child_slot(page: u64) -> Vec<u8> {
    page.to_le_bytes().to_vec()
}

fn leaf_capacity(page_size: usize, value_size: usize) -> usize {
    page_body_size(page_size) / (8 + value_size)
}

fn branch_capacity(page_size: usize) -> usize {
    page_body_size(page_size) / 16
}

/// Reject value sizes that would not leave room for two entries per leaf
pub(crate) fn check_value_size(page_size: usize, value_size: u16) -> Result<()> {
    if leaf_capacity(page_size, value_size as usize) < 2 {
        return Err(Error::InvalidConfiguration(format!(
            "fixed value size {} is too large for {} byte pages",
            value_size, page_size
        )));
    }
    Ok(())
}

struct PathEntry {
    page: FixedPage,
    index: usize,
    dirty: bool,
}

/// Handle to a fixed-size tree
#[derive(Debug)]
pub struct FixedSizeTree {
    name: TreeName,
    value_size: u16,
    changes: PageChanges,
}

impl FixedSizeTree {
    pub(crate) fn new(name: &str, value_size: u16) -> Self {
        FixedSizeTree {
            name: TreeName::Named(name.to_string()),
            value_size,
            changes: PageChanges::default(),
        }
    }

    pub fn name(&self) -> &TreeName {
        &self.name
    }

    pub fn value_size(&self) -> u16 {
        self.value_size
    }

    pub fn page_changes(&self) -> &PageChanges {
        &self.changes
    }

    pub fn take_page_changes(&mut self) -> PageChanges {
        std::mem::take(&mut self.changes)
    }

    fn header(&self, txn: &Transaction<'_>) -> Result<TreeRootHeader> {
        txn.tree_header(&self.name)?
            .ok_or_else(|| Error::TreeNotFound(self.name.to_string()))
    }

    fn capacity(&self, page_size: usize, is_leaf: bool) -> usize {
        if is_leaf {
            leaf_capacity(page_size, self.value_size as usize)
        } else {
            branch_capacity(page_size)
        }
    }

    pub fn number_of_entries(&self, txn: &Transaction<'_>) -> Result<u64> {
        Ok(self.header(txn)?.entries)
    }

    pub fn stats(&self, txn: &Transaction<'_>) -> Result<TreeStats> {
        Ok(TreeStats::from_header(txn.page_size(), &self.header(txn)?))
    }

    /// Insert or overwrite; returns `true` when the key is new
    pub fn add(&mut self, txn: &mut Transaction<'_>, key: i64, value: &[u8]) -> Result<bool> {
        txn.ensure_writable()?;
        if value.len() != self.value_size as usize {
            return Err(Error::ValueSizeMismatch {
                expected: self.value_size as usize,
                actual: value.len(),
            });
        }
        let mut header = self.header(txn)?;
        if header.root_page == 0 {
            let page = txn.allocate_pages(1)?;
            self.store(txn, &FixedPage::new(page, true));
            header.root_page = page;
            header.depth = 1;
            header.leaf_pages = 1;
        }

        let mut path = self.find_path(txn, &header, key)?;
        let leaf = path
            .last_mut()
            .ok_or_else(|| Error::corrupted("empty tree path"))?;
        let added = match leaf.page.search(key) {
            Ok(index) => {
                leaf.page.entries[index].1 = value.to_vec();
                false
            }
            Err(index) => {
                leaf.page.entries.insert(index, (key, value.to_vec()));
                header.entries += 1;
                true
            }
        };
        leaf.dirty = true;
        self.write_path(txn, &mut header, path)?;
        txn.set_tree_header(&self.name, header);
        Ok(added)
    }

    pub fn read(&self, txn: &Transaction<'_>, key: i64) -> Result<Option<Vec<u8>>> {
        txn.ensure_active()?;
        let header = self.header(txn)?;
        if header.root_page == 0 {
            return Ok(None);
        }
        let path = self.find_path(txn, &header, key)?;
        Ok(path.last().and_then(|leaf| match leaf.page.search(key) {
            Ok(index) => Some(leaf.page.entries[index].1.clone()),
            Err(_) => None,
        }))
    }

    pub fn contains(&self, txn: &Transaction<'_>, key: i64) -> Result<bool> {
        Ok(self.read(txn, key)?.is_some())
    }

    /// Remove `key`; returns whether it existed
    pub fn delete(&mut self, txn: &mut Transaction<'_>, key: i64) -> Result<bool> {
        txn.ensure_writable()?;
        let mut header = self.header(txn)?;
        if header.root_page == 0 {
            return Ok(false);
        }
        let mut path = self.find_path(txn, &header, key)?;
        let leaf = path
            .last_mut()
            .ok_or_else(|| Error::corrupted("empty tree path"))?;
        match leaf.page.search(key) {
            Ok(index) => {
                leaf.page.entries.remove(index);
            }
            Err(_) => return Ok(false),
        }
        leaf.dirty = true;
        header.entries = header.entries.saturating_sub(1);
        self.rebalance(txn, &mut header, path)?;
        txn.set_tree_header(&self.name, header);
        Ok(true)
    }

    /// Iterate all entries in key order
    pub fn iter<'t, 'env>(&self, txn: &'t Transaction<'env>) -> Result<FixedSizeIterator<'t, 'env>> {
        self.seek(txn, i64::MIN)
    }

    /// Iterate entries with keys not less than `from`
    pub fn seek<'t, 'env>(
        &self,
        txn: &'t Transaction<'env>,
        from: i64,
    ) -> Result<FixedSizeIterator<'t, 'env>> {
        txn.ensure_active()?;
        let header = self.header(txn)?;
        let value_size = self.value_size as usize;
        let mut stack = Vec::new();
        let mut page_number = header.root_page;
        while page_number != 0 {
            if stack.len() >= MAX_DEPTH {
                return Err(Error::corrupted("fixed-size tree is too deep"));
            }
            let page = FixedPage::decode(&txn.page(page_number)?, value_size)?;
            if page.is_leaf {
                let index = match page.search(from) {
                    Ok(index) | Err(index) => index,
                };
                stack.push((page, index));
                break;
            }
            let index = page.child_index(from);
            page_number = if index < page.entries.len() {
                page.child(index)?
            } else {
                0
            };
            stack.push((page, index + 1));
        }
        Ok(FixedSizeIterator {
            txn,
            value_size,
            stack,
        })
    }

    fn find_path(
        &self,
        txn: &Transaction<'_>,
        header: &TreeRootHeader,
        key: i64,
    ) -> Result<Vec<PathEntry>> {
        let mut path = Vec::with_capacity(header.depth as usize);
        let mut page_number = header.root_page;
        loop {
            if path.len() >= MAX_DEPTH {
                return Err(Error::corrupted(format!(
                    "fixed-size tree '{}' is too deep",
                    self.name
                )));
            }
            let page = FixedPage::decode(&txn.page(page_number)?, self.value_size as usize)?;
            if page.is_leaf {
                let index = match page.search(key) {
                    Ok(index) | Err(index) => index,
                };
                path.push(PathEntry {
                    page,
                    index,
                    dirty: false,
                });
                return Ok(path);
            }
            let index = page.child_index(key);
            page_number = page.child(index)?;
            path.push(PathEntry {
                page,
                index,
                dirty: false,
            });
        }
    }

    fn store(&mut self, txn: &mut Transaction<'_>, page: &FixedPage) {
        txn.write_page(page.page_number, page.encode(txn.page_size()));
        self.changes.record_modified(page.page_number);
    }

    fn release(&mut self, txn: &mut Transaction<'_>, header: &mut TreeRootHeader, page: &FixedPage) {
        txn.free_pages(page.page_number, 1);
        if page.is_leaf {
            header.leaf_pages = header.leaf_pages.saturating_sub(1);
        } else {
            header.branch_pages = header.branch_pages.saturating_sub(1);
        }
        self.changes.record_freed(page.page_number);
    }

    /// Store a page, splitting it in two when it is over capacity. Returns
    /// the new right sibling, if any.
    fn store_or_split(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        mut page: FixedPage,
    ) -> Result<Option<(i64, u64)>> {
        if page.entries.len() <= self.capacity(txn.page_size(), page.is_leaf) {
            self.store(txn, &page);
            return Ok(None);
        }
        let right_page = txn.allocate_pages(1)?;
        let middle = page.entries.len() / 2;
        let right = FixedPage {
            page_number: right_page,
            is_leaf: page.is_leaf,
            entries: page.entries.split_off(middle),
        };
        if page.is_leaf {
            header.leaf_pages += 1;
        } else {
            header.branch_pages += 1;
        }
        let separator = right.entries[0].0;
        self.store(txn, &page);
        self.store(txn, &right);
        Ok(Some((separator, right_page)))
    }

    fn write_path(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        mut path: Vec<PathEntry>,
    ) -> Result<()> {
        let mut split: Option<(i64, u64)> = None;
        while let Some(mut entry) = path.pop() {
            if let Some((key, child)) = split.take() {
                entry.page.entries.insert(entry.index + 1, (key, child_slot(child)));
                entry.dirty = true;
            }
            if !entry.dirty {
                break;
            }
            split = self.store_or_split(txn, header, entry.page)?;
        }
        if let Some((key, child)) = split {
            self.new_root(txn, header, key, child)?;
        }
        Ok(())
    }

    fn new_root(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        key: i64,
        child: u64,
    ) -> Result<()> {
        let page = txn.allocate_pages(1)?;
        let mut root = FixedPage::new(page, false);
        root.entries.push((i64::MIN, child_slot(header.root_page)));
        root.entries.push((key, child_slot(child)));
        self.store(txn, &root);
        header.root_page = page;
        header.depth += 1;
        header.branch_pages += 1;
        Ok(())
    }

    fn rebalance(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        mut path: Vec<PathEntry>,
    ) -> Result<()> {
        let page_size = txn.page_size();
        while let Some(entry) = path.pop() {
            if !entry.dirty {
                break;
            }
            let parent = match path.last_mut() {
                Some(parent) => parent,
                None => return self.store_root(txn, header, entry.page),
            };
            if entry.page.entries.is_empty() {
                self.release(txn, header, &entry.page);
                parent.page.entries.remove(parent.index);
                parent.dirty = true;
                continue;
            }
            let capacity = self.capacity(page_size, entry.page.is_leaf);
            if entry.page.entries.len() < capacity / 4
                && self.try_merge(txn, header, &entry.page, parent, capacity)?
            {
                continue;
            }
            self.store(txn, &entry.page);
        }
        Ok(())
    }

    fn store_root(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        mut page: FixedPage,
    ) -> Result<()> {
        if !page.is_leaf && page.entries.is_empty() {
            header.branch_pages = header.branch_pages.saturating_sub(1);
            header.leaf_pages += 1;
            header.depth = 1;
            page.is_leaf = true;
        }
        if page.is_leaf || page.entries.len() > 1 {
            self.store(txn, &page);
            return Ok(());
        }
        while !page.is_leaf && page.entries.len() == 1 {
            let child = page.child(0)?;
            self.release(txn, header, &page);
            header.root_page = child;
            header.depth = header.depth.saturating_sub(1);
            page = FixedPage::decode(&txn.page(child)?, self.value_size as usize)?;
        }
        Ok(())
    }

    fn try_merge(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        page: &FixedPage,
        parent: &mut PathEntry,
        capacity: usize,
    ) -> Result<bool> {
        let (left_index, right_index) = if parent.index + 1 < parent.page.entries.len() {
            (parent.index, parent.index + 1)
        } else if parent.index > 0 {
            (parent.index - 1, parent.index)
        } else {
            return Ok(false);
        };
        let sibling_index = if left_index == parent.index {
            right_index
        } else {
            left_index
        };
        let sibling_page = parent.page.child(sibling_index)?;
        let sibling = FixedPage::decode(&txn.page(sibling_page)?, self.value_size as usize)?;
        if sibling.entries.len() + page.entries.len() > capacity {
            return Ok(false);
        }
        let (mut left, mut right) = if sibling_index == right_index {
            (page.clone(), sibling)
        } else {
            (sibling, page.clone())
        };
        if !right.is_leaf {
            if let Some(first) = right.entries.first_mut() {
                first.0 = parent.page.entries[right_index].0;
            }
        }
        left.entries.append(&mut right.entries);
        self.store(txn, &left);
        self.release(txn, header, &right);
        parent.page.entries.remove(right_index);
        parent.dirty = true;
        Ok(true)
    }
}

/// Ordered iterator over a fixed-size tree
pub struct FixedSizeIterator<'t, 'env> {
    txn: &'t Transaction<'env>,
    value_size: usize,
    stack: Vec<(FixedPage, usize)>,
}

impl Iterator for FixedSizeIterator<'_, '_> {
    type Item = Result<(i64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (page, index) = self.stack.last_mut()?;
            if *index >= page.entries.len() {
                self.stack.pop();
                continue;
            }
            let at = *index;
            *index += 1;
            if page.is_leaf {
                return Some(Ok(page.entries[at].clone()));
            }
            let child = page
                .child(at)
                .and_then(|child| self.txn.page(child).map(|bytes| bytes.into_owned()))
                .and_then(|bytes| FixedPage::decode(&bytes, self.value_size));
            match child {
                Ok(child) => self.stack.push((child, 0)),
                Err(e) => {
                    self.stack.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Report every page of a fixed-size tree as `(page, 1)`
pub(crate) fn visit_pages(
    txn: &Transaction<'_>,
    header: &TreeRootHeader,
    f: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    let value_size = header.value_size as usize;
    let mut pending = vec![(header.root_page, 0usize)];
    while let Some((page_number, depth)) = pending.pop() {
        if depth >= MAX_DEPTH {
            return Err(Error::corrupted("fixed-size tree is too deep to walk"));
        }
        f(page_number, 1);
        let page = FixedPage::decode(&txn.page(page_number)?, value_size)?;
        if !page.is_leaf {
            for index in 0..page.entries.len() {
                pending.push((page.child(index)?, depth + 1));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::StorageEnvironment;
    use crate::options::StorageEnvironmentOptions;

    fn env() -> StorageEnvironment {
        StorageEnvironment::open(StorageEnvironmentOptions::create_memory_only()).unwrap()
    }

    #[test]
    fn add_reports_new_keys() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.fixed_tree("f", 8).unwrap();
        assert!(tree.add(&mut txn, 5, &5u64.to_le_bytes()).unwrap());
        assert!(!tree.add(&mut txn, 5, &6u64.to_le_bytes()).unwrap());
        assert_eq!(tree.read(&txn, 5).unwrap().unwrap(), 6u64.to_le_bytes().to_vec());
        assert_eq!(tree.number_of_entries(&txn).unwrap(), 1);
        assert!(matches!(
            tree.add(&mut txn, 1, b"short"),
            Err(Error::ValueSizeMismatch { expected: 8, actual: 5 })
        ));
    }

    #[test]
    fn negative_keys_sort_first() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.fixed_tree("f", 4).unwrap();
        for key in [3i64, -7, 0, i64::MIN, 12] {
            tree.add(&mut txn, key, &[1, 2, 3, 4]).unwrap();
        }
        let keys: Vec<i64> = tree.iter(&txn).unwrap().map(|e| e.unwrap().0).collect();
        assert_eq!(keys, vec![i64::MIN, -7, 0, 3, 12]);
        let from: Vec<i64> = tree.seek(&txn, 1).unwrap().map(|e| e.unwrap().0).collect();
        assert_eq!(from, vec![3, 12]);
    }

    #[test]
    fn grows_and_shrinks_across_many_pages() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.fixed_tree("f", 16).unwrap();
        for key in 0..5000i64 {
            tree.add(&mut txn, key * 3, &[key as u8; 16]).unwrap();
        }
        let stats = tree.stats(&txn).unwrap();
        assert_eq!(stats.entries, 5000);
        assert!(stats.depth >= 2);
        assert!(tree.contains(&txn, 2997).unwrap());
        assert!(!tree.contains(&txn, 2998).unwrap());
        assert_eq!(tree.iter(&txn).unwrap().count(), 5000);

        for key in 0..5000i64 {
            assert!(tree.delete(&mut txn, key * 3).unwrap());
        }
        assert!(!tree.delete(&mut txn, 0).unwrap());
        let stats = tree.stats(&txn).unwrap();
        assert_eq!((stats.entries, stats.depth, stats.branch_pages), (0, 1, 0));
        assert_eq!(stats.leaf_pages, 1);
    }

    #[test]
    fn oversized_values_are_rejected() {
        assert!(check_value_size(4096, 8).is_ok());
        assert!(check_value_size(4096, 4000).is_err());
    }
}
