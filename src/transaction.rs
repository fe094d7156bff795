use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::constants::{TransactionFlags, TreeFlags};
use crate::env::{EnvironmentState, StorageEnvironment};
use crate::error::{Error, Result};
use crate::fixed_size_tree::{self, FixedSizeTree};
use crate::meta::{TreeKind, TreeRootHeader};
use crate::pager::PagerState;
use crate::tree::{self, Tree, TreeName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// Storage transaction.
///
/// Read transactions see the state committed when they began, no matter what
/// commits afterwards. There is at most one write transaction at a time; it
/// reads its own writes and publishes them atomically on commit. Dropping an
/// active transaction rolls it back.
pub struct Transaction<'env> {
    /// Environment this transaction belongs to
    env: &'env StorageEnvironment,
    /// Transaction ID; a write transaction gets the next ID
    id: u64,
    /// Read-only or read-write
    flags: TransactionFlags,
    /// Committed state this transaction reads
    snapshot: Arc<EnvironmentState>,
    /// Data file mapping at the start of the transaction
    pager_state: Arc<PagerState>,
    /// First page never handed out, including this transaction's allocations
    next_page_number: u64,
    /// Root of the root tree as modified by this transaction
    root: TreeRootHeader,
    /// Page blocks written by this transaction, keyed by first page
    dirty: BTreeMap<u64, Vec<u8>>,
    /// Pages released by this transaction
    freed: Vec<u64>,
    /// Free pages handed to this transaction as (first, count)
    reused: Vec<(u64, u64)>,
    /// Named tree headers changed here; `None` marks a deleted tree
    tree_headers: BTreeMap<String, Option<TreeRootHeader>>,
    state: TransactionState,
}

impl<'env> Transaction<'env> {
    pub(crate) fn new(env: &'env StorageEnvironment, flags: TransactionFlags) -> Result<Self> {
        let inner = env.inner();
        let write = flags.contains(TransactionFlags::READ_WRITE);
        if write {
            inner.acquire_write_lock();
        }
        let snapshot = inner.register_transaction();
        let id = if write {
            snapshot.transaction_id + 1
        } else {
            snapshot.transaction_id
        };

        Ok(Transaction {
            env,
            id,
            flags,
            pager_state: inner.data_pager.state(),
            next_page_number: snapshot.next_page_number,
            root: snapshot.root,
            snapshot,
            dirty: BTreeMap::new(),
            freed: Vec::new(),
            reused: Vec::new(),
            tree_headers: BTreeMap::new(),
            state: TransactionState::Active,
        })
    }

    /// Transaction ID
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(TransactionFlags::READ_ONLY)
    }

    pub fn environment(&self) -> &'env StorageEnvironment {
        self.env
    }

    pub fn page_size(&self) -> usize {
        self.env.page_size()
    }

    pub(crate) fn next_page_number(&self) -> u64 {
        self.next_page_number
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            _ => Err(Error::TransactionFinished),
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if self.is_read_only() {
            return Err(Error::TransactionReadOnly);
        }
        Ok(())
    }

    /// Bytes of `count` pages starting at `page` as this transaction sees them
    pub(crate) fn read_pages(&self, page: u64, count: u64) -> Result<Cow<'_, [u8]>> {
        self.ensure_active()?;
        let len = count as usize * self.page_size();
        if let Some(block) = self.dirty.get(&page) {
            if block.len() >= len {
                return Ok(Cow::Borrowed(&block[..len]));
            }
        }
        if page == 0 || page >= self.next_page_number {
            return Err(Error::InvalidPageNumber(page));
        }

        let inner = self.env.inner();
        // The scratch lock keeps a flush from moving versions while we look
        let scratch = inner.scratch.read();
        if let Some(version) = scratch.find(page, self.snapshot.transaction_id) {
            if version.page_count >= count {
                return Ok(Cow::Owned(scratch.read(&version, count)?));
            }
        }
        if page + count <= self.pager_state.number_of_pages() {
            return self.pager_state.read_pages(page, count);
        }
        let current = inner.data_pager.state();
        let bytes = current.read_pages(page, count)?.into_owned();
        Ok(Cow::Owned(bytes))
    }

    pub(crate) fn page(&self, page: u64) -> Result<Cow<'_, [u8]>> {
        self.read_pages(page, 1)
    }

    /// Store a full page block; returns whether it was not dirty before
    pub(crate) fn write_page(&mut self, page: u64, bytes: Vec<u8>) -> bool {
        self.dirty.insert(page, bytes).is_none()
    }

    pub(crate) fn dirty_page_mut(&mut self, page: u64) -> Option<&mut [u8]> {
        self.dirty.get_mut(&page).map(|block| block.as_mut_slice())
    }

    /// Hand out `count` consecutive pages, reusing free space when possible
    pub(crate) fn allocate_pages(&mut self, count: u64) -> Result<u64> {
        self.ensure_writable()?;
        let first = match self.env.inner().take_free_pages(count) {
            Some(first) => {
                self.reused.push((first, count));
                first
            }
            None => {
                let first = self.next_page_number;
                self.next_page_number += count;
                first
            }
        };
        self.dirty
            .insert(first, vec![0u8; count as usize * self.page_size()]);
        Ok(first)
    }

    /// Release `count` pages starting at `page`
    pub(crate) fn free_pages(&mut self, page: u64, count: u64) {
        self.dirty.remove(&page);
        self.freed.extend(page..page + count);
    }

    /// Current header of a tree, `None` if it does not exist
    pub(crate) fn tree_header(&self, name: &TreeName) -> Result<Option<TreeRootHeader>> {
        match name {
            TreeName::Root => Ok(Some(self.root)),
            TreeName::Named(name) => {
                if let Some(header) = self.tree_headers.get(name) {
                    return Ok(*header);
                }
                match Tree::root().read(self, name.as_bytes())? {
                    Some(bytes) => Ok(Some(TreeRootHeader::decode(&bytes)?)),
                    None => Ok(None),
                }
            }
        }
    }

    pub(crate) fn set_tree_header(&mut self, name: &TreeName, header: TreeRootHeader) {
        match name {
            TreeName::Root => self.root = header,
            TreeName::Named(name) => {
                self.tree_headers.insert(name.clone(), Some(header));
            }
        }
    }

    /// Open or create the named variable-size tree
    pub fn create_tree(&mut self, name: &str) -> Result<Tree> {
        self.create_tree_with_flags(name, TreeFlags::empty())
    }

    /// Open or create the named tree; flags only apply on creation
    pub fn create_tree_with_flags(&mut self, name: &str, flags: TreeFlags) -> Result<Tree> {
        self.ensure_writable()?;
        let tree_name = TreeName::Named(name.to_string());
        match self.tree_header(&tree_name)? {
            Some(header) if header.kind == TreeKind::FixedSize => Err(Error::invalid_operation(
                format!("'{}' is a fixed-size tree", name),
            )),
            Some(_) => Ok(Tree::new(tree_name)),
            None => {
                self.set_tree_header(&tree_name, TreeRootHeader::new(flags));
                Ok(Tree::new(tree_name))
            }
        }
    }

    /// Open the named variable-size tree if it exists
    pub fn read_tree(&self, name: &str) -> Result<Option<Tree>> {
        let tree_name = TreeName::Named(name.to_string());
        match self.tree_header(&tree_name)? {
            Some(header) if header.kind == TreeKind::Variable => Ok(Some(Tree::new(tree_name))),
            _ => Ok(None),
        }
    }

    /// Open or create the named fixed-size tree
    pub fn fixed_tree(&mut self, name: &str, value_size: u16) -> Result<FixedSizeTree> {
        self.ensure_writable()?;
        let tree_name = TreeName::Named(name.to_string());
        match self.tree_header(&tree_name)? {
            Some(header) if header.kind != TreeKind::FixedSize => Err(Error::invalid_operation(
                format!("'{}' is not a fixed-size tree", name),
            )),
            Some(header) if header.value_size != value_size => Err(Error::ValueSizeMismatch {
                expected: header.value_size as usize,
                actual: value_size as usize,
            }),
            Some(_) => Ok(FixedSizeTree::new(name, value_size)),
            None => {
                fixed_size_tree::check_value_size(self.page_size(), value_size)?;
                self.set_tree_header(&tree_name, TreeRootHeader::fixed_size(value_size));
                Ok(FixedSizeTree::new(name, value_size))
            }
        }
    }

    /// Open the named fixed-size tree if it exists
    pub fn read_fixed_tree(&self, name: &str) -> Result<Option<FixedSizeTree>> {
        let tree_name = TreeName::Named(name.to_string());
        match self.tree_header(&tree_name)? {
            Some(header) if header.kind == TreeKind::FixedSize => {
                Ok(Some(FixedSizeTree::new(name, header.value_size)))
            }
            _ => Ok(None),
        }
    }

    /// Delete a named tree and release all of its pages
    pub fn delete_tree(&mut self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let tree_name = TreeName::Named(name.to_string());
        let header = self
            .tree_header(&tree_name)?
            .ok_or_else(|| Error::TreeNotFound(name.to_string()))?;
        let mut pages = Vec::new();
        tree::visit_pages(self, &header, &mut |first, count| pages.push((first, count)))?;
        for (first, count) in pages {
            self.free_pages(first, count);
        }
        self.tree_headers.insert(name.to_string(), None);
        Ok(())
    }

    /// Names of all trees visible to this transaction, sorted
    pub fn tree_names(&self) -> Result<Vec<String>> {
        let mut names = BTreeMap::new();
        for entry in Tree::root().iter(self)? {
            let (key, _) = entry?;
            names.insert(String::from_utf8_lossy(&key).into_owned(), true);
        }
        for (name, header) in &self.tree_headers {
            names.insert(name.clone(), header.is_some());
        }
        Ok(names
            .into_iter()
            .filter_map(|(name, exists)| exists.then_some(name))
            .collect())
    }

    fn write_tree_headers(&mut self) -> Result<()> {
        let headers = std::mem::take(&mut self.tree_headers);
        let mut root = Tree::root();
        for (name, header) in headers {
            match header {
                Some(header) => root.add(self, name.as_bytes(), &header.to_bytes())?,
                None => {
                    root.delete(self, name.as_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Commit the transaction
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        if self.is_read_only() {
            self.finish(TransactionState::Committed);
            return Ok(());
        }

        if let Err(e) = self.write_tree_headers() {
            self.finish(TransactionState::RolledBack);
            return Err(e);
        }

        let blocks: Vec<(u64, &[u8])> = self
            .dirty
            .iter()
            .map(|(page, block)| (*page, block.as_slice()))
            .collect();
        let freed = std::mem::take(&mut self.freed);
        let result = self.env.inner().commit(
            self.id,
            self.next_page_number,
            self.root,
            &blocks,
            freed,
        );
        drop(blocks);

        match result {
            Ok(()) => {
                self.finish(TransactionState::Committed);
                self.env.after_commit();
                Ok(())
            }
            Err(e) => {
                self.env
                    .logger()
                    .error(format_args!("commit of transaction {} failed: {}", self.id, e));
                self.finish(TransactionState::RolledBack);
                Err(e)
            }
        }
    }

    /// Abort the transaction and discard its changes
    pub fn rollback(mut self) {
        self.finish(TransactionState::RolledBack);
    }

    fn finish(&mut self, state: TransactionState) {
        if self.state != TransactionState::Active {
            return;
        }
        self.state = state;
        let inner = self.env.inner();
        if !self.is_read_only() {
            if state == TransactionState::RolledBack {
                let reused = std::mem::take(&mut self.reused);
                inner.return_free_pages(
                    reused
                        .into_iter()
                        .flat_map(|(first, count)| first..first + count),
                );
                self.dirty.clear();
            }
            inner.release_write_lock();
        }
        inner.unregister_transaction(self.snapshot.transaction_id);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.finish(TransactionState::RolledBack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::StorageEnvironmentOptions;

    fn env() -> StorageEnvironment {
        StorageEnvironment::open(StorageEnvironmentOptions::create_memory_only()).unwrap()
    }

    #[test]
    fn read_transactions_cannot_write() {
        let env = env();
        let mut txn = env.read_transaction().unwrap();
        assert!(matches!(txn.create_tree("t"), Err(Error::TransactionReadOnly)));
        assert!(matches!(txn.allocate_pages(1), Err(Error::TransactionReadOnly)));
    }

    #[test]
    fn write_transaction_ids_advance_on_commit_only() {
        let env = env();
        let txn = env.write_transaction().unwrap();
        assert_eq!(txn.id(), 1);
        txn.rollback();

        let mut txn = env.write_transaction().unwrap();
        assert_eq!(txn.id(), 1);
        txn.create_tree("t").unwrap();
        txn.commit().unwrap();

        let txn = env.write_transaction().unwrap();
        assert_eq!(txn.id(), 2);
    }

    #[test]
    fn rolled_back_allocations_return_free_pages() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.create_tree("t").unwrap();
        tree.add(&mut txn, b"k", b"v").unwrap();
        txn.commit().unwrap();

        let mut txn = env.write_transaction().unwrap();
        txn.delete_tree("t").unwrap();
        txn.commit().unwrap();
        let free_before = env.stats().free_pages;
        assert!(free_before > 0);

        let mut txn = env.write_transaction().unwrap();
        txn.allocate_pages(1).unwrap();
        drop(txn);
        assert_eq!(env.stats().free_pages, free_before);
    }

    #[test]
    fn tree_kinds_do_not_mix() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        txn.fixed_tree("ids", 8).unwrap();
        assert!(txn.create_tree("ids").is_err());
        assert!(matches!(
            txn.fixed_tree("ids", 4),
            Err(Error::ValueSizeMismatch { .. })
        ));
        assert!(txn.read_tree("ids").unwrap().is_none());
        assert!(txn.read_fixed_tree("ids").unwrap().is_some());
    }

    #[test]
    fn deleted_trees_disappear() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        txn.create_tree("a").unwrap();
        txn.create_tree("b").unwrap();
        txn.commit().unwrap();

        let mut txn = env.write_transaction().unwrap();
        txn.delete_tree("a").unwrap();
        assert_eq!(txn.tree_names().unwrap(), vec!["b".to_string()]);
        assert!(matches!(txn.delete_tree("a"), Err(Error::TreeNotFound(_))));
        txn.commit().unwrap();

        let txn = env.read_transaction().unwrap();
        assert!(txn.read_tree("a").unwrap().is_none());
        assert_eq!(txn.tree_names().unwrap(), vec!["b".to_string()]);
    }
}
