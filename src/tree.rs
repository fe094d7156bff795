use std::collections::BTreeSet;
use std::fmt;

use crate::constants::{
    max_key_size, max_node_size, overflow_page_count, page_body_size, TreeFlags, PAGE_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::fixed_size_tree;
use crate::meta::{TreeKind, TreeRootHeader};
use crate::page::{
    encode_overflow, inline_value_offset, leaf_node_size, overflow_value, NodeValue, TreeNode,
    TreePage,
};
use crate::transaction::Transaction;
use crate::types::TreeStats;

/// Deepest tree we are willing to walk before calling the file corrupted
const MAX_TREE_DEPTH: usize = 64;

/// Which tree a handle refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TreeName {
    /// The root tree, holding the headers of all named trees
    Root,
    /// A named tree
    Named(String),
}

impl fmt::Display for TreeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeName::Root => f.write_str("$root"),
            TreeName::Named(name) => f.write_str(name),
        }
    }
}

/// Pages a tree handle touched since the changes were last taken
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageChanges {
    /// Pages written
    pub modified: BTreeSet<u64>,
    /// Pages released
    pub freed: BTreeSet<u64>,
}

impl PageChanges {
    pub(crate) fn record_modified(&mut self, page: u64) {
        self.freed.remove(&page);
        self.modified.insert(page);
    }

    pub(crate) fn record_freed(&mut self, page: u64) {
        self.modified.remove(&page);
        self.freed.insert(page);
    }

    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.freed.is_empty()
    }

    /// Fold `other` into these changes
    pub fn merge(&mut self, other: PageChanges) {
        for page in other.modified {
            self.record_modified(page);
        }
        for page in other.freed {
            self.record_freed(page);
        }
    }
}

/// One level of a root-to-leaf path
struct PathEntry {
    page: TreePage,
    /// Child taken in a branch, insert position in a leaf
    index: usize,
    /// Page content changed and must be written
    dirty: bool,
}

/// Handle to a variable-size B+tree.
///
/// The handle itself only carries the tree's name; the header is loaded from
/// the transaction on every operation, so several handles to the same tree
/// can be used within one transaction.
#[derive(Debug)]
pub struct Tree {
    name: TreeName,
    changes: PageChanges,
}

impl Tree {
    pub(crate) fn new(name: TreeName) -> Self {
        Tree {
            name,
            changes: PageChanges::default(),
        }
    }

    pub(crate) fn root() -> Self {
        Tree::new(TreeName::Root)
    }

    pub fn name(&self) -> &TreeName {
        &self.name
    }

    /// Pages modified and freed through this handle so far
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

    fn check_key(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<()> {
        let max = max_key_size(txn.page_size());
        if key.len() > max {
            return Err(Error::KeyTooLarge {
                size: key.len(),
                max,
            });
        }
        Ok(())
    }

    /// Whether a value of this size would be stored out of line
    pub fn should_go_to_overflow_page(
        &self,
        txn: &Transaction<'_>,
        key_len: usize,
        value_len: usize,
    ) -> bool {
        leaf_node_size(key_len, value_len) > max_node_size(txn.page_size())
    }

    pub fn stats(&self, txn: &Transaction<'_>) -> Result<TreeStats> {
        Ok(TreeStats::from_header(txn.page_size(), &self.header(txn)?))
    }

    /// Insert or replace `key`
    pub fn add(&mut self, txn: &mut Transaction<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        txn.ensure_writable()?;
        self.check_key(txn, key)?;
        let mut header = self.header(txn)?;
        self.ensure_root(txn, &mut header)?;

        let node_value = if self.should_go_to_overflow_page(txn, key.len(), value.len()) {
            self.write_overflow(txn, &mut header, value)?
        } else {
            NodeValue::Inline(value.to_vec())
        };
        self.put_node(txn, &mut header, key, node_value)?;
        txn.set_tree_header(&self.name, header);
        Ok(())
    }

    /// Reserve `size` bytes for `key` and hand back the buffer to fill in.
    ///
    /// Compressed trees always place the value on overflow pages, since a
    /// compressed leaf has no stable byte range to write into.
    pub fn direct_add<'t>(
        &mut self,
        txn: &'t mut Transaction<'_>,
        key: &[u8],
        size: usize,
    ) -> Result<&'t mut [u8]> {
        txn.ensure_writable()?;
        self.check_key(txn, key)?;
        let mut header = self.header(txn)?;
        self.ensure_root(txn, &mut header)?;

        let out_of_line = header.flags.contains(TreeFlags::LEAFS_COMPRESSED)
            || self.should_go_to_overflow_page(txn, key.len(), size);
        if out_of_line {
            let node_value = self.write_overflow(txn, &mut header, &vec![0u8; size])?;
            let first_page = match node_value {
                NodeValue::Overflow { page, .. } => page,
                _ => return Err(Error::corrupted("overflow write returned an inline value")),
            };
            self.put_node(txn, &mut header, key, node_value)?;
            txn.set_tree_header(&self.name, header);
            let block = txn
                .dirty_page_mut(first_page)
                .ok_or_else(|| Error::corrupted("overflow block is not dirty"))?;
            return Ok(&mut block[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size]);
        }

        self.put_node(txn, &mut header, key, NodeValue::Inline(vec![0u8; size]))?;
        txn.set_tree_header(&self.name, header);
        let path = self.find_path(txn, &header, key)?;
        let leaf = path
            .last()
            .map(|entry| entry.page.page_number)
            .ok_or_else(|| Error::corrupted("empty tree path"))?;
        let page = txn
            .dirty_page_mut(leaf)
            .ok_or_else(|| Error::corrupted("leaf is not dirty after insert"))?;
        let (offset, len) = inline_value_offset(page, key)?
            .ok_or_else(|| Error::corrupted("inserted key is missing from its leaf"))?;
        Ok(&mut page[offset..offset + len])
    }

    /// Value stored under `key`
    pub fn read(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        txn.ensure_active()?;
        let header = self.header(txn)?;
        if header.root_page == 0 {
            return Ok(None);
        }
        let path = self.find_path(txn, &header, key)?;
        let leaf = match path.last() {
            Some(entry) => &entry.page,
            None => return Ok(None),
        };
        match leaf.search(key) {
            Ok(index) => Ok(Some(read_value(txn, &leaf.entries[index].value)?)),
            Err(_) => Ok(None),
        }
    }

    /// Remove `key`; returns whether it existed
    pub fn delete(&mut self, txn: &mut Transaction<'_>, key: &[u8]) -> Result<bool> {
        txn.ensure_writable()?;
        let mut header = self.header(txn)?;
        if header.root_page == 0 {
            return Ok(false);
        }
        let mut path = self.find_path(txn, &header, key)?;
        let leaf = path
            .last_mut()
            .ok_or_else(|| Error::corrupted("empty tree path"))?;
        let index = match leaf.page.search(key) {
            Ok(index) => index,
            Err(_) => return Ok(false),
        };
        let node = leaf.page.entries.remove(index);
        leaf.dirty = true;
        self.release_value(txn, &mut header, &node.value);
        header.entries = header.entries.saturating_sub(1);

        self.rebalance(txn, &mut header, path)?;
        txn.set_tree_header(&self.name, header);
        Ok(true)
    }

    /// Iterate all entries in key order
    pub fn iter<'t, 'env>(&self, txn: &'t Transaction<'env>) -> Result<TreeIterator<'t, 'env>> {
        self.seek(txn, &[])
    }

    /// Iterate entries starting at the first key not less than `key`
    pub fn seek<'t, 'env>(
        &self,
        txn: &'t Transaction<'env>,
        key: &[u8],
    ) -> Result<TreeIterator<'t, 'env>> {
        txn.ensure_active()?;
        let header = self.header(txn)?;
        TreeIterator::new(txn, header.root_page, key)
    }

    fn ensure_root(&mut self, txn: &mut Transaction<'_>, header: &mut TreeRootHeader) -> Result<()> {
        if header.root_page != 0 {
            return Ok(());
        }
        let page = txn.allocate_pages(1)?;
        let leaf = TreePage::new(page, true);
        let bytes = leaf
            .encode(txn.page_size(), false)
            .ok_or_else(|| Error::corrupted("empty leaf does not fit a page"))?;
        self.put_page(txn, page, bytes);
        header.root_page = page;
        header.depth = 1;
        header.leaf_pages += 1;
        Ok(())
    }

    fn find_path(
        &self,
        txn: &Transaction<'_>,
        header: &TreeRootHeader,
        key: &[u8],
    ) -> Result<Vec<PathEntry>> {
        let mut path = Vec::with_capacity(header.depth as usize);
        let mut page_number = header.root_page;
        loop {
            if path.len() >= MAX_TREE_DEPTH {
                return Err(Error::corrupted(format!(
                    "tree '{}' is deeper than {} levels",
                    self.name, MAX_TREE_DEPTH
                )));
            }
            let page = TreePage::decode(&txn.page(page_number)?)?;
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
            page_number = page
                .entries
                .get(index)
                .ok_or_else(|| Error::corrupted(format!("branch page {} is empty", page.page_number)))?
                .child_page()?;
            path.push(PathEntry {
                page,
                index,
                dirty: false,
            });
        }
    }

    fn put_node(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        key: &[u8],
        value: NodeValue,
    ) -> Result<()> {
        let mut path = self.find_path(txn, header, key)?;
        let leaf = path
            .last_mut()
            .ok_or_else(|| Error::corrupted("empty tree path"))?;
        match leaf.page.search(key) {
            Ok(index) => {
                let old = std::mem::replace(&mut leaf.page.entries[index].value, value);
                self.release_value(txn, header, &old);
            }
            Err(index) => {
                leaf.page.entries.insert(
                    index,
                    TreeNode {
                        key: key.to_vec(),
                        value,
                    },
                );
                header.entries += 1;
            }
        }
        leaf.dirty = true;
        self.write_path(txn, header, path)
    }

    /// Write changed pages bottom up, splitting where they overflow
    fn write_path(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        mut path: Vec<PathEntry>,
    ) -> Result<()> {
        let mut siblings: Vec<(Vec<u8>, u64)> = Vec::new();
        while let Some(mut entry) = path.pop() {
            if !siblings.is_empty() {
                let at = entry.index + 1;
                for (offset, (key, page)) in siblings.drain(..).enumerate() {
                    entry.page.entries.insert(at + offset, TreeNode::child(key, page));
                }
                entry.dirty = true;
            }
            if !entry.dirty {
                break;
            }
            siblings = self.store_page(txn, header, entry.page)?;
        }
        self.grow_root(txn, header, siblings)
    }

    /// Put new siblings of the root under a new root until nothing splits
    fn grow_root(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        mut siblings: Vec<(Vec<u8>, u64)>,
    ) -> Result<()> {
        while !siblings.is_empty() {
            let page = txn.allocate_pages(1)?;
            let mut root = TreePage::new(page, false);
            root.entries.push(TreeNode::child(Vec::new(), header.root_page));
            root.entries.extend(
                siblings
                    .drain(..)
                    .map(|(key, child)| TreeNode::child(key, child)),
            );
            header.root_page = page;
            header.depth += 1;
            header.branch_pages += 1;
            siblings = self.store_page(txn, header, root)?;
        }
        Ok(())
    }

    /// Write a page, splitting it into as many pages as needed. Returns the
    /// new right-hand siblings with their separator keys.
    fn store_page(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        page: TreePage,
    ) -> Result<Vec<(Vec<u8>, u64)>> {
        let page_size = txn.page_size();
        let compress = page.is_leaf && header.flags.contains(TreeFlags::LEAFS_COMPRESSED);
        if let Some(bytes) = page.encode(page_size, compress) {
            self.put_page(txn, page.page_number, bytes);
            return Ok(Vec::new());
        }

        let is_leaf = page.is_leaf;
        let first_page = page.page_number;
        let chunks = split_entries(page.entries, is_leaf, page_size, compress);
        let mut siblings = Vec::with_capacity(chunks.len() - 1);
        for (i, entries) in chunks.into_iter().enumerate() {
            let page_number = if i == 0 {
                first_page
            } else {
                let page_number = txn.allocate_pages(1)?;
                if is_leaf {
                    header.leaf_pages += 1;
                } else {
                    header.branch_pages += 1;
                }
                let separator = entries.first().map(|n| n.key.clone()).unwrap_or_default();
                siblings.push((separator, page_number));
                page_number
            };
            let chunk = TreePage {
                page_number,
                is_leaf,
                entries,
            };
            let bytes = chunk.encode(page_size, compress).ok_or_else(|| {
                Error::corrupted(format!("entry does not fit on page {}", page_number))
            })?;
            self.put_page(txn, page_number, bytes);
        }
        Ok(siblings)
    }

    /// Fix up the path after a removal: drop empty pages, merge small
    /// neighbours and collapse a root with a single child.
    fn rebalance(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        mut path: Vec<PathEntry>,
    ) -> Result<()> {
        let threshold = page_body_size(txn.page_size()) / 4;
        while let Some(entry) = path.pop() {
            if !entry.dirty {
                break;
            }
            let parent = match path.last_mut() {
                Some(parent) => parent,
                None => return self.store_root(txn, header, entry.page),
            };

            if entry.page.entries.is_empty() {
                self.release_page(txn, header, entry.page.page_number, entry.page.is_leaf);
                parent.page.entries.remove(parent.index);
                parent.dirty = true;
                continue;
            }
            if entry.page.body_len() < threshold && self.try_merge(txn, header, &entry, parent)? {
                continue;
            }
            let siblings = self.store_page(txn, header, entry.page)?;
            if !siblings.is_empty() {
                let at = parent.index + 1;
                for (offset, (key, page)) in siblings.into_iter().enumerate() {
                    parent.page.entries.insert(at + offset, TreeNode::child(key, page));
                }
                parent.dirty = true;
            }
        }
        Ok(())
    }

    fn store_root(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        mut page: TreePage,
    ) -> Result<()> {
        if !page.is_leaf && page.entries.is_empty() {
            header.branch_pages = header.branch_pages.saturating_sub(1);
            header.leaf_pages += 1;
            header.depth = 1;
            page.is_leaf = true;
        }
        let mut collapsed = false;
        while !page.is_leaf && page.entries.len() == 1 {
            let child = page.entries[0].child_page()?;
            self.release_page(txn, header, page.page_number, false);
            header.root_page = child;
            header.depth = header.depth.saturating_sub(1);
            page = TreePage::decode(&txn.page(child)?)?;
            collapsed = true;
        }
        if collapsed {
            return Ok(());
        }
        let siblings = self.store_page(txn, header, page)?;
        self.grow_root(txn, header, siblings)
    }

    /// Merge `entry` with a neighbour under the same parent if the result
    /// fits on one page.
    fn try_merge(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        entry: &PathEntry,
        parent: &mut PathEntry,
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
        let sibling_page = parent.page.entries[sibling_index].child_page()?;
        let sibling = TreePage::decode(&txn.page(sibling_page)?)?;
        if sibling.is_leaf != entry.page.is_leaf {
            return Err(Error::corrupted(format!(
                "siblings {} and {} are on different levels",
                sibling_page, entry.page.page_number
            )));
        }

        let (mut left, mut right) = if sibling_index == right_index {
            (entry.page.clone(), sibling)
        } else {
            (sibling, entry.page.clone())
        };
        if !right.is_leaf {
            if let Some(first) = right.entries.first_mut() {
                first.key = parent.page.entries[right_index].key.clone();
            }
        }
        let compress = left.is_leaf && header.flags.contains(TreeFlags::LEAFS_COMPRESSED);
        left.entries.append(&mut right.entries);
        let bytes = match left.encode(txn.page_size(), compress) {
            Some(bytes) => bytes,
            None => return Ok(false),
        };
        self.put_page(txn, left.page_number, bytes);
        self.release_page(txn, header, right.page_number, right.is_leaf);
        parent.page.entries.remove(right_index);
        parent.dirty = true;
        Ok(true)
    }

    fn put_page(&mut self, txn: &mut Transaction<'_>, page: u64, bytes: Vec<u8>) {
        txn.write_page(page, bytes);
        self.changes.record_modified(page);
    }

    fn release_page(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        page: u64,
        is_leaf: bool,
    ) {
        txn.free_pages(page, 1);
        if is_leaf {
            header.leaf_pages = header.leaf_pages.saturating_sub(1);
        } else {
            header.branch_pages = header.branch_pages.saturating_sub(1);
        }
        self.changes.record_freed(page);
    }

    fn write_overflow(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        value: &[u8],
    ) -> Result<NodeValue> {
        let page_size = txn.page_size();
        let count = overflow_page_count(page_size, value.len());
        let first = txn.allocate_pages(count)?;
        txn.write_page(first, encode_overflow(first, page_size, value));
        header.overflow_pages += count;
        for page in first..first + count {
            self.changes.record_modified(page);
        }
        Ok(NodeValue::Overflow {
            page: first,
            size: value.len() as u32,
        })
    }

    fn release_value(
        &mut self,
        txn: &mut Transaction<'_>,
        header: &mut TreeRootHeader,
        value: &NodeValue,
    ) {
        if let NodeValue::Overflow { page, size } = *value {
            let count = overflow_page_count(txn.page_size(), size as usize);
            txn.free_pages(page, count);
            header.overflow_pages = header.overflow_pages.saturating_sub(count);
            for freed in page..page + count {
                self.changes.record_freed(freed);
            }
        }
    }
}

/// Cut `entries` into runs that each fit on a page, halving by size
fn split_entries(
    mut entries: Vec<TreeNode>,
    is_leaf: bool,
    page_size: usize,
    compress: bool,
) -> Vec<Vec<TreeNode>> {
    if entries.len() <= 1 || fits(&entries, is_leaf, page_size, compress) {
        return vec![entries];
    }
    let total: usize = entries.iter().map(TreeNode::encoded_size).sum();
    let mut accumulated = 0;
    let mut middle = entries.len() / 2;
    for (i, node) in entries.iter().enumerate() {
        accumulated += node.encoded_size();
        if accumulated >= total / 2 {
            middle = i + 1;
            break;
        }
    }
    let middle = middle.clamp(1, entries.len() - 1);
    let right = entries.split_off(middle);
    let mut chunks = split_entries(entries, is_leaf, page_size, compress);
    chunks.extend(split_entries(right, is_leaf, page_size, compress));
    chunks
}

fn fits(entries: &[TreeNode], is_leaf: bool, page_size: usize, compress: bool) -> bool {
    let raw: usize = entries.iter().map(TreeNode::encoded_size).sum();
    if raw <= page_body_size(page_size) {
        return true;
    }
    if !compress {
        return false;
    }
    let page = TreePage {
        page_number: 0,
        is_leaf,
        entries: entries.to_vec(),
    };
    page.encode(page_size, true).is_some()
}

pub(crate) fn read_value(txn: &Transaction<'_>, value: &NodeValue) -> Result<Vec<u8>> {
    match value {
        NodeValue::Inline(bytes) => Ok(bytes.clone()),
        NodeValue::Overflow { page, size } => {
            let count = overflow_page_count(txn.page_size(), *size as usize);
            let block = txn.read_pages(*page, count)?;
            Ok(overflow_value(&block)?.to_vec())
        }
        NodeValue::Child(_) => Err(Error::corrupted("leaf entry points at a child page")),
    }
}

/// Ordered iterator over a tree's entries
pub struct TreeIterator<'t, 'env> {
    txn: &'t Transaction<'env>,
    /// Pages from the root down with the next index to visit on each
    stack: Vec<(TreePage, usize)>,
}

enum Step {
    Pop,
    Yield(Vec<u8>, NodeValue),
    Descend(Result<u64>),
}

impl<'t, 'env> TreeIterator<'t, 'env> {
    fn new(txn: &'t Transaction<'env>, root_page: u64, key: &[u8]) -> Result<Self> {
        let mut stack = Vec::new();
        let mut page_number = root_page;
        while page_number != 0 {
            if stack.len() >= MAX_TREE_DEPTH {
                return Err(Error::corrupted("tree is too deep to iterate"));
            }
            let page = TreePage::decode(&txn.page(page_number)?)?;
            if page.is_leaf {
                let index = match page.search(key) {
                    Ok(index) | Err(index) => index,
                };
                stack.push((page, index));
                break;
            }
            let index = page.child_index(key);
            page_number = match page.entries.get(index) {
                Some(node) => node.child_page()?,
                None => 0,
            };
            stack.push((page, index + 1));
        }
        Ok(TreeIterator { txn, stack })
    }
}

impl Iterator for TreeIterator<'_, '_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let step = {
                let (page, index) = self.stack.last_mut()?;
                match page.entries.get(*index) {
                    None => Step::Pop,
                    Some(node) => {
                        *index += 1;
                        if page.is_leaf {
                            Step::Yield(node.key.clone(), node.value.clone())
                        } else {
                            Step::Descend(node.child_page())
                        }
                    }
                }
            };
            match step {
                Step::Pop => {
                    self.stack.pop();
                }
                Step::Yield(key, value) => {
                    return Some(read_value(self.txn, &value).map(|value| (key, value)));
                }
                Step::Descend(child) => {
                    let page = child
                        .and_then(|child| self.txn.page(child).and_then(|b| TreePage::decode(&b)));
                    match page {
                        Ok(page) => self.stack.push((page, 0)),
                        Err(e) => {
                            self.stack.clear();
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}

/// Report every page block a tree owns as `(first page, count)`
pub(crate) fn visit_pages(
    txn: &Transaction<'_>,
    header: &TreeRootHeader,
    f: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    if header.root_page == 0 {
        return Ok(());
    }
    match header.kind {
        TreeKind::FixedSize => fixed_size_tree::visit_pages(txn, header, f),
        TreeKind::Variable => visit_variable_pages(txn, header.root_page, f, 0),
    }
}

fn visit_variable_pages(
    txn: &Transaction<'_>,
    page_number: u64,
    f: &mut dyn FnMut(u64, u64),
    depth: usize,
) -> Result<()> {
    if depth >= MAX_TREE_DEPTH {
        return Err(Error::corrupted("tree is too deep to walk"));
    }
    f(page_number, 1);
    let page = TreePage::decode(&txn.page(page_number)?)?;
    for node in &page.entries {
        match node.value {
            NodeValue::Child(child) => visit_variable_pages(txn, child, f, depth + 1)?,
            NodeValue::Overflow { page, size } => {
                f(page, overflow_page_count(txn.page_size(), size as usize))
            }
            NodeValue::Inline(_) => {}
        }
    }
    Ok(())
}

/// Pages reachable from the root tree and every tree it names
pub(crate) fn collect_all_pages(txn: &Transaction<'_>) -> Result<BTreeSet<u64>> {
    let mut used = BTreeSet::new();
    let mut mark = |first: u64, count: u64| used.extend(first..first + count);
    let root = txn
        .tree_header(&TreeName::Root)?
        .ok_or_else(|| Error::corrupted("root tree header is missing"))?;
    visit_pages(txn, &root, &mut mark)?;
    for entry in Tree::root().iter(txn)? {
        let (_, value) = entry?;
        let header = TreeRootHeader::decode(&value)?;
        visit_pages(txn, &header, &mut mark)?;
    }
    Ok(used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::StorageEnvironment;
    use crate::options::StorageEnvironmentOptions;

    fn env() -> StorageEnvironment {
        StorageEnvironment::open(StorageEnvironmentOptions::create_memory_only()).unwrap()
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key/{:08}", i).into_bytes()
    }

    #[test]
    fn many_inserts_split_and_stay_ordered() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.create_tree("t").unwrap();
        for i in (0..3000).rev() {
            tree.add(&mut txn, &key(i), format!("value-{}", i).as_bytes())
                .unwrap();
        }
        let stats = tree.stats(&txn).unwrap();
        assert_eq!(stats.entries, 3000);
        assert!(stats.depth >= 2);
        assert!(stats.branch_pages >= 1);

        let keys: Vec<Vec<u8>> = tree.iter(&txn).unwrap().map(|e| e.unwrap().0).collect();
        assert_eq!(keys.len(), 3000);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(
            tree.read(&txn, &key(1234)).unwrap().unwrap(),
            b"value-1234".to_vec()
        );
    }

    #[test]
    fn deleting_everything_collapses_the_tree() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.create_tree("t").unwrap();
        for i in 0..2000 {
            tree.add(&mut txn, &key(i), &[7u8; 40]).unwrap();
        }
        for i in 0..2000 {
            assert!(tree.delete(&mut txn, &key(i)).unwrap());
        }
        assert!(!tree.delete(&mut txn, &key(5)).unwrap());
        let stats = tree.stats(&txn).unwrap();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.branch_pages, 0);
        assert_eq!(stats.leaf_pages, 1);
        assert!(tree.iter(&txn).unwrap().next().is_none());
    }

    #[test]
    fn large_values_go_to_overflow_pages() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.create_tree("t").unwrap();
        assert!(tree.should_go_to_overflow_page(&txn, 3, 2000));
        assert!(!tree.should_go_to_overflow_page(&txn, 3, 100));

        let big = vec![9u8; 10_000];
        tree.add(&mut txn, b"big", &big).unwrap();
        assert_eq!(tree.stats(&txn).unwrap().overflow_pages, 3);
        assert_eq!(tree.read(&txn, b"big").unwrap().unwrap(), big);

        tree.add(&mut txn, b"big", b"small").unwrap();
        assert_eq!(tree.stats(&txn).unwrap().overflow_pages, 0);
        assert_eq!(tree.take_page_changes().freed.len(), 3);
    }

    #[test]
    fn seek_starts_at_first_key_not_less() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.create_tree("t").unwrap();
        for name in ["apple", "banana", "cherry"] {
            tree.add(&mut txn, name.as_bytes(), b"").unwrap();
        }
        let first = tree.seek(&txn, b"b").unwrap().next().unwrap().unwrap();
        assert_eq!(first.0, b"banana".to_vec());
        assert!(tree.seek(&txn, b"d").unwrap().next().is_none());
    }

    #[test]
    fn direct_add_writes_in_place() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.create_tree("t").unwrap();
        tree.direct_add(&mut txn, b"inline", 5)
            .unwrap()
            .copy_from_slice(b"hello");
        let big = tree.direct_add(&mut txn, b"large", 6000).unwrap();
        big[0] = 1;
        big[5999] = 2;

        assert_eq!(tree.read(&txn, b"inline").unwrap().unwrap(), b"hello".to_vec());
        let large = tree.read(&txn, b"large").unwrap().unwrap();
        assert_eq!((large.len(), large[0], large[5999]), (6000, 1, 2));
    }

    #[test]
    fn compressed_trees_hold_more_per_leaf() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut plain = txn.create_tree("plain").unwrap();
        let mut packed = txn
            .create_tree_with_flags("packed", TreeFlags::LEAFS_COMPRESSED)
            .unwrap();
        for i in 0..500 {
            plain.add(&mut txn, &key(i), &[b'x'; 64]).unwrap();
            packed.add(&mut txn, &key(i), &[b'x'; 64]).unwrap();
        }
        let plain_leaves = plain.stats(&txn).unwrap().leaf_pages;
        let packed_stats = packed.stats(&txn).unwrap();
        assert!(packed_stats.leaf_pages < plain_leaves);
        assert_eq!(packed.read(&txn, &key(321)).unwrap().unwrap(), vec![b'x'; 64]);

        // Direct adds on compressed trees always use overflow pages
        packed.direct_add(&mut txn, b"direct", 10).unwrap();
        assert_eq!(packed.stats(&txn).unwrap().overflow_pages, 1);
    }

    #[test]
    fn oversized_keys_are_rejected() {
        let env = env();
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.create_tree("t").unwrap();
        let key = vec![b'k'; 1000];
        assert!(matches!(
            tree.add(&mut txn, &key, b"v"),
            Err(Error::KeyTooLarge { .. })
        ));
    }

    #[test]
    fn freed_pages_leave_the_modified_set() {
        let mut changes = PageChanges::default();
        changes.record_modified(4);
        changes.record_modified(5);
        changes.record_freed(5);
        assert_eq!(changes.modified.iter().copied().collect::<Vec<_>>(), vec![4]);
        assert!(changes.freed.contains(&5));

        let mut other = PageChanges::default();
        other.record_modified(5);
        changes.merge(other);
        assert!(changes.freed.is_empty());
    }
}
