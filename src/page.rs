//! On-page layout of tree pages.
//!
//! Every page starts with a 32-byte header:
//!
//! ```text
//! 0  page number      u64
//! 8  flags            u8
//! 12 entry count      u16
//! 16 overflow size    u32   (overflow pages: value length)
//! 20 body size        u32   (bytes of encoded entries, compressed or not)
//! 24 uncompressed     u32   (compressed leaves: raw body length)
//! ```
//!
//! Variable-size tree entries are packed back to back in the body. Leaf nodes
//! are `key_len u16, flags u8, key` followed by either `len u32, value` or,
//! for values moved out of line, `page u64, len u32`. Branch nodes are
//! `key_len u16, key, child u64`; the key of the first branch node is never
//! compared.

use std::cmp::Ordering;

use crate::constants::{overflow_page_count, page_body_size, NodeFlags, PageFlags, PAGE_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::meta::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageHeader {
    pub(crate) page_number: u64,
    pub(crate) flags: PageFlags,
    pub(crate) entry_count: u16,
    pub(crate) overflow_size: u32,
    pub(crate) body_size: u32,
    pub(crate) uncompressed_size: u32,
}

impl PageHeader {
    pub(crate) fn new(page_number: u64, flags: PageFlags) -> Self {
        PageHeader {
            page_number,
            flags,
            entry_count: 0,
            overflow_size: 0,
            body_size: 0,
            uncompressed_size: 0,
        }
    }

    pub(crate) fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < PAGE_HEADER_SIZE {
            return Err(Error::corrupted("page is shorter than its header"));
        }
        Ok(PageHeader {
            page_number: get_u64(page, 0)?,
            flags: PageFlags::from_bits_truncate(page[8]),
            entry_count: get_u16(page, 12)?,
            overflow_size: get_u32(page, 16)?,
            body_size: get_u32(page, 20)?,
            uncompressed_size: get_u32(page, 24)?,
        })
    }

    pub(crate) fn encode(&self, page: &mut [u8]) {
        put_u64(page, 0, self.page_number);
        page[8] = self.flags.bits();
        put_u16(page, 12, self.entry_count);
        put_u32(page, 16, self.overflow_size);
        put_u32(page, 20, self.body_size);
        put_u32(page, 24, self.uncompressed_size);
    }
}

/// What a node points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeValue {
    /// Value stored on the leaf
    Inline(Vec<u8>),
    /// Value stored on overflow pages
    Overflow { page: u64, size: u32 },
    /// Branch node child
    Child(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TreeNode {
    pub(crate) key: Vec<u8>,
    pub(crate) value: NodeValue,
}

impl TreeNode {
    pub(crate) fn child(key: Vec<u8>, page: u64) -> Self {
        TreeNode {
            key,
            value: NodeValue::Child(page),
        }
    }

    pub(crate) fn encoded_size(&self) -> usize {
        match &self.value {
            NodeValue::Inline(value) => leaf_node_size(self.key.len(), value.len()),
            NodeValue::Overflow { .. } => 2 + 1 + self.key.len() + 8 + 4,
            NodeValue::Child(_) => 2 + self.key.len() + 8,
        }
    }

    pub(crate) fn child_page(&self) -> Result<u64> {
        match self.value {
            NodeValue::Child(page) => Ok(page),
            _ => Err(Error::corrupted("branch entry without a child page")),
        }
    }
}

/// Size of a leaf node holding the value inline
pub(crate) fn leaf_node_size(key_len: usize, value_len: usize) -> usize {
    2 + 1 + key_len + 4 + value_len
}

/// Parsed variable-size tree page
#[derive(Debug, Clone)]
pub(crate) struct TreePage {
    pub(crate) page_number: u64,
    pub(crate) is_leaf: bool,
    pub(crate) entries: Vec<TreeNode>,
}

impl TreePage {
    pub(crate) fn new(page_number: u64, is_leaf: bool) -> Self {
        TreePage {
            page_number,
            is_leaf,
            entries: Vec::new(),
        }
    }

    pub(crate) fn decode(page: &[u8]) -> Result<Self> {
        let header = PageHeader::decode(page)?;
        let is_leaf = if header.flags.contains(PageFlags::LEAF) {
            true
        } else if header.flags.contains(PageFlags::BRANCH) {
            false
        } else {
            return Err(Error::corrupted(format!(
                "page {} is not a tree page ({:?})",
                header.page_number, header.flags
            )));
        };

        let stored = page
            .get(PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + header.body_size as usize)
            .ok_or_else(|| Error::corrupted("page body exceeds the page"))?;
        let decompressed;
        let body = if header.flags.contains(PageFlags::COMPRESSED) {
            decompressed = lz4_flex::block::decompress(stored, header.uncompressed_size as usize)
                .map_err(|e| Error::corrupted(format!("page {}: {}", header.page_number, e)))?;
            &decompressed[..]
        } else {
            stored
        };

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        let mut at = 0usize;
        for _ in 0..header.entry_count {
            let key_len = get_u16(body, at)? as usize;
            if is_leaf {
                let flags = NodeFlags::from_bits_truncate(*body.get(at + 2).ok_or_else(|| {
                    Error::corrupted("leaf node is truncated")
                })?);
                let key = slice(body, at + 3, key_len)?.to_vec();
                at += 3 + key_len;
                let value = if flags.contains(NodeFlags::OVERFLOW) {
                    let page = get_u64(body, at)?;
                    let size = get_u32(body, at + 8)?;
                    at += 12;
                    NodeValue::Overflow { page, size }
                } else {
                    let len = get_u32(body, at)? as usize;
                    let value = slice(body, at + 4, len)?.to_vec();
                    at += 4 + len;
                    NodeValue::Inline(value)
                };
                entries.push(TreeNode { key, value });
            } else {
                let key = slice(body, at + 2, key_len)?.to_vec();
                let child = get_u64(body, at + 2 + key_len)?;
                at += 2 + key_len + 8;
                entries.push(TreeNode::child(key, child));
            }
        }

        Ok(TreePage {
            page_number: header.page_number,
            is_leaf,
            entries,
        })
    }

    pub(crate) fn body_len(&self) -> usize {
        self.entries.iter().map(TreeNode::encoded_size).sum()
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.body_len());
        for node in &self.entries {
            body.extend_from_slice(&(node.key.len() as u16).to_le_bytes());
            match &node.value {
                NodeValue::Inline(value) => {
                    body.push(NodeFlags::empty().bits());
                    body.extend_from_slice(&node.key);
                    body.extend_from_slice(&(value.len() as u32).to_le_bytes());
                    body.extend_from_slice(value);
                }
                NodeValue::Overflow { page, size } => {
                    body.push(NodeFlags::OVERFLOW.bits());
                    body.extend_from_slice(&node.key);
                    body.extend_from_slice(&page.to_le_bytes());
                    body.extend_from_slice(&size.to_le_bytes());
                }
                NodeValue::Child(page) => {
                    body.extend_from_slice(&node.key);
                    body.extend_from_slice(&page.to_le_bytes());
                }
            }
        }
        body
    }

    /// Serialize into a full page, compressing a leaf if needed and allowed.
    /// Returns `None` when the entries do not fit.
    pub(crate) fn encode(&self, page_size: usize, allow_compression: bool) -> Option<Vec<u8>> {
        let capacity = page_body_size(page_size);
        let body = self.encode_body();
        let mut flags = if self.is_leaf {
            PageFlags::LEAF
        } else {
            PageFlags::BRANCH
        };
        let mut header = PageHeader::new(self.page_number, flags);
        header.entry_count = self.entries.len() as u16;

        let stored = if body.len() <= capacity {
            body
        } else if self.is_leaf && allow_compression {
            let compressed = lz4_flex::block::compress(&body);
            if compressed.len() > capacity {
                return None;
            }
            flags |= PageFlags::COMPRESSED;
            header.flags = flags;
            header.uncompressed_size = body.len() as u32;
            compressed
        } else {
            return None;
        };
        header.body_size = stored.len() as u32;

        let mut page = vec![0u8; page_size];
        header.encode(&mut page);
        page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + stored.len()].copy_from_slice(&stored);
        Some(page)
    }

    /// Leaf lookup: `Ok(index)` of the key or `Err(insert position)`
    pub(crate) fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|node| node.key.as_slice().cmp(key))
    }

    /// Branch lookup: index of the child that may hold `key`
    pub(crate) fn child_index(&self, key: &[u8]) -> usize {
        if self.entries.len() <= 1 {
            return 0;
        }
        // entries[0] covers everything below entries[1].key
        let rest = &self.entries[1..];
        match rest.binary_search_by(|node| node.key.as_slice().cmp(key)) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }
}

/// Byte offset of the inline value of `key` inside an uncompressed leaf page
pub(crate) fn inline_value_offset(page: &[u8], key: &[u8]) -> Result<Option<(usize, usize)>> {
    let header = PageHeader::decode(page)?;
    if !header.flags.contains(PageFlags::LEAF) || header.flags.contains(PageFlags::COMPRESSED) {
        return Ok(None);
    }
    let mut at = PAGE_HEADER_SIZE;
    for _ in 0..header.entry_count {
        let key_len = get_u16(page, at)? as usize;
        let flags = NodeFlags::from_bits_truncate(slice(page, at + 2, 1)?[0]);
        let node_key = slice(page, at + 3, key_len)?;
        at += 3 + key_len;
        if flags.contains(NodeFlags::OVERFLOW) {
            at += 12;
            continue;
        }
        let len = get_u32(page, at)? as usize;
        if node_key.cmp(key) == Ordering::Equal {
            return Ok(Some((at + 4, len)));
        }
        at += 4 + len;
    }
    Ok(None)
}

/// Build the pages of an overflow value
pub(crate) fn encode_overflow(page_number: u64, page_size: usize, value: &[u8]) -> Vec<u8> {
    let count = overflow_page_count(page_size, value.len()) as usize;
    let mut block = vec![0u8; count * page_size];
    let mut header = PageHeader::new(page_number, PageFlags::OVERFLOW);
    header.overflow_size = value.len() as u32;
    header.encode(&mut block);
    block[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + value.len()].copy_from_slice(value);
    block
}

/// Value bytes of an overflow block
pub(crate) fn overflow_value(block: &[u8]) -> Result<&[u8]> {
    let header = PageHeader::decode(block)?;
    if !header.flags.contains(PageFlags::OVERFLOW) {
        return Err(Error::corrupted(format!(
            "page {} is not an overflow page",
            header.page_number
        )));
    }
    slice(block, PAGE_HEADER_SIZE, header.overflow_size as usize)
}

fn slice(input: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    input
        .get(at..at + len)
        .ok_or_else(|| Error::corrupted(format!("{} bytes at {} are out of bounds", len, at)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(entries: &[(&str, &str)]) -> TreePage {
        let mut page = TreePage::new(7, true);
        for (k, v) in entries {
            page.entries.push(TreeNode {
                key: k.as_bytes().to_vec(),
                value: NodeValue::Inline(v.as_bytes().to_vec()),
            });
        }
        page
    }

    #[test]
    fn leaf_with_overflow_reference_decodes() {
        let mut page = leaf(&[("a", "1")]);
        page.entries.push(TreeNode {
            key: b"b".to_vec(),
            value: NodeValue::Overflow { page: 99, size: 10_000 },
        });
        let bytes = page.encode(4096, false).unwrap();
        let decoded = TreePage::decode(&bytes).unwrap();
        assert_eq!(decoded.page_number, 7);
        assert_eq!(decoded.entries, page.entries);
    }

    #[test]
    fn oversized_leaf_is_compressed_only_when_allowed() {
        let entries: Vec<(String, String)> = (0..200)
            .map(|i| (format!("users/{:05}", i), "x".repeat(40)))
            .collect();
        let borrowed: Vec<(&str, &str)> =
            entries.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let page = leaf(&borrowed);
        assert!(page.body_len() > 4096);
        assert!(page.encode(4096, false).is_none());

        let bytes = page.encode(4096, true).unwrap();
        let header = PageHeader::decode(&bytes).unwrap();
        assert!(header.flags.contains(PageFlags::COMPRESSED));
        assert_eq!(TreePage::decode(&bytes).unwrap().entries.len(), 200);
    }

    #[test]
    fn branch_first_key_is_ignored() {
        let mut branch = TreePage::new(1, false);
        branch.entries.push(TreeNode::child(b"zzz".to_vec(), 10));
        branch.entries.push(TreeNode::child(b"m".to_vec(), 11));
        assert_eq!(branch.child_index(b"a"), 0);
        assert_eq!(branch.child_index(b"m"), 1);
        assert_eq!(branch.child_index(b"q"), 1);
    }

    #[test]
    fn inline_offsets_point_at_the_value() {
        let page = leaf(&[("a", "first"), ("b", "second")]);
        let bytes = page.encode(4096, false).unwrap();
        let (offset, len) = inline_value_offset(&bytes, b"b").unwrap().unwrap();
        assert_eq!(&bytes[offset..offset + len], b"second");
        assert!(inline_value_offset(&bytes, b"c").unwrap().is_none());
    }

    #[test]
    fn truncated_page_is_corruption() {
        let page = leaf(&[("a", "1")]);
        let mut bytes = page.encode(4096, false).unwrap();
        // Claim a body larger than the page
        put_u32(&mut bytes, 20, 8000);
        assert!(matches!(TreePage::decode(&bytes), Err(Error::Corrupted(_))));
    }

    #[test]
    fn overflow_blocks_hold_the_value() {
        let value = vec![3u8; 5000];
        let block = encode_overflow(12, 4096, &value);
        assert_eq!(block.len(), 8192);
        assert_eq!(overflow_value(&block).unwrap(), &value[..]);
    }
}
