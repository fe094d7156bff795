use xxhash_rust::xxh64::xxh64;

use crate::constants::{TreeFlags, FILE_HEADER_MAGIC, FORMAT_VERSION};
use crate::error::{Error, Result};

/// Encoded size of [`TreeRootHeader`]
pub(crate) const TREE_ROOT_HEADER_SIZE: usize = 48;
/// Encoded size of [`FileHeader`], hash included
pub(crate) const FILE_HEADER_SIZE: usize = 104;

/// Kind of tree a root header describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// Variable-size byte keys and values
    Variable,
    /// `i64` keys with values of one fixed size
    FixedSize,
}

/// Persistent description of a tree, stored in its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRootHeader {
    /// Root page number, 0 for an empty tree
    pub root_page: u64,
    /// Depth of the tree, 0 for an empty tree
    pub depth: u32,
    /// Tree flags
    pub flags: TreeFlags,
    /// Variable or fixed size
    pub kind: TreeKind,
    /// Value size of a fixed-size tree
    pub value_size: u16,
    /// Number of entries
    pub entries: u64,
    /// Number of branch pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
}

impl TreeRootHeader {
    pub fn new(flags: TreeFlags) -> Self {
        TreeRootHeader {
            root_page: 0,
            depth: 0,
            flags,
            kind: TreeKind::Variable,
            value_size: 0,
            entries: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
        }
    }

    pub fn fixed_size(value_size: u16) -> Self {
        TreeRootHeader {
            kind: TreeKind::FixedSize,
            value_size,
            ..Self::new(TreeFlags::empty())
        }
    }

    pub(crate) fn encode(&self, out: &mut [u8]) {
        put_u64(out, 0, self.root_page);
        put_u32(out, 8, self.depth);
        out[12] = self.flags.bits();
        out[13] = match self.kind {
            TreeKind::Variable => 0,
            TreeKind::FixedSize => 1,
        };
        put_u16(out, 14, self.value_size);
        put_u64(out, 16, self.entries);
        put_u64(out, 24, self.branch_pages);
        put_u64(out, 32, self.leaf_pages);
        put_u64(out, 40, self.overflow_pages);
    }

    pub(crate) fn to_bytes(&self) -> [u8; TREE_ROOT_HEADER_SIZE] {
        let mut out = [0u8; TREE_ROOT_HEADER_SIZE];
        self.encode(&mut out);
        out
    }

    pub(crate) fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < TREE_ROOT_HEADER_SIZE {
            return Err(Error::corrupted(format!(
                "tree root header needs {} bytes, got {}",
                TREE_ROOT_HEADER_SIZE,
                input.len()
            )));
        }
        let kind = match input[13] {
            0 => TreeKind::Variable,
            1 => TreeKind::FixedSize,
            other => return Err(Error::corrupted(format!("unknown tree kind {}", other))),
        };
        Ok(TreeRootHeader {
            root_page: get_u64(input, 0)?,
            depth: get_u32(input, 8)?,
            flags: TreeFlags::from_bits_truncate(input[12]),
            kind,
            value_size: get_u16(input, 14)?,
            entries: get_u64(input, 16)?,
            branch_pages: get_u64(input, 24)?,
            leaf_pages: get_u64(input, 32)?,
            overflow_pages: get_u64(input, 40)?,
        })
    }
}

/// Data file header; two copies live on page 0 and the newest valid one wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHeader {
    /// Format version
    pub(crate) version: u32,
    /// Page size the file was created with
    pub(crate) page_size: u32,
    /// Incremented on every header write; picks the slot
    pub(crate) counter: u64,
    /// Last transaction whose pages reached the data file
    pub(crate) last_flushed_transaction: u64,
    /// Journal holding that transaction; recovery starts there
    pub(crate) last_flushed_journal: u64,
    /// First page never handed out
    pub(crate) next_page_number: u64,
    /// Root of the root tree
    pub(crate) root: TreeRootHeader,
}

impl FileHeader {
    pub(crate) fn new(page_size: usize) -> Self {
        FileHeader {
            version: FORMAT_VERSION,
            page_size: page_size as u32,
            counter: 0,
            last_flushed_transaction: 0,
            last_flushed_journal: 0,
            // Page 0 is the header itself
            next_page_number: 1,
            root: TreeRootHeader::new(TreeFlags::empty()),
        }
    }

    fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        put_u64(&mut out, 0, FILE_HEADER_MAGIC);
        put_u32(&mut out, 8, self.version);
        put_u32(&mut out, 12, self.page_size);
        put_u64(&mut out, 16, self.counter);
        put_u64(&mut out, 24, self.last_flushed_transaction);
        put_u64(&mut out, 32, self.last_flushed_journal);
        put_u64(&mut out, 40, self.next_page_number);
        self.root.encode(&mut out[48..48 + TREE_ROOT_HEADER_SIZE]);
        let hash = xxh64(&out[..96], 0);
        put_u64(&mut out, 96, hash);
        out
    }

    fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < FILE_HEADER_SIZE {
            return Err(Error::InvalidFileHeader("header slot is truncated".into()));
        }
        if get_u64(input, 0)? != FILE_HEADER_MAGIC {
            return Err(Error::InvalidFileHeader("bad magic".into()));
        }
        if get_u64(input, 96)? != xxh64(&input[..96], 0) {
            return Err(Error::InvalidFileHeader("hash mismatch".into()));
        }
        let version = get_u32(input, 8)?;
        if version != FORMAT_VERSION {
            return Err(Error::InvalidFileHeader(format!(
                "unsupported version {}, expected {}",
                version, FORMAT_VERSION
            )));
        }
        Ok(FileHeader {
            version,
            page_size: get_u32(input, 12)?,
            counter: get_u64(input, 16)?,
            last_flushed_transaction: get_u64(input, 24)?,
            last_flushed_journal: get_u64(input, 32)?,
            next_page_number: get_u64(input, 40)?,
            root: TreeRootHeader::decode(&input[48..])?,
        })
    }

    /// Pick the newest valid copy out of page 0
    pub(crate) fn read_from_page(page: &[u8]) -> Result<Self> {
        let half = page.len() / 2;
        let first = FileHeader::decode(&page[..half]);
        let second = FileHeader::decode(&page[half..]);
        match (first, second) {
            (Ok(a), Ok(b)) => Ok(if a.counter >= b.counter { a } else { b }),
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(e), Err(_)) => Err(e),
        }
    }

    /// Bump the counter and write into the slot it selects, leaving the
    /// previous copy intact.
    pub(crate) fn write_to_page(&mut self, page: &mut [u8]) {
        self.counter += 1;
        let half = page.len() / 2;
        let offset = if self.counter % 2 == 0 { 0 } else { half };
        page[offset..offset + FILE_HEADER_SIZE].copy_from_slice(&self.encode());
    }

    /// Whether `page` carries no header at all (fresh file)
    pub(crate) fn is_blank(page: &[u8]) -> bool {
        page.iter().all(|&b| b == 0)
    }
}

pub(crate) fn put_u16(out: &mut [u8], at: usize, value: u16) {
    out[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut [u8], at: usize, value: u64) {
    out[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn field<const N: usize>(input: &[u8], at: usize) -> Result<[u8; N]> {
    input
        .get(at..at + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| Error::corrupted(format!("read of {} bytes at {} is out of bounds", N, at)))
}

pub(crate) fn get_u16(input: &[u8], at: usize) -> Result<u16> {
    field::<2>(input, at).map(u16::from_le_bytes)
}

pub(crate) fn get_u32(input: &[u8], at: usize) -> Result<u32> {
    field::<4>(input, at).map(u32::from_le_bytes)
}

pub(crate) fn get_u64(input: &[u8], at: usize) -> Result<u64> {
    field::<8>(input, at).map(u64::from_le_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_valid_slot_wins() {
        let mut page = vec![0u8; 4096];
        assert!(FileHeader::is_blank(&page));
        let mut header = FileHeader::new(4096);
        header.write_to_page(&mut page);
        header.next_page_number = 10;
        header.write_to_page(&mut page);

        let read = FileHeader::read_from_page(&page).unwrap();
        assert_eq!(read.counter, 2);
        assert_eq!(read.next_page_number, 10);
    }

    #[test]
    fn torn_slot_falls_back_to_previous_copy() {
        let mut page = vec![0u8; 4096];
        let mut header = FileHeader::new(4096);
        header.write_to_page(&mut page);
        header.last_flushed_transaction = 5;
        header.write_to_page(&mut page);
        // Counter 2 lives in the first slot
        page[30] ^= 0xFF;

        let read = FileHeader::read_from_page(&page).unwrap();
        assert_eq!(read.counter, 1);
        assert_eq!(read.last_flushed_transaction, 0);
    }

    #[test]
    fn garbage_is_rejected() {
        let page = vec![0xAB; 4096];
        assert!(matches!(
            FileHeader::read_from_page(&page),
            Err(Error::InvalidFileHeader(_))
        ));
    }

    #[test]
    fn short_root_header_is_corruption() {
        assert!(matches!(
            TreeRootHeader::decode(&[0u8; 10]),
            Err(Error::Corrupted(_))
        ));
        let fixed = TreeRootHeader::fixed_size(16);
        let decoded = TreeRootHeader::decode(&fixed.to_bytes()).unwrap();
        assert_eq!(decoded.kind, TreeKind::FixedSize);
        assert_eq!(decoded.value_size, 16);
    }
}
