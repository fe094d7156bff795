use crate::constants::TreeFlags;
use crate::meta::{TreeKind, TreeRootHeader};

/// Tree statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStats {
    /// Size of a page
    pub page_size: usize,
    /// Variable or fixed-size tree
    pub kind: TreeKind,
    /// Tree flags
    pub flags: TreeFlags,
    /// Depth (height) of the tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of data entries
    pub entries: u64,
}

impl TreeStats {
    pub(crate) fn from_header(page_size: usize, header: &TreeRootHeader) -> Self {
        TreeStats {
            page_size,
            kind: header.kind,
            flags: header.flags,
            depth: header.depth,
            branch_pages: header.branch_pages,
            leaf_pages: header.leaf_pages,
            overflow_pages: header.overflow_pages,
            entries: header.entries,
        }
    }

    /// Pages owned by the tree
    pub fn total_pages(&self) -> u64 {
        self.branch_pages + self.leaf_pages + self.overflow_pages
    }
}

/// Environment statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentStats {
    /// Last committed transaction
    pub last_transaction_id: u64,
    /// Last transaction whose pages reached the data file
    pub last_flushed_transaction_id: u64,
    /// First page never handed out
    pub next_page_number: u64,
    /// Pages mapped for the data file
    pub allocated_data_pages: u64,
    /// Pages available for reuse
    pub free_pages: u64,
    /// Bytes of committed pages waiting in scratch
    pub scratch_bytes: u64,
    /// Page versions waiting in scratch
    pub unflushed_versions: usize,
    /// Open transactions
    pub active_transactions: usize,
}
