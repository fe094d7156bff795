use bitflags::bitflags;

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransactionFlags: u32 {
        const READ_ONLY = 0x01;
        const READ_WRITE = 0x02;
    }
}

// Tree flags, persisted in the tree root header
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TreeFlags: u8 {
        const LEAFS_COMPRESSED = 0x01;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const LEAF = 0x01;
        const BRANCH = 0x02;
        const OVERFLOW = 0x04;
        const FIXED_SIZE = 0x08;
        const COMPRESSED = 0x10;
    }
}

// Tree node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        const OVERFLOW = 0x01;
    }
}

/// Default page size
pub const DEFAULT_PAGE_SIZE: usize = 4096;
/// Page sizes must be a multiple of this
pub const SECTOR_SIZE: usize = 512;
/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 1024;
/// Page sizes must stay strictly below this
pub const MAX_PAGE_SIZE: usize = 64 * 1024;
/// Mappings grow in multiples of this
pub const ALLOCATION_GRANULARITY: u64 = 64 * 1024;
/// Default journal file size
pub const DEFAULT_MAX_JOURNAL_SIZE: u64 = 64 * 1024 * 1024;
/// Default initial data file size
pub const DEFAULT_INITIAL_FILE_SIZE: u64 = 256 * 1024;
/// Default amount of committed-but-unflushed pages before a flush is requested
pub const DEFAULT_MAX_SCRATCH_BUFFER_SIZE: u64 = 32 * 1024 * 1024;
/// Maximum number of mapped regions before the pager remaps the whole file
pub const MAX_PAGER_REGIONS: usize = 32;

/// Magic marker at the start of the data file header
pub const FILE_HEADER_MAGIC: u64 = 0xB16B_AADC_0DEF_0015;
/// Magic marker at the start of every journal transaction header
pub const TRANSACTION_HEADER_MAGIC: u64 = 0x1A4C_92AD_90AB_C123;
/// Data file format version
pub const FORMAT_VERSION: u32 = 24;

/// Size of the common page header
pub const PAGE_HEADER_SIZE: usize = 32;
/// Largest key a tree accepts
pub const MAX_KEY_SIZE: usize = 512;

/// Name of the data file inside the environment directory
pub const DATA_FILE_NAME: &str = "Raven.voron";

/// Prefix of the dedicated per-reduce-key results tree
pub const REDUCE_TREE_PREFIX: &str = "#reduceTree-";
/// Prefix of the nested results section key inside the reduce phase tree
pub const NESTED_SECTION_PREFIX: &str = "#nestedSection-";

pub fn journal_file_name(number: u64) -> String {
    format!("{:019}.journal", number)
}

pub fn scratch_file_name(number: u32) -> String {
    format!("scratch.{:010}.buffers", number)
}

pub fn reduce_tree_name(reduce_key_hash: u64) -> String {
    format!("{}{}", REDUCE_TREE_PREFIX, reduce_key_hash)
}

pub fn nested_section_key(reduce_key_hash: u64) -> String {
    format!("{}{}", NESTED_SECTION_PREFIX, reduce_key_hash)
}

/// Number of bytes available for entries on a page
pub fn page_body_size(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE
}

/// Largest encoded node that may live inline on a leaf page
pub fn max_node_size(page_size: usize) -> usize {
    page_body_size(page_size) / 4
}

/// Largest key accepted for a given page size
pub fn max_key_size(page_size: usize) -> usize {
    MAX_KEY_SIZE.min(max_node_size(page_size) - 32)
}

/// Number of pages needed to store an overflow value
pub fn overflow_page_count(page_size: usize, value_len: usize) -> u64 {
    ((PAGE_HEADER_SIZE + value_len + page_size - 1) / page_size) as u64
}
