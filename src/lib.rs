// src/lib.rs
mod constants;
mod env;
mod error;
mod fixed_size_tree;
mod journal;
mod meta;
mod midl;
mod options;
mod page;
mod pager;
mod scratch;
mod transaction;
mod tree;
mod types;

pub mod hilo;
pub mod indexing;
pub mod logging;
pub mod versioned;

pub use constants::{
    TransactionFlags, TreeFlags, DEFAULT_PAGE_SIZE, MAX_KEY_SIZE, NESTED_SECTION_PREFIX,
    REDUCE_TREE_PREFIX,
};
pub use env::StorageEnvironment;
pub use error::{Error, Result};
pub use fixed_size_tree::{FixedSizeIterator, FixedSizeTree};
pub use hilo::{HiLoIdGenerator, HiLoRange};
pub use indexing::{
    MapReduceIndexingContext, MapReduceResultsStore, ReduceKeyProcessor, ReduceValue,
    ResultsStoreType,
};
pub use journal::{FileJournalWriter, JournalWriter, MemoryJournalWriter};
pub use meta::{TreeKind, TreeRootHeader};
pub use options::{
    is_changeable, OptionChange, RuntimeOption, StorageEnvironmentOptions, StorageLocation,
    TransactionsMode,
};
pub use pager::{PageRef, Pager, PagerState};
pub use transaction::Transaction;
pub use tree::{PageChanges, Tree, TreeIterator, TreeName};
pub use types::{EnvironmentStats, TreeStats};
pub use versioned::{VersionedTree, VersionedValue};

// Environment -> Transaction -> Tree -> results stores
