//! Map-reduce indexing state kept inside the storage engine

mod context;
mod reduce_key;
mod results_store;

pub use context::{
    MapReduceIndexingContext, MAP_ENTRIES_TREE, MAP_PHASE_TREE, RESULTS_STORE_TYPES_TREE,
};
pub use reduce_key::{
    BufferPool, Decimal, ReduceKeyMode, ReduceKeyProcessor, ReduceProperty, ReduceValue,
};
pub use results_store::{MapReduceResultsStore, ResultsStoreType};
