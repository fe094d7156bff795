use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for storage operations
pub type Result<T> = result::Result<T, Error>;

/// Storage engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying file or mapping I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Mapping a newly extended region failed; the operation must be aborted
    #[error("out of memory while mapping {requested} bytes: {source}")]
    OutOfMemory { requested: u64, source: io::Error },
    /// The data file header is missing, has a bad magic or a bad hash
    #[error("invalid data file header: {0}")]
    InvalidFileHeader(String),
    /// Persisted structures do not decode
    #[error("corrupted data: {0}")]
    Corrupted(String),
    /// Options failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Expected etag did not match the stored one
    #[error("concurrency violation on '{key}': expected etag {expected}, actual {actual:?}")]
    Concurrency {
        key: String,
        expected: u64,
        actual: Option<u64>,
    },
    /// A caller broke an API contract
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// Write attempted through a read transaction
    #[error("transaction is read-only")]
    TransactionReadOnly,
    /// The transaction was already committed or rolled back
    #[error("transaction already finished")]
    TransactionFinished,
    /// No tree with this name exists
    #[error("tree '{0}' does not exist")]
    TreeNotFound(String),
    /// Key exceeds the maximum key size
    #[error("key of {size} bytes exceeds the maximum of {max} bytes")]
    KeyTooLarge { size: usize, max: usize },
    /// Write to a page that is currently protected
    #[error("page {0} is write protected")]
    PageProtected(u64),
    /// Page number outside of the mapped range
    #[error("page {0} is outside of the mapped range")]
    InvalidPageNumber(u64),
    /// Fixed-size tree value of the wrong length
    #[error("value of {actual} bytes does not match the fixed size of {expected} bytes")]
    ValueSizeMismatch { expected: usize, actual: usize },
}

impl Error {
    /// Whether the caller may reload state and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Concurrency { .. })
    }

    pub(crate) fn corrupted(what: impl Into<String>) -> Self {
        Error::Corrupted(what.into())
    }

    pub(crate) fn invalid_operation(what: impl Into<String>) -> Self {
        Error::InvalidOperation(what.into())
    }
}
