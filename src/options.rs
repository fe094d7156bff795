use std::path::{Path, PathBuf};

use lazy_static::lazy_static;

use crate::constants::{
    journal_file_name, scratch_file_name, DATA_FILE_NAME, DEFAULT_INITIAL_FILE_SIZE,
    DEFAULT_MAX_JOURNAL_SIZE, DEFAULT_MAX_SCRATCH_BUFFER_SIZE, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
    MIN_PAGE_SIZE, SECTOR_SIZE,
};
use crate::error::{Error, Result};
use crate::journal::{FileJournalWriter, JournalWriter, MemoryJournalWriter};
use crate::logging::Logger;

/// Durability of committed transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionsMode {
    /// Journal is written and fsynced on every commit
    Safe,
    /// Journal is written but not fsynced
    Lazy,
    /// No journal; committed data is lost on crash until flushed
    Danger,
}

/// Configuration knobs that can be addressed individually
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOption {
    PageSize,
    MaxJournalSize,
    TransactionsMode,
    MaxScratchBufferSize,
}

lazy_static! {
    static ref CHANGEABLE: Vec<RuntimeOption> = vec![
        RuntimeOption::TransactionsMode,
        RuntimeOption::MaxScratchBufferSize
    ];
}

/// Whether `option` can be changed after the environment is opened
pub fn is_changeable(option: RuntimeOption) -> bool {
    CHANGEABLE.contains(&option)
}

/// A new value for one option of an open environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionChange {
    PageSize(usize),
    MaxJournalSize(u64),
    TransactionsMode(TransactionsMode),
    MaxScratchBufferSize(u64),
}

impl OptionChange {
    pub fn option(&self) -> RuntimeOption {
        match self {
            OptionChange::PageSize(_) => RuntimeOption::PageSize,
            OptionChange::MaxJournalSize(_) => RuntimeOption::MaxJournalSize,
            OptionChange::TransactionsMode(_) => RuntimeOption::TransactionsMode,
            OptionChange::MaxScratchBufferSize(_) => RuntimeOption::MaxScratchBufferSize,
        }
    }
}

/// Where the environment keeps its files
#[derive(Debug, Clone)]
pub enum StorageLocation {
    Directory(PathBuf),
    Memory,
}

/// Storage environment configuration
#[derive(Debug, Clone)]
pub struct StorageEnvironmentOptions {
    /// Directory or anonymous memory
    pub location: StorageLocation,
    /// Page size in bytes
    pub page_size: usize,
    /// Size of a fresh data file
    pub initial_file_size: u64,
    /// Journals rotate after this many bytes
    pub max_journal_size: u64,
    /// Durability of commits
    pub transactions_mode: TransactionsMode,
    /// Keep data file mappings read-only outside of flushes
    pub protect_data_pages: bool,
    /// Committed-but-unflushed bytes that trigger a data file flush
    pub max_scratch_buffer_size: u64,
    /// Flush from a dedicated background thread instead of the committer
    pub background_flush: bool,
    /// Logging context handed to every component
    pub logger: Logger,
}

impl StorageEnvironmentOptions {
    /// Options for an environment stored in `dir`
    pub fn for_path<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let logger = Logger::new(dir.display().to_string());
        StorageEnvironmentOptions {
            location: StorageLocation::Directory(dir),
            logger,
            ..Self::create_memory_only()
        }
    }

    /// Options for a purely in-memory environment
    pub fn create_memory_only() -> Self {
        StorageEnvironmentOptions {
            location: StorageLocation::Memory,
            page_size: DEFAULT_PAGE_SIZE,
            initial_file_size: DEFAULT_INITIAL_FILE_SIZE,
            max_journal_size: DEFAULT_MAX_JOURNAL_SIZE,
            transactions_mode: TransactionsMode::Safe,
            protect_data_pages: false,
            max_scratch_buffer_size: DEFAULT_MAX_SCRATCH_BUFFER_SIZE,
            background_flush: false,
            logger: Logger::new("memory"),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_journal_size(mut self, size: u64) -> Self {
        self.max_journal_size = size;
        self
    }

    pub fn with_transactions_mode(mut self, mode: TransactionsMode) -> Self {
        self.transactions_mode = mode;
        self
    }

    pub fn with_protect_data_pages(mut self, protect: bool) -> Self {
        self.protect_data_pages = protect;
        self
    }

    pub fn with_max_scratch_buffer_size(mut self, size: u64) -> Self {
        self.max_scratch_buffer_size = size;
        self
    }

    pub fn with_background_flush(mut self, enabled: bool) -> Self {
        self.background_flush = enabled;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn is_memory_only(&self) -> bool {
        matches!(self.location, StorageLocation::Memory)
    }

    /// Check sizes before anything is created on disk
    pub fn validate(&self) -> Result<()> {
        if self.page_size % SECTOR_SIZE != 0 {
            return Err(Error::InvalidConfiguration(format!(
                "page size {} is not a multiple of the sector size {}",
                self.page_size, SECTOR_SIZE
            )));
        }
        if self.page_size < MIN_PAGE_SIZE || self.page_size >= MAX_PAGE_SIZE {
            return Err(Error::InvalidConfiguration(format!(
                "page size {} must be in [{}, {})",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.max_journal_size < 4 * self.page_size as u64 {
            return Err(Error::InvalidConfiguration(format!(
                "journal size {} must hold at least 4 pages",
                self.max_journal_size
            )));
        }
        if self.initial_file_size < 2 * self.page_size as u64 {
            return Err(Error::InvalidConfiguration(format!(
                "initial file size {} must hold at least 2 pages",
                self.initial_file_size
            )));
        }
        Ok(())
    }

    pub fn base_path(&self) -> Option<&Path> {
        match &self.location {
            StorageLocation::Directory(dir) => Some(dir),
            StorageLocation::Memory => None,
        }
    }

    pub fn data_file_path(&self) -> Option<PathBuf> {
        self.base_path().map(|dir| dir.join(DATA_FILE_NAME))
    }

    pub fn journal_path(&self, number: u64) -> Option<PathBuf> {
        self.base_path().map(|dir| dir.join(journal_file_name(number)))
    }

    pub fn scratch_path(&self, number: u32) -> Option<PathBuf> {
        self.base_path().map(|dir| dir.join(scratch_file_name(number)))
    }

    /// Pick the journal writer for this platform and location
    pub fn create_journal_writer(&self, number: u64) -> Result<Box<dyn JournalWriter>> {
        match self.journal_path(number) {
            Some(path) => Ok(Box::new(FileJournalWriter::create(&path)?)),
            None => Ok(Box::new(MemoryJournalWriter::new(number))),
        }
    }
}

impl Default for StorageEnvironmentOptions {
    fn default() -> Self {
        Self::create_memory_only()
    }
}
