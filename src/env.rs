use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::constants::{journal_file_name, TransactionFlags};
use crate::error::{Error, Result};
use crate::journal::{self, encode_transaction, WriteAheadJournal};
use crate::logging::Logger;
use crate::meta::{FileHeader, TreeRootHeader};
use crate::midl::PageList;
use crate::options::{is_changeable, OptionChange, StorageEnvironmentOptions, TransactionsMode};
use crate::pager::Pager;
use crate::scratch::{CommittedState, ScratchBufferPool};
use crate::transaction::Transaction;
use crate::tree;
use crate::types::EnvironmentStats;

/// Snapshot of the committed environment
#[derive(Debug, Clone)]
pub(crate) struct EnvironmentState {
    /// Last committed transaction
    pub(crate) transaction_id: u64,
    /// First page never handed out
    pub(crate) next_page_number: u64,
    /// Root of the root tree
    pub(crate) root: TreeRootHeader,
}

/// Options that may change while the environment is open
#[derive(Debug, Clone, Copy)]
struct RuntimeSettings {
    transactions_mode: TransactionsMode,
    max_scratch_buffer_size: u64,
}

/// Shared part of a storage environment
pub(crate) struct EnvironmentInner {
    /// Options the environment was opened with
    pub(crate) options: StorageEnvironmentOptions,
    runtime: Mutex<RuntimeSettings>,
    /// Data file
    pub(crate) data_pager: Pager,
    /// Committed page versions not yet flushed
    pub(crate) scratch: RwLock<ScratchBufferPool>,
    state: RwLock<Arc<EnvironmentState>>,
    /// Set while a write transaction is open
    writer_active: Mutex<bool>,
    writer_released: Condvar,
    /// Snapshot transaction id to number of open transactions on it
    active_transactions: Mutex<BTreeMap<u64, usize>>,
    free_pages: Mutex<PageList>,
    journal: Mutex<WriteAheadJournal>,
    /// Last written data file header; held for the whole flush
    header: Mutex<FileHeader>,
    pub(crate) logger: Logger,
}

impl EnvironmentInner {
    pub(crate) fn page_size(&self) -> usize {
        self.options.page_size
    }

    /// Capture the current state and register as a reader of it
    pub(crate) fn register_transaction(&self) -> Arc<EnvironmentState> {
        let mut active = self.active_transactions.lock();
        let state = self.state.read().clone();
        *active.entry(state.transaction_id).or_insert(0) += 1;
        state
    }

    pub(crate) fn unregister_transaction(&self, snapshot: u64) {
        let mut active = self.active_transactions.lock();
        if let Some(count) = active.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                active.remove(&snapshot);
            }
        }
    }

    /// Oldest snapshot any open transaction may still read
    fn oldest_active_transaction(&self) -> u64 {
        let active = self.active_transactions.lock();
        match active.keys().next() {
            Some(oldest) => *oldest,
            None => self.state.read().transaction_id,
        }
    }

    pub(crate) fn acquire_write_lock(&self) {
        let mut active = self.writer_active.lock();
        while *active {
            self.writer_released.wait(&mut active);
        }
        *active = true;
    }

    pub(crate) fn release_write_lock(&self) {
        let mut active = self.writer_active.lock();
        *active = false;
        self.writer_released.notify_one();
    }

    /// Take `count` consecutive free pages
    pub(crate) fn take_free_pages(&self, count: u64) -> Option<u64> {
        self.free_pages.lock().allocate(count)
    }

    pub(crate) fn return_free_pages(&self, pages: impl IntoIterator<Item = u64>) {
        self.free_pages.lock().extend(pages);
    }

    /// Make a write transaction durable and visible
    pub(crate) fn commit(
        &self,
        transaction_id: u64,
        next_page_number: u64,
        root: TreeRootHeader,
        blocks: &[(u64, &[u8])],
        freed: Vec<u64>,
    ) -> Result<()> {
        let mode = self.runtime.lock().transactions_mode;
        let record = encode_transaction(
            self.page_size(),
            transaction_id,
            next_page_number,
            &root,
            blocks,
        );
        self.journal
            .lock()
            .write_transaction(&self.options, mode, transaction_id, &record)?;

        let committed = CommittedState {
            next_page_number,
            root,
        };
        self.scratch
            .write()
            .add_versions(transaction_id, blocks, committed)?;
        self.free_pages.lock().extend(freed);

        *self.state.write() = Arc::new(EnvironmentState {
            transaction_id,
            next_page_number,
            root,
        });
        self.logger.debug(format_args!(
            "committed transaction {} with {} page blocks",
            transaction_id,
            blocks.len()
        ));
        Ok(())
    }

    pub(crate) fn scratch_over_limit(&self) -> bool {
        let limit = self.runtime.lock().max_scratch_buffer_size;
        self.scratch.read().size_in_bytes() > limit
    }

    /// Copy committed pages no transaction needs from scratch into the data
    /// file. Returns whether anything was flushed.
    pub(crate) fn flush(&self) -> Result<bool> {
        let mut header = self.header.lock();
        let oldest = self.oldest_active_transaction();
        let mut scratch = self.scratch.write();
        let batch = match scratch.flush_batch(oldest) {
            Some(batch) if batch.transaction_id > header.last_flushed_transaction => batch,
            _ => return Ok(false),
        };

        for (page, version) in batch.pages.iter().copied() {
            self.data_pager.ensure_continuous(page, version.page_count)?;
            self.data_pager.unprotect_page_range(page, version.page_count);
            let written =
                scratch.with_version(&version, |bytes| self.data_pager.write_pages(page, bytes));
            self.data_pager.protect_page_range(page, version.page_count);
            written?;
        }
        self.data_pager.sync()?;

        let journal_number = self.journal.lock().journal_of(batch.transaction_id);
        header.last_flushed_transaction = batch.transaction_id;
        header.next_page_number = batch.state.next_page_number;
        header.root = batch.state.root;
        if let Some(number) = journal_number {
            header.last_flushed_journal = number;
        }
        write_header(&self.data_pager, &mut *header)?;
        scratch.release_up_to(batch.transaction_id);
        drop(scratch);

        self.journal
            .lock()
            .delete_flushed(&self.options, batch.transaction_id);
        self.logger.debug(format_args!(
            "flushed {} pages up to transaction {}",
            batch.pages.len(),
            batch.transaction_id
        ));
        Ok(true)
    }

    fn stats(&self) -> EnvironmentStats {
        let last_flushed = self.header.lock().last_flushed_transaction;
        let state = self.state.read().clone();
        let scratch = self.scratch.read();
        EnvironmentStats {
            last_transaction_id: state.transaction_id,
            last_flushed_transaction_id: last_flushed,
            next_page_number: state.next_page_number,
            allocated_data_pages: self.data_pager.number_of_allocated_pages(),
            free_pages: self.free_pages.lock().len() as u64,
            scratch_bytes: scratch.size_in_bytes(),
            unflushed_versions: scratch.number_of_versions(),
            active_transactions: self.active_transactions.lock().values().sum(),
        }
    }
}

enum FlushRequest {
    Flush,
    Stop,
}

/// Dedicated thread that flushes scratch into the data file on request
struct BackgroundFlusher {
    sender: Mutex<Sender<FlushRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundFlusher {
    fn start(inner: Arc<EnvironmentInner>) -> Result<Self> {
        let (sender, receiver): (Sender<FlushRequest>, Receiver<FlushRequest>) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("voron-flusher".into())
            .spawn(move || {
                while let Ok(FlushRequest::Flush) = receiver.recv() {
                    if let Err(e) = inner.flush() {
                        inner
                            .logger
                            .error(format_args!("background flush failed: {}", e));
                    }
                }
            })?;
        Ok(BackgroundFlusher {
            sender: Mutex::new(sender),
            handle: Some(handle),
        })
    }

    fn request(&self) {
        // A closed channel means the flusher is shutting down
        let _ = self.sender.lock().send(FlushRequest::Flush);
    }

    fn stop(&mut self) {
        let _ = self.sender.lock().send(FlushRequest::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A storage environment: one data file, its journals and scratch buffers
pub struct StorageEnvironment {
    inner: Arc<EnvironmentInner>,
    flusher: Option<BackgroundFlusher>,
}

impl StorageEnvironment {
    /// Open (or create) the environment described by `options`, replaying any
    /// journals left by an unclean shutdown.
    pub fn open(options: StorageEnvironmentOptions) -> Result<Self> {
        options.validate()?;
        let logger = options.logger.clone();
        let page_size = options.page_size;

        if let Some(dir) = options.base_path() {
            fs::create_dir_all(dir)?;
            remove_stale_scratch_files(dir, &logger)?;
        }

        let data_pager = match options.data_file_path() {
            Some(path) => Pager::open_file(
                &path,
                options.initial_file_size,
                page_size,
                options.protect_data_pages,
                logger.for_component("data"),
            )?,
            None => Pager::create_memory(
                options.initial_file_size,
                page_size,
                options.protect_data_pages,
                logger.for_component("data"),
            )?,
        };

        let first_page = data_pager.state().page(0)?.to_vec();
        let mut header = if FileHeader::is_blank(&first_page) {
            let mut header = FileHeader::new(page_size);
            write_header(&data_pager, &mut header)?;
            logger.info(format_args!("created a new data file"));
            header
        } else {
            let header = FileHeader::read_from_page(&first_page)?;
            if header.page_size as usize != page_size {
                return Err(Error::InvalidConfiguration(format!(
                    "data file uses {} byte pages, options ask for {}",
                    header.page_size, page_size
                )));
            }
            header
        };

        let next_journal = match options.base_path() {
            Some(dir) => replay_journals(dir, &data_pager, &mut header, &logger)?,
            None => header.last_flushed_journal + 1,
        };

        let state = EnvironmentState {
            transaction_id: header.last_flushed_transaction,
            next_page_number: header.next_page_number,
            root: header.root,
        };
        let inner = Arc::new(EnvironmentInner {
            runtime: Mutex::new(RuntimeSettings {
                transactions_mode: options.transactions_mode,
                max_scratch_buffer_size: options.max_scratch_buffer_size,
            }),
            scratch: RwLock::new(ScratchBufferPool::new(&options)?),
            data_pager,
            state: RwLock::new(Arc::new(state)),
            writer_active: Mutex::new(false),
            writer_released: Condvar::new(),
            active_transactions: Mutex::new(BTreeMap::new()),
            free_pages: Mutex::new(PageList::new()),
            journal: Mutex::new(WriteAheadJournal::new(
                next_journal,
                logger.for_component("journal"),
            )),
            header: Mutex::new(header),
            logger: logger.clone(),
            options,
        });

        let flusher = if inner.options.background_flush {
            Some(BackgroundFlusher::start(inner.clone())?)
        } else {
            None
        };
        let env = StorageEnvironment { inner, flusher };
        env.rebuild_free_space()?;
        env.inner.data_pager.try_prefetching_whole_file();
        logger.info(format_args!(
            "opened at transaction {} with {} pages",
            header.last_flushed_transaction, header.next_page_number
        ));
        Ok(env)
    }

    /// Every page below the next page number that no tree reaches is free
    fn rebuild_free_space(&self) -> Result<()> {
        let txn = self.read_transaction()?;
        let used = tree::collect_all_pages(&txn)?;
        let next_page = txn.next_page_number();
        drop(txn);

        let mut free = self.inner.free_pages.lock();
        free.extend((1..next_page).filter(|page| !used.contains(page)));
        if !free.is_empty() {
            self.inner
                .logger
                .debug(format_args!("{} free pages available", free.len()));
        }
        Ok(())
    }

    pub(crate) fn inner(&self) -> &EnvironmentInner {
        &self.inner
    }

    pub fn options(&self) -> &StorageEnvironmentOptions {
        &self.inner.options
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    /// Begin a read transaction on the latest committed state
    pub fn read_transaction(&self) -> Result<Transaction<'_>> {
        Transaction::new(self, TransactionFlags::READ_ONLY)
    }

    /// Begin the write transaction; blocks while another one is open
    pub fn write_transaction(&self) -> Result<Transaction<'_>> {
        Transaction::new(self, TransactionFlags::READ_WRITE)
    }

    /// Flush committed pages that no open transaction needs into the data file
    pub fn flush(&self) -> Result<bool> {
        self.inner.flush()
    }

    /// Called after a write transaction released the write lock
    pub(crate) fn after_commit(&self) {
        if !self.inner.scratch_over_limit() {
            return;
        }
        match &self.flusher {
            Some(flusher) => flusher.request(),
            None => {
                if let Err(e) = self.inner.flush() {
                    self.inner
                        .logger
                        .warn(format_args!("flush after commit failed: {}", e));
                }
            }
        }
    }

    pub fn stats(&self) -> EnvironmentStats {
        self.inner.stats()
    }

    /// Oldest snapshot an open transaction may still read; pages committed
    /// after it stay in scratch
    pub fn oldest_active_transaction(&self) -> u64 {
        self.inner.oldest_active_transaction()
    }

    /// Change an option of the open environment
    pub fn change_option(&self, change: OptionChange) -> Result<()> {
        if !is_changeable(change.option()) {
            return Err(Error::InvalidConfiguration(format!(
                "{:?} cannot be changed while the environment is open",
                change.option()
            )));
        }
        let mut runtime = self.inner.runtime.lock();
        match change {
            OptionChange::TransactionsMode(mode) => runtime.transactions_mode = mode,
            OptionChange::MaxScratchBufferSize(size) => runtime.max_scratch_buffer_size = size,
            OptionChange::PageSize(_) | OptionChange::MaxJournalSize(_) => {}
        }
        self.inner
            .logger
            .info(format_args!("changed option {:?}", change));
        Ok(())
    }

    pub fn transactions_mode(&self) -> TransactionsMode {
        self.inner.runtime.lock().transactions_mode
    }
}

impl Drop for StorageEnvironment {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.as_mut() {
            flusher.stop();
        }
        if let Err(e) = self.inner.flush() {
            self.inner
                .logger
                .error(format_args!("final flush failed: {}", e));
        }
        let last_flushed = self.inner.header.lock().last_flushed_transaction;
        let last_committed = self.inner.state.read().transaction_id;
        let closed =
            self.inner
                .journal
                .lock()
                .close(&self.inner.options, last_flushed, last_committed);
        if let Err(e) = closed {
            self.inner
                .logger
                .error(format_args!("closing the journal failed: {}", e));
        }
        self.inner.logger.info(format_args!("environment closed"));
    }
}

/// Write `header` into page 0 of the data file and sync it
pub(crate) fn write_header(pager: &Pager, header: &mut FileHeader) -> Result<()> {
    let mut page = pager.state().page(0)?.to_vec();
    header.write_to_page(&mut page);
    pager.unprotect_page_range(0, 1);
    let written = pager.write_pages(0, &page);
    pager.protect_page_range(0, 1);
    written?;
    pager.sync()
}

/// Apply the journaled transactions the data file has not seen yet, then
/// delete every journal. Returns the number the next journal gets.
fn replay_journals(
    dir: &Path,
    pager: &Pager,
    header: &mut FileHeader,
    logger: &Logger,
) -> Result<u64> {
    let page_size = pager.page_size();
    let recovered = journal::recover(
        dir,
        page_size,
        header.last_flushed_journal,
        header.last_flushed_transaction,
        logger,
    )?;

    if let Some(last) = recovered.records.last() {
        for record in &recovered.records {
            for block in &record.blocks {
                let count = (block.data.len() / page_size) as u64;
                pager.ensure_continuous(block.first_page, count)?;
                pager.unprotect_page_range(block.first_page, count);
                let written = pager.write_pages(block.first_page, &block.data);
                pager.protect_page_range(block.first_page, count);
                written?;
            }
        }
        pager.sync()?;
        header.last_flushed_transaction = last.transaction_id;
        header.next_page_number = last.next_page_number;
        header.root = last.root;
        if let Some(number) = recovered.last_journal {
            header.last_flushed_journal = number;
        }
        write_header(pager, header)?;
    }

    for number in &recovered.journals {
        let path = dir.join(journal_file_name(*number));
        if let Err(e) = fs::remove_file(&path) {
            logger.warn(format_args!("could not delete {}: {}", path.display(), e));
        }
    }
    let highest = recovered
        .journals
        .iter()
        .copied()
        .max()
        .unwrap_or(0)
        .max(header.last_flushed_journal);
    Ok(highest + 1)
}

fn remove_stale_scratch_files(dir: &Path, logger: &Logger) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_scratch = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with("scratch.") && name.ends_with(".buffers"));
        if is_scratch {
            logger.debug(format_args!("removing stale {}", path.display()));
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_environment_starts_empty() {
        let env = StorageEnvironment::open(StorageEnvironmentOptions::create_memory_only()).unwrap();
        let stats = env.stats();
        assert_eq!(stats.last_transaction_id, 0);
        assert_eq!(stats.next_page_number, 1);
        assert_eq!(stats.free_pages, 0);
    }

    #[test]
    fn page_size_must_match_existing_file() {
        let dir = TempDir::new().unwrap();
        drop(StorageEnvironment::open(StorageEnvironmentOptions::for_path(dir.path())).unwrap());
        let options = StorageEnvironmentOptions::for_path(dir.path()).with_page_size(8192);
        assert!(matches!(
            StorageEnvironment::open(options),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn only_runtime_options_can_change() {
        let env = StorageEnvironment::open(StorageEnvironmentOptions::create_memory_only()).unwrap();
        env.change_option(OptionChange::TransactionsMode(TransactionsMode::Lazy))
            .unwrap();
        assert_eq!(env.transactions_mode(), TransactionsMode::Lazy);
        assert!(env.change_option(OptionChange::PageSize(8192)).is_err());
    }

    #[test]
    fn stale_scratch_files_are_removed_on_open() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("scratch.0000000007.buffers");
        fs::write(&stale, b"junk").unwrap();
        let _env = StorageEnvironment::open(StorageEnvironmentOptions::for_path(dir.path())).unwrap();
        assert!(!stale.exists());
    }
}
