//! Write-ahead journal.
//!
//! Every committed write transaction is appended as one record: a fixed
//! 128-byte header followed by the images of the pages it modified. Records
//! are padded to a page multiple. When a record does not fit into the current
//! journal a new journal file is started. On startup the journals written
//! after the last data file flush are replayed.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use xxhash_rust::xxh64::xxh64;

use crate::constants::TRANSACTION_HEADER_MAGIC;
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::meta::{get_u32, get_u64, put_u32, put_u64, TreeRootHeader, TREE_ROOT_HEADER_SIZE};
use crate::options::{StorageEnvironmentOptions, TransactionsMode};

/// Size of the header in front of every journal record
pub(crate) const TRANSACTION_HEADER_SIZE: usize = 128;
const BLOCK_HEADER_SIZE: usize = 16;
const PAYLOAD_COMPRESSED: u32 = 0x01;

/// Destination of journal records
pub trait JournalWriter: Send {
    /// Journal sequence number
    fn number(&self) -> u64;
    /// Write `data` at byte `position`
    fn write(&mut self, position: u64, data: &[u8]) -> Result<()>;
    /// Make previous writes durable
    fn sync(&mut self) -> Result<()>;
    /// File backing the journal, if any
    fn path(&self) -> Option<&Path>;
}

/// Journal writer over a file
pub struct FileJournalWriter {
    file: File,
    path: PathBuf,
    number: u64,
}

impl FileJournalWriter {
    /// Create (or truncate) the journal file at `path`
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let number = journal_number_of(path).ok_or_else(|| {
            Error::InvalidConfiguration(format!("{} is not a journal file name", path.display()))
        })?;
        Ok(FileJournalWriter {
            file,
            path: path.to_path_buf(),
            number,
        })
    }
}

impl JournalWriter for FileJournalWriter {
    fn number(&self) -> u64 {
        self.number
    }

    #[cfg(unix)]
    fn write(&mut self, position: u64, data: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(data, position)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn write(&mut self, position: u64, data: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Journal writer for memory-only environments; keeps the bytes around
pub struct MemoryJournalWriter {
    number: u64,
    buffer: Vec<u8>,
}

impl MemoryJournalWriter {
    pub fn new(number: u64) -> Self {
        MemoryJournalWriter {
            number,
            buffer: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl JournalWriter for MemoryJournalWriter {
    fn number(&self) -> u64 {
        self.number
    }

    fn write(&mut self, position: u64, data: &[u8]) -> Result<()> {
        let end = position as usize + data.len();
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[position as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Pages modified by a transaction, starting at `first_page`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageBlock {
    pub(crate) first_page: u64,
    pub(crate) data: Vec<u8>,
}

/// A decoded journal record
#[derive(Debug, Clone)]
pub(crate) struct TransactionRecord {
    pub(crate) transaction_id: u64,
    pub(crate) next_page_number: u64,
    pub(crate) root: TreeRootHeader,
    pub(crate) blocks: Vec<PageBlock>,
}

/// Encode a committed transaction as a journal record padded to `page_size`
pub(crate) fn encode_transaction(
    page_size: usize,
    transaction_id: u64,
    next_page_number: u64,
    root: &TreeRootHeader,
    blocks: &[(u64, &[u8])],
) -> Vec<u8> {
    let payload_len: usize = blocks
        .iter()
        .map(|(_, data)| BLOCK_HEADER_SIZE + data.len())
        .sum();
    let mut payload = Vec::with_capacity(payload_len);
    for (first_page, data) in blocks {
        let mut block_header = [0u8; BLOCK_HEADER_SIZE];
        put_u64(&mut block_header, 0, *first_page);
        put_u32(&mut block_header, 8, (data.len() / page_size) as u32);
        payload.extend_from_slice(&block_header);
        payload.extend_from_slice(data);
    }

    let compressed = lz4_flex::block::compress(&payload);
    let (stored, flags) = if compressed.len() < payload.len() {
        (compressed, PAYLOAD_COMPRESSED)
    } else {
        (payload, 0)
    };

    let mut header = [0u8; TRANSACTION_HEADER_SIZE];
    put_u64(&mut header, 0, TRANSACTION_HEADER_MAGIC);
    put_u64(&mut header, 8, transaction_id);
    put_u64(&mut header, 16, next_page_number);
    root.encode(&mut header[24..24 + TREE_ROOT_HEADER_SIZE]);
    put_u32(&mut header, 72, blocks.len() as u32);
    put_u32(&mut header, 76, flags);
    put_u64(&mut header, 80, payload_len as u64);
    put_u64(&mut header, 88, stored.len() as u64);
    put_u64(&mut header, 96, xxh64(&stored, 0));
    let header_hash = xxh64(&header[..120], 0);
    put_u64(&mut header, 120, header_hash);

    let total = TRANSACTION_HEADER_SIZE + stored.len();
    let padded = (total + page_size - 1) / page_size * page_size;
    let mut record = Vec::with_capacity(padded);
    record.extend_from_slice(&header);
    record.extend_from_slice(&stored);
    record.resize(padded, 0);
    record
}

/// Outcome of decoding the bytes at one journal position
#[derive(Debug)]
pub(crate) enum RecordRead {
    /// A valid record and the padded length it occupies
    Record(TransactionRecord, usize),
    /// No record starts here
    End,
    /// A record starts here but fails validation
    Torn(String),
}

pub(crate) fn decode_transaction(page_size: usize, input: &[u8]) -> RecordRead {
    match try_decode_transaction(page_size, input) {
        Ok(read) => read,
        Err(e) => RecordRead::Torn(e.to_string()),
    }
}

fn try_decode_transaction(page_size: usize, input: &[u8]) -> Result<RecordRead> {
    if input.len() < TRANSACTION_HEADER_SIZE || get_u64(input, 0)? != TRANSACTION_HEADER_MAGIC {
        return Ok(RecordRead::End);
    }
    let header = &input[..TRANSACTION_HEADER_SIZE];
    if get_u64(header, 120)? != xxh64(&header[..120], 0) {
        return Ok(RecordRead::Torn("header hash mismatch".into()));
    }
    let stored_len = get_u64(header, 88)? as usize;
    let stored = match input.get(TRANSACTION_HEADER_SIZE..TRANSACTION_HEADER_SIZE + stored_len) {
        Some(stored) => stored,
        None => return Ok(RecordRead::Torn("payload is truncated".into())),
    };
    if get_u64(header, 96)? != xxh64(stored, 0) {
        return Ok(RecordRead::Torn("payload hash mismatch".into()));
    }

    let payload_len = get_u64(header, 80)? as usize;
    let payload = if get_u32(header, 76)? & PAYLOAD_COMPRESSED != 0 {
        lz4_flex::block::decompress(stored, payload_len)
            .map_err(|e| Error::corrupted(format!("journal payload: {}", e)))?
    } else {
        stored.to_vec()
    };

    let block_count = get_u32(header, 72)? as usize;
    let mut blocks = Vec::with_capacity(block_count);
    let mut offset = 0usize;
    for _ in 0..block_count {
        let first_page = get_u64(&payload, offset)?;
        let count = get_u32(&payload, offset + 8)? as usize;
        let start = offset + BLOCK_HEADER_SIZE;
        let data = payload
            .get(start..start + count * page_size)
            .ok_or_else(|| Error::corrupted("journal block exceeds payload"))?;
        blocks.push(PageBlock {
            first_page,
            data: data.to_vec(),
        });
        offset = start + count * page_size;
    }

    let record = TransactionRecord {
        transaction_id: get_u64(header, 8)?,
        next_page_number: get_u64(header, 16)?,
        root: TreeRootHeader::decode(&header[24..24 + TREE_ROOT_HEADER_SIZE])?,
        blocks,
    };
    let total = TRANSACTION_HEADER_SIZE + stored_len;
    let padded = (total + page_size - 1) / page_size * page_size;
    Ok(RecordRead::Record(record, padded))
}

/// Parse the sequence number out of a journal file name
pub(crate) fn journal_number_of(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".journal")?.parse().ok()
}

/// Journal numbers present in `dir`, ascending
pub(crate) fn list_journals(dir: &Path) -> Result<Vec<u64>> {
    let mut numbers = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(number) = journal_number_of(&entry.path()) {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// What journal replay found
#[derive(Debug, Default)]
pub(crate) struct RecoveredJournals {
    /// Records after the last flushed transaction, in order
    pub(crate) records: Vec<TransactionRecord>,
    /// Journal holding the last recovered record
    pub(crate) last_journal: Option<u64>,
    /// Every journal file present on disk
    pub(crate) journals: Vec<u64>,
}

/// Read the journals of `dir` starting at `first_journal` and collect the
/// records following `last_flushed_transaction`. Stops at the first torn
/// record or at a gap in transaction ids.
pub(crate) fn recover(
    dir: &Path,
    page_size: usize,
    first_journal: u64,
    last_flushed_transaction: u64,
    logger: &Logger,
) -> Result<RecoveredJournals> {
    let journals = list_journals(dir)?;
    let mut recovered = RecoveredJournals {
        journals: journals.clone(),
        ..Default::default()
    };
    let mut expected = last_flushed_transaction + 1;

    'journals: for number in journals.into_iter().filter(|n| *n >= first_journal) {
        let path = dir.join(crate::constants::journal_file_name(number));
        let bytes = fs::read(&path)?;
        let mut position = 0usize;
        while position < bytes.len() {
            match decode_transaction(page_size, &bytes[position..]) {
                RecordRead::Record(record, len) => {
                    position += len;
                    if record.transaction_id < expected {
                        continue;
                    }
                    if record.transaction_id != expected {
                        logger.warn(format_args!(
                            "journal {} jumps from transaction {} to {}, ignoring the rest",
                            number,
                            expected - 1,
                            record.transaction_id
                        ));
                        break 'journals;
                    }
                    expected += 1;
                    recovered.last_journal = Some(number);
                    recovered.records.push(record);
                }
                RecordRead::End => break,
                RecordRead::Torn(reason) => {
                    logger.warn(format_args!(
                        "journal {} has a torn record at {}: {}",
                        number, position, reason
                    ));
                    break 'journals;
                }
            }
        }
    }

    if !recovered.records.is_empty() {
        logger.info(format_args!(
            "recovered {} transactions from journals",
            recovered.records.len()
        ));
    }
    Ok(recovered)
}

struct ActiveJournal {
    writer: Box<dyn JournalWriter>,
    position: u64,
}

/// Appends committed transactions to the current journal, rotating as needed
pub(crate) struct WriteAheadJournal {
    current: Option<ActiveJournal>,
    next_number: u64,
    /// Last transaction written to each live journal
    last_transaction: BTreeMap<u64, u64>,
    logger: Logger,
}

impl WriteAheadJournal {
    pub(crate) fn new(next_number: u64, logger: Logger) -> Self {
        WriteAheadJournal {
            current: None,
            next_number,
            last_transaction: BTreeMap::new(),
            logger,
        }
    }

    /// Journal the next record goes to, if one is open
    pub(crate) fn current_number(&self) -> Option<u64> {
        self.current.as_ref().map(|j| j.writer.number())
    }

    pub(crate) fn write_transaction(
        &mut self,
        options: &StorageEnvironmentOptions,
        mode: TransactionsMode,
        transaction_id: u64,
        record: &[u8],
    ) -> Result<()> {
        if mode == TransactionsMode::Danger {
            return Ok(());
        }
        let needs_rotation = match &self.current {
            None => true,
            Some(journal) => {
                journal.position > 0
                    && journal.position + record.len() as u64 > options.max_journal_size
            }
        };
        if needs_rotation {
            let writer = options.create_journal_writer(self.next_number)?;
            self.logger
                .debug(format_args!("starting journal {}", self.next_number));
            self.next_number += 1;
            self.current = Some(ActiveJournal {
                writer,
                position: 0,
            });
        }

        if let Some(journal) = self.current.as_mut() {
            journal.writer.write(journal.position, record)?;
            if mode == TransactionsMode::Safe {
                journal.writer.sync()?;
            }
            journal.position += record.len() as u64;
            self.last_transaction
                .insert(journal.writer.number(), transaction_id);
        }
        Ok(())
    }

    /// Journal the given transaction was written to
    pub(crate) fn journal_of(&self, transaction_id: u64) -> Option<u64> {
        self.last_transaction
            .iter()
            .find(|(_, last)| **last >= transaction_id)
            .map(|(number, _)| *number)
    }

    /// Delete journals that only hold transactions up to `flushed`, except
    /// the one being written to.
    pub(crate) fn delete_flushed(&mut self, options: &StorageEnvironmentOptions, flushed: u64) {
        let current = self.current_number();
        let obsolete: Vec<u64> = self
            .last_transaction
            .iter()
            .filter(|(number, last)| **last <= flushed && Some(**number) != current)
            .map(|(number, _)| *number)
            .collect();
        for number in obsolete {
            self.last_transaction.remove(&number);
            if let Some(path) = options.journal_path(number) {
                match fs::remove_file(&path) {
                    Ok(()) => self
                        .logger
                        .debug(format_args!("deleted flushed journal {}", number)),
                    Err(e) => self.logger.warn(format_args!(
                        "could not delete journal {}: {}",
                        path.display(),
                        e
                    )),
                }
            }
        }
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        if let Some(journal) = self.current.as_mut() {
            journal.writer.sync()?;
        }
        Ok(())
    }

    /// Close the current journal. When everything up to `last_committed`
    /// reached the data file, all journals are deleted as well.
    pub(crate) fn close(
        &mut self,
        options: &StorageEnvironmentOptions,
        last_flushed: u64,
        last_committed: u64,
    ) -> Result<()> {
        self.sync()?;
        if last_flushed >= last_committed {
            self.current = None;
            self.delete_flushed(options, last_flushed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{journal_file_name, TreeFlags};
    use tempfile::TempDir;

    const PAGE: usize = 4096;

    fn record(txn: u64, fill: u8) -> Vec<u8> {
        let page = vec![fill; PAGE];
        let mut root = TreeRootHeader::new(TreeFlags::empty());
        root.root_page = 3;
        encode_transaction(PAGE, txn, 5, &root, &[(3, &page)])
    }

    #[test]
    fn records_are_page_aligned_and_decode() {
        let bytes = record(1, 0x42);
        assert_eq!(bytes.len() % PAGE, 0);
        match decode_transaction(PAGE, &bytes) {
            RecordRead::Record(rec, len) => {
                assert_eq!(len, bytes.len());
                assert_eq!(rec.transaction_id, 1);
                assert_eq!(rec.root.root_page, 3);
                assert_eq!(rec.blocks[0].data[100], 0x42);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn flipped_payload_byte_is_torn() {
        let mut bytes = record(1, 0x42);
        bytes[TRANSACTION_HEADER_SIZE + 4] ^= 0x01;
        assert!(matches!(decode_transaction(PAGE, &bytes), RecordRead::Torn(_)));
        assert!(matches!(decode_transaction(PAGE, &vec![0u8; PAGE]), RecordRead::End));
    }

    #[test]
    fn recovery_stops_at_torn_record() {
        let dir = TempDir::new().unwrap();
        let mut bytes = record(1, 1);
        bytes.extend(record(2, 2));
        let mut third = record(3, 3);
        let len = third.len();
        third[len / 2] ^= 0xFF;
        third[TRANSACTION_HEADER_SIZE] ^= 0xFF;
        bytes.extend(third);
        fs::write(dir.path().join(journal_file_name(0)), &bytes).unwrap();

        let recovered = recover(dir.path(), PAGE, 0, 0, &Logger::new("test")).unwrap();
        let ids: Vec<u64> = recovered.records.iter().map(|r| r.transaction_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(recovered.last_journal, Some(0));
    }

    #[test]
    fn recovery_skips_flushed_and_spans_journals() {
        let dir = TempDir::new().unwrap();
        let mut first = record(4, 4);
        first.extend(record(5, 5));
        fs::write(dir.path().join(journal_file_name(2)), &first).unwrap();
        fs::write(dir.path().join(journal_file_name(3)), record(6, 6)).unwrap();

        let recovered = recover(dir.path(), PAGE, 2, 4, &Logger::new("test")).unwrap();
        let ids: Vec<u64> = recovered.records.iter().map(|r| r.transaction_id).collect();
        assert_eq!(ids, vec![5, 6]);
        assert_eq!(recovered.last_journal, Some(3));
        assert_eq!(recovered.journals, vec![2, 3]);
    }

    #[test]
    fn journals_rotate_when_full() {
        let dir = TempDir::new().unwrap();
        let options = StorageEnvironmentOptions::for_path(dir.path()).with_max_journal_size(4 * PAGE as u64);
        let mut wal = WriteAheadJournal::new(0, Logger::new("test"));
        // Hashed bytes do not compress, so each record spans two pages
        for txn in 1..=5u64 {
            let page: Vec<u8> = (0..PAGE as u64)
                .map(|i| xxh64(&(txn * PAGE as u64 + i).to_le_bytes(), 0) as u8)
                .collect();
            let root = TreeRootHeader::new(TreeFlags::empty());
            let bytes = encode_transaction(PAGE, txn, 2, &root, &[(1, &page)]);
            wal.write_transaction(&options, TransactionsMode::Safe, txn, &bytes).unwrap();
        }
        let journals = list_journals(dir.path()).unwrap();
        assert!(journals.len() >= 2);
        assert_eq!(wal.journal_of(1), Some(0));

        wal.delete_flushed(&options, 2);
        assert!(!dir.path().join(journal_file_name(0)).exists());
        assert!(dir.path().join(journal_file_name(wal.current_number().unwrap())).exists());
    }

    #[test]
    fn danger_mode_skips_the_journal() {
        let dir = TempDir::new().unwrap();
        let options = StorageEnvironmentOptions::for_path(dir.path());
        let mut wal = WriteAheadJournal::new(0, Logger::new("test"));
        wal.write_transaction(&options, TransactionsMode::Danger, 1, &record(1, 1))
            .unwrap();
        assert!(list_journals(dir.path()).unwrap().is_empty());
    }
}
