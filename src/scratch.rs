//! Scratch buffers.
//!
//! Committed page images live here until a flush copies them into the data
//! file. Each modified page keeps a list of versions tagged with the
//! transaction that wrote them, so a reader resolves a page to the newest
//! version not newer than its own snapshot.

use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::logging::Logger;
use crate::meta::TreeRootHeader;
use crate::options::StorageEnvironmentOptions;
use crate::pager::Pager;

/// One committed image of a page block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageVersion {
    /// Transaction that committed this image
    pub(crate) transaction_id: u64,
    /// First scratch page holding the image
    pub(crate) scratch_position: u64,
    /// Number of pages in the block
    pub(crate) page_count: u64,
}

/// Environment state as of a committed transaction
#[derive(Debug, Clone, Copy)]
pub(crate) struct CommittedState {
    pub(crate) next_page_number: u64,
    pub(crate) root: TreeRootHeader,
}

/// Everything a flush needs to move pages into the data file
#[derive(Debug)]
pub(crate) struct FlushBatch {
    /// Newest transaction included in the batch
    pub(crate) transaction_id: u64,
    pub(crate) state: CommittedState,
    /// Newest version of each page, in commit order. Blocks of different
    /// transactions may overlap, so they must be written in this order.
    pub(crate) pages: Vec<(u64, PageVersion)>,
}

pub(crate) struct ScratchBufferPool {
    pager: Pager,
    next_free: u64,
    /// Released slots by block size
    free_slots: BTreeMap<u64, Vec<u64>>,
    /// Versions per page, oldest first
    versions: HashMap<u64, Vec<PageVersion>>,
    committed: BTreeMap<u64, CommittedState>,
    pages_in_use: u64,
    logger: Logger,
}

impl ScratchBufferPool {
    pub(crate) fn new(options: &StorageEnvironmentOptions) -> Result<Self> {
        let logger = options.logger.for_component("scratch");
        let pager = match options.scratch_path(0) {
            Some(path) => Pager::create_temporary_file(
                &path,
                options.initial_file_size,
                options.page_size,
                logger.clone(),
            )?,
            None => Pager::create_memory(
                options.initial_file_size,
                options.page_size,
                false,
                logger.clone(),
            )?,
        };
        Ok(ScratchBufferPool {
            pager,
            next_free: 0,
            free_slots: BTreeMap::new(),
            versions: HashMap::new(),
            committed: BTreeMap::new(),
            pages_in_use: 0,
            logger,
        })
    }

    /// Bytes held by unflushed versions
    pub(crate) fn size_in_bytes(&self) -> u64 {
        self.pages_in_use * self.pager.page_size() as u64
    }

    pub(crate) fn number_of_versions(&self) -> usize {
        self.versions.values().map(Vec::len).sum()
    }

    fn allocate(&mut self, count: u64) -> Result<u64> {
        if let Some(position) = self.free_slots.get_mut(&count).and_then(Vec::pop) {
            return Ok(position);
        }
        let position = self.next_free;
        self.pager.ensure_continuous(position, count)?;
        self.next_free += count;
        Ok(position)
    }

    fn release(&mut self, version: &PageVersion) {
        self.free_slots
            .entry(version.page_count)
            .or_default()
            .push(version.scratch_position);
        self.pages_in_use -= version.page_count;
    }

    /// Copy the blocks a transaction committed into scratch
    pub(crate) fn add_versions(
        &mut self,
        transaction_id: u64,
        blocks: &[(u64, &[u8])],
        state: CommittedState,
    ) -> Result<()> {
        let page_size = self.pager.page_size();
        for (page, data) in blocks {
            let page_count = (data.len() / page_size) as u64;
            let position = self.allocate(page_count)?;
            self.pager.write_pages(position, data)?;
            self.pages_in_use += page_count;
            self.versions.entry(*page).or_default().push(PageVersion {
                transaction_id,
                scratch_position: position,
                page_count,
            });
        }
        self.committed.insert(transaction_id, state);
        Ok(())
    }

    /// Newest version of `page` visible to a snapshot at `transaction_id`
    pub(crate) fn find(&self, page: u64, transaction_id: u64) -> Option<PageVersion> {
        self.versions
            .get(&page)?
            .iter()
            .rev()
            .find(|v| v.transaction_id <= transaction_id)
            .copied()
    }

    /// Copy `count` pages of a version out of scratch
    pub(crate) fn read(&self, version: &PageVersion, count: u64) -> Result<Vec<u8>> {
        let count = count.min(version.page_count);
        let state = self.pager.state();
        Ok(state.read_pages(version.scratch_position, count)?.into_owned())
    }

    /// Bytes of a version, borrowed for the duration of `f`
    pub(crate) fn with_version<T>(
        &self,
        version: &PageVersion,
        f: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Result<T> {
        let state = self.pager.state();
        let bytes = state.read_pages(version.scratch_position, version.page_count)?;
        f(&bytes)
    }

    /// Collect the newest versions of every page committed up to `oldest`
    pub(crate) fn flush_batch(&self, oldest: u64) -> Option<FlushBatch> {
        let (&transaction_id, &state) = self.committed.range(..=oldest).next_back()?;
        let mut pages: Vec<(u64, PageVersion)> = self
            .versions
            .iter()
            .filter_map(|(&page, versions)| {
                versions
                    .iter()
                    .rev()
                    .find(|v| v.transaction_id <= transaction_id)
                    .map(|v| (page, *v))
            })
            .collect();
        pages.sort_by_key(|(page, v)| (v.transaction_id, *page));
        Some(FlushBatch {
            transaction_id,
            state,
            pages,
        })
    }

    /// Forget everything committed up to `transaction_id`
    pub(crate) fn release_up_to(&mut self, transaction_id: u64) {
        let mut released = Vec::new();
        self.versions.retain(|_, versions| {
            versions.retain(|v| {
                if v.transaction_id <= transaction_id {
                    released.push(*v);
                    false
                } else {
                    true
                }
            });
            !versions.is_empty()
        });
        for version in &released {
            self.release(version);
        }
        self.committed = self.committed.split_off(&(transaction_id + 1));
        self.logger.debug(format_args!(
            "released {} page versions up to transaction {}",
            released.len(),
            transaction_id
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TreeFlags;

    fn pool() -> ScratchBufferPool {
        ScratchBufferPool::new(&StorageEnvironmentOptions::create_memory_only()).unwrap()
    }

    fn state() -> CommittedState {
        CommittedState {
            next_page_number: 10,
            root: TreeRootHeader::new(TreeFlags::empty()),
        }
    }

    #[test]
    fn readers_see_the_newest_version_at_their_snapshot() {
        let mut pool = pool();
        pool.add_versions(2, &[(5, &vec![2u8; 4096])], state()).unwrap();
        pool.add_versions(4, &[(5, &vec![4u8; 4096])], state()).unwrap();

        assert!(pool.find(5, 1).is_none());
        let v = pool.find(5, 3).unwrap();
        assert_eq!(pool.read(&v, 1).unwrap()[0], 2);
        let v = pool.find(5, 9).unwrap();
        assert_eq!(pool.read(&v, 1).unwrap()[0], 4);
    }

    #[test]
    fn flush_batch_takes_newest_per_page_up_to_oldest() {
        let mut pool = pool();
        pool.add_versions(1, &[(5, &vec![1u8; 4096]), (6, &vec![1u8; 4096])], state())
            .unwrap();
        pool.add_versions(2, &[(5, &vec![2u8; 4096])], state()).unwrap();
        pool.add_versions(3, &[(6, &vec![3u8; 4096])], state()).unwrap();

        let batch = pool.flush_batch(2).unwrap();
        assert_eq!(batch.transaction_id, 2);
        let order: Vec<(u64, u64)> = batch
            .pages
            .iter()
            .map(|(page, v)| (*page, v.transaction_id))
            .collect();
        assert_eq!(order, vec![(6, 1), (5, 2)]);

        pool.release_up_to(2);
        assert_eq!(pool.number_of_versions(), 1);
        assert!(pool.find(6, 3).is_some());
        assert!(pool.flush_batch(2).is_none());
    }

    #[test]
    fn released_slots_are_reused() {
        let mut pool = pool();
        pool.add_versions(1, &[(5, &vec![1u8; 8192])], state()).unwrap();
        let first = pool.find(5, 1).unwrap().scratch_position;
        pool.release_up_to(1);
        assert_eq!(pool.size_in_bytes(), 0);
        pool.add_versions(2, &[(9, &vec![1u8; 8192])], state()).unwrap();
        assert_eq!(pool.find(9, 2).unwrap().scratch_position, first);
    }
}
