//! Memory-mapped page store.
//!
//! A [`Pager`] maps a backing file (or anonymous memory) as a list of regions.
//! The current list is published as an immutable [`PagerState`]; transactions
//! hold an `Arc` to the state they started with. Growing the pager never
//! touches a published state: it maps the new range as an extra region and
//! publishes a new state that shares the old regions ("continuous"
//! allocation). When too many regions accumulate the whole file is mapped
//! again as one region and the old state is marked obsolete; it is unmapped
//! once the last transaction holding it lets go.

use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::constants::{ALLOCATION_GRANULARITY, MAX_PAGER_REGIONS};
use crate::error::{Error, Result};
use crate::logging::Logger;

/// What the mapping is backed by
#[derive(Debug)]
enum PagerBacking {
    File {
        file: File,
        path: PathBuf,
        delete_on_drop: bool,
    },
    Memory,
}

/// One contiguous mapping of `page_count` pages starting at `first_page`
struct MappedRegion {
    first_page: u64,
    page_count: u64,
    page_size: usize,
    base: *mut u8,
    protected: AtomicBool,
    map: MmapMut,
}

// Safety: `base` points into `map`, which lives as long as the region. Writes
// only happen through `Pager::write_pages`, which is serialized by the
// environment, and only to pages no reader can observe at that time.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    fn new(first_page: u64, page_size: usize, mut map: MmapMut, protected: bool) -> Self {
        let page_count = (map.len() / page_size) as u64;
        let base = map.as_mut_ptr();
        MappedRegion {
            first_page,
            page_count,
            page_size,
            base,
            protected: AtomicBool::new(protected),
            map,
        }
    }

    fn end_page(&self) -> u64 {
        self.first_page + self.page_count
    }

    fn contains(&self, page: u64) -> bool {
        page >= self.first_page && page < self.end_page()
    }

    fn offset_of(&self, page: u64) -> usize {
        (page - self.first_page) as usize * self.page_size
    }

    fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.map.len());
        unsafe { std::slice::from_raw_parts(self.base.add(offset), len) }
    }

    fn write(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.map.len());
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len()) }
    }
}

/// Immutable snapshot of the pager's mappings
pub struct PagerState {
    regions: Vec<Arc<MappedRegion>>,
    total_pages: u64,
    page_size: usize,
    obsolete: AtomicBool,
    logger: Logger,
}

impl PagerState {
    fn new(regions: Vec<Arc<MappedRegion>>, page_size: usize, logger: Logger) -> Self {
        let total_pages = regions.last().map(|r| r.end_page()).unwrap_or(0);
        PagerState {
            regions,
            total_pages,
            page_size,
            obsolete: AtomicBool::new(false),
            logger,
        }
    }

    /// Pages covered by this state
    pub fn number_of_pages(&self) -> u64 {
        self.total_pages
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of separate mappings
    pub fn number_of_regions(&self) -> usize {
        self.regions.len()
    }

    /// Set once a newer state has replaced this one
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    fn region_index(&self, page: u64) -> Option<usize> {
        let idx = self.regions.partition_point(|r| r.end_page() <= page);
        match self.regions.get(idx) {
            Some(region) if region.contains(page) => Some(idx),
            _ => None,
        }
    }

    /// Bytes of a single page
    pub fn page(&self, page: u64) -> Result<&[u8]> {
        let idx = self.region_index(page).ok_or(Error::InvalidPageNumber(page))?;
        let region = &self.regions[idx];
        Ok(region.slice(region.offset_of(page), self.page_size))
    }

    /// Bytes of `count` consecutive pages; copies when they span regions
    pub fn read_pages(&self, page: u64, count: u64) -> Result<Cow<'_, [u8]>> {
        if count == 0 || page + count > self.total_pages {
            return Err(Error::InvalidPageNumber(page + count.saturating_sub(1)));
        }
        let idx = self.region_index(page).ok_or(Error::InvalidPageNumber(page))?;
        let region = &self.regions[idx];
        let len = count as usize * self.page_size;
        if page + count <= region.end_page() {
            return Ok(Cow::Borrowed(region.slice(region.offset_of(page), len)));
        }

        let mut buffer = Vec::with_capacity(len);
        let mut current = page;
        while current < page + count {
            let region = &self.regions[self.region_index(current).ok_or(Error::InvalidPageNumber(current))?];
            let take = (page + count).min(region.end_page()) - current;
            buffer.extend_from_slice(region.slice(region.offset_of(current), take as usize * self.page_size));
            current += take;
        }
        Ok(Cow::Owned(buffer))
    }

    fn write_pages(&self, page: u64, data: &[u8]) -> Result<()> {
        let count = (data.len() + self.page_size - 1) / self.page_size;
        if page + count as u64 > self.total_pages {
            return Err(Error::InvalidPageNumber(page + count as u64 - 1));
        }
        let mut written = 0usize;
        let mut current = page;
        while written < data.len() {
            let idx = self.region_index(current).ok_or(Error::InvalidPageNumber(current))?;
            let region = &self.regions[idx];
            if region.protected.load(Ordering::Acquire) {
                return Err(Error::PageProtected(current));
            }
            let room = (region.end_page() - current) as usize * self.page_size;
            let take = room.min(data.len() - written);
            region.write(region.offset_of(current), &data[written..written + take]);
            written += take;
            current = region.end_page();
        }
        Ok(())
    }

    fn set_protection(&self, page: u64, count: u64, protected: bool) {
        for region in &self.regions {
            if region.first_page < page + count && region.end_page() > page {
                region.protected.store(protected, Ordering::Release);
            }
        }
    }

    fn flush(&self) -> Result<()> {
        for region in &self.regions {
            region.map.flush()?;
        }
        Ok(())
    }
}

impl Drop for PagerState {
    fn drop(&mut self) {
        if self.is_obsolete() {
            self.logger.debug(format_args!(
                "releasing obsolete pager state of {} pages in {} regions",
                self.total_pages,
                self.regions.len()
            ));
        }
    }
}

/// A page borrowed from a specific pager state; stays readable after the
/// pager grows or remaps.
pub struct PageRef {
    state: Arc<PagerState>,
    region: Arc<MappedRegion>,
    page_number: u64,
}

impl PageRef {
    pub fn page_number(&self) -> u64 {
        self.page_number
    }

    pub fn state(&self) -> &Arc<PagerState> {
        &self.state
    }

    pub fn bytes(&self) -> &[u8] {
        self.region.slice(self.region.offset_of(self.page_number), self.state.page_size)
    }
}

/// Memory-mapped page store
pub struct Pager {
    backing: PagerBacking,
    /// Current state; the mutex also serializes growth
    state: Mutex<Arc<PagerState>>,
    page_size: usize,
    protect: bool,
    logger: Logger,
}

impl Pager {
    /// Open or create a file-backed pager of at least `initial_size` bytes
    pub fn open_file(
        path: &Path,
        initial_size: u64,
        page_size: usize,
        protect: bool,
        logger: Logger,
    ) -> Result<Self> {
        Self::open_file_internal(path, initial_size, page_size, protect, false, logger)
    }

    /// Create a file-backed pager whose file is deleted when the pager is dropped
    pub fn create_temporary_file(
        path: &Path,
        initial_size: u64,
        page_size: usize,
        logger: Logger,
    ) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        Self::open_file_internal(path, initial_size, page_size, false, true, logger)
    }

    fn open_file_internal(
        path: &Path,
        initial_size: u64,
        page_size: usize,
        protect: bool,
        delete_on_drop: bool,
        logger: Logger,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let existing = file.metadata()?.len();
        let length = round_up_to_granularity(existing.max(initial_size));
        if length != existing {
            file.set_len(length)?;
        }

        let map = map_file_range(&file, 0, length)?;
        let region = Arc::new(MappedRegion::new(0, page_size, map, protect));
        logger.debug(format_args!("mapped {} ({} bytes)", path.display(), length));

        let state = PagerState::new(vec![region], page_size, logger.clone());
        Ok(Pager {
            backing: PagerBacking::File {
                file,
                path: path.to_path_buf(),
                delete_on_drop,
            },
            state: Mutex::new(Arc::new(state)),
            page_size,
            protect,
            logger,
        })
    }

    /// Create a pager over anonymous memory
    pub fn create_memory(
        initial_size: u64,
        page_size: usize,
        protect: bool,
        logger: Logger,
    ) -> Result<Self> {
        let length = round_up_to_granularity(initial_size);
        let map = map_anonymous(length)?;
        let region = Arc::new(MappedRegion::new(0, page_size, map, protect));
        let state = PagerState::new(vec![region], page_size, logger.clone());
        Ok(Pager {
            backing: PagerBacking::Memory,
            state: Mutex::new(Arc::new(state)),
            page_size,
            protect,
            logger,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            PagerBacking::File { path, .. } => Some(path),
            PagerBacking::Memory => None,
        }
    }

    /// The state new transactions should capture
    pub fn state(&self) -> Arc<PagerState> {
        self.state.lock().clone()
    }

    pub fn number_of_allocated_pages(&self) -> u64 {
        self.state.lock().number_of_pages()
    }

    /// A page handle tied to the current state
    pub fn page_ref(&self, page: u64) -> Result<PageRef> {
        let state = self.state();
        let idx = state.region_index(page).ok_or(Error::InvalidPageNumber(page))?;
        let region = state.regions[idx].clone();
        Ok(PageRef {
            state,
            region,
            page_number: page,
        })
    }

    /// Grow the mapping to at least `new_length` bytes.
    ///
    /// Returns `false` when the current mapping is already large enough.
    pub fn allocate_more_pages(&self, new_length: u64) -> Result<bool> {
        let new_length = round_up_to_granularity(new_length);
        let mut current = self.state.lock();
        let current_length = current.number_of_pages() * self.page_size as u64;
        if new_length <= current_length {
            return Ok(false);
        }

        let continuous = current.regions.len() < MAX_PAGER_REGIONS;
        let regions = match &self.backing {
            PagerBacking::File { file, .. } => {
                file.set_len(new_length)?;
                if continuous {
                    let map = map_file_range(file, current_length, new_length - current_length)?;
                    let mut regions = current.regions.clone();
                    regions.push(Arc::new(MappedRegion::new(
                        current.number_of_pages(),
                        self.page_size,
                        map,
                        self.protect,
                    )));
                    regions
                } else {
                    let map = map_file_range(file, 0, new_length)?;
                    vec![Arc::new(MappedRegion::new(0, self.page_size, map, self.protect))]
                }
            }
            PagerBacking::Memory => {
                if continuous {
                    let map = map_anonymous(new_length - current_length)?;
                    let mut regions = current.regions.clone();
                    regions.push(Arc::new(MappedRegion::new(
                        current.number_of_pages(),
                        self.page_size,
                        map,
                        self.protect,
                    )));
                    regions
                } else {
                    let mut map = map_anonymous(new_length)?;
                    let old = current.read_pages(0, current.number_of_pages())?;
                    map[..old.len()].copy_from_slice(&old);
                    vec![Arc::new(MappedRegion::new(0, self.page_size, map, self.protect))]
                }
            }
        };

        let new_state = Arc::new(PagerState::new(regions, self.page_size, self.logger.clone()));
        current.obsolete.store(true, Ordering::Release);
        self.logger.debug(format_args!(
            "grew pager from {} to {} bytes ({})",
            current_length,
            new_length,
            if continuous { "continuous" } else { "remapped" }
        ));
        *current = new_state;
        Ok(true)
    }

    /// Make sure pages `[page, page + count)` are mapped, growing generously
    pub fn ensure_continuous(&self, page: u64, count: u64) -> Result<()> {
        let required = (page + count) * self.page_size as u64;
        let current = self.number_of_allocated_pages() * self.page_size as u64;
        if required <= current {
            return Ok(());
        }
        const MAX_INCREASE: u64 = 1024 * 1024 * 1024;
        let grown = current + current.min(MAX_INCREASE);
        self.allocate_more_pages(required.max(grown))?;
        Ok(())
    }

    /// Copy `data` into the mapping starting at `page`
    pub fn write_pages(&self, page: u64, data: &[u8]) -> Result<()> {
        self.state().write_pages(page, data)
    }

    /// Mark the regions covering the range read-only
    pub fn protect_page_range(&self, page: u64, count: u64) {
        if self.protect {
            self.state().set_protection(page, count, true);
        }
    }

    /// Allow writes to the regions covering the range
    pub fn unprotect_page_range(&self, page: u64, count: u64) {
        if self.protect {
            self.state().set_protection(page, count, false);
        }
    }

    pub fn sync(&self) -> Result<()> {
        let state = self.state();
        state.flush()?;
        if let PagerBacking::File { file, .. } = &self.backing {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Hint the OS to load the given pages; best effort
    pub fn maybe_prefetch_memory(&self, pages: &[u64]) {
        #[cfg(unix)]
        {
            let state = self.state();
            for &page in pages {
                if let Some(idx) = state.region_index(page) {
                    let region = &state.regions[idx];
                    let offset = region.offset_of(page);
                    if let Err(e) =
                        region
                            .map
                            .advise_range(memmap2::Advice::WillNeed, offset, self.page_size)
                    {
                        self.logger.debug(format_args!("prefetch of page {} failed: {}", page, e));
                    }
                }
            }
        }
        #[cfg(not(unix))]
        let _ = pages;
    }

    /// Hint the OS to load the whole mapping; best effort
    pub fn try_prefetching_whole_file(&self) {
        #[cfg(unix)]
        {
            let state = self.state();
            for region in &state.regions {
                if let Err(e) = region.map.advise(memmap2::Advice::WillNeed) {
                    self.logger.debug(format_args!("prefetch of region failed: {}", e));
                }
            }
        }
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if let PagerBacking::File {
            path,
            delete_on_drop: true,
            ..
        } = &self.backing
        {
            if let Err(e) = fs::remove_file(path) {
                self.logger
                    .warn(format_args!("could not delete {}: {}", path.display(), e));
            }
        }
    }
}

fn round_up_to_granularity(length: u64) -> u64 {
    let length = length.max(ALLOCATION_GRANULARITY);
    (length + ALLOCATION_GRANULARITY - 1) / ALLOCATION_GRANULARITY * ALLOCATION_GRANULARITY
}

fn map_file_range(file: &File, offset: u64, length: u64) -> Result<MmapMut> {
    // Safety: the environment is the only writer of its data file.
    unsafe {
        MmapOptions::new()
            .offset(offset)
            .len(length as usize)
            .map_mut(file)
    }
    .map_err(|source| Error::OutOfMemory {
        requested: length,
        source,
    })
}

fn map_anonymous(length: u64) -> Result<MmapMut> {
    MmapOptions::new()
        .len(length as usize)
        .map_anon()
        .map_err(|source| Error::OutOfMemory {
            requested: length,
            source,
        })
}
