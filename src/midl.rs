use std::collections::BTreeSet;

/// Sorted set of page numbers.
///
/// Used for the environment's free space: pages are handed out lowest first
/// and multi-page requests are served from the first contiguous run that is
/// long enough.
#[derive(Debug, Clone, Default)]
pub(crate) struct PageList {
    pages: BTreeSet<u64>,
}

impl PageList {
    pub(crate) fn new() -> Self {
        PageList::default()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn extend<I: IntoIterator<Item = u64>>(&mut self, pages: I) {
        self.pages.extend(pages)
    }

    /// Take `count` consecutive pages, returning the first one
    pub(crate) fn allocate(&mut self, count: u64) -> Option<u64> {
        if count == 0 {
            return None;
        }
        let mut run_start = None;
        let mut run_len = 0u64;
        let mut previous = None;
        for &page in &self.pages {
            match previous {
                Some(prev) if prev + 1 == page => run_len += 1,
                _ => {
                    run_start = Some(page);
                    run_len = 1;
                }
            }
            previous = Some(page);
            if run_len == count {
                break;
            }
        }
        if run_len < count {
            return None;
        }
        let first = run_start?;
        for page in first..first + count {
            self.pages.remove(&page);
        }
        Some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_pages_come_out_lowest_first() {
        let mut list = PageList::new();
        list.extend([9, 4, 7]);
        assert_eq!(list.allocate(1), Some(4));
        assert_eq!(list.allocate(1), Some(7));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn runs_must_be_contiguous() {
        let mut list = PageList::new();
        list.extend([2, 3, 5, 6, 7, 10]);
        assert_eq!(list.allocate(3), Some(5));
        assert_eq!(list.allocate(3), None);
        assert_eq!(list.allocate(2), Some(2));
        assert_eq!(list.allocate(1), Some(10));
        assert!(list.is_empty());
    }
}
