use crate::system::VirtualMemory;

/// An old-generation region. Starts as a bump region; once the cursor is
/// abandoned the rest of the page belongs to the free list.
///
/// Pages start on an OS page boundary, so every object in them has the
/// old-generation alignment.
#[derive(Debug)]
pub(crate) struct HeapPage {
    memory: VirtualMemory,
    object_end: usize,
}

impl HeapPage {
    pub(crate) fn allocate(size: usize) -> Option<Self> {
        let memory = VirtualMemory::allocate(size)?;
        let object_end = memory.start();
        Some(Self { memory, object_end })
    }

    #[inline(always)]
    pub(crate) fn object_start(&self) -> usize {
        self.memory.start()
    }

    /// End of the prefix that holds objects or free-list elements.
    #[inline(always)]
    pub(crate) fn object_end(&self) -> usize {
        self.object_end
    }

    #[inline(always)]
    pub(crate) fn limit(&self) -> usize {
        self.memory.end()
    }

    #[inline(always)]
    pub(crate) fn size(&self) -> usize {
        self.memory.size()
    }

    #[inline(always)]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.memory.contains(addr)
    }

    /// Bump-allocates `size` bytes.
    pub(crate) fn try_allocate(&mut self, size: usize) -> Option<usize> {
        if self.limit() - self.object_end < size {
            return None;
        }
        let result = self.object_end;
        self.object_end += size;
        Some(result)
    }

    /// Gives up the bump cursor, returning the unused tail.
    pub(crate) fn take_remaining(&mut self) -> Option<(usize, usize)> {
        let remaining = self.limit() - self.object_end;
        if remaining == 0 {
            return None;
        }
        let start = self.object_end;
        self.object_end = self.limit();
        Some((start, remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OS_PAGE_SIZE;

    #[test]
    fn test_bump_until_full() {
        let mut page = HeapPage::allocate(OS_PAGE_SIZE).expect("map page");
        let first = page.try_allocate(4000).expect("room");
        assert_eq!(first, page.object_start());
        assert!(page.try_allocate(512).is_none());
        let (start, len) = page.take_remaining().expect("tail");
        assert_eq!(start, first + 4000);
        assert_eq!(len, OS_PAGE_SIZE - 4000);
        assert_eq!(page.object_end(), page.limit());
        assert!(page.take_remaining().is_none());
    }
}
