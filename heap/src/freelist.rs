//! Segregated free list for the old generation.
//!
//! Buckets `0..SIZE_CLASSES` hold elements of exactly `index * 16` bytes;
//! the last bucket takes everything larger and is searched first-fit.

use object::{
    FreeListElement, HeapObject, OBJECT_ALIGNMENT, OBJECT_ALIGNMENT_LOG2, cid,
    fill_words,
};

pub(crate) const SIZE_CLASSES: usize = 7;

const UNALLOCATED_WORD: usize = usize::from_ne_bytes([0xab; size_of::<usize>()]);

#[derive(Debug, Default)]
pub(crate) struct FreeList {
    heads: [Option<FreeListElement>; SIZE_CLASSES + 1],
}

impl FreeList {
    #[inline(always)]
    pub(crate) fn index_for_size(size: usize) -> usize {
        (size >> OBJECT_ALIGNMENT_LOG2).min(SIZE_CLASSES)
    }

    pub(crate) fn reset(&mut self) {
        self.heads = Default::default();
    }

    /// Turns `addr..addr + size` into a free-list element. The range keeps
    /// a valid header so heap walks can step over it.
    pub(crate) fn enqueue_range(&mut self, addr: usize, size: usize) {
        debug_assert!(size >= OBJECT_ALIGNMENT && size.is_multiple_of(OBJECT_ALIGNMENT));
        // SAFETY: the range is dead storage owned by the old generation
        let object = unsafe {
            if cfg!(debug_assertions) {
                fill_words(addr, size, UNALLOCATED_WORD);
            }
            HeapObject::initialize(addr, cid::FREE_LIST_ELEMENT, size)
        };
        let element = FreeListElement::from_object(object);
        let index = Self::index_for_size(size);
        element.set_next(self.heads[index]);
        self.heads[index] = Some(element);
    }

    pub(crate) fn try_allocate(&mut self, size: usize) -> Option<usize> {
        for index in Self::index_for_size(size)..SIZE_CLASSES {
            if let Some(element) = self.heads[index] {
                self.heads[index] = element.next();
                return Some(self.split_and_requeue(element, size));
            }
        }

        let mut previous: Option<FreeListElement> = None;
        let mut current = self.heads[SIZE_CLASSES];
        while let Some(element) = current {
            if element.heap_size() >= size {
                match previous {
                    Some(previous) => previous.set_next(element.next()),
                    None => self.heads[SIZE_CLASSES] = element.next(),
                }
                return Some(self.split_and_requeue(element, size));
            }
            previous = Some(element);
            current = element.next();
        }
        None
    }

    fn split_and_requeue(&mut self, element: FreeListElement, size: usize) -> usize {
        let addr = element.addr();
        let remaining = element.heap_size() - size;
        if remaining > 0 {
            self.enqueue_range(addr + size, remaining);
        }
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::VirtualMemory;
    use proptest::prelude::*;

    #[test]
    fn test_index_for_size() {
        assert_eq!(FreeList::index_for_size(16), 1);
        assert_eq!(FreeList::index_for_size(96), 6);
        assert_eq!(FreeList::index_for_size(112), SIZE_CLASSES);
        assert_eq!(FreeList::index_for_size(1 << 20), SIZE_CLASSES);
    }

    #[test]
    fn test_exact_bucket_before_catch_all() {
        let memory = VirtualMemory::allocate(4096).expect("map");
        let mut list = FreeList::default();
        let large = memory.start();
        let exact = memory.start() + 1024;
        list.enqueue_range(large, 1024);
        list.enqueue_range(exact, 48);
        assert_eq!(list.try_allocate(48), Some(exact));
        assert_eq!(list.try_allocate(48), Some(large));
    }

    #[test]
    fn test_split_requeues_tail() {
        let memory = VirtualMemory::allocate(4096).expect("map");
        let mut list = FreeList::default();
        list.enqueue_range(memory.start(), 256);
        assert_eq!(list.try_allocate(64), Some(memory.start()));
        // 192 bytes left in the catch-all bucket
        assert_eq!(list.try_allocate(192), Some(memory.start() + 64));
        assert_eq!(list.try_allocate(16), None);
    }

    #[test]
    fn test_first_fit_unlinks_middle() {
        let memory = VirtualMemory::allocate(8192).expect("map");
        let mut list = FreeList::default();
        let a = memory.start();
        let b = a + 2048;
        let c = b + 2048;
        list.enqueue_range(a, 128);
        list.enqueue_range(b, 512);
        list.enqueue_range(c, 128);
        assert_eq!(list.try_allocate(512), Some(b));
        assert!(list.try_allocate(128).is_some());
        assert!(list.try_allocate(128).is_some());
        assert_eq!(list.try_allocate(128), None);
    }

    proptest! {
        #[test]
        fn test_allocations_never_overlap(units in prop::collection::vec(1usize..64, 1..200)) {
            let memory = VirtualMemory::allocate(64 * 1024).expect("map");
            let mut list = FreeList::default();
            list.enqueue_range(memory.start(), memory.size());
            let mut blocks: Vec<(usize, usize)> = Vec::new();
            for unit in units {
                let size = unit * OBJECT_ALIGNMENT;
                let Some(addr) = list.try_allocate(size) else { break };
                prop_assert!(addr >= memory.start() && addr + size <= memory.end());
                prop_assert!(addr.is_multiple_of(OBJECT_ALIGNMENT));
                for &(other, other_size) in &blocks {
                    prop_assert!(addr + size <= other || other + other_size <= addr);
                }
                blocks.push((addr, size));
            }
        }
    }
}
