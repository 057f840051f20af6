use object::NEW_OBJECT_ALIGNMENT_OFFSET;

use crate::system::VirtualMemory;

/// One half of the young generation.
///
/// Objects start one word past the 16-byte alignment, which is what marks
/// them as young.
#[derive(Debug)]
pub(crate) struct Semispace {
    memory: VirtualMemory,
}

impl Semispace {
    pub(crate) fn allocate(size: usize) -> Option<Self> {
        VirtualMemory::allocate(size).map(|memory| Self { memory })
    }

    #[inline(always)]
    pub(crate) fn object_start(&self) -> usize {
        self.memory.start() + NEW_OBJECT_ALIGNMENT_OFFSET
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

    /// Poisons the whole space so stale references fault loudly.
    pub(crate) fn mark_unallocated(&self) {
        self.memory.fill(self.memory.start(), self.memory.size(), 0xab);
    }
}
