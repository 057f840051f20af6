use object::HeapObject;

/// Fixed-capacity chunk of a mark stack. Blocks chain through `next`, so an
/// unbounded stack is a list of bounded blocks and whole blocks can be
/// handed between the mutator and the marker.
#[derive(Debug)]
pub(crate) struct MarkBlock {
    objects: [Option<HeapObject>; MarkBlock::CAPACITY],
    top: usize,
    pub(crate) next: Option<Box<MarkBlock>>,
}

impl MarkBlock {
    pub(crate) const CAPACITY: usize = 126;

    pub(crate) fn new() -> Box<Self> {
        Box::new(Self {
            objects: [None; Self::CAPACITY],
            top: 0,
            next: None,
        })
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.top == 0
    }

    #[inline(always)]
    pub(crate) fn is_full(&self) -> bool {
        self.top == Self::CAPACITY
    }

    #[inline(always)]
    pub(crate) fn push(&mut self, object: HeapObject) {
        debug_assert!(!self.is_full());
        self.objects[self.top] = Some(object);
        self.top += 1;
    }

    #[inline(always)]
    pub(crate) fn pop(&mut self) -> Option<HeapObject> {
        if self.top == 0 {
            return None;
        }
        self.top -= 1;
        self.objects[self.top].take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_lifo() {
        let words = Box::new([0usize; 8]);
        let base = (words.as_ptr() as usize + 15) & !15;
        let a = unsafe { HeapObject::from_addr(base) };
        let b = unsafe { HeapObject::from_addr(base + 16) };
        let mut block = MarkBlock::new();
        assert!(block.is_empty());
        block.push(a);
        block.push(b);
        assert_eq!(block.pop(), Some(b));
        assert_eq!(block.pop(), Some(a));
        assert_eq!(block.pop(), None);
    }

    #[test]
    fn test_capacity() {
        let words = Box::new([0usize; 4]);
        let base = (words.as_ptr() as usize + 15) & !15;
        let object = unsafe { HeapObject::from_addr(base) };
        let mut block = MarkBlock::new();
        for _ in 0..MarkBlock::CAPACITY {
            block.push(object);
        }
        assert!(block.is_full());
    }
}
