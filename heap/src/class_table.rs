use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use object::{Value, cid};

/// Class id to class object. The marker reads entries concurrently, so the
/// storage is a fixed array of atomics shared through an `Arc`.
///
/// Free ids are chained through the table: a free entry holds the next free
/// id as a SmallInteger, and id zero terminates the chain.
#[derive(Debug)]
pub(crate) struct ClassTable {
    entries: Arc<[AtomicUsize]>,
    size: usize,
    free: usize,
}

impl ClassTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| AtomicUsize::new(Value::from_smi(0).raw()))
            .collect();
        Self {
            entries,
            size: cid::FIRST_REGULAR_OBJECT,
            free: 0,
        }
    }

    pub(crate) fn shared(&self) -> Arc<[AtomicUsize]> {
        Arc::clone(&self.entries)
    }

    #[inline(always)]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub(crate) fn at(&self, cid: usize) -> Value {
        class_at(&self.entries, cid)
    }

    #[inline(always)]
    pub(crate) fn set(&self, cid: usize, class: Value) {
        self.entries[cid].store(class.raw(), Ordering::Relaxed);
    }

    /// Pops the free chain or extends the used prefix. `None` once the
    /// table is exhausted.
    pub(crate) fn try_allocate(&mut self) -> Option<usize> {
        let cid = if self.free != 0 {
            let cid = self.free;
            self.free = self.at(cid).smi_value() as usize;
            cid
        } else if self.size < self.entries.len() {
            self.size += 1;
            self.size - 1
        } else {
            return None;
        };
        self.set(cid, Value::from_smi(0));
        Some(cid)
    }

    /// Returns `cid` to the free chain.
    pub(crate) fn release(&mut self, cid: usize) {
        debug_assert!(cid >= cid::FIRST_LEGAL && cid < self.size);
        self.set(cid, Value::from_smi(self.free as isize));
        self.free = cid;
    }
}

#[inline(always)]
pub(crate) fn class_at(entries: &[AtomicUsize], cid: usize) -> Value {
    Value::from_raw(entries[cid].load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_after_builtins() {
        let mut table = ClassTable::new(cid::FIRST_REGULAR_OBJECT + 2);
        assert_eq!(table.try_allocate(), Some(cid::FIRST_REGULAR_OBJECT));
        assert_eq!(table.try_allocate(), Some(cid::FIRST_REGULAR_OBJECT + 1));
        assert_eq!(table.try_allocate(), None);
    }

    #[test]
    fn test_free_chain_is_lifo() {
        let first = cid::FIRST_REGULAR_OBJECT;
        let mut table = ClassTable::new(first + 4);
        for _ in 0..4 {
            table.try_allocate();
        }
        table.release(first + 1);
        table.release(first + 3);
        assert_eq!(table.at(first + 1), Value::from_smi(0));
        assert_eq!(table.at(first + 3), Value::from_smi((first + 1) as isize));
        assert_eq!(table.try_allocate(), Some(first + 3));
        assert_eq!(table.try_allocate(), Some(first + 1));
        assert_eq!(table.try_allocate(), None);
    }
}
