use object::HeapObject;

use crate::system::round_up;

/// Old objects that may hold references into the young generation.
///
/// Duplicates are prevented by the remembered bit on each object, not by
/// this table. Entries are dropped lazily: a scavenge compacts the table
/// while rescanning it, and mark-sweep nulls entries for dead objects.
#[derive(Debug)]
pub(crate) struct RememberedSet {
    slots: Vec<Option<HeapObject>>,
    len: usize,
}

impl RememberedSet {
    const SHRINK_GRANULE: usize = 1024;

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            len: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn add(&mut self, object: HeapObject) {
        debug_assert!(object.is_old_object());
        if self.len == self.capacity() {
            let capacity = self.capacity() + self.capacity() / 2;
            self.resize(capacity);
        }
        self.slots[self.len] = Some(object);
        self.len += 1;
    }

    /// Starts an in-place rescan: returns the old length and empties the
    /// table. Entries below the returned length stay readable through
    /// [`Self::get`] while [`Self::add`] refills from index zero, which
    /// never overtakes the read cursor.
    pub(crate) fn begin_rescan(&mut self) -> usize {
        std::mem::replace(&mut self.len, 0)
    }

    #[inline(always)]
    pub(crate) fn get(&self, index: usize) -> Option<HeapObject> {
        self.slots[index]
    }

    pub(crate) fn clear(&mut self) {
        self.slots[..self.len].fill(None);
        self.len = 0;
    }

    /// Nulls every entry `keep` rejects.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(HeapObject) -> bool) {
        for entry in &mut self.slots[..self.len] {
            if entry.is_some_and(|object| !keep(object)) {
                *entry = None;
            }
        }
    }

    /// Compacts out null entries and resizes to 1.5x the occupancy.
    pub(crate) fn shrink(&mut self) {
        let mut live = 0;
        for index in 0..self.len {
            if let Some(object) = self.slots[index] {
                self.slots[live] = Some(object);
                live += 1;
            }
        }
        self.slots[live..self.len].fill(None);
        self.len = live;
        let preferred = round_up(live + live / 2 + 1, Self::SHRINK_GRANULE);
        if preferred < self.capacity() {
            self.resize(preferred);
        }
    }

    fn resize(&mut self, capacity: usize) {
        debug_assert!(capacity >= self.len);
        self.slots.resize(capacity, None);
        self.slots.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objects(count: usize) -> (Vec<u128>, Vec<HeapObject>) {
        let storage = vec![0u128; count];
        let base = storage.as_ptr() as usize;
        let objects = (0..count)
            .map(|i| unsafe { HeapObject::from_addr(base + i * 16) })
            .collect();
        (storage, objects)
    }

    #[test]
    fn test_grows_by_half() {
        let (_storage, objects) = objects(5);
        let mut set = RememberedSet::with_capacity(4);
        for &object in &objects {
            set.add(object);
        }
        assert_eq!(set.len(), 5);
        assert_eq!(set.capacity(), 6);
    }

    #[test]
    fn test_rescan_compacts_in_place() {
        let (_storage, objects) = objects(4);
        let mut set = RememberedSet::with_capacity(8);
        for &object in &objects {
            set.add(object);
        }
        let saved = set.begin_rescan();
        for index in 0..saved {
            let object = set.get(index).expect("entry");
            if index % 2 == 1 {
                set.add(object);
            }
        }
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(0), Some(objects[1]));
        assert_eq!(set.get(1), Some(objects[3]));
    }

    #[test]
    fn test_shrink_rounds_to_granule() {
        let (_storage, objects) = objects(3);
        let mut set = RememberedSet::with_capacity(4096);
        for &object in &objects {
            set.add(object);
        }
        set.retain(|object| object != objects[1]);
        set.shrink();
        assert_eq!(set.len(), 2);
        assert_eq!(set.capacity(), 1024);
        assert_eq!(set.get(1), Some(objects[2]));
    }
}
