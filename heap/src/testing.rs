//! Heap fixtures shared by the unit tests.

use object::{Array, Behavior, Message, Value, store_index};

use crate::{Allocator, Heap, HeapSettings};

/// Class id of class objects.
pub(crate) const CLASS_CID: usize = object::cid::FIRST_REGULAR_OBJECT;
/// Class id of nil, true, false and plain test objects.
pub(crate) const OBJECT_CID: usize = object::cid::FIRST_REGULAR_OBJECT + 1;

pub(crate) fn small_settings() -> HeapSettings {
    HeapSettings {
        initial_semispace_capacity: 64 * 1024,
        max_semispace_capacity: 256 * 1024,
        page_size: 64 * 1024,
        large_allocation: 8 * 1024,
        remembered_set_capacity: 16,
        class_table_capacity: 64,
    }
}

pub(crate) fn bootstrap() -> Heap {
    bootstrap_with(small_settings())
}

/// A heap with an installed object store holding nil, false, true and an
/// unregistered `Message` class. Everything bootstrapped lives in old space.
pub(crate) fn bootstrap_with(settings: HeapSettings) -> Heap {
    let mut heap = Heap::new(settings);
    let store = heap.allocate_array(store_index::COUNT, Allocator::Snapshot);

    assert_eq!(heap.allocate_class_id(), CLASS_CID);
    assert_eq!(heap.allocate_class_id(), OBJECT_CID);
    let nil = heap
        .allocate_regular_object(OBJECT_CID, 0, Allocator::Snapshot)
        .value();
    for index in 0..store.len() {
        store.set_element(index, nil, &mut heap);
    }

    let metaclass = new_behavior(&mut heap, nil, Behavior::NUM_SLOTS, Allocator::Snapshot);
    heap.register_class(CLASS_CID, metaclass);
    let object_class = new_behavior(&mut heap, nil, 0, Allocator::Snapshot);
    heap.register_class(OBJECT_CID, object_class);

    let false_object = heap.allocate_regular_object(OBJECT_CID, 0, Allocator::Snapshot);
    let true_object = heap.allocate_regular_object(OBJECT_CID, 0, Allocator::Snapshot);
    store.set_element(store_index::FALSE, false_object.value(), &mut heap);
    store.set_element(store_index::TRUE, true_object.value(), &mut heap);

    let message_class = new_behavior(&mut heap, nil, Message::NUM_SLOTS, Allocator::Snapshot);
    store.set_element(store_index::MESSAGE_CLASS, message_class.value(), &mut heap);

    heap.initialize_root(store);
    heap
}

/// A class object whose slots are nil and whose id is unassigned.
pub(crate) fn new_behavior(
    heap: &mut Heap,
    nil: Value,
    format: usize,
    allocator: Allocator,
) -> Behavior {
    let object = heap.allocate_regular_object(CLASS_CID, Behavior::NUM_SLOTS, allocator);
    let class = Behavior::from_object(object.object());
    for index in 0..Behavior::NUM_SLOTS {
        class.set_slot(index, nil, heap);
    }
    class.set_format(format);
    class
}

/// Registers a fresh young class and returns its id.
pub(crate) fn new_class(heap: &mut Heap, format: usize) -> usize {
    let cid = heap.allocate_class_id();
    let nil = heap.nil();
    let class = new_behavior(heap, nil, format, Allocator::Normal);
    heap.register_class(cid, class);
    cid
}

/// A young array filled with `values`.
pub(crate) fn array_of(heap: &mut Heap, values: &[Value]) -> Array {
    let array = heap.allocate_array(values.len(), Allocator::Normal);
    for (index, &value) in values.iter().enumerate() {
        array.set_element(index, value, heap);
    }
    array
}
