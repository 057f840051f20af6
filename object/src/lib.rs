//! Object model shared by the heap and its clients: tagged values, the
//! header word, built-in class ids and typed views over object layouts.

pub mod cid;
mod header;
mod heap_object;
mod objects;
mod value;

pub use header::{
    BitField, CLASS_ID_FIELD_OFFSET, CLASS_ID_FIELD_SIZE, ClassIdField, Header,
    HeaderFlags, SIZE_FIELD_OFFSET, SIZE_FIELD_SIZE, SizeField,
};
pub use heap_object::{
    HeapObject, NoBarrier, Slot, Slots, StoreBarrier, fill_words, read_word,
    write_word,
};
pub use objects::{
    Activation, Array, Behavior, ByteArray, Closure, Ephemeron, Float64,
    ForwardingCorpse, FreeListElement, LargeInteger, MediumInteger, Message,
    ObjectStore, RegularObject, Str, WeakArray, store_index,
};
pub use value::{HEAP_OBJECT_TAG, SMI_TAG, Value, ValueKind};

const _: () = assert!(usize::BITS == 64, "the header layout assumes 64-bit words");

pub const WORD_SIZE: usize = size_of::<usize>();
pub const WORD_SIZE_LOG2: u32 = WORD_SIZE.trailing_zeros();
pub const OBJECT_ALIGNMENT: usize = 2 * WORD_SIZE;
pub const OBJECT_ALIGNMENT_LOG2: u32 = OBJECT_ALIGNMENT.trailing_zeros();
pub const OLD_OBJECT_ALIGNMENT_OFFSET: usize = 0;
pub const NEW_OBJECT_ALIGNMENT_OFFSET: usize = WORD_SIZE;

/// Header word plus hash word.
pub const HEADER_WORDS: usize = 2;
pub const HEADER_SIZE: usize = HEADER_WORDS * WORD_SIZE;

#[inline(always)]
pub const fn allocation_size(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Word-aligned scratch memory standing in for a heap region.
    #[repr(C, align(16))]
    struct Scratch([usize; 64]);

    impl Scratch {
        fn new() -> Box<Self> {
            Box::new(Self([0; 64]))
        }

        fn old_addr(&self) -> usize {
            self.0.as_ptr() as usize
        }

        fn new_addr(&self) -> usize {
            self.old_addr() + NEW_OBJECT_ALIGNMENT_OFFSET
        }
    }

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn smi_zero_is_zero_bits() {
        assert_eq!(Value::from_smi(0).raw(), 0);
        assert_eq!(Value::default(), Value::from_smi(0));
    }

    #[test]
    fn smi_extremes() {
        let min = Value::from_smi(Value::SMI_MIN);
        let max = Value::from_smi(Value::SMI_MAX);
        assert_eq!(min.smi_value(), Value::SMI_MIN);
        assert_eq!(max.smi_value(), Value::SMI_MAX);
        assert!(Value::fits_smi(Value::SMI_MAX as i64));
        assert!(!Value::fits_smi(i64::MAX));
        assert!(min.is_immediate_or_old() && min.is_immediate_or_new());
    }

    #[test]
    fn generation_is_alignment() {
        let scratch = Scratch::new();
        let old = unsafe { HeapObject::initialize(scratch.old_addr(), cid::ARRAY, 32) };
        assert!(old.value().is_old_object());
        assert!(!old.value().is_new_object());
        assert!(old.value().is_immediate_or_old());

        let scratch = Scratch::new();
        let new = unsafe { HeapObject::initialize(scratch.new_addr(), cid::ARRAY, 32) };
        assert!(new.value().is_new_object());
        assert!(new.value().is_immediate_or_new());
        assert_eq!(new.addr(), scratch.new_addr());
        assert_eq!(new.value().kind(), ValueKind::Heap(new));
    }

    // ── Header ─────────────────────────────────────────────────────

    #[test]
    fn mark_bit_is_acquired_once() {
        let scratch = Scratch::new();
        let object = unsafe {
            HeapObject::initialize(scratch.old_addr(), cid::FIRST_REGULAR_OBJECT, 32)
        };
        assert!(!object.is_marked());
        assert!(object.try_acquire_mark_bit());
        assert!(!object.try_acquire_mark_bit());
        assert!(object.is_marked());
        object.set_is_marked(false);
        assert!(!object.is_marked());
        assert_eq!(object.cid(), cid::FIRST_REGULAR_OBJECT);
        assert_eq!(object.heap_size(), 32);
    }

    #[test]
    fn flags_are_independent() {
        let scratch = Scratch::new();
        let object = unsafe {
            HeapObject::initialize(scratch.old_addr(), cid::FIRST_REGULAR_OBJECT, 16)
        };
        object.set_is_remembered(true);
        object.set_is_canonical(true);
        assert!(!object.is_marked());
        assert!(object.is_remembered());
        object.set_cid(40);
        assert!(object.is_remembered() && object.is_canonical());
        assert_eq!(object.cid(), 40);
        assert_eq!(object.heap_size(), 16);
    }

    #[test]
    fn forwarding_word_reads_as_marked() {
        let from = Scratch::new();
        let to = Scratch::new();
        let old = unsafe { HeapObject::initialize(from.new_addr(), cid::ARRAY, 32) };
        let target = unsafe { HeapObject::initialize(to.new_addr(), cid::ARRAY, 32) };
        assert!(!old.is_forwarded());
        old.set_forwarding_target(target);
        assert!(old.is_forwarded());
        assert_eq!(old.forwarding_target(), target);
    }

    // ── Layouts ────────────────────────────────────────────────────

    #[test]
    fn array_pointers_cover_elements_only() {
        let scratch = Scratch::new();
        let size = Array::allocation_size(3);
        assert_eq!(size, 48);
        let object = unsafe { HeapObject::initialize(scratch.old_addr(), cid::ARRAY, size) };
        let array = Array::from_object(object);
        array.set_len(3);
        let slots: Vec<usize> = array.pointers().map(Slot::addr).collect();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0], object.addr() + Array::ELEMENTS * WORD_SIZE);
        array.set_element(2, Value::from_smi(7), &mut NoBarrier);
        assert_eq!(array.element(2), Value::from_smi(7));
    }

    #[test]
    fn weak_array_link_is_not_traced() {
        let scratch = Scratch::new();
        let size = WeakArray::allocation_size(2);
        let object =
            unsafe { HeapObject::initialize(scratch.old_addr(), cid::WEAK_ARRAY, size) };
        let weak = WeakArray::from_object(object);
        weak.set_len(2);
        let first = weak.pointers().next().map(Slot::addr);
        assert_eq!(first, Some(object.addr() + WeakArray::ELEMENTS * WORD_SIZE));
        assert_eq!(weak.pointers().len(), 2);
        assert!(weak.next().is_none());
    }

    #[test]
    fn activation_traces_live_stack() {
        let scratch = Box::new([0usize; 64]);
        let addr = (scratch.as_ptr() as usize + 15) & !15;
        let object = unsafe { HeapObject::initialize(addr, cid::ACTIVATION, Activation::SIZE) };
        let activation = Activation::from_object(object);
        assert_eq!(activation.pointers().len(), 6);
        activation.push(Value::from_smi(1), &mut NoBarrier);
        activation.push(Value::from_smi(2), &mut NoBarrier);
        assert_eq!(activation.pointers().len(), 8);
        assert_eq!(activation.pop(), Value::from_smi(2));
        assert_eq!(activation.stack_depth(), 1);
    }

    #[test]
    fn ephemeron_traces_triple() {
        let scratch = Scratch::new();
        let size = RegularObject::allocation_size(Ephemeron::NUM_SLOTS);
        let object =
            unsafe { HeapObject::initialize(scratch.old_addr(), cid::EPHEMERON, size) };
        assert_eq!(object.pointers().len(), 3);
    }

    #[test]
    fn regular_object_padding_is_traced() {
        let scratch = Scratch::new();
        let size = RegularObject::allocation_size(3);
        assert_eq!(size, 48);
        let object = unsafe {
            HeapObject::initialize(scratch.old_addr(), cid::FIRST_REGULAR_OBJECT, size)
        };
        assert_eq!(RegularObject::from_object(object).num_slots(), 4);
        assert_eq!(object.pointers().len(), 4);
    }

    #[test]
    fn byte_objects_have_no_pointers() {
        let scratch = Scratch::new();
        let size = Str::allocation_size(5);
        let object = unsafe { HeapObject::initialize(scratch.old_addr(), cid::STRING, size) };
        let string = Str::from_object(object);
        string.set_len(5);
        string.copy_from_slice(b"hello");
        assert_eq!(string.to_vec(), b"hello");
        assert_eq!(object.pointers().len(), 0);
    }

    #[test]
    fn corpse_overflow_size() {
        let scratch = Scratch::new();
        let huge = 1 << 21;
        let object = unsafe {
            HeapObject::initialize(scratch.old_addr(), cid::FORWARDING_CORPSE, huge)
        };
        assert_eq!(object.header().size_tag(), 0);
        assert_eq!(object.heap_size(), huge);
        assert_eq!(object.pointers().len(), 0);
    }

    #[test]
    fn cast_checks_class() {
        let scratch = Scratch::new();
        let object = unsafe { HeapObject::initialize(scratch.old_addr(), cid::FLOAT64, 32) };
        assert!(Float64::cast(object.value()).is_some());
        assert!(Array::cast(object.value()).is_none());
        assert!(Array::cast(Value::from_smi(3)).is_none());
    }
}
