//! Typed views over heap objects.
//!
//! Every layout starts with the header word and the hash word; the word
//! indices below count from the object start. Reference stores take a
//! [`StoreBarrier`].

use crate::{
    HEADER_WORDS, HeapObject, NoBarrier, StoreBarrier, Value, WORD_SIZE,
    allocation_size, cid,
};

macro_rules! heap_object_view {
    ($(#[$meta:meta])* $name:ident, |$cid:ident| $check:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        #[repr(transparent)]
        pub struct $name(HeapObject);

        impl $name {
            #[inline(always)]
            fn accepts($cid: usize) -> bool {
                $check
            }

            /// Reinterprets `object` as this view; the class id is only
            /// checked in debug builds.
            #[inline(always)]
            pub fn from_object(object: HeapObject) -> Self {
                debug_assert!(Self::accepts(object.cid()), "{object:?}");
                Self(object)
            }

            #[inline(always)]
            pub fn cast(value: Value) -> Option<Self> {
                value
                    .as_heap_object()
                    .filter(|object| Self::accepts(object.cid()))
                    .map(Self)
            }

            #[inline(always)]
            pub fn object(self) -> HeapObject {
                self.0
            }

            #[inline(always)]
            pub fn value(self) -> Value {
                self.0.value()
            }
        }

        impl core::ops::Deref for $name {
            type Target = HeapObject;

            #[inline(always)]
            fn deref(&self) -> &HeapObject {
                &self.0
            }
        }
    };
}

#[inline(always)]
fn store(
    object: HeapObject,
    index: usize,
    value: Value,
    barrier: &mut impl StoreBarrier,
) {
    object.slot(index).store(value);
    barrier.on_store(object, value);
}

// ── Numbers ────────────────────────────────────────────────────────

heap_object_view!(
    /// Boxed 64-bit integer for values outside the SmallInteger range.
    MediumInteger, |c| c == cid::MEDIUM_INTEGER
);

impl MediumInteger {
    pub const VALUE: usize = HEADER_WORDS;
    pub const SIZE: usize = allocation_size((Self::VALUE + 1) * WORD_SIZE);

    pub fn get(self) -> i64 {
        self.raw_at(Self::VALUE) as i64
    }

    pub fn set(self, value: i64) {
        self.set_raw_at(Self::VALUE, value as usize);
    }
}

heap_object_view!(
    /// Arbitrary-precision integer with 32-bit digits.
    ///
    /// ```text
    /// [header] [hash] [capacity] [negative] [size] [digit_0 digit_1] ...
    /// ```
    LargeInteger, |c| c == cid::LARGE_INTEGER
);

impl LargeInteger {
    pub const CAPACITY: usize = HEADER_WORDS;
    pub const NEGATIVE: usize = HEADER_WORDS + 1;
    pub const USED: usize = HEADER_WORDS + 2;
    pub const DIGITS: usize = HEADER_WORDS + 3;

    pub const fn allocation_size(capacity: usize) -> usize {
        allocation_size(Self::DIGITS * WORD_SIZE + capacity * size_of::<u32>())
    }

    pub fn capacity(self) -> usize {
        self.raw_at(Self::CAPACITY)
    }

    pub fn set_capacity(self, capacity: usize) {
        self.set_raw_at(Self::CAPACITY, capacity);
    }

    pub fn negative(self) -> bool {
        self.raw_at(Self::NEGATIVE) != 0
    }

    pub fn set_negative(self, negative: bool) {
        self.set_raw_at(Self::NEGATIVE, negative as usize);
    }

    pub fn used(self) -> usize {
        self.raw_at(Self::USED)
    }

    pub fn set_used(self, used: usize) {
        debug_assert!(used <= self.capacity());
        self.set_raw_at(Self::USED, used);
    }

    fn digit_ptr(self, index: usize) -> *mut u32 {
        assert!(index < self.capacity(), "digit {index} out of bounds");
        (self.addr() + Self::DIGITS * WORD_SIZE + index * size_of::<u32>()) as *mut u32
    }

    pub fn digit(self, index: usize) -> u32 {
        // SAFETY: bounds checked against capacity
        unsafe { self.digit_ptr(index).read() }
    }

    pub fn set_digit(self, index: usize, digit: u32) {
        // SAFETY: bounds checked against capacity
        unsafe { self.digit_ptr(index).write(digit) }
    }
}

heap_object_view!(Float64, |c| c == cid::FLOAT64);

impl Float64 {
    pub const VALUE: usize = HEADER_WORDS;
    pub const SIZE: usize = allocation_size((Self::VALUE + 1) * WORD_SIZE);

    pub fn get(self) -> f64 {
        f64::from_bits(self.raw_at(Self::VALUE) as u64)
    }

    pub fn set(self, value: f64) {
        self.set_raw_at(Self::VALUE, value.to_bits() as usize);
    }
}

// ── Bytes ──────────────────────────────────────────────────────────

macro_rules! bytes_accessors {
    ($name:ident) => {
        impl $name {
            pub const LENGTH: usize = HEADER_WORDS;
            pub const BYTES: usize = HEADER_WORDS + 1;

            pub const fn allocation_size(length: usize) -> usize {
                allocation_size(Self::BYTES * WORD_SIZE + length)
            }

            pub fn len(self) -> usize {
                self.smi_at(Self::LENGTH)
            }

            pub fn is_empty(self) -> bool {
                self.len() == 0
            }

            pub fn set_len(self, length: usize) {
                self.set_raw_at(Self::LENGTH, Value::from_smi(length as isize).raw());
            }

            fn bytes_ptr(self) -> *mut u8 {
                (self.addr() + Self::BYTES * WORD_SIZE) as *mut u8
            }

            pub fn byte(self, index: usize) -> u8 {
                assert!(index < self.len(), "byte {index} out of bounds");
                // SAFETY: bounds checked against the length field
                unsafe { self.bytes_ptr().add(index).read() }
            }

            pub fn set_byte(self, index: usize, byte: u8) {
                assert!(index < self.len(), "byte {index} out of bounds");
                // SAFETY: bounds checked against the length field
                unsafe { self.bytes_ptr().add(index).write(byte) }
            }

            pub fn copy_from_slice(self, bytes: &[u8]) {
                assert_eq!(bytes.len(), self.len());
                // SAFETY: the body holds exactly `len` bytes
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        self.bytes_ptr(),
                        bytes.len(),
                    )
                }
            }

            pub fn to_vec(self) -> Vec<u8> {
                let mut out = vec![0; self.len()];
                // SAFETY: the body holds exactly `len` bytes
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        self.bytes_ptr(),
                        out.as_mut_ptr(),
                        out.len(),
                    )
                }
                out
            }
        }
    };
}

heap_object_view!(ByteArray, |c| c == cid::BYTE_ARRAY);
bytes_accessors!(ByteArray);

heap_object_view!(
    /// Byte-encoded string. Shares the [`ByteArray`] layout.
    Str, |c| c == cid::STRING
);
bytes_accessors!(Str);

// ── Arrays ─────────────────────────────────────────────────────────

heap_object_view!(Array, |c| c == cid::ARRAY);

impl Array {
    pub const LENGTH: usize = HEADER_WORDS;
    pub const ELEMENTS: usize = HEADER_WORDS + 1;

    pub const fn allocation_size(length: usize) -> usize {
        allocation_size((Self::ELEMENTS + length) * WORD_SIZE)
    }

    pub fn len(self) -> usize {
        self.smi_at(Self::LENGTH)
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn set_len(self, length: usize) {
        self.set_raw_at(Self::LENGTH, Value::from_smi(length as isize).raw());
    }

    #[inline]
    pub fn element(self, index: usize) -> Value {
        assert!(index < self.len(), "index {index} out of bounds");
        self.slot(Self::ELEMENTS + index).load()
    }

    #[inline]
    pub fn set_element(self, index: usize, value: Value, barrier: &mut impl StoreBarrier) {
        assert!(index < self.len(), "index {index} out of bounds");
        store(self.0, Self::ELEMENTS + index, value, barrier);
    }
}

heap_object_view!(
    /// Array whose elements do not keep their referents alive across a
    /// mark-sweep. The list link is private to the collector.
    WeakArray, |c| c == cid::WEAK_ARRAY
);

impl WeakArray {
    pub const LENGTH: usize = HEADER_WORDS;
    pub const NEXT: usize = HEADER_WORDS + 1;
    pub const ELEMENTS: usize = HEADER_WORDS + 2;

    pub const fn allocation_size(length: usize) -> usize {
        allocation_size((Self::ELEMENTS + length) * WORD_SIZE)
    }

    pub fn len(self) -> usize {
        self.smi_at(Self::LENGTH)
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn set_len(self, length: usize) {
        self.set_raw_at(Self::LENGTH, Value::from_smi(length as isize).raw());
    }

    pub fn element(self, index: usize) -> Value {
        assert!(index < self.len(), "index {index} out of bounds");
        self.slot(Self::ELEMENTS + index).load()
    }

    pub fn set_element(self, index: usize, value: Value, barrier: &mut impl StoreBarrier) {
        assert!(index < self.len(), "index {index} out of bounds");
        store(self.0, Self::ELEMENTS + index, value, barrier);
    }

    /// Collector-private list link; zero terminates.
    pub fn next(self) -> Option<WeakArray> {
        Value::from_raw(self.raw_at(Self::NEXT))
            .as_heap_object()
            .map(Self::from_object)
    }

    pub fn set_next(self, next: Option<WeakArray>) {
        self.set_raw_at(Self::NEXT, next.map_or(0, |n| n.value().raw()));
    }
}

heap_object_view!(
    /// Key/value/finalizer triple whose value and finalizer are only
    /// reachable through it while its key is otherwise reachable.
    Ephemeron, |c| c == cid::EPHEMERON
);

impl Ephemeron {
    pub const KEY: usize = HEADER_WORDS;
    pub const VALUE: usize = HEADER_WORDS + 1;
    pub const FINALIZER: usize = HEADER_WORDS + 2;
    pub const NEXT: usize = HEADER_WORDS + 3;
    pub const NUM_SLOTS: usize = 4;

    pub fn key(self) -> Value {
        self.slot(Self::KEY).load()
    }

    pub fn set_key(self, key: Value, barrier: &mut impl StoreBarrier) {
        store(self.0, Self::KEY, key, barrier);
    }

    pub fn value_slot(self) -> Value {
        self.slot(Self::VALUE).load()
    }

    pub fn set_value_slot(self, value: Value, barrier: &mut impl StoreBarrier) {
        store(self.0, Self::VALUE, value, barrier);
    }

    pub fn finalizer(self) -> Value {
        self.slot(Self::FINALIZER).load()
    }

    pub fn set_finalizer(self, finalizer: Value, barrier: &mut impl StoreBarrier) {
        store(self.0, Self::FINALIZER, finalizer, barrier);
    }

    /// Collector-private list link; zero terminates.
    pub fn next(self) -> Option<Ephemeron> {
        Value::from_raw(self.raw_at(Self::NEXT))
            .as_heap_object()
            .map(Self::from_object)
    }

    pub fn set_next(self, next: Option<Ephemeron>) {
        self.set_raw_at(Self::NEXT, next.map_or(0, |n| n.value().raw()));
    }
}

// ── Execution state ────────────────────────────────────────────────

heap_object_view!(
    /// A method or block activation with a fixed-size temporary stack.
    /// Only `temps[..stack_depth]` is traced.
    Activation, |c| c == cid::ACTIVATION
);

impl Activation {
    pub const SENDER: usize = HEADER_WORDS;
    pub const BCI: usize = HEADER_WORDS + 1;
    pub const METHOD: usize = HEADER_WORDS + 2;
    pub const CLOSURE: usize = HEADER_WORDS + 3;
    pub const RECEIVER: usize = HEADER_WORDS + 4;
    pub const STACK_DEPTH: usize = HEADER_WORDS + 5;
    pub const TEMPS: usize = HEADER_WORDS + 6;
    pub const MAX_TEMPS: usize = 35;
    pub const SIZE: usize = allocation_size((Self::TEMPS + Self::MAX_TEMPS) * WORD_SIZE);

    pub fn sender(self) -> Value {
        self.slot(Self::SENDER).load()
    }

    pub fn set_sender(self, sender: Value, barrier: &mut impl StoreBarrier) {
        store(self.0, Self::SENDER, sender, barrier);
    }

    pub fn bci(self) -> Value {
        self.slot(Self::BCI).load()
    }

    pub fn set_bci(self, bci: Value) {
        store(self.0, Self::BCI, bci, &mut NoBarrier);
    }

    pub fn method(self) -> Value {
        self.slot(Self::METHOD).load()
    }

    pub fn set_method(self, method: Value, barrier: &mut impl StoreBarrier) {
        store(self.0, Self::METHOD, method, barrier);
    }

    pub fn closure(self) -> Value {
        self.slot(Self::CLOSURE).load()
    }

    pub fn set_closure(self, closure: Value, barrier: &mut impl StoreBarrier) {
        store(self.0, Self::CLOSURE, closure, barrier);
    }

    pub fn receiver(self) -> Value {
        self.slot(Self::RECEIVER).load()
    }

    pub fn set_receiver(self, receiver: Value, barrier: &mut impl StoreBarrier) {
        store(self.0, Self::RECEIVER, receiver, barrier);
    }

    pub fn stack_depth(self) -> usize {
        self.smi_at(Self::STACK_DEPTH)
    }

    pub fn set_stack_depth(self, depth: usize) {
        assert!(depth <= Self::MAX_TEMPS, "stack depth {depth} exceeds frame");
        store(
            self.0,
            Self::STACK_DEPTH,
            Value::from_smi(depth as isize),
            &mut NoBarrier,
        );
    }

    pub fn temp(self, index: usize) -> Value {
        assert!(index < self.stack_depth());
        self.slot(Self::TEMPS + index).load()
    }

    pub fn set_temp(self, index: usize, value: Value, barrier: &mut impl StoreBarrier) {
        assert!(index < self.stack_depth());
        store(self.0, Self::TEMPS + index, value, barrier);
    }

    pub fn push(self, value: Value, barrier: &mut impl StoreBarrier) {
        let depth = self.stack_depth();
        self.set_stack_depth(depth + 1);
        self.set_temp(depth, value, barrier);
    }

    pub fn pop(self) -> Value {
        let depth = self.stack_depth();
        assert!(depth > 0, "pop from empty activation");
        let top = self.temp(depth - 1);
        self.set_stack_depth(depth - 1);
        top
    }
}

heap_object_view!(Closure, |c| c == cid::CLOSURE);

impl Closure {
    pub const NUM_COPIED: usize = HEADER_WORDS;
    pub const DEFINING_ACTIVATION: usize = HEADER_WORDS + 1;
    pub const INITIAL_BCI: usize = HEADER_WORDS + 2;
    pub const NUM_ARGS: usize = HEADER_WORDS + 3;
    pub const COPIED: usize = HEADER_WORDS + 4;

    pub const fn allocation_size(num_copied: usize) -> usize {
        allocation_size((Self::COPIED + num_copied) * WORD_SIZE)
    }

    pub fn num_copied(self) -> usize {
        self.smi_at(Self::NUM_COPIED)
    }

    pub fn set_num_copied(self, num_copied: usize) {
        self.set_raw_at(Self::NUM_COPIED, Value::from_smi(num_copied as isize).raw());
    }

    pub fn defining_activation(self) -> Value {
        self.slot(Self::DEFINING_ACTIVATION).load()
    }

    pub fn set_defining_activation(
        self,
        activation: Value,
        barrier: &mut impl StoreBarrier,
    ) {
        store(self.0, Self::DEFINING_ACTIVATION, activation, barrier);
    }

    pub fn initial_bci(self) -> Value {
        self.slot(Self::INITIAL_BCI).load()
    }

    pub fn set_initial_bci(self, bci: Value) {
        store(self.0, Self::INITIAL_BCI, bci, &mut NoBarrier);
    }

    pub fn num_args(self) -> Value {
        self.slot(Self::NUM_ARGS).load()
    }

    pub fn set_num_args(self, num_args: Value) {
        store(self.0, Self::NUM_ARGS, num_args, &mut NoBarrier);
    }

    pub fn copied(self, index: usize) -> Value {
        assert!(index < self.num_copied());
        self.slot(Self::COPIED + index).load()
    }

    pub fn set_copied(self, index: usize, value: Value, barrier: &mut impl StoreBarrier) {
        assert!(index < self.num_copied());
        store(self.0, Self::COPIED + index, value, barrier);
    }
}

// ── Regular objects ────────────────────────────────────────────────

heap_object_view!(
    /// An instance of a user class: a header followed by slots.
    RegularObject, |c| cid::is_regular_object(c)
);

impl RegularObject {
    /// Heap size for `num_slots`, padded to the object alignment. The
    /// padding slot, if any, is traced and must hold an immediate.
    pub const fn allocation_size(num_slots: usize) -> usize {
        allocation_size((HEADER_WORDS + num_slots) * WORD_SIZE)
    }

    pub fn num_slots(self) -> usize {
        self.heap_size() / WORD_SIZE - HEADER_WORDS
    }

    pub fn slot_at(self, index: usize) -> Value {
        assert!(index < self.num_slots(), "slot {index} out of bounds");
        self.slot(HEADER_WORDS + index).load()
    }

    pub fn set_slot_at(self, index: usize, value: Value, barrier: &mut impl StoreBarrier) {
        assert!(index < self.num_slots(), "slot {index} out of bounds");
        store(self.0, HEADER_WORDS + index, value, barrier);
    }
}

heap_object_view!(
    /// A class object. Its id slot holds the class id it was registered
    /// under, or nil.
    Behavior, |c| cid::is_regular_object(c)
);

impl Behavior {
    pub const SUPERCLASS: usize = 0;
    pub const METHODS: usize = 1;
    pub const ENCLOSING_OBJECT: usize = 2;
    pub const MIXIN: usize = 3;
    pub const ID: usize = 4;
    pub const FORMAT: usize = 5;
    pub const NAME: usize = 6;
    pub const SUBCLASSES: usize = 7;
    pub const NUM_SLOTS: usize = 8;

    fn regular(self) -> RegularObject {
        RegularObject(self.0)
    }

    pub fn id(self) -> Value {
        self.regular().slot_at(Self::ID)
    }

    pub fn set_id(self, id: Value) {
        self.regular().set_slot_at(Self::ID, id, &mut NoBarrier);
    }

    /// Number of slots in an instance.
    pub fn format(self) -> usize {
        let format = self.regular().slot_at(Self::FORMAT).smi_value();
        debug_assert!(format >= 0);
        format as usize
    }

    pub fn set_format(self, num_slots: usize) {
        self.regular().set_slot_at(
            Self::FORMAT,
            Value::from_smi(num_slots as isize),
            &mut NoBarrier,
        );
    }

    pub fn set_slot(self, index: usize, value: Value, barrier: &mut impl StoreBarrier) {
        self.regular().set_slot_at(index, value, barrier);
    }
}

heap_object_view!(
    /// A reified send: selector plus argument array.
    Message, |c| cid::is_regular_object(c)
);

impl Message {
    pub const SELECTOR: usize = 0;
    pub const ARGUMENTS: usize = 1;
    pub const NUM_SLOTS: usize = 2;

    pub fn selector(self) -> Value {
        self.slot(HEADER_WORDS + Self::SELECTOR).load()
    }

    pub fn set_selector(self, selector: Value, barrier: &mut impl StoreBarrier) {
        store(self.0, HEADER_WORDS + Self::SELECTOR, selector, barrier);
    }

    pub fn arguments(self) -> Value {
        self.slot(HEADER_WORDS + Self::ARGUMENTS).load()
    }

    pub fn set_arguments(self, arguments: Value, barrier: &mut impl StoreBarrier) {
        store(self.0, HEADER_WORDS + Self::ARGUMENTS, arguments, barrier);
    }
}

// ── Collector-owned shapes ─────────────────────────────────────────

heap_object_view!(
    /// Left behind by `become`: the hash word holds the forwarding target.
    ForwardingCorpse, |c| c == cid::FORWARDING_CORPSE
);

impl ForwardingCorpse {
    pub const TARGET: usize = 1;
    pub const OVERFLOW_SIZE: usize = HEADER_WORDS;

    pub fn target(self) -> HeapObject {
        let target = Value::from_raw(self.raw_at(Self::TARGET));
        debug_assert!(target.is_heap_object());
        target
            .as_heap_object()
            .unwrap_or_else(|| unreachable!("corpse without target"))
    }

    pub fn set_target(self, target: HeapObject) {
        self.set_raw_at(Self::TARGET, target.value().raw());
    }
}

heap_object_view!(
    /// A dead range owned by the old-space free list.
    FreeListElement, |c| c == cid::FREE_LIST_ELEMENT
);

impl FreeListElement {
    pub const NEXT: usize = 1;

    pub fn next(self) -> Option<FreeListElement> {
        Value::from_raw(self.raw_at(Self::NEXT))
            .as_heap_object()
            .map(Self::from_object)
    }

    pub fn set_next(self, next: Option<FreeListElement>) {
        self.set_raw_at(Self::NEXT, next.map_or(0, |n| n.value().raw()));
    }
}

// ── Object store ───────────────────────────────────────────────────

/// Indices of the well-known objects held by the object-store array.
pub mod store_index {
    pub const NIL: usize = 0;
    pub const FALSE: usize = 1;
    pub const TRUE: usize = 2;
    pub const MESSAGE_LOOP: usize = 3;
    pub const QUICK_SELECTORS: usize = 4;
    pub const DOES_NOT_UNDERSTAND: usize = 5;
    pub const NON_BOOLEAN_RECEIVER: usize = 6;
    pub const CANNOT_RETURN: usize = 7;
    pub const ABOUT_TO_RETURN_THROUGH: usize = 8;
    pub const UNUSED_BYTECODE: usize = 9;
    pub const DISPATCH_MESSAGE: usize = 10;
    pub const DISPATCH_SIGNAL: usize = 11;
    pub const ARRAY_CLASS: usize = 12;
    pub const BYTE_ARRAY_CLASS: usize = 13;
    pub const STRING_CLASS: usize = 14;
    pub const CLOSURE_CLASS: usize = 15;
    pub const EPHEMERON_CLASS: usize = 16;
    pub const FLOAT64_CLASS: usize = 17;
    pub const LARGE_INTEGER_CLASS: usize = 18;
    pub const MEDIUM_INTEGER_CLASS: usize = 19;
    pub const MESSAGE_CLASS: usize = 20;
    pub const SMALL_INTEGER_CLASS: usize = 21;
    pub const WEAK_ARRAY_CLASS: usize = 22;
    pub const ACTIVATION_CLASS: usize = 23;
    pub const METHOD_CLASS: usize = 24;
    pub const COUNT: usize = 25;
}

/// The root array of well-known objects.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct ObjectStore(Array);

impl ObjectStore {
    pub fn from_array(array: Array) -> Self {
        debug_assert!(array.len() >= store_index::COUNT);
        Self(array)
    }

    pub fn array(self) -> Array {
        self.0
    }

    pub fn nil(self) -> Value {
        self.0.element(store_index::NIL)
    }

    pub fn false_object(self) -> Value {
        self.0.element(store_index::FALSE)
    }

    pub fn true_object(self) -> Value {
        self.0.element(store_index::TRUE)
    }

    pub fn message_class(self) -> Option<Behavior> {
        Behavior::cast(self.0.element(store_index::MESSAGE_CLASS))
    }
}
