//! Raw access to objects living in heap memory.
//!
//! A [`HeapObject`] is only ever produced by the heap's allocators or by
//! decoding a [`Value`] read out of the object graph, so it always refers
//! to a live, initialized object. Every word of an object is accessed
//! through an `AtomicUsize` with relaxed ordering: the background marker
//! reads headers and slots while the mutator writes them.

use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::objects::{
    Activation, Array, ByteArray, Closure, Ephemeron, ForwardingCorpse,
    LargeInteger, WeakArray,
};
use crate::{HEADER_WORDS, Header, HeaderFlags, Value, WORD_SIZE, cid};

/// # Safety
///
/// `addr` must be word aligned and lie inside memory owned by a heap for as
/// long as the returned reference is used.
#[inline(always)]
unsafe fn cell<'a>(addr: usize) -> &'a AtomicUsize {
    debug_assert!(addr.is_multiple_of(WORD_SIZE), "misaligned word {addr:#x}");
    // SAFETY: caller upholds alignment and liveness
    unsafe { &*(addr as *const AtomicUsize) }
}

/// # Safety
///
/// See [`write_word`].
#[inline(always)]
pub unsafe fn read_word(addr: usize) -> usize {
    // SAFETY: forwarded contract
    unsafe { cell(addr) }.load(Ordering::Relaxed)
}

/// # Safety
///
/// `addr` must be a word-aligned address in mapped heap memory.
#[inline(always)]
pub unsafe fn write_word(addr: usize, value: usize) {
    // SAFETY: forwarded contract
    unsafe { cell(addr) }.store(value, Ordering::Relaxed);
}

/// Fills `size` bytes starting at `addr` with `word`.
///
/// # Safety
///
/// The range must be word aligned and lie in mapped heap memory that no
/// other thread is reading.
pub unsafe fn fill_words(addr: usize, size: usize, word: usize) {
    debug_assert!(size.is_multiple_of(WORD_SIZE));
    let mut cursor = addr;
    while cursor < addr + size {
        // SAFETY: in range per contract
        unsafe { write_word(cursor, word) };
        cursor += WORD_SIZE;
    }
}

// ── Store barrier ────────────────────────────────────────────────────

/// Hook run after every reference store into a heap object.
///
/// The heap implements this to maintain the remembered set and to re-gray
/// targets while concurrent marking is active. Mutating accessors take the
/// barrier explicitly, so there is no ambient "is marking" state.
pub trait StoreBarrier {
    fn on_store(&mut self, object: HeapObject, value: Value);
}

/// Barrier for stores that can never create an old-to-young edge or hide
/// an object from the marker (initializing stores of immediates or old
/// objects such as nil).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBarrier;

impl StoreBarrier for NoBarrier {
    #[inline(always)]
    fn on_store(&mut self, _object: HeapObject, value: Value) {
        debug_assert!(
            value.is_immediate_or_old(),
            "unbarriered store of young reference {value:?}"
        );
    }
}

// ── Slots ────────────────────────────────────────────────────────────

/// One reference-holding word inside a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Slot(usize);

impl Slot {
    #[inline(always)]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn load(self) -> Value {
        // SAFETY: slots are only handed out for live objects
        Value::from_raw(unsafe { read_word(self.0) })
    }

    /// Raw store. Callers outside the collector go through an accessor
    /// that runs a [`StoreBarrier`].
    #[inline(always)]
    pub fn store(self, value: Value) {
        // SAFETY: slots are only handed out for live objects
        unsafe { write_word(self.0, value.raw()) };
    }
}

/// The outgoing-reference range of an object, `from..to` by address.
#[derive(Clone, Debug)]
pub struct Slots {
    next: usize,
    end: usize,
}

impl Iterator for Slots {
    type Item = Slot;

    #[inline(always)]
    fn next(&mut self) -> Option<Slot> {
        if self.next >= self.end {
            return None;
        }
        let slot = Slot(self.next);
        self.next += WORD_SIZE;
        Some(slot)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.end.saturating_sub(self.next) / WORD_SIZE;
        (len, Some(len))
    }
}

impl ExactSizeIterator for Slots {}

// ── HeapObject ───────────────────────────────────────────────────────

/// A tagged reference to a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HeapObject(NonZeroUsize);

impl HeapObject {
    #[inline(always)]
    pub(crate) const fn from_tagged(tagged: NonZeroUsize) -> Self {
        Self(tagged)
    }

    /// # Safety
    ///
    /// `addr` must be the start of an initialized object.
    #[inline(always)]
    pub unsafe fn from_addr(addr: usize) -> Self {
        debug_assert!(addr.is_multiple_of(WORD_SIZE));
        Self(NonZeroUsize::MIN.saturating_add(addr))
    }

    /// Writes a fresh header and a zero hash at `addr`. Corpses and free
    /// list elements too large for the size field also get their overflow
    /// size word; every other variable-sized class records its length in
    /// the body, which the caller must fill in.
    ///
    /// # Safety
    ///
    /// `addr..addr + heap_size` must be unused, mapped heap memory.
    pub unsafe fn initialize(addr: usize, cid: usize, heap_size: usize) -> Self {
        let header = Header::new(cid, heap_size);
        debug_assert!(
            header.size_tag() != 0 || !cid::is_regular_object(cid),
            "regular object of {heap_size} bytes overflows the size field"
        );
        // SAFETY: caller guarantees the range
        unsafe {
            write_word(addr, header.raw());
            write_word(addr + WORD_SIZE, 0);
            if header.size_tag() == 0
                && (cid == cid::FORWARDING_CORPSE || cid == cid::FREE_LIST_ELEMENT)
            {
                write_word(addr + ForwardingCorpse::OVERFLOW_SIZE * WORD_SIZE, heap_size);
            }
            Self::from_addr(addr)
        }
    }

    #[inline(always)]
    pub const fn addr(self) -> usize {
        self.0.get() - crate::value::HEAP_OBJECT_TAG
    }

    #[inline(always)]
    pub const fn value(self) -> Value {
        Value::from_raw(self.0.get())
    }

    #[inline(always)]
    pub const fn is_old_object(self) -> bool {
        self.value().is_old_object()
    }

    #[inline(always)]
    pub const fn is_new_object(self) -> bool {
        self.value().is_new_object()
    }

    #[inline(always)]
    fn word(self, index: usize) -> &'static AtomicUsize {
        // SAFETY: a HeapObject always addresses a live object
        unsafe { cell(self.addr() + index * WORD_SIZE) }
    }

    #[inline(always)]
    pub fn slot(self, index: usize) -> Slot {
        Slot(self.addr() + index * WORD_SIZE)
    }

    #[inline(always)]
    pub(crate) fn raw_at(self, index: usize) -> usize {
        self.word(index).load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn set_raw_at(self, index: usize, raw: usize) {
        self.word(index).store(raw, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn smi_at(self, index: usize) -> usize {
        let length = Value::from_raw(self.raw_at(index)).smi_value();
        debug_assert!(length >= 0);
        length as usize
    }

    // ── header ─────────────────────────────────────────────────────

    #[inline(always)]
    pub fn header(self) -> Header {
        Header::from_raw(self.raw_at(0))
    }

    #[inline(always)]
    fn add_flag(self, flag: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.word(0).fetch_or(flag.0, Ordering::Relaxed))
    }

    #[inline(always)]
    fn remove_flag(self, flag: HeaderFlags) {
        self.word(0).fetch_and(!flag.0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_marked(self) -> bool {
        self.header().has_flag(HeaderFlags::MARKED)
    }

    #[inline(always)]
    pub fn set_is_marked(self, marked: bool) {
        if marked {
            self.add_flag(HeaderFlags::MARKED);
        } else {
            self.remove_flag(HeaderFlags::MARKED);
        }
    }

    /// Sets the mark bit, returning `true` if this call flipped it.
    #[inline(always)]
    pub fn try_acquire_mark_bit(self) -> bool {
        !self.add_flag(HeaderFlags::MARKED).contains(HeaderFlags::MARKED)
    }

    #[inline(always)]
    pub fn is_remembered(self) -> bool {
        self.header().has_flag(HeaderFlags::REMEMBERED)
    }

    #[inline(always)]
    pub fn set_is_remembered(self, remembered: bool) {
        if remembered {
            self.add_flag(HeaderFlags::REMEMBERED);
        } else {
            self.remove_flag(HeaderFlags::REMEMBERED);
        }
    }

    #[inline(always)]
    pub fn is_canonical(self) -> bool {
        self.header().has_flag(HeaderFlags::CANONICAL)
    }

    #[inline(always)]
    pub fn set_is_canonical(self, canonical: bool) {
        if canonical {
            self.add_flag(HeaderFlags::CANONICAL);
        } else {
            self.remove_flag(HeaderFlags::CANONICAL);
        }
    }

    #[inline(always)]
    pub fn cid(self) -> usize {
        self.header().cid()
    }

    pub fn set_cid(self, cid: usize) {
        let _ = self.word(0).fetch_update(Ordering::Relaxed, Ordering::Relaxed, |raw| {
            Some(Header::from_raw(raw).with_cid(cid).raw())
        });
    }

    #[inline(always)]
    pub fn header_hash(self) -> usize {
        self.raw_at(1)
    }

    #[inline(always)]
    pub fn set_header_hash(self, hash: usize) {
        self.set_raw_at(1, hash);
    }

    // ── scavenge forwarding ────────────────────────────────────────

    /// During a scavenge a from-space object whose header has its low bit
    /// set has been copied; the header is the tagged new location.
    #[inline(always)]
    pub fn is_forwarded(self) -> bool {
        self.is_marked()
    }

    #[inline(always)]
    pub fn forwarding_target(self) -> HeapObject {
        debug_assert!(self.is_forwarded());
        let target = Value::from_raw(self.raw_at(0));
        debug_assert!(target.is_heap_object());
        Self(NonZeroUsize::MIN.saturating_add(target.raw() - 1))
    }

    #[inline(always)]
    pub fn set_forwarding_target(self, target: HeapObject) {
        self.set_raw_at(0, target.value().raw());
    }

    // ── class predicates ───────────────────────────────────────────

    #[inline(always)]
    pub fn is_forwarding_corpse(self) -> bool {
        self.cid() == cid::FORWARDING_CORPSE
    }

    #[inline(always)]
    pub fn is_free_list_element(self) -> bool {
        self.cid() == cid::FREE_LIST_ELEMENT
    }

    #[inline(always)]
    pub fn is_weak_array(self) -> bool {
        self.cid() == cid::WEAK_ARRAY
    }

    #[inline(always)]
    pub fn is_ephemeron(self) -> bool {
        self.cid() == cid::EPHEMERON
    }

    // ── size and pointers ──────────────────────────────────────────

    #[inline(always)]
    pub fn heap_size(self) -> usize {
        match self.header().heap_size() {
            0 => self.heap_size_from_class(),
            size => size,
        }
    }

    fn heap_size_from_class(self) -> usize {
        match self.cid() {
            cid::BYTE_ARRAY | cid::STRING => {
                ByteArray::allocation_size(self.smi_at(ByteArray::LENGTH))
            }
            cid::ARRAY => Array::allocation_size(self.smi_at(Array::LENGTH)),
            cid::WEAK_ARRAY => {
                WeakArray::allocation_size(self.smi_at(WeakArray::LENGTH))
            }
            cid::LARGE_INTEGER => {
                LargeInteger::allocation_size(self.raw_at(LargeInteger::CAPACITY))
            }
            cid::CLOSURE => Closure::allocation_size(self.smi_at(Closure::NUM_COPIED)),
            cid::FORWARDING_CORPSE | cid::FREE_LIST_ELEMENT => {
                self.raw_at(ForwardingCorpse::OVERFLOW_SIZE)
            }
            other => unreachable!("class id {other} has a fixed size"),
        }
    }

    /// The words of this object that may hold heap references.
    pub fn pointers(self) -> Slots {
        let (from, to) = match self.cid() {
            cid::ARRAY => {
                (Array::ELEMENTS, Array::ELEMENTS + self.smi_at(Array::LENGTH))
            }
            cid::WEAK_ARRAY => (
                WeakArray::ELEMENTS,
                WeakArray::ELEMENTS + self.smi_at(WeakArray::LENGTH),
            ),
            cid::EPHEMERON => (Ephemeron::KEY, Ephemeron::NEXT),
            cid::ACTIVATION => (
                Activation::SENDER,
                Activation::TEMPS + self.smi_at(Activation::STACK_DEPTH),
            ),
            cid::CLOSURE => (
                Closure::NUM_COPIED,
                Closure::COPIED + self.smi_at(Closure::NUM_COPIED),
            ),
            c if c >= cid::FIRST_REGULAR_OBJECT => {
                (HEADER_WORDS, self.heap_size() / WORD_SIZE)
            }
            _ => (0, 0),
        };
        Slots {
            next: self.addr() + from * WORD_SIZE,
            end: self.addr() + to * WORD_SIZE,
        }
    }
}

impl core::fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapObject")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("header", &self.header())
            .finish()
    }
}
