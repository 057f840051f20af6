use core::num::NonZeroUsize;

use crate::{HeapObject, NEW_OBJECT_ALIGNMENT_OFFSET, OBJECT_ALIGNMENT};

/// Tag constants.
pub const SMI_TAG: usize = 0;
pub const HEAP_OBJECT_TAG: usize = 1;
pub const SMI_TAG_MASK: usize = 0b1;
pub const SMI_TAG_SHIFT: u32 = 1;

const GENERATION_MASK: usize = OBJECT_ALIGNMENT - 1;
const OLD_OBJECT_BITS: usize = HEAP_OBJECT_TAG;
const NEW_OBJECT_BITS: usize = NEW_OBJECT_ALIGNMENT_OFFSET | HEAP_OBJECT_TAG;

/// A tagged machine word.
///
/// Encoding:
/// - **SmallInteger**: `...XXXXX0`: 63-bit signed integer (low bit 0).
/// - **Heap object**:  `...XXXXX1`: address of the object plus one.
///
/// The generation of a heap object is encoded in its address alignment:
/// old objects sit on a 16-byte boundary, young objects sit one word past
/// it. Masking the low four bits of a reference therefore yields `0b0001`
/// for old and `0b1001` for new objects.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(usize);

/// Decoded view of a [`Value`]. Code must branch on this before touching
/// memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Immediate(isize),
    Heap(HeapObject),
}

impl Value {
    pub const SMI_MIN: isize = isize::MIN >> SMI_TAG_SHIFT;
    pub const SMI_MAX: isize = isize::MAX >> SMI_TAG_SHIFT;

    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    // ── SmallInteger ───────────────────────────────────────────────

    #[inline(always)]
    pub const fn from_smi(value: isize) -> Self {
        debug_assert!(value >= Self::SMI_MIN && value <= Self::SMI_MAX);
        Self((value << SMI_TAG_SHIFT) as usize)
    }

    #[inline(always)]
    pub const fn fits_smi(value: i64) -> bool {
        value >= Self::SMI_MIN as i64 && value <= Self::SMI_MAX as i64
    }

    #[inline(always)]
    pub const fn is_smi(self) -> bool {
        self.0 & SMI_TAG_MASK == SMI_TAG
    }

    #[inline(always)]
    pub fn smi_value(self) -> isize {
        debug_assert!(self.is_smi(), "not a small integer: {self:?}");
        (self.0 as isize) >> SMI_TAG_SHIFT
    }

    // ── Heap object ────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_heap_object(self) -> bool {
        self.0 & SMI_TAG_MASK == HEAP_OBJECT_TAG
    }

    #[inline(always)]
    pub const fn is_old_object(self) -> bool {
        self.0 & GENERATION_MASK == OLD_OBJECT_BITS
    }

    #[inline(always)]
    pub const fn is_new_object(self) -> bool {
        self.0 & GENERATION_MASK == NEW_OBJECT_BITS
    }

    #[inline(always)]
    pub const fn is_immediate_or_old(self) -> bool {
        self.0 & GENERATION_MASK != NEW_OBJECT_BITS
    }

    #[inline(always)]
    pub const fn is_immediate_or_new(self) -> bool {
        self.0 & GENERATION_MASK != OLD_OBJECT_BITS
    }

    #[inline(always)]
    pub fn kind(self) -> ValueKind {
        match self.as_heap_object() {
            Some(object) => ValueKind::Heap(object),
            None => ValueKind::Immediate(self.smi_value()),
        }
    }

    #[inline(always)]
    pub fn as_heap_object(self) -> Option<HeapObject> {
        if !self.is_heap_object() {
            return None;
        }
        NonZeroUsize::new(self.0).map(HeapObject::from_tagged)
    }

    #[inline(always)]
    pub fn as_old_object(self) -> Option<HeapObject> {
        if self.is_old_object() {
            self.as_heap_object()
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_new_object(self) -> Option<HeapObject> {
        if self.is_new_object() {
            self.as_heap_object()
        } else {
            None
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::from_smi(0)
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_smi() {
            write!(f, "Smi({})", self.smi_value())
        } else if self.is_new_object() {
            write!(f, "New({:#x})", self.0 - HEAP_OBJECT_TAG)
        } else {
            write!(f, "Old({:#x})", self.0 - HEAP_OBJECT_TAG)
        }
    }
}
