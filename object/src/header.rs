use crate::OBJECT_ALIGNMENT_LOG2;

/// A `SIZE`-bit field stored at bit `OFFSET` of a header word.
pub struct BitField<const OFFSET: u32, const SIZE: u32>;

impl<const OFFSET: u32, const SIZE: u32> BitField<OFFSET, SIZE> {
    const LOW_MASK: usize = (1 << SIZE) - 1;
    pub const MASK: usize = Self::LOW_MASK << OFFSET;

    #[inline(always)]
    pub const fn is_valid(value: usize) -> bool {
        value & !Self::LOW_MASK == 0
    }

    #[inline(always)]
    pub const fn encode(value: usize) -> usize {
        debug_assert!(Self::is_valid(value));
        value << OFFSET
    }

    #[inline(always)]
    pub const fn decode(word: usize) -> usize {
        (word >> OFFSET) & Self::LOW_MASK
    }

    #[inline(always)]
    pub const fn update(value: usize, word: usize) -> usize {
        (word & !Self::MASK) | Self::encode(value)
    }
}

pub const SIZE_FIELD_OFFSET: u32 = 16;
pub const SIZE_FIELD_SIZE: u32 = 16;
pub const CLASS_ID_FIELD_OFFSET: u32 = 32;
pub const CLASS_ID_FIELD_SIZE: u32 = 32;

/// Object size in units of the object alignment; zero means the size is
/// recovered from the object body.
pub type SizeField = BitField<SIZE_FIELD_OFFSET, SIZE_FIELD_SIZE>;
pub type ClassIdField = BitField<CLASS_ID_FIELD_OFFSET, CLASS_ID_FIELD_SIZE>;

/// GC / bookkeeping flags in the low bits of the header word.
///
/// The mark bit doubles as the "forwarded" bit during a scavenge: a
/// forwarding word is a tagged heap reference whose low bit is always set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeaderFlags(pub usize);

impl HeaderFlags {
    pub const NONE: Self = Self(0);
    pub const MARKED: Self = Self(1 << 0);
    pub const REMEMBERED: Self = Self(1 << 1);
    pub const CANONICAL: Self = Self(1 << 2);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline(always)]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

/// The first word of every heap object.
///
/// ```text
/// bits 0..3:   flags: Marked | Remembered | Canonical
/// bits 16..32: size in 16-byte units (0 = overflow, ask the body)
/// bits 32..64: class id
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Header(usize);

impl Header {
    /// Header for a fresh, unmarked object. Sizes too large for the size
    /// field encode as zero.
    pub fn new(cid: usize, heap_size: usize) -> Self {
        let tag = heap_size >> OBJECT_ALIGNMENT_LOG2;
        let tag = if SizeField::is_valid(tag) { tag } else { 0 };
        Self(SizeField::encode(tag) | ClassIdField::encode(cid))
    }

    #[inline(always)]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn flags(self) -> HeaderFlags {
        HeaderFlags(self.0 & 0b111)
    }

    #[inline(always)]
    pub const fn has_flag(self, flag: HeaderFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub const fn size_tag(self) -> usize {
        SizeField::decode(self.0)
    }

    /// Size in bytes, or zero if it does not fit the header.
    #[inline(always)]
    pub const fn heap_size(self) -> usize {
        self.size_tag() << OBJECT_ALIGNMENT_LOG2
    }

    #[inline(always)]
    pub const fn cid(self) -> usize {
        ClassIdField::decode(self.0)
    }

    #[inline(always)]
    pub const fn with_cid(self, cid: usize) -> Self {
        Self(ClassIdField::update(cid, self.0))
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("cid", &self.cid())
            .field("size", &self.heap_size())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_overflow_encodes_zero() {
        let fits = Header::new(9, 1 << 19);
        assert_eq!(fits.heap_size(), 1 << 19);
        let too_big = Header::new(9, 1 << 21);
        assert_eq!(too_big.size_tag(), 0);
        assert_eq!(too_big.cid(), 9);
    }

    #[test]
    fn test_fields_do_not_overlap_flags() {
        let header = Header::new(u32::MAX as usize, 16 * 0xffff);
        assert_eq!(header.flags(), HeaderFlags::NONE);
        assert_eq!(header.with_cid(14).heap_size(), 16 * 0xffff);
        assert_eq!(header.with_cid(14).cid(), 14);
    }
}
