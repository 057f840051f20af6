//! Built-in class ids. Ids at or above [`FIRST_REGULAR_OBJECT`] are handed
//! out by the heap's class table.

pub const ILLEGAL: usize = 0;
pub const FORWARDING_CORPSE: usize = 1;
pub const FREE_LIST_ELEMENT: usize = 2;
pub const SMALL_INTEGER: usize = 3;
pub const MEDIUM_INTEGER: usize = 4;
pub const LARGE_INTEGER: usize = 5;
pub const FLOAT64: usize = 6;
pub const BYTE_ARRAY: usize = 7;
pub const STRING: usize = 8;
pub const ARRAY: usize = 9;
pub const WEAK_ARRAY: usize = 10;
pub const EPHEMERON: usize = 11;
pub const ACTIVATION: usize = 12;
pub const CLOSURE: usize = 13;

pub const FIRST_LEGAL: usize = SMALL_INTEGER;
pub const FIRST_REGULAR_OBJECT: usize = 14;

#[inline(always)]
pub const fn is_bytes(cid: usize) -> bool {
    cid == BYTE_ARRAY || cid == STRING
}

#[inline(always)]
pub const fn is_regular_object(cid: usize) -> bool {
    cid == EPHEMERON || cid >= FIRST_REGULAR_OBJECT
}
