use std::ops::{Deref, DerefMut};

use object::{HeapObject, StoreBarrier, Value};

use crate::heap::{Handle, Heap};

/// Keeps one value alive and up to date across collections for as long as
/// the scope lives. Scopes nest: the innermost must be dropped first.
///
/// The scope borrows the heap and dereferences to it, so allocation goes
/// through the scope while the handled value stays reachable.
pub struct HandleScope<'h> {
    heap: &'h mut Heap,
    handle: Handle,
}

impl<'h> HandleScope<'h> {
    pub fn new(heap: &'h mut Heap, value: Value) -> Self {
        let handle = heap.push_handle(value);
        Self { heap, handle }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// The value's current location.
    pub fn get(&self) -> Value {
        self.heap.handle(self.handle)
    }

    pub fn set(&mut self, value: Value) {
        self.heap.set_handle(self.handle, value);
    }
}

impl Deref for HandleScope<'_> {
    type Target = Heap;

    fn deref(&self) -> &Heap {
        self.heap
    }
}

impl DerefMut for HandleScope<'_> {
    fn deref_mut(&mut self) -> &mut Heap {
        self.heap
    }
}

impl StoreBarrier for HandleScope<'_> {
    #[inline]
    fn on_store(&mut self, object: HeapObject, value: Value) {
        self.heap.on_store(object, value);
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        self.heap.pop_handle(self.handle);
    }
}
