//! Bulk identity forwarding (`become`).
//!
//! Each forwarder is overwritten in place by a forwarding corpse that
//! points at its forwardee, then one walk over the roots, both generations
//! and the class table replaces every reference to a corpse with the
//! corpse's target.

use std::{error::Error, fmt};

use object::{
    Array, Behavior, ForwardingCorpse, HEADER_WORDS, HeapObject, Value, cid,
};

use crate::{
    heap::{GcReason, Heap},
    marker::MarkingState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BecomeError {
    /// The two arrays differ in length.
    LengthMismatch { old: usize, new: usize },
    /// An element on either side is an immediate and cannot be forwarded.
    ImmediateElement { index: usize },
}

impl fmt::Display for BecomeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BecomeError::LengthMismatch { old, new } => {
                write!(f, "become arrays differ in length ({old} vs {new})")
            }
            BecomeError::ImmediateElement { index } => {
                write!(f, "become element {index} is not a heap object")
            }
        }
    }
}

impl Error for BecomeError {}

impl Heap {
    /// Makes every reference to `old[i]` refer to `new[i]`. The forwardee
    /// takes over the forwarder's identity hash.
    ///
    /// On error nothing has been modified.
    pub fn become_forward(&mut self, old: Array, new: Array) -> Result<(), BecomeError> {
        let length = old.len();
        if length != new.len() {
            return Err(BecomeError::LengthMismatch {
                old: length,
                new: new.len(),
            });
        }
        for index in 0..length {
            if !old.element(index).is_heap_object() || !new.element(index).is_heap_object() {
                return Err(BecomeError::ImmediateElement { index });
            }
        }
        log::trace!("become ({length} objects)");

        // Forwarding while the barrier is armed is not supported.
        self.wait_for_marker();
        if self.monitor.state() == MarkingState::AwaitingFinalization {
            self.mark_sweep(GcReason::Finalize);
        }
        debug_assert!(!self.marking);

        for index in 0..length {
            let (Some(forwarder), Some(forwardee)) = (
                old.element(index).as_heap_object(),
                new.element(index).as_heap_object(),
            ) else {
                unreachable!("checked above");
            };
            debug_assert!(!forwarder.is_forwarding_corpse());
            debug_assert!(!forwardee.is_forwarding_corpse());

            forwardee.set_header_hash(forwarder.header_hash());
            let heap_size = forwarder.heap_size();
            // SAFETY: the forwarder's storage is reused in place at its own size
            let corpse = unsafe {
                HeapObject::initialize(forwarder.addr(), cid::FORWARDING_CORPSE, heap_size)
            };
            debug_assert_eq!(corpse.heap_size(), heap_size);
            ForwardingCorpse::from_object(corpse).set_target(forwardee);
        }

        self.forward_roots();
        // Uses the class table as it was before forwarding.
        self.forward_heap();
        self.forward_class_table();
        Ok(())
    }

    fn forward_roots(&mut self) {
        self.object_store = forward_value(self.object_store);
        self.current_activation = forward_value(self.current_activation);
        for index in 0..self.handles_len {
            self.handles[index] = forward_value(self.handles[index]);
        }
    }

    fn forward_heap(&mut self) {
        let mut scan = self.to.object_start();
        while scan < self.top {
            // SAFETY: to-space below `top` is a contiguous run of objects
            let object = unsafe { HeapObject::from_addr(scan) };
            if object.cid() >= cid::FIRST_LEGAL {
                self.forward_class(object);
                for slot in object.pointers() {
                    slot.store(forward_value(slot.load()));
                }
            }
            scan += object.heap_size();
        }

        // Rebuilt from scratch by the walk below.
        self.remembered_set.clear();
        for index in 0..self.pages.len() {
            let page = &self.pages[index];
            let (mut scan, end) = (page.object_start(), page.object_end());
            while scan < end {
                // SAFETY: a page prefix is a contiguous run of objects
                let object = unsafe { HeapObject::from_addr(scan) };
                if object.cid() >= cid::FIRST_LEGAL {
                    self.forward_class(object);
                    object.set_is_remembered(false);
                    let mut has_young = false;
                    for slot in object.pointers() {
                        let value = forward_value(slot.load());
                        slot.store(value);
                        has_young |= value.is_new_object();
                    }
                    if has_young {
                        self.add_to_remembered_set(object);
                    }
                }
                scan += object.heap_size();
            }
        }
    }

    /// Moves `object` to its class's forwardee, which inherits the old
    /// class id if it has none of its own.
    fn forward_class(&self, object: HeapObject) {
        let Some(old_class) = forwarded_class(self.class_table.at(object.cid())) else {
            return;
        };
        let new_class = Behavior::from_object(ForwardingCorpse::from_object(old_class).target());
        if new_class.id() == self.nil() {
            let old_id = class_id_of_corpse(old_class);
            debug_assert!(old_id.is_smi());
            new_class.set_id(old_id);
        }
        object.set_cid(new_class.id().smi_value() as usize);
    }

    fn forward_class_table(&mut self) {
        for index in cid::FIRST_LEGAL..self.class_table.size() {
            let Some(old_class) = forwarded_class(self.class_table.at(index)) else {
                continue;
            };
            let new_class = Behavior::from_object(ForwardingCorpse::from_object(old_class).target());
            if class_id_of_corpse(old_class) == new_class.id() {
                self.class_table.set(index, new_class.value());
            } else {
                // Instances already carry the new class's id.
                self.class_table.release(index);
            }
        }
    }
}

#[inline(always)]
fn forward_value(value: Value) -> Value {
    match value.as_heap_object() {
        Some(object) if object.is_forwarding_corpse() => {
            ForwardingCorpse::from_object(object).target().value()
        }
        _ => value,
    }
}

fn forwarded_class(class: Value) -> Option<HeapObject> {
    class
        .as_heap_object()
        .filter(|object| object.is_forwarding_corpse())
}

/// The id slot survives in the body of a corpse left by a class.
fn class_id_of_corpse(corpse: HeapObject) -> Value {
    corpse.slot(HEADER_WORDS + Behavior::ID).load()
}
