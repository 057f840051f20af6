//! Tri-color marking shared by the background marker and the mutator's
//! stop-the-world finalization.
//!
//! White objects have a clear mark bit. An object turns gray by winning
//! [`HeapObject::try_acquire_mark_bit`] and being pushed, and black once it
//! is popped and its references have been visited. Only old objects are
//! ever marked; young objects are always treated as live.

use std::{
    mem,
    sync::{Arc, atomic::AtomicUsize},
};

use crossbeam_channel::Receiver;
use object::{Ephemeron, HeapObject, Value, WeakArray};
use parking_lot::{Condvar, Mutex};

use crate::{class_table::class_at, mark_block::MarkBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkingState {
    /// No mark in flight; the write barrier is idle.
    Complete,
    /// The background marker is running.
    Marking,
    /// The background marker ran dry and waits for the mutator to finish
    /// the cycle.
    AwaitingFinalization,
}

/// Monitor the mutator waits on for the background marker.
#[derive(Debug)]
pub(crate) struct MarkingMonitor {
    state: Mutex<MarkingState>,
    changed: Condvar,
}

impl MarkingMonitor {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MarkingState::Complete),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> MarkingState {
        *self.state.lock()
    }

    pub(crate) fn set(&self, state: MarkingState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }

    pub(crate) fn wait_while_marking(&self) {
        let mut state = self.state.lock();
        while *state == MarkingState::Marking {
            self.changed.wait(&mut state);
        }
    }
}

/// Survives the current mark-sweep: immediates and young objects always
/// do, old objects if marked.
#[inline(always)]
pub(crate) fn is_mark_sweep_survivor(value: Value) -> bool {
    value.as_old_object().is_none_or(HeapObject::is_marked)
}

/// The collector side of marking. Owned by the background thread while a
/// concurrent mark runs and by the heap otherwise.
#[derive(Debug)]
pub(crate) struct Marker {
    stack: Box<MarkBlock>,
    handoff: Receiver<Box<MarkBlock>>,
    classes: Arc<[AtomicUsize]>,
    ephemerons: Option<Ephemeron>,
    weak_arrays: Option<WeakArray>,
    concurrent_marked: usize,
}

impl Marker {
    pub(crate) fn new(handoff: Receiver<Box<MarkBlock>>, classes: Arc<[AtomicUsize]>) -> Self {
        Self {
            stack: MarkBlock::new(),
            handoff,
            classes,
            ephemerons: None,
            weak_arrays: None,
            concurrent_marked: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn mark_object(&mut self, value: Value) {
        let Some(object) = value.as_old_object() else {
            return;
        };
        if object.try_acquire_mark_bit() {
            self.push(object);
        }
    }

    fn push(&mut self, object: HeapObject) {
        if self.stack.is_full() {
            let full = mem::replace(&mut self.stack, MarkBlock::new());
            self.stack.next = Some(full);
        }
        self.stack.push(object);
    }

    fn pop(&mut self) -> Option<HeapObject> {
        loop {
            if let Some(object) = self.stack.pop() {
                return Some(object);
            }
            if let Some(next) = self.stack.next.take() {
                self.stack = next;
                continue;
            }
            match self.handoff.try_recv() {
                Ok(block) => self.stack = block,
                Err(_) => return None,
            }
        }
    }

    fn has_work(&self) -> bool {
        !self.stack.is_empty() || self.stack.next.is_some()
    }

    /// Chains every block the mutator has published onto the local stack.
    pub(crate) fn absorb_handoff(&mut self) {
        while let Ok(mut block) = self.handoff.try_recv() {
            block.next = self.stack.next.take();
            self.stack.next = Some(block);
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        !self.has_work() && self.handoff.is_empty()
    }

    /// Visits a young object found by walking to-space.
    pub(crate) fn visit_young(&mut self, object: HeapObject, visit_weak: bool) {
        self.mark_object(class_at(&self.classes, object.cid()));
        if object.is_weak_array() {
            if visit_weak {
                self.add_weak_array(WeakArray::from_object(object));
            }
        } else if object.is_ephemeron() {
            if visit_weak {
                self.add_ephemeron(Ephemeron::from_object(object));
            }
        } else {
            for slot in object.pointers() {
                self.mark_object(slot.load());
            }
        }
    }

    /// Pops until every stack is empty; returns the bytes blackened.
    fn process_mark_stack(&mut self) -> usize {
        let mut marked = 0;
        while let Some(object) = self.pop() {
            debug_assert!(object.is_old_object() && object.is_marked());
            marked += object.heap_size();
            self.mark_object(class_at(&self.classes, object.cid()));
            if object.is_weak_array() {
                self.add_weak_array(WeakArray::from_object(object));
            } else if object.is_ephemeron() {
                self.add_ephemeron(Ephemeron::from_object(object));
            } else {
                for slot in object.pointers() {
                    self.mark_object(slot.load());
                }
            }
        }
        marked
    }

    fn add_weak_array(&mut self, weak: WeakArray) {
        weak.set_next(self.weak_arrays);
        self.weak_arrays = Some(weak);
    }

    fn add_ephemeron(&mut self, ephemeron: Ephemeron) {
        ephemeron.set_next(self.ephemerons);
        self.ephemerons = Some(ephemeron);
    }

    /// Resolves every ephemeron whose key is known live and requeues the
    /// rest. Marking a resolved value can make another key live, so the
    /// caller repeats until nothing new is pushed.
    fn mark_ephemeron_list(&mut self) {
        let mut pending = self.ephemerons.take();
        while let Some(ephemeron) = pending {
            pending = ephemeron.next();
            if is_mark_sweep_survivor(ephemeron.key()) {
                self.mark_object(ephemeron.key());
                self.mark_object(ephemeron.value_slot());
                self.mark_object(ephemeron.finalizer());
            } else {
                self.add_ephemeron(ephemeron);
            }
        }
    }

    /// Marks to a fixed point; returns the bytes blackened. Queued
    /// ephemerons are resolved at least once, even with an empty stack.
    pub(crate) fn drain(&mut self) -> usize {
        let mut marked = 0;
        loop {
            marked += self.process_mark_stack();
            self.mark_ephemeron_list();
            if !self.has_work() {
                break;
            }
        }
        marked
    }

    /// Body of the background marking thread.
    pub(crate) fn run_concurrently(mut self: Box<Self>, monitor: &MarkingMonitor) -> Box<Self> {
        self.concurrent_marked = self.drain();
        log::trace!("concurrent mark ran dry, {} bytes marked", self.concurrent_marked);
        monitor.set(MarkingState::AwaitingFinalization);
        self
    }

    pub(crate) fn take_concurrent_marked(&mut self) -> usize {
        mem::take(&mut self.concurrent_marked)
    }

    pub(crate) fn take_ephemerons(&mut self) -> Option<Ephemeron> {
        self.ephemerons.take()
    }

    pub(crate) fn take_weak_arrays(&mut self) -> Option<WeakArray> {
        self.weak_arrays.take()
    }
}
