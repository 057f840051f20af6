//! Old-generation mark-sweep.
//!
//! A cycle starts either stop-the-world from [`Heap::mark_sweep`] or in the
//! background from [`Heap::start_concurrent_marking`]. In the latter case the
//! write barrier shades every old object stored into an old object until the
//! mutator finalizes the cycle: it rescans the roots and the young
//! generation, drains whatever the barrier published, and then mourns weak
//! references and sweeps.

use std::{mem, sync::Arc, thread, time::Instant};

use object::{HeapObject, NoBarrier, cid};

use crate::{
    freelist::FreeList,
    heap::{GcReason, Heap, fatal},
    marker::{Marker, MarkingState, is_mark_sweep_survivor},
    page::HeapPage,
};

impl Heap {
    /// Called at allocation safepoints: finalizes a mark the background
    /// marker has finished, or starts one when old space nears its limit.
    pub(crate) fn evaluate_concurrent_marking(&mut self) {
        match self.monitor.state() {
            MarkingState::AwaitingFinalization => {
                log::trace!("finalizing concurrent mark");
                self.mark_sweep(GcReason::Finalize);
            }
            MarkingState::Complete if self.old_size + self.to.size() / 2 > self.old_limit => {
                self.start_concurrent_marking();
            }
            _ => {}
        }
    }

    /// Shades the roots and hands marking to a background thread. Returns
    /// `false` if a mark is already in flight.
    pub fn start_concurrent_marking(&mut self) -> bool {
        if self.monitor.state() != MarkingState::Complete {
            return false;
        }
        let mut marker = self.take_marker();
        self.mark_roots(&mut marker, false);

        self.monitor.set(MarkingState::Marking);
        self.marking = true;
        self.stats.concurrent_marks += 1;
        log::trace!("begin concurrent marking");

        let monitor = Arc::clone(&self.monitor);
        let task = thread::Builder::new()
            .name("gc-marker".into())
            .spawn(move || marker.run_concurrently(&monitor));
        match task {
            Ok(task) => self.marker_task = Some(task),
            Err(err) => fatal(format_args!("failed to spawn marker thread: {err}")),
        }
        true
    }

    /// Reclaims the marker from its thread once it has run dry.
    fn join_marker(&mut self) {
        let Some(task) = self.marker_task.take() else {
            return;
        };
        match task.join() {
            Ok(marker) => self.marker = Some(marker),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn take_marker(&mut self) -> Box<Marker> {
        self.join_marker();
        self.marker
            .take()
            .unwrap_or_else(|| unreachable!("marker is neither running nor owned by the heap"))
    }

    /// Blocks until no background mark is running.
    pub(crate) fn wait_for_marker(&mut self) {
        self.monitor.wait_while_marking();
        self.join_marker();
    }

    /// Marks the old generation to completion and sweeps it, finishing a
    /// concurrent mark if one is in flight.
    pub fn mark_sweep(&mut self, reason: GcReason) {
        let start = Instant::now();
        let size_before = self.old_size;

        let mut marker = self.take_marker();
        self.mutator_release_block();
        marker.absorb_handoff();

        // Initializing stores of nil skip the barrier.
        marker.mark_object(self.nil());
        self.mark_roots(&mut marker, true);
        let stw_marked = marker.drain();

        debug_assert!(marker.is_idle(), "mark stack not empty at finalization");
        debug_assert!(self.mutator_block.is_empty());

        self.monitor.set(MarkingState::Complete);
        self.marking = false;

        let concurrent_marked = marker.take_concurrent_marked();
        debug_assert!(stw_marked + concurrent_marked <= self.old_size);
        self.old_size = stw_marked + concurrent_marked;
        debug_assert!(self.old_size <= self.old_capacity);

        self.mourn_ephemerons(&mut marker);
        self.mourn_weak_arrays(&mut marker);
        self.marker = Some(marker);
        self.mourn_class_table();
        self.remembered_set.retain(HeapObject::is_marked);

        self.sweep();
        self.set_old_allocation_limit();

        let reclaimed = size_before.saturating_sub(self.old_size);
        self.stats.mark_sweeps += 1;
        self.stats.reclaimed_bytes += reclaimed as u64;
        log::debug!(
            "mark-sweep ({reason}, {} KB old, {} KB freed, {} us)",
            self.old_size / 1024,
            reclaimed / 1024,
            start.elapsed().as_micros()
        );
    }

    /// Shades the strong roots and every old object young objects refer
    /// to. Weak arrays and ephemerons in the young generation are only
    /// queued when `visit_weak` is set, as a scavenge would move them
    /// before a concurrent mark could mourn them.
    fn mark_roots(&self, marker: &mut Marker, visit_weak: bool) {
        marker.mark_object(self.object_store);
        marker.mark_object(self.current_activation);
        for &handle in &self.handles[..self.handles_len] {
            marker.mark_object(handle);
        }

        let mut scan = self.to.object_start();
        while scan < self.top {
            // SAFETY: to-space below `top` is a contiguous run of objects
            let object = unsafe { HeapObject::from_addr(scan) };
            if object.cid() >= cid::FIRST_LEGAL {
                marker.visit_young(object, visit_weak);
            }
            scan += object.heap_size();
        }
    }

    /// Clears every ephemeron whose key did not survive.
    fn mourn_ephemerons(&mut self, marker: &mut Marker) {
        let nil = self.nil();
        let mut pending = marker.take_ephemerons();
        while let Some(ephemeron) = pending {
            debug_assert!(!is_mark_sweep_survivor(ephemeron.key()));
            ephemeron.set_key(nil, &mut NoBarrier);
            ephemeron.set_value_slot(nil, &mut NoBarrier);
            ephemeron.set_finalizer(nil, &mut NoBarrier);
            pending = ephemeron.next();
            ephemeron.set_next(None);
        }
    }

    /// Replaces references to dead old objects in weak arrays with nil.
    fn mourn_weak_arrays(&mut self, marker: &mut Marker) {
        let nil = self.nil();
        let mut pending = marker.take_weak_arrays();
        while let Some(weak) = pending {
            for slot in weak.pointers() {
                if !is_mark_sweep_survivor(slot.load()) {
                    slot.store(nil);
                }
            }
            pending = weak.next();
            weak.set_next(None);
        }
    }

    /// Returns the ids of dead classes to the free chain.
    fn mourn_class_table(&mut self) {
        for cid in cid::FIRST_LEGAL..self.class_table.size() {
            if !is_mark_sweep_survivor(self.class_table.at(cid)) {
                self.class_table.release(cid);
            }
        }
    }

    fn sweep(&mut self) {
        self.freelist.reset();
        let mut released = 0;
        let mut pages = mem::take(&mut self.pages);
        pages.retain_mut(|page| {
            let in_use = sweep_page(page, &mut self.freelist);
            if !in_use {
                released += page.size();
            }
            in_use
        });
        self.pages = pages;
        self.old_capacity -= released;
    }
}

/// Clears the marks on a page and hands each run of dead objects to the
/// free list as one range. Returns `false` if nothing on the page survived,
/// in which case the page is released instead.
fn sweep_page(page: &mut HeapPage, freelist: &mut FreeList) -> bool {
    let end = page.object_end();
    let mut scan = page.object_start();
    while scan < end {
        // SAFETY: a page prefix is a contiguous run of objects
        let object = unsafe { HeapObject::from_addr(scan) };
        if object.is_marked() {
            object.set_is_marked(false);
            scan += object.heap_size();
            continue;
        }

        let mut free_end = scan + object.heap_size();
        while free_end < end {
            // SAFETY: as above
            let next = unsafe { HeapObject::from_addr(free_end) };
            if next.is_marked() {
                break;
            }
            free_end += next.heap_size();
        }
        if scan == page.object_start() && free_end == end {
            return false;
        }
        freelist.enqueue_range(scan, free_end - scan);
        scan = free_end;
    }
    true
}

#[cfg(test)]
mod tests {
    use object::{Array, Behavior, Ephemeron, Value};

    use super::*;
    use crate::{
        Allocator, HeapSettings,
        testing::{OBJECT_CID, array_of, bootstrap, bootstrap_with, new_class, small_settings},
    };

    fn old_object(heap: &mut Heap) -> Value {
        heap.allocate_regular_object(OBJECT_CID, 0, Allocator::Snapshot)
            .value()
    }

    fn rooted_array(heap: &mut Heap, length: usize) -> Array {
        let array = heap.allocate_array(length, Allocator::Snapshot);
        heap.push_handle(array.value());
        array
    }

    #[test]
    fn test_barrier_shades_stores_during_concurrent_mark() {
        let mut heap = bootstrap();
        let holder = rooted_array(&mut heap, 1);
        let source = rooted_array(&mut heap, 1);
        let target = heap.allocate_array(1, Allocator::Snapshot);
        target.set_element(0, Value::from_smi(123), &mut heap);
        source.set_element(0, target.value(), &mut heap);

        assert!(heap.start_concurrent_marking());
        assert!(heap.is_marking());
        assert!(!heap.start_concurrent_marking());

        // Move the only reference from a possibly unscanned object into a
        // possibly black one.
        holder.set_element(0, target.value(), &mut heap);
        assert!(target.is_marked());
        source.set_element(0, Value::from_smi(0), &mut heap);

        heap.mark_sweep(GcReason::Finalize);
        assert!(!heap.is_marking());
        assert_eq!(heap.marking_state(), MarkingState::Complete);
        let kept = Array::cast(holder.element(0)).expect("array survived");
        assert_eq!(kept, target);
        assert_eq!(kept.element(0), Value::from_smi(123));
        assert!(!kept.is_marked());
        assert_eq!(heap.stats().concurrent_marks, 1);
    }

    #[test]
    fn test_tenured_objects_are_black_during_concurrent_mark() {
        let mut heap = bootstrap();
        let young = heap.allocate_array(1, Allocator::Normal);
        young.set_element(0, Value::from_smi(9), &mut heap);
        let handle = heap.push_handle(young.value());
        heap.scavenge(GcReason::Primitive);

        assert!(heap.start_concurrent_marking());
        heap.scavenge(GcReason::Primitive);
        let tenured = Array::cast(heap.handle(handle)).expect("array");
        assert!(tenured.is_old_object());
        assert!(tenured.is_marked());

        heap.mark_sweep(GcReason::Finalize);
        assert_eq!(tenured.cid(), cid::ARRAY);
        assert_eq!(tenured.element(0), Value::from_smi(9));
        assert!(!tenured.is_marked());
    }

    #[test]
    fn test_second_mark_sweep_reclaims_nothing() {
        let mut heap = bootstrap();
        for _ in 0..10 {
            heap.allocate_array(8, Allocator::Snapshot);
        }
        let holder = rooted_array(&mut heap, 1);
        let kept = old_object(&mut heap);
        holder.set_element(0, kept, &mut heap);

        heap.mark_sweep(GcReason::OldSpace);
        let reclaimed = heap.stats().reclaimed_bytes;
        assert_eq!(reclaimed as usize, 10 * Array::allocation_size(8));
        let old_size = heap.old_size();
        let capacity = heap.old_capacity();

        heap.mark_sweep(GcReason::OldSpace);
        assert_eq!(heap.stats().reclaimed_bytes, reclaimed);
        assert_eq!(heap.old_size(), old_size);
        assert_eq!(heap.old_capacity(), capacity);
        assert_eq!(holder.element(0), kept);
    }

    #[test]
    fn test_dead_page_is_released() {
        let mut heap = bootstrap();
        let pages = heap.page_count();
        let capacity = heap.old_capacity();
        let large = heap.allocate_array(2048, Allocator::Normal);
        assert!(large.is_old_object());
        let page_size = heap.old_capacity() - capacity;
        assert!(page_size >= Array::allocation_size(2048));
        assert_eq!(heap.page_count(), pages + 1);

        heap.mark_sweep(GcReason::OldSpace);
        assert_eq!(heap.page_count(), pages);
        assert_eq!(heap.old_capacity(), capacity);
    }

    #[test]
    fn test_swept_space_is_reused() {
        let mut heap = bootstrap();
        let garbage = heap.allocate_array(30, Allocator::Snapshot);
        let addr = garbage.addr();
        heap.mark_sweep(GcReason::OldSpace);

        let young = heap.allocate_array(30, Allocator::Normal);
        let handle = heap.push_handle(young.value());
        heap.scavenge(GcReason::Primitive);
        heap.scavenge(GcReason::Primitive);
        let tenured = Array::cast(heap.handle(handle)).expect("array");
        assert!(tenured.is_old_object());
        assert_eq!(tenured.addr(), addr);
    }

    fn ephemeron_fixture(root_k1: bool, root_k2: bool) -> (Heap, Ephemeron, Ephemeron, [Value; 4]) {
        let mut heap = bootstrap();
        let root = rooted_array(&mut heap, 4);
        let k1 = old_object(&mut heap);
        let v1 = old_object(&mut heap);
        let f1 = old_object(&mut heap);
        let k2 = old_object(&mut heap);

        let e1 = heap.allocate_ephemeron(Allocator::Snapshot);
        e1.set_key(k1, &mut heap);
        e1.set_value_slot(v1, &mut heap);
        e1.set_finalizer(f1, &mut heap);
        // k1 is reachable through e2's value only.
        let e2 = heap.allocate_ephemeron(Allocator::Snapshot);
        e2.set_key(k2, &mut heap);
        e2.set_value_slot(k1, &mut heap);

        root.set_element(0, e1.value(), &mut heap);
        root.set_element(1, e2.value(), &mut heap);
        if root_k1 {
            root.set_element(2, k1, &mut heap);
        }
        if root_k2 {
            root.set_element(3, k2, &mut heap);
        }
        (heap, e1, e2, [k1, v1, f1, k2])
    }

    #[test]
    fn test_ephemerons_resolve_to_fixed_point() {
        let (mut heap, e1, e2, [k1, v1, f1, k2]) = ephemeron_fixture(false, true);
        heap.mark_sweep(GcReason::OldSpace);
        assert_eq!(e2.key(), k2);
        assert_eq!(e2.value_slot(), k1);
        assert_eq!(e1.key(), k1);
        assert_eq!(e1.value_slot(), v1);
        assert_eq!(e1.finalizer(), f1);
    }

    #[test]
    fn test_ephemeron_with_dead_key_is_cleared() {
        let (mut heap, e1, e2, [k1, v1, _, _]) = ephemeron_fixture(true, false);
        heap.mark_sweep(GcReason::OldSpace);
        let nil = heap.nil();
        assert_eq!(e1.key(), k1);
        assert_eq!(e1.value_slot(), v1);
        assert_eq!(e2.key(), nil);
        assert_eq!(e2.value_slot(), nil);
        assert_eq!(e2.finalizer(), nil);
    }

    #[test]
    fn test_ephemeron_chain_with_dead_root_key_is_cleared() {
        let (mut heap, e1, e2, _) = ephemeron_fixture(false, false);
        heap.mark_sweep(GcReason::OldSpace);
        let nil = heap.nil();
        for ephemeron in [e1, e2] {
            assert_eq!(ephemeron.key(), nil);
            assert_eq!(ephemeron.value_slot(), nil);
            assert_eq!(ephemeron.finalizer(), nil);
        }
    }

    #[test]
    fn test_weak_array_loses_dead_old_referents() {
        let mut heap = bootstrap();
        let root = rooted_array(&mut heap, 2);
        let weak = heap.allocate_weak_array(4, Allocator::Snapshot);
        let live = old_object(&mut heap);
        let dead = old_object(&mut heap);
        let young = heap.allocate_array(1, Allocator::Normal).value();
        root.set_element(0, weak.value(), &mut heap);
        root.set_element(1, live, &mut heap);
        weak.set_element(0, live, &mut heap);
        weak.set_element(1, dead, &mut heap);
        weak.set_element(2, Value::from_smi(5), &mut heap);
        weak.set_element(3, young, &mut heap);

        heap.mark_sweep(GcReason::OldSpace);
        assert_eq!(weak.element(0), live);
        assert_eq!(weak.element(1), heap.nil());
        assert_eq!(weak.element(2), Value::from_smi(5));
        assert_eq!(weak.element(3), young);
        assert!(weak.is_remembered());
    }

    /// Runs a full cycle through the background marker. With `wait` the
    /// marker has run dry before the mutator finalizes; without it the
    /// finalization may overlap the marker.
    fn concurrent_cycle(heap: &mut Heap, wait: bool) {
        assert!(heap.start_concurrent_marking());
        if wait {
            heap.wait_for_marker();
            assert_eq!(heap.marking_state(), MarkingState::AwaitingFinalization);
        }
        heap.mark_sweep(GcReason::Finalize);
        assert_eq!(heap.marking_state(), MarkingState::Complete);
    }

    #[test]
    fn test_young_ephemeron_keeps_live_key_across_concurrent_mark() {
        for wait in [false, true] {
            let mut heap = bootstrap();
            let key = array_of(&mut heap, &[Value::from_smi(1)]).value();
            let value = array_of(&mut heap, &[Value::from_smi(2)]).value();
            let ephemeron = heap.allocate_ephemeron(Allocator::Normal);
            ephemeron.set_key(key, &mut heap);
            ephemeron.set_value_slot(value, &mut heap);
            heap.push_handle(ephemeron.value());

            concurrent_cycle(&mut heap, wait);
            assert_eq!(ephemeron.key(), key);
            assert_eq!(ephemeron.value_slot(), value);
            assert_eq!(Array::cast(value).expect("array").element(0), Value::from_smi(2));
        }
    }

    #[test]
    fn test_old_ephemeron_keeps_key_replaced_during_concurrent_mark() {
        for wait in [false, true] {
            let mut heap = bootstrap();
            let root = rooted_array(&mut heap, 1);
            let dead = old_object(&mut heap);
            let value = old_object(&mut heap);
            let ephemeron = heap.allocate_ephemeron(Allocator::Snapshot);
            ephemeron.set_key(dead, &mut heap);
            ephemeron.set_value_slot(value, &mut heap);
            root.set_element(0, ephemeron.value(), &mut heap);
            let young = heap.allocate_array(1, Allocator::Normal).value();

            assert!(heap.start_concurrent_marking());
            if wait {
                heap.wait_for_marker();
            }
            ephemeron.set_key(young, &mut heap);
            heap.mark_sweep(GcReason::Finalize);

            assert_eq!(ephemeron.key(), young);
            assert_eq!(ephemeron.value_slot(), value);
            assert_eq!(value.as_heap_object().expect("heap object").cid(), OBJECT_CID);
        }
    }

    #[test]
    fn test_old_ephemeron_with_dead_key_is_cleared_after_concurrent_mark() {
        for wait in [false, true] {
            let (mut heap, e1, e2, [k1, v1, f1, _]) = ephemeron_fixture(true, false);
            concurrent_cycle(&mut heap, wait);
            let nil = heap.nil();
            assert_eq!(e1.key(), k1);
            assert_eq!(e1.value_slot(), v1);
            assert_eq!(e1.finalizer(), f1);
            assert_eq!(e2.key(), nil);
            assert_eq!(e2.value_slot(), nil);
            assert_eq!(e2.finalizer(), nil);
        }
    }

    #[test]
    fn test_weak_array_loses_dead_referent_after_concurrent_mark() {
        for wait in [false, true] {
            let mut heap = bootstrap();
            let root = rooted_array(&mut heap, 2);
            let weak = heap.allocate_weak_array(3, Allocator::Snapshot);
            let live = old_object(&mut heap);
            let dead = old_object(&mut heap);
            root.set_element(0, weak.value(), &mut heap);
            root.set_element(1, live, &mut heap);
            weak.set_element(0, live, &mut heap);
            weak.set_element(1, dead, &mut heap);
            weak.set_element(2, Value::from_smi(5), &mut heap);

            concurrent_cycle(&mut heap, wait);
            assert_eq!(weak.element(0), live);
            assert_eq!(weak.element(1), heap.nil());
            assert_eq!(weak.element(2), Value::from_smi(5));
            assert!(weak.next().is_none());
        }
    }

    #[test]
    fn test_dead_class_id_is_reused() {
        let mut heap = bootstrap();
        let dead = new_class(&mut heap, 0);
        let live = new_class(&mut heap, 0);
        let instance = heap.allocate_regular_object(live, 0, Allocator::Normal);
        heap.push_handle(instance.value());

        heap.collect_all(GcReason::Primitive);
        assert!(heap.class_at(dead).is_smi());
        assert!(Behavior::cast(heap.class_at(live)).is_some());
        assert_eq!(heap.allocate_class_id(), dead);
    }

    fn tight_class_table() -> HeapSettings {
        HeapSettings {
            class_table_capacity: cid::FIRST_REGULAR_OBJECT + 4,
            ..small_settings()
        }
    }

    #[test]
    fn test_full_class_table_collects() {
        let mut heap = bootstrap_with(tight_class_table());
        let first = new_class(&mut heap, 0);
        new_class(&mut heap, 0);
        assert_eq!(heap.class_table_size(), cid::FIRST_REGULAR_OBJECT + 4);
        let reused = heap.allocate_class_id();
        assert!(reused == first || reused == first + 1);
    }

    #[test]
    #[should_panic(expected = "class table growth unimplemented")]
    fn test_full_class_table_with_live_classes_is_fatal() {
        let mut heap = bootstrap_with(tight_class_table());
        for _ in 0..2 {
            let cid = new_class(&mut heap, 0);
            let instance = heap.allocate_regular_object(cid, 0, Allocator::Normal);
            heap.push_handle(instance.value());
        }
        heap.allocate_class_id();
    }
}
