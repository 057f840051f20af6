//! Generational heap: a copying young generation, a free-list old
//! generation, and the allocation, root and barrier API the interpreter
//! uses.
//!
//! Young objects live in a pair of semispaces and are evacuated by a Cheney
//! scavenge; survivors of two scavenges are tenured into old pages. The old
//! generation is collected by a mark-sweep whose marking may run
//! concurrently on a background thread (see `mark_sweep.rs`).

use std::{
    fmt, mem,
    sync::Arc,
    thread::JoinHandle,
    time::Instant,
};

use crossbeam_channel::Sender;
use object::{
    Activation, Array, Behavior, ByteArray, Closure, Ephemeron, Float64,
    HEADER_SIZE, HeapObject, LargeInteger, MediumInteger, Message,
    OBJECT_ALIGNMENT, ObjectStore, RegularObject, StoreBarrier, Str, Value,
    WORD_SIZE, WeakArray, cid, fill_words, read_word, store_index, write_word,
};

use crate::{
    HeapSettings, OS_PAGE_SIZE,
    class_table::ClassTable,
    freelist::FreeList,
    mark_block::MarkBlock,
    marker::{Marker, MarkingMonitor, MarkingState},
    page::HeapPage,
    remembered_set::RememberedSet,
    semispace::Semispace,
    system::round_up,
};

/// Maximum number of simultaneously registered handles.
pub const HANDLES_CAPACITY: usize = 8;

// ── Public API types ──────────────────────────────────────────────────

/// Why a collection ran. Only used for attribution, except that a
/// new-space scavenge may chain into an old-space collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    NewSpace,
    Tenure,
    OldSpace,
    ClassTable,
    Primitive,
    SnapshotTest,
    Finalize,
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GcReason::NewSpace => "new-space",
            GcReason::Tenure => "tenure",
            GcReason::OldSpace => "old-space",
            GcReason::ClassTable => "class-table",
            GcReason::Primitive => "primitive",
            GcReason::SnapshotTest => "snapshot-test",
            GcReason::Finalize => "finalize",
        })
    }
}

/// Where an allocation may come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocator {
    /// May collect, may place the object in the young generation.
    Normal,
    /// Bump allocation in old space only; never collects. Used while
    /// loading an image.
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GrowthPolicy {
    /// Collect or start concurrent marking before growing past the limit.
    ControlGrowth,
    /// Grow unconditionally; used where a collection cannot run.
    ForceGrowth,
}

/// Reference to a registered handle slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(pub(crate) usize);

/// Cumulative collection counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcStats {
    pub scavenges: u64,
    pub mark_sweeps: u64,
    pub concurrent_marks: u64,
    pub tenured_bytes: u64,
    pub reclaimed_bytes: u64,
}

fn is_scavenge_reason(reason: GcReason) -> bool {
    matches!(
        reason,
        GcReason::NewSpace | GcReason::ClassTable | GcReason::Primitive | GcReason::SnapshotTest
    )
}

#[cold]
pub(crate) fn fatal(message: fmt::Arguments<'_>) -> ! {
    log::error!("{message}");
    panic!("{message}");
}

// ── Heap ──────────────────────────────────────────────────────────────

pub struct Heap {
    pub(crate) settings: HeapSettings,

    // New space.
    pub(crate) top: usize,
    pub(crate) end: usize,
    pub(crate) survivor_end: usize,
    pub(crate) to: Semispace,
    pub(crate) from: Semispace,
    next_semispace_capacity: usize,

    // Old space.
    pub(crate) pages: Vec<HeapPage>,
    pub(crate) freelist: FreeList,
    pub(crate) old_size: usize,
    pub(crate) old_capacity: usize,
    pub(crate) old_limit: usize,

    pub(crate) remembered_set: RememberedSet,
    pub(crate) class_table: ClassTable,

    // Roots.
    pub(crate) object_store: Value,
    pub(crate) current_activation: Value,
    pub(crate) handles: [Value; HANDLES_CAPACITY],
    pub(crate) handles_len: usize,

    // Marking.
    pub(crate) marking: bool,
    pub(crate) mutator_block: Box<MarkBlock>,
    handoff: Sender<Box<MarkBlock>>,
    pub(crate) marker: Option<Box<Marker>>,
    pub(crate) marker_task: Option<JoinHandle<Box<Marker>>>,
    pub(crate) monitor: Arc<MarkingMonitor>,

    pub(crate) stats: GcStats,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        if let Err(message) = settings.validate() {
            panic!("invalid heap settings: {message}");
        }
        let capacity = settings.initial_semispace_capacity;
        let to = Semispace::allocate(capacity)
            .unwrap_or_else(|| fatal(format_args!("failed to reserve {capacity} byte semispace")));
        let from = Semispace::allocate(capacity)
            .unwrap_or_else(|| fatal(format_args!("failed to reserve {capacity} byte semispace")));
        let class_table = ClassTable::new(settings.class_table_capacity);
        let (handoff, receiver) = crossbeam_channel::unbounded();
        let marker = Marker::new(receiver, class_table.shared());

        let mut heap = Self {
            top: to.object_start(),
            end: to.limit(),
            survivor_end: to.object_start(),
            to,
            from,
            next_semispace_capacity: capacity,
            pages: Vec::new(),
            freelist: FreeList::default(),
            old_size: 0,
            old_capacity: 0,
            old_limit: 0,
            remembered_set: RememberedSet::with_capacity(settings.remembered_set_capacity),
            class_table,
            object_store: Value::default(),
            current_activation: Value::default(),
            handles: [Value::default(); HANDLES_CAPACITY],
            handles_len: 0,
            marking: false,
            mutator_block: MarkBlock::new(),
            handoff,
            marker: Some(Box::new(marker)),
            marker_task: None,
            monitor: Arc::new(MarkingMonitor::new()),
            stats: GcStats::default(),
            settings,
        };
        heap.set_old_allocation_limit();
        heap
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    // ── sizes ─────────────────────────────────────────────────────────

    /// Bytes in use in the young generation.
    pub fn new_size(&self) -> usize {
        self.top - self.to.object_start()
    }

    pub fn new_capacity(&self) -> usize {
        self.to.size()
    }

    /// Bytes of old objects, as of the last sweep plus what was allocated
    /// since.
    pub fn old_size(&self) -> usize {
        self.old_size
    }

    pub fn old_capacity(&self) -> usize {
        self.old_capacity
    }

    pub fn old_limit(&self) -> usize {
        self.old_limit
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Live bytes: young usage plus old size.
    pub fn size(&self) -> usize {
        self.new_size() + self.old_size
    }

    pub fn capacity(&self) -> usize {
        self.new_capacity() + self.old_capacity
    }

    pub fn in_new_space(&self, value: Value) -> bool {
        value
            .as_new_object()
            .is_some_and(|object| self.to.contains(object.addr()))
    }

    pub fn in_old_space(&self, value: Value) -> bool {
        value
            .as_old_object()
            .is_some_and(|object| self.pages.iter().any(|page| page.contains(object.addr())))
    }

    pub fn marking_state(&self) -> MarkingState {
        self.monitor.state()
    }

    pub fn is_marking(&self) -> bool {
        self.marking
    }

    // ── allocation ────────────────────────────────────────────────────

    #[inline(always)]
    fn try_allocate_new(&mut self, size: usize) -> Option<usize> {
        if self.end - self.top < size {
            return None;
        }
        let result = self.top;
        self.top += size;
        Some(result)
    }

    fn allocate(&mut self, size: usize, allocator: Allocator) -> usize {
        debug_assert!(size >= HEADER_SIZE && size.is_multiple_of(OBJECT_ALIGNMENT));
        let large = size >= self.settings.large_allocation;
        match (allocator, large) {
            (Allocator::Normal, false) => self.allocate_new(size),
            (Allocator::Normal, true) => self.allocate_old_large(size, GrowthPolicy::ControlGrowth),
            (Allocator::Snapshot, false) => self.allocate_snapshot_small(size),
            (Allocator::Snapshot, true) => self.allocate_snapshot_large(size),
        }
    }

    fn allocate_new(&mut self, size: usize) -> usize {
        if let Some(addr) = self.try_allocate_new(size) {
            return addr;
        }
        self.scavenge(GcReason::NewSpace);
        if let Some(addr) = self.try_allocate_new(size) {
            return addr;
        }
        self.allocate_old_small(size, GrowthPolicy::ControlGrowth)
    }

    /// Allocation target for an object being promoted mid-scavenge.
    fn allocate_tenure(&mut self, size: usize) -> usize {
        let addr = match self.freelist.try_allocate(size) {
            Some(addr) => {
                self.old_size += size;
                addr
            }
            None => self.allocate_old_small(size, GrowthPolicy::ForceGrowth),
        };
        self.push_tenure_stack(addr);
        addr
    }

    fn allocate_old_small(&mut self, size: usize, growth: GrowthPolicy) -> usize {
        debug_assert!(size < self.settings.large_allocation);
        if let Some(addr) = self.freelist.try_allocate(size) {
            self.old_size += size;
            return addr;
        }
        let index = self.allocate_page(self.settings.page_size, growth);
        let page = &mut self.pages[index];
        let addr = page
            .try_allocate(size)
            .unwrap_or_else(|| fatal(format_args!("{size} bytes do not fit a fresh page")));
        if let Some((start, len)) = page.take_remaining() {
            self.freelist.enqueue_range(start, len);
        }
        self.old_size += size;
        addr
    }

    fn allocate_old_large(&mut self, size: usize, growth: GrowthPolicy) -> usize {
        let index = self.allocate_page(round_up(size, OS_PAGE_SIZE), growth);
        let addr = self.pages[index]
            .try_allocate(size)
            .unwrap_or_else(|| fatal(format_args!("{size} bytes do not fit a large page")));
        self.old_size += size;
        addr
    }

    fn allocate_page(&mut self, size: usize, growth: GrowthPolicy) -> usize {
        if growth == GrowthPolicy::ControlGrowth {
            if self.old_size + size > self.old_limit {
                self.mark_sweep(GcReason::OldSpace);
            } else {
                self.evaluate_concurrent_marking();
            }
        }
        let page = HeapPage::allocate(size)
            .unwrap_or_else(|| fatal(format_args!("failed to reserve {size} byte page")));
        self.old_capacity += page.size();
        self.pages.push(page);
        self.pages.len() - 1
    }

    fn allocate_snapshot_small(&mut self, size: usize) -> usize {
        if let Some(page) = self.pages.last_mut() {
            if let Some(addr) = page.try_allocate(size) {
                self.old_size += size;
                return addr;
            }
            if let Some((start, len)) = page.take_remaining() {
                self.freelist.enqueue_range(start, len);
            }
        }
        let index = self.allocate_page(self.settings.page_size, GrowthPolicy::ForceGrowth);
        let addr = self.pages[index]
            .try_allocate(size)
            .unwrap_or_else(|| fatal(format_args!("{size} bytes do not fit a fresh page")));
        self.old_size += size;
        addr
    }

    /// Large snapshot objects get their own page, placed behind the
    /// current bump page so small snapshot allocation keeps its cursor.
    fn allocate_snapshot_large(&mut self, size: usize) -> usize {
        let mut page = HeapPage::allocate(round_up(size, OS_PAGE_SIZE))
            .unwrap_or_else(|| fatal(format_args!("failed to reserve {size} byte page")));
        let addr = page
            .try_allocate(size)
            .unwrap_or_else(|| fatal(format_args!("{size} bytes do not fit a large page")));
        self.old_capacity += page.size();
        self.old_size += size;
        let current = self.pages.len().saturating_sub(1);
        self.pages.insert(current, page);
        addr
    }

    /// Allocates and initializes an object whose body reads as zeros
    /// (SmallInteger 0 in every slot).
    fn allocate_object(&mut self, cid: usize, size: usize, allocator: Allocator) -> HeapObject {
        let addr = self.allocate(size, allocator);
        // SAFETY: freshly allocated storage of `size` bytes
        unsafe {
            fill_words(addr + HEADER_SIZE, size - HEADER_SIZE, 0);
            HeapObject::initialize(addr, cid, size)
        }
    }

    pub fn allocate_medium_integer(&mut self, allocator: Allocator) -> MediumInteger {
        let object = self.allocate_object(cid::MEDIUM_INTEGER, MediumInteger::SIZE, allocator);
        MediumInteger::from_object(object)
    }

    /// SmallInteger when `value` fits, MediumInteger otherwise.
    pub fn allocate_integer(&mut self, value: i64, allocator: Allocator) -> Value {
        if Value::fits_smi(value) {
            return Value::from_smi(value as isize);
        }
        let boxed = self.allocate_medium_integer(allocator);
        boxed.set(value);
        boxed.value()
    }

    pub fn allocate_large_integer(&mut self, capacity: usize, allocator: Allocator) -> LargeInteger {
        let size = LargeInteger::allocation_size(capacity);
        let object = self.allocate_object(cid::LARGE_INTEGER, size, allocator);
        let integer = LargeInteger::from_object(object);
        integer.set_capacity(capacity);
        integer
    }

    pub fn allocate_float64(&mut self, allocator: Allocator) -> Float64 {
        let object = self.allocate_object(cid::FLOAT64, Float64::SIZE, allocator);
        Float64::from_object(object)
    }

    pub fn allocate_byte_array(&mut self, length: usize, allocator: Allocator) -> ByteArray {
        let size = ByteArray::allocation_size(length);
        let bytes = ByteArray::from_object(self.allocate_object(cid::BYTE_ARRAY, size, allocator));
        bytes.set_len(length);
        bytes
    }

    pub fn allocate_string(&mut self, length: usize, allocator: Allocator) -> Str {
        let size = Str::allocation_size(length);
        let string = Str::from_object(self.allocate_object(cid::STRING, size, allocator));
        string.set_len(length);
        string
    }

    pub fn allocate_array(&mut self, length: usize, allocator: Allocator) -> Array {
        let size = Array::allocation_size(length);
        let array = Array::from_object(self.allocate_object(cid::ARRAY, size, allocator));
        array.set_len(length);
        array
    }

    pub fn allocate_weak_array(&mut self, length: usize, allocator: Allocator) -> WeakArray {
        let size = WeakArray::allocation_size(length);
        let weak = WeakArray::from_object(self.allocate_object(cid::WEAK_ARRAY, size, allocator));
        weak.set_len(length);
        weak
    }

    pub fn allocate_closure(&mut self, num_copied: usize, allocator: Allocator) -> Closure {
        let size = Closure::allocation_size(num_copied);
        let closure = Closure::from_object(self.allocate_object(cid::CLOSURE, size, allocator));
        closure.set_num_copied(num_copied);
        closure
    }

    pub fn allocate_activation(&mut self, allocator: Allocator) -> Activation {
        let object = self.allocate_object(cid::ACTIVATION, Activation::SIZE, allocator);
        Activation::from_object(object)
    }

    pub fn allocate_regular_object(
        &mut self,
        cid: usize,
        num_slots: usize,
        allocator: Allocator,
    ) -> RegularObject {
        debug_assert!(cid::is_regular_object(cid) && cid < self.class_table.size());
        let size = RegularObject::allocation_size(num_slots);
        RegularObject::from_object(self.allocate_object(cid, size, allocator))
    }

    pub fn allocate_ephemeron(&mut self, allocator: Allocator) -> Ephemeron {
        let object = self.allocate_regular_object(cid::EPHEMERON, Ephemeron::NUM_SLOTS, allocator);
        Ephemeron::from_object(object.object())
    }

    /// Instantiates the object store's `Message` class, registering it
    /// first if needed. May collect.
    pub fn allocate_message(&mut self) -> Message {
        let mut id = self.message_class().id();
        if id == self.nil() {
            let cid = self.allocate_class_id();
            let class = self.message_class();
            self.register_class(cid, class);
            id = Value::from_smi(cid as isize);
        }
        let num_slots = self.message_class().format();
        let object = self.allocate_regular_object(id.smi_value() as usize, num_slots, Allocator::Normal);
        Message::from_object(object.object())
    }

    fn message_class(&self) -> Behavior {
        self.object_store()
            .message_class()
            .unwrap_or_else(|| fatal(format_args!("object store has no Message class")))
    }

    // ── roots ─────────────────────────────────────────────────────────

    /// Installs the object store. Called once, after the image is loaded.
    pub fn initialize_root(&mut self, object_store: Array) {
        debug_assert!(self.object_store == Value::default(), "object store installed twice");
        debug_assert!(object_store.len() >= store_index::COUNT);
        self.object_store = object_store.value();
        self.set_old_allocation_limit();
    }

    pub fn object_store(&self) -> ObjectStore {
        let array = Array::cast(self.object_store)
            .unwrap_or_else(|| fatal(format_args!("object store is not installed")));
        ObjectStore::from_array(array)
    }

    /// The nil object, or SmallInteger 0 before the object store exists.
    pub fn nil(&self) -> Value {
        Array::cast(self.object_store)
            .map(|store| ObjectStore::from_array(store).nil())
            .unwrap_or_default()
    }

    pub fn activation(&self) -> Value {
        self.current_activation
    }

    pub fn set_activation(&mut self, activation: Value) {
        debug_assert!(activation.is_smi() || Activation::cast(activation).is_some());
        self.current_activation = activation;
    }

    pub(crate) fn push_handle(&mut self, value: Value) -> Handle {
        if self.handles_len == HANDLES_CAPACITY {
            fatal(format_args!("more than {HANDLES_CAPACITY} live handles"));
        }
        let handle = Handle(self.handles_len);
        self.handles[self.handles_len] = value;
        self.handles_len += 1;
        handle
    }

    pub(crate) fn pop_handle(&mut self, handle: Handle) {
        debug_assert_eq!(handle.0 + 1, self.handles_len, "handles released out of order");
        self.handles_len -= 1;
        self.handles[self.handles_len] = Value::default();
    }

    pub fn handle(&self, handle: Handle) -> Value {
        debug_assert!(handle.0 < self.handles_len);
        self.handles[handle.0]
    }

    pub fn set_handle(&mut self, handle: Handle, value: Value) {
        debug_assert!(handle.0 < self.handles_len);
        self.handles[handle.0] = value;
    }

    // ── class table ───────────────────────────────────────────────────

    /// Hands out an unused class id, running a full collection to free
    /// dead classes when the table is exhausted.
    pub fn allocate_class_id(&mut self) -> usize {
        if let Some(cid) = self.class_table.try_allocate() {
            return cid;
        }
        log::info!("class table full, collecting to free class ids");
        self.collect_all(GcReason::ClassTable);
        self.class_table
            .try_allocate()
            .unwrap_or_else(|| fatal(format_args!("class table growth unimplemented")))
    }

    pub fn register_class(&mut self, cid: usize, class: Behavior) {
        debug_assert!(cid >= cid::FIRST_REGULAR_OBJECT && cid < self.class_table.size());
        debug_assert_eq!(self.class_table.at(cid), Value::default(), "class id {cid} in use");
        self.class_table.set(cid, class.value());
        class.set_id(Value::from_smi(cid as isize));
    }

    pub fn class_at(&self, cid: usize) -> Value {
        debug_assert!(cid < self.class_table.size());
        self.class_table.at(cid)
    }

    pub fn class_table_size(&self) -> usize {
        self.class_table.size()
    }

    // ── remembered set and mutator mark stack ─────────────────────────

    pub(crate) fn add_to_remembered_set(&mut self, object: HeapObject) {
        debug_assert!(object.is_old_object() && !object.is_remembered());
        object.set_is_remembered(true);
        self.remembered_set.add(object);
    }

    pub fn remembered_set_len(&self) -> usize {
        self.remembered_set.len()
    }

    pub fn remembered_set_capacity(&self) -> usize {
        self.remembered_set.capacity()
    }

    /// Compacts the remembered set and trims its storage. Never run
    /// automatically.
    pub fn shrink_remembered_set(&mut self) {
        self.remembered_set.shrink();
        log::info!(
            "remembered set shrunk to {} entries",
            self.remembered_set.capacity()
        );
    }

    pub(crate) fn add_to_mark_stack(&mut self, object: HeapObject) {
        debug_assert!(object.is_old_object() && object.is_marked());
        if self.mutator_block.is_full() {
            self.mutator_release_block();
        }
        self.mutator_block.push(object);
    }

    /// Publishes the mutator's block to the marker.
    pub(crate) fn mutator_release_block(&mut self) {
        if self.mutator_block.is_empty() {
            return;
        }
        let block = mem::replace(&mut self.mutator_block, MarkBlock::new());
        if self.handoff.send(block).is_err() {
            unreachable!("marker dropped its handoff receiver");
        }
    }

    // ── scavenge ──────────────────────────────────────────────────────

    /// Evacuates the young generation. Survivors that already outlived one
    /// scavenge are tenured.
    pub fn scavenge(&mut self, reason: GcReason) {
        debug_assert!(is_scavenge_reason(reason), "scavenge does not accept reason {reason}");
        let start = Instant::now();
        let new_before = self.new_size();
        let old_before = self.old_size;

        self.flip_spaces();

        // Every reference is strong during a scavenge. The list links in weak
        // arrays and ephemerons may belong to the concurrent marker.
        self.scavenge_roots();
        let mut scan = self.to.object_start();
        while scan < self.top || self.end < self.to.limit() {
            scan = self.scavenge_to_space(scan);
            self.process_tenure_stack();
        }

        if cfg!(debug_assertions) {
            self.from.mark_unallocated();
        }

        self.survivor_end = self.top;

        let new_after = self.new_size();
        let tenured = self.old_size - old_before;
        let survived = new_after + tenured;
        if survived > self.to.size() / 3 {
            let next = (self.to.size() * 2).min(self.settings.max_semispace_capacity);
            if next > self.next_semispace_capacity {
                log::info!("growing new space to {} KB", next / 1024);
            }
            self.next_semispace_capacity = next;
        }

        self.stats.scavenges += 1;
        self.stats.tenured_bytes += tenured as u64;
        log::debug!(
            "scavenge ({reason}, {} KB new, {} KB tenured, {} KB freed, {} us)",
            new_after / 1024,
            tenured / 1024,
            (new_before + old_before).saturating_sub(new_after + self.old_size) / 1024,
            start.elapsed().as_micros()
        );

        // The other reasons follow up with a mark-sweep of their own.
        if reason == GcReason::NewSpace {
            if self.old_size > self.old_limit {
                self.mark_sweep(GcReason::Tenure);
            } else {
                self.evaluate_concurrent_marking();
            }
        }
    }

    fn flip_spaces(&mut self) {
        mem::swap(&mut self.to, &mut self.from);
        if self.to.size() < self.next_semispace_capacity {
            let capacity = self.next_semispace_capacity;
            self.to = Semispace::allocate(capacity)
                .unwrap_or_else(|| fatal(format_args!("failed to reserve {capacity} byte semispace")));
        }
        debug_assert!(self.to.size() >= self.from.size());
        self.top = self.to.object_start();
        self.end = self.to.limit();
    }

    fn scavenge_roots(&mut self) {
        // Rescan the remembered set first so visiting and resetting happen
        // in one pass.
        let saved = self.remembered_set.begin_rescan();
        for index in 0..saved {
            let Some(object) = self.remembered_set.get(index) else {
                continue;
            };
            debug_assert!(object.is_remembered());
            object.set_is_remembered(false);
            self.scavenge_old_object(object);
        }

        self.object_store = self.scavenge_value(self.object_store);
        self.current_activation = self.scavenge_value(self.current_activation);
        for index in 0..self.handles_len {
            self.handles[index] = self.scavenge_value(self.handles[index]);
        }
        for cid in cid::FIRST_LEGAL..self.class_table.size() {
            let class = self.scavenge_value(self.class_table.at(cid));
            self.class_table.set(cid, class);
        }
    }

    fn scavenge_to_space(&mut self, mut scan: usize) -> usize {
        while scan < self.top {
            // SAFETY: to-space below `top` is a contiguous run of objects
            let object = unsafe { HeapObject::from_addr(scan) };
            for slot in object.pointers() {
                let value = self.scavenge_value(slot.load());
                slot.store(value);
            }
            scan += object.heap_size();
        }
        scan
    }

    fn push_tenure_stack(&mut self, addr: usize) {
        debug_assert!(self.end - WORD_SIZE >= self.top);
        self.end -= WORD_SIZE;
        // SAFETY: the tail of to-space above `top` is unused
        unsafe { write_word(self.end, addr) };
    }

    fn process_tenure_stack(&mut self) {
        while self.end < self.to.limit() {
            // SAFETY: entries between `end` and the limit were pushed above
            let addr = unsafe { read_word(self.end) };
            self.end += WORD_SIZE;
            // SAFETY: the entry is a freshly tenured object
            let object = unsafe { HeapObject::from_addr(addr) };
            self.scavenge_old_object(object);
            if self.marking {
                debug_assert!(object.is_marked());
                self.add_to_mark_stack(object);
            }
        }
    }

    fn scavenge_old_object(&mut self, object: HeapObject) {
        debug_assert!(object.is_old_object());
        let mut has_young = false;
        for slot in object.pointers() {
            let value = self.scavenge_value(slot.load());
            slot.store(value);
            has_young |= value.is_new_object();
        }
        if has_young && !object.is_remembered() {
            self.add_to_remembered_set(object);
        }
    }

    /// Returns the post-scavenge location of `value`, copying it on first
    /// visit.
    fn scavenge_value(&mut self, value: Value) -> Value {
        let Some(old) = value.as_new_object() else {
            return value;
        };
        debug_assert!(self.from.contains(old.addr()), "{old:?} is not in from-space");
        if old.is_forwarded() {
            return old.forwarding_target().value();
        }

        let size = old.heap_size();
        let addr = if old.addr() < self.survivor_end {
            self.allocate_tenure(size)
        } else {
            match self.try_allocate_new(size) {
                Some(addr) => addr,
                None => self.allocate_tenure(size),
            }
        };
        let mut offset = 0;
        while offset < size {
            // SAFETY: both ranges hold `size` bytes; the target is unused
            unsafe { write_word(addr + offset, read_word(old.addr() + offset)) };
            offset += WORD_SIZE;
        }
        // SAFETY: a complete copy of `old` now sits at `addr`
        let target = unsafe { HeapObject::from_addr(addr) };
        if target.is_old_object() && self.marking {
            // Already black for the concurrent marker; the tenure stack
            // scans its slots and pushes it explicitly.
            target.set_is_marked(true);
        }
        old.set_forwarding_target(target);
        target.value()
    }

    // ── whole-heap walks ──────────────────────────────────────────────

    pub(crate) fn for_each_object(&self, mut visit: impl FnMut(HeapObject)) {
        let mut scan = self.to.object_start();
        while scan < self.top {
            // SAFETY: to-space below `top` is a contiguous run of objects
            let object = unsafe { HeapObject::from_addr(scan) };
            visit(object);
            scan += object.heap_size();
        }
        for page in &self.pages {
            let mut scan = page.object_start();
            while scan < page.object_end() {
                // SAFETY: a page prefix is a contiguous run of objects
                let object = unsafe { HeapObject::from_addr(scan) };
                visit(object);
                scan += object.heap_size();
            }
        }
    }

    pub fn count_instances(&self, cid: usize) -> usize {
        let mut count = 0;
        self.for_each_object(|object| {
            if object.cid() == cid {
                count += 1;
            }
        });
        count
    }

    /// Stores instances of `cid` into `array`, up to its length. Returns
    /// the number of instances found.
    pub fn collect_instances(&mut self, cid: usize, array: Array) -> usize {
        let mut instances = Vec::new();
        self.for_each_object(|object| {
            if object.cid() == cid {
                instances.push(object.value());
            }
        });
        debug_assert!(instances.len() <= array.len());
        for (index, &instance) in instances.iter().take(array.len()).enumerate() {
            array.set_element(index, instance, self);
        }
        instances.len()
    }

    /// Collects everything: finishes any mark, tenures every young
    /// survivor, then marks and sweeps the old generation.
    ///
    /// `reason` must be one a scavenge accepts: `NewSpace`, `ClassTable`,
    /// `Primitive` or `SnapshotTest`.
    pub fn collect_all(&mut self, reason: GcReason) {
        debug_assert!(
            is_scavenge_reason(reason),
            "collect_all does not accept reason {reason}"
        );
        self.mark_sweep(GcReason::Finalize);
        self.survivor_end = self.end;
        self.scavenge(reason);
        self.mark_sweep(reason);
    }

    pub(crate) fn set_old_allocation_limit(&mut self) {
        let size = self.old_size;
        self.old_limit = size + (size / 2).max(2 * self.settings.page_size);
    }
}

// ── write barrier ─────────────────────────────────────────────────────

impl StoreBarrier for Heap {
    #[inline]
    fn on_store(&mut self, object: HeapObject, value: Value) {
        if !object.is_old_object() {
            return;
        }
        if value.is_new_object() && !object.is_remembered() {
            self.add_to_remembered_set(object);
        }
        if self.marking {
            if let Some(target) = value.as_old_object() {
                if target.try_acquire_mark_bit() {
                    self.add_to_mark_stack(target);
                }
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.wait_for_marker();
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("new_size", &self.new_size())
            .field("new_capacity", &self.new_capacity())
            .field("old_size", &self.old_size)
            .field("old_capacity", &self.old_capacity)
            .field("old_limit", &self.old_limit)
            .field("pages", &self.pages.len())
            .field("marking", &self.marking)
            .finish()
    }
}
