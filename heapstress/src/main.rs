use clap::Parser as ClapParser;
use std::process;

use heap::{Allocator, GcReason, HandleScope, Heap, HeapSettings};
use object::{Array, Behavior, Ephemeron, Message, Str, Value, store_index};

/// Ring slots past the live entries, used to keep intermediate objects
/// reachable across allocations.
const SCRATCH: usize = 3;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of workload iterations
    #[arg(long, default_value_t = 100_000)]
    iterations: usize,

    /// Objects retained in the ring
    #[arg(long, default_value_t = 1024, help = "Strings kept alive at any time")]
    live: usize,

    /// Garbage objects per iteration
    #[arg(long, default_value_t = 8)]
    garbage: usize,

    /// Initial semispace capacity
    #[arg(long, default_value_t = 1024, help = "Initial semispace capacity in KiB")]
    semispace_kib: usize,

    /// Old-space page size
    #[arg(long, default_value_t = 256, help = "Old-space page size in KiB")]
    page_kib: usize,

    /// Replace a ring entry through become every N iterations
    #[arg(long, default_value_t = 0, help = "Run become every N iterations (0 disables)")]
    become_every: usize,

    /// Attach an ephemeron to every ring entry
    #[arg(long)]
    ephemerons: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let settings = heap_settings(&cli);
    if let Err(message) = settings.validate() {
        eprintln!("Invalid heap settings: {message}");
        process::exit(2);
    }

    let mut heap = bootstrap(settings);
    let corrupt = run(&mut heap, &cli);
    report(&heap, &cli);

    if corrupt > 0 {
        eprintln!("{corrupt} retained objects were corrupted");
        process::exit(1);
    }
}

fn heap_settings(cli: &Cli) -> HeapSettings {
    let defaults = HeapSettings::default();
    let semispace = cli.semispace_kib * 1024;
    let page_size = cli.page_kib * 1024;
    HeapSettings {
        initial_semispace_capacity: semispace,
        max_semispace_capacity: defaults.max_semispace_capacity.max(semispace),
        page_size,
        large_allocation: defaults.large_allocation.min(page_size / 2).min(semispace / 2) & !15,
        ..defaults
    }
}

/// Installs an object store with nil, false and true, plus the classes
/// they need.
fn bootstrap(settings: HeapSettings) -> Heap {
    let mut heap = Heap::new(settings);
    let store = heap.allocate_array(store_index::COUNT, Allocator::Snapshot);

    let class_cid = heap.allocate_class_id();
    let object_cid = heap.allocate_class_id();
    let nil = heap
        .allocate_regular_object(object_cid, 0, Allocator::Snapshot)
        .value();
    for index in 0..store.len() {
        store.set_element(index, nil, &mut heap);
    }

    let metaclass = new_class(&mut heap, class_cid, nil, Behavior::NUM_SLOTS);
    heap.register_class(class_cid, metaclass);
    let object_class = new_class(&mut heap, class_cid, nil, 0);
    heap.register_class(object_cid, object_class);

    for index in [store_index::FALSE, store_index::TRUE] {
        let boolean = heap.allocate_regular_object(object_cid, 0, Allocator::Snapshot);
        store.set_element(index, boolean.value(), &mut heap);
    }
    let message_class = new_class(&mut heap, class_cid, nil, Message::NUM_SLOTS);
    store.set_element(store_index::MESSAGE_CLASS, message_class.value(), &mut heap);

    heap.initialize_root(store);
    heap
}

fn new_class(heap: &mut Heap, class_cid: usize, nil: Value, format: usize) -> Behavior {
    let object = heap.allocate_regular_object(class_cid, Behavior::NUM_SLOTS, Allocator::Snapshot);
    let class = Behavior::from_object(object.object());
    for index in 0..Behavior::NUM_SLOTS {
        class.set_slot(index, nil, heap);
    }
    class.set_format(format);
    class
}

// ── workload ─────────────────────────────────────────────────────────

fn ring(scope: &HandleScope<'_>) -> Array {
    let Some(ring) = Array::cast(scope.get()) else {
        unreachable!("ring root is not an array");
    };
    ring
}

fn scratch(live: usize, index: usize) -> usize {
    2 * live + index
}

fn store(scope: &mut HandleScope<'_>, index: usize, value: Value) {
    let ring = ring(scope);
    ring.set_element(index, value, scope);
}

fn new_string(scope: &mut HandleScope<'_>, text: &str) -> Value {
    let string = scope.allocate_string(text.len(), Allocator::Normal);
    string.copy_from_slice(text.as_bytes());
    string.value()
}

/// Returns the number of corrupted entries found.
fn run(heap: &mut Heap, cli: &Cli) -> usize {
    let live = cli.live.max(1);
    let ring = heap.allocate_array(2 * live + SCRATCH, Allocator::Normal);
    let mut scope = HandleScope::new(heap, ring.value());
    let mut written: Vec<Option<usize>> = vec![None; live];

    for iteration in 0..cli.iterations {
        let slot = iteration % live;
        let string = new_string(&mut scope, &format!("obj-{iteration}"));
        store(&mut scope, slot, string);
        if cli.ephemerons {
            attach_ephemeron(&mut scope, live, slot, iteration);
        }
        written[slot] = Some(iteration);

        for index in 0..cli.garbage {
            allocate_garbage(&mut scope, iteration * cli.garbage + index);
        }

        if cli.become_every > 0 && (iteration + 1) % cli.become_every == 0 {
            let victim = (iteration / cli.become_every) % live;
            if let Some(origin) = written[victim] {
                replace_by_become(&mut scope, live, victim, origin);
            }
        }
    }

    let mut corrupt = verify(&scope, live, &written, cli.ephemerons);
    scope.collect_all(GcReason::Primitive);
    corrupt += verify(&scope, live, &written, cli.ephemerons);
    corrupt
}

fn attach_ephemeron(scope: &mut HandleScope<'_>, live: usize, slot: usize, iteration: usize) {
    let value = new_string(scope, &format!("val-{iteration}"));
    store(scope, scratch(live, 0), value);
    let ephemeron = scope.allocate_ephemeron(Allocator::Normal);

    let ring = ring(scope);
    ephemeron.set_key(ring.element(slot), scope);
    ephemeron.set_value_slot(ring.element(scratch(live, 0)), scope);
    ring.set_element(live + slot, ephemeron.value(), scope);
    ring.set_element(scratch(live, 0), Value::from_smi(0), scope);
}

fn allocate_garbage(scope: &mut HandleScope<'_>, n: usize) {
    if n % 4096 == 4095 {
        scope.allocate_array(8 * 1024, Allocator::Normal);
        return;
    }
    match n % 4 {
        0 => {
            scope.allocate_array(n % 16 + 1, Allocator::Normal);
        }
        1 => {
            scope.allocate_string(n % 64, Allocator::Normal);
        }
        2 => {
            scope.allocate_byte_array(n % 128, Allocator::Normal);
        }
        _ => {
            scope.allocate_integer(i64::MAX - n as i64, Allocator::Normal);
        }
    }
}

/// Swaps the string at `slot` for an equal copy through become.
fn replace_by_become(scope: &mut HandleScope<'_>, live: usize, slot: usize, origin: usize) {
    let replacement = new_string(scope, &format!("obj-{origin}"));
    store(scope, scratch(live, 0), replacement);
    let old = scope.allocate_array(1, Allocator::Normal).value();
    store(scope, scratch(live, 1), old);
    let new = scope.allocate_array(1, Allocator::Normal).value();
    store(scope, scratch(live, 2), new);

    let ring = ring(scope);
    let (Some(old), Some(new)) = (
        Array::cast(ring.element(scratch(live, 1))),
        Array::cast(ring.element(scratch(live, 2))),
    ) else {
        unreachable!("scratch slots hold arrays");
    };
    old.set_element(0, ring.element(slot), scope);
    new.set_element(0, ring.element(scratch(live, 0)), scope);
    if let Err(err) = scope.become_forward(old, new) {
        log::error!("become failed: {err}");
    }
    for index in 0..SCRATCH {
        ring.set_element(scratch(live, index), Value::from_smi(0), scope);
    }
}

fn verify(scope: &HandleScope<'_>, live: usize, written: &[Option<usize>], ephemerons: bool) -> usize {
    let ring = ring(scope);
    let mut corrupt = 0;
    for (slot, origin) in written.iter().enumerate() {
        let Some(origin) = *origin else {
            continue;
        };
        let value = ring.element(slot);
        let expected = format!("obj-{origin}");
        if !Str::cast(value).is_some_and(|string| string.to_vec() == expected.as_bytes()) {
            log::error!("slot {slot}: expected {expected:?}, found {value:?}");
            corrupt += 1;
            continue;
        }
        if !ephemerons {
            continue;
        }
        let expected = format!("val-{origin}");
        let intact = Ephemeron::cast(ring.element(live + slot)).is_some_and(|ephemeron| {
            ephemeron.key() == value
                && Str::cast(ephemeron.value_slot())
                    .is_some_and(|string| string.to_vec() == expected.as_bytes())
        });
        if !intact {
            log::error!("slot {slot}: ephemeron lost {expected:?}");
            corrupt += 1;
        }
    }
    corrupt
}

fn report(heap: &Heap, cli: &Cli) {
    let stats = heap.stats();
    println!("iterations        {}", cli.iterations);
    println!("scavenges         {}", stats.scavenges);
    println!("mark-sweeps       {}", stats.mark_sweeps);
    println!("concurrent marks  {}", stats.concurrent_marks);
    println!("tenured           {} KB", stats.tenured_bytes / 1024);
    println!("reclaimed         {} KB", stats.reclaimed_bytes / 1024);
    println!("new space         {} / {} KB", heap.new_size() / 1024, heap.new_capacity() / 1024);
    println!("old space         {} / {} KB", heap.old_size() / 1024, heap.old_capacity() / 1024);
    println!("pages             {}", heap.page_count());
}
