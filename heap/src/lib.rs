mod class_table;
mod forward;
mod freelist;
mod handles;
mod heap;
mod mark_block;
mod mark_sweep;
mod marker;
mod page;
mod remembered_set;
mod semispace;
mod settings;
mod system;

#[cfg(test)]
mod testing;

pub use forward::BecomeError;
pub use handles::HandleScope;
pub use heap::{Allocator, GcReason, GcStats, HANDLES_CAPACITY, Handle, Heap};
pub use marker::MarkingState;
pub use settings::HeapSettings;
pub use system::OS_PAGE_SIZE;
