//! # Core Module
//!
//! Small shared primitives used across the engine: the thread-safe resource
//! wrapper handed to worker tasks and the viewer-interest reference counter.

mod mt_resource;

pub use mt_resource::MtResource;

/// Counts how many viewers hold an interest in a block.
///
/// Reaches zero only when every interested viewer has left range, which is
/// the trigger for cancelling a pending load or unloading a resident block.
#[derive(Clone, Debug, Default)]
pub struct RefCount(u32);

impl RefCount {
    /// Creates a counter starting at `count`.
    pub fn new(count: u32) -> Self {
        RefCount(count)
    }

    /// Increments the counter.
    pub fn add(&mut self) {
        self.0 += 1;
    }

    /// Decrements the counter and returns the new value.
    ///
    /// # Panics
    /// Panics in debug builds if the counter is already zero; that means an
    /// unview without a matching view, which is a bookkeeping fault.
    pub fn remove(&mut self) -> u32 {
        debug_assert!(self.0 > 0, "unbalanced viewer refcount");
        self.0 = self.0.saturating_sub(1);
        self.0
    }

    /// Current count.
    pub fn get(&self) -> u32 {
        self.0
    }
}
