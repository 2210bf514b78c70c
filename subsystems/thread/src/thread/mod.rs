//! # Thread Management
//!
//! Thread entities, their state machine, per-thread stores and the registry
//! of live threads.

pub mod local_storage;
pub mod recursion;
pub mod registry;
pub mod states;
#[allow(clippy::module_inception)]
pub mod thread;

pub use local_storage::ThreadLocals;
pub use recursion::RecursionTracker;
pub use registry::ThreadRegistry;
pub use states::{ThreadFlags, ThreadState};
pub use thread::{Randomizer, Thread};
