//! # Std Scheduler
//!
//! [`NativeScheduler`] backed by `std::thread`.

use super::{NativeEntry, NativeHandle, NativeScheduler, Priority, SpawnRequest};
use crate::{ThreadError, ThreadId, ThreadResult};
use std::thread;

/// Scheduler that maps each entity onto one `std::thread`
#[derive(Debug, Default, Clone, Copy)]
pub struct StdScheduler;

impl NativeScheduler for StdScheduler {
    fn name(&self) -> &'static str {
        "std"
    }

    fn spawn(&self, request: SpawnRequest, entry: NativeEntry) -> ThreadResult<NativeHandle> {
        let mut builder = thread::Builder::new().name(request.name.clone());
        if let Some(size) = request.stack_size {
            builder = builder.stack_size(size);
        }

        builder.spawn(entry).map(NativeHandle::new).map_err(|err| {
            log::warn!("Failed to spawn native thread {}: {}", request.name, err);
            ThreadError::SpawnFailed { kind: err.kind() }
        })
    }

    fn yield_now(&self) {
        thread::yield_now();
    }

    fn apply_priority(&self, thread: ThreadId, priority: Priority) {
        // std exposes no portable priority control
        log::trace!("Priority hint for thread {}: {}", thread, priority);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_spawn_runs_entry() {
        let (tx, rx) = mpsc::channel();
        let request = SpawnRequest::new(ThreadId::new(9), "strand-test-9")
            .with_stack_size(Some(256 * 1024));

        let handle = StdScheduler
            .spawn(
                request,
                Box::new(move || {
                    let name = thread::current().name().map(String::from);
                    tx.send(name).unwrap();
                }),
            )
            .unwrap();

        assert_eq!(rx.recv().unwrap().as_deref(), Some("strand-test-9"));
        while !handle.is_finished() {
            thread::yield_now();
        }
    }

    #[test]
    fn test_detached_handle() {
        let handle = NativeHandle::detached();
        assert!(!handle.is_finished());
    }
}
