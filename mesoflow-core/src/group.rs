//! The set of cooperating processes a simulation runs on.
//!
//! Checkpoints are collective: one coordinating process writes the shared files
//! while every process writes its own shard. The trait only exposes the few
//! collectives that protocol needs.

use std::sync::{Arc, Barrier, Mutex};

pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// The process that writes shared files.
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every process of the group reached the barrier.
    fn barrier(&self);

    /// Every process contributes one value; all receive the values ordered by rank.
    fn all_gather_u64(&self, value: u64) -> Vec<u64>;
}

/// A group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_gather_u64(&self, value: u64) -> Vec<u64> {
        vec![value]
    }
}

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<u64>>,
}

/// In-process group: each rank is driven by its own thread.
#[derive(Clone)]
pub struct ThreadGroup {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl ThreadGroup {
    /// Create the handles of a group of `size` ranks, ordered by rank.
    pub fn create(size: usize) -> Vec<ThreadGroup> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![0; size]),
        });
        (0..size)
            .map(|rank| ThreadGroup {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn all_gather_u64(&self, value: u64) -> Vec<u64> {
        // A poisoned lock means a peer thread panicked mid-collective; nothing sane is left to do.
        self.shared.slots.lock().expect("process group poisoned")[self.rank] = value;
        self.shared.barrier.wait();
        let gathered = self.shared.slots.lock().expect("process group poisoned").clone();
        // Nobody may overwrite a slot before everyone has read it.
        self.shared.barrier.wait();
        gathered
    }
}
