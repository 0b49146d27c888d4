//! Stage descriptors and the state shared by all pipeline workers.
//!
//! The stages form a ring: input, processors in declaration order, output,
//! and back to input. Rather than a cyclic ownership graph, the executor
//! owns a flat stage table and each descriptor carries the indices of its
//! ring neighbours.
//!
//! One global mutex protects every cursor, the done and abort flags and
//! the versioned bitrate cell. Each protected operation is a pointer or
//! arithmetic update, so the single mutex is not a bottleneck at
//! realistic packet rates. Packet slots themselves are unprotected:
//! ownership moves between stages through cursor publication, which the
//! mutex orders.

use std::sync::atomic::AtomicBool;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::ring::PacketBuffer;

/// Role of a stage in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// The packet source.
    Input,
    /// An intermediate packet processor.
    Processor,
    /// The packet sink.
    Output,
}

/// Immutable description of one stage in the ring.
#[derive(Debug)]
pub(crate) struct StageSlot {
    pub kind: StageKind,
    pub name: String,
    /// Ring predecessor (the stage whose cursor bounds ours).
    pub prev: usize,
    /// Ring successor.
    pub next: usize,
}

/// Cursor and flag state guarded by the global mutex.
#[derive(Debug)]
pub(crate) struct SharedState {
    /// Per-stage published cursor: sequence number of the next packet
    /// this stage has not yet made available downstream.
    pub cursors: Vec<u64>,
    /// Per-stage termination flag, published with the final cursor. This
    /// is the formalization of the "cursor at infinity" sentinel: a done
    /// stage never advances again.
    pub done: Vec<bool>,
    /// Per-stage abort flag, checked at batch boundaries.
    pub aborted: Vec<bool>,
    /// Current stream bitrate in bits/second, 0 when unknown.
    pub bitrate: u32,
    /// Monotonic version of the bitrate cell.
    pub bitrate_version: u64,
    /// A processor asked the output not to buffer further.
    pub flush: bool,
    /// A plugin failed fatally; the exit status must be non-zero.
    pub fatal: bool,
}

/// Everything the worker threads share.
pub(crate) struct PipelineShared {
    pub state: Mutex<SharedState>,
    pub cond: Condvar,
    pub buffer: PacketBuffer,
    /// Per-slot dropped marks. A processor dropping a packet marks its
    /// slot; downstream stages skip marked slots and the input clears
    /// the marks when it recycles them.
    pub dropped: Box<[AtomicBool]>,
    pub stages: Vec<StageSlot>,
    /// Maximum packets a stage claims per batch.
    pub batch: usize,
}

impl PipelineShared {
    /// Lock the shared state; `None` when another worker panicked.
    pub fn lock(&self) -> Option<MutexGuard<'_, SharedState>> {
        self.state.lock().ok()
    }

    /// Set the abort flag on every stage, walking the ring from the
    /// input, and wake all workers.
    pub fn abort_all(&self) {
        if let Some(mut st) = self.lock() {
            let mut idx = 0;
            loop {
                st.aborted[idx] = true;
                idx = self.stages[idx].next;
                if idx == 0 {
                    break;
                }
            }
        }
        self.cond.notify_all();
    }
}

/// Observable cursor and flag snapshot of one stage.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    /// Stage name (the plugin name).
    pub name: String,
    /// Stage role.
    pub kind: StageKind,
    /// Published cursor.
    pub cursor: u64,
    /// Whether the stage has terminated.
    pub done: bool,
    /// Whether the stage was aborted.
    pub aborted: bool,
}

/// Observable snapshot of the whole pipeline.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    /// Per-stage snapshots, in ring order starting at the input.
    pub stages: Vec<StageMetrics>,
    /// Current stream bitrate in bits/second.
    pub bitrate: u32,
    /// Number of bitrate changes published so far.
    pub bitrate_version: u64,
    /// Capacity of the shared buffer in packets.
    pub buffer_packets: usize,
    /// Whether the buffer is locked in physical memory.
    pub buffer_locked: bool,
}
