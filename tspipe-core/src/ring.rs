//! Shared packet buffer.
//!
//! One page-aligned allocation of K packet slots shared by every stage of
//! the pipeline. Slots are addressed by monotonically increasing 64-bit
//! sequence numbers; slot index is `seq % K`. The buffer itself performs
//! no locking: the stage cursors published under the pipeline mutex are
//! the synchronization discipline, and a slot may be read or written only
//! by the one stage whose window covers its sequence number.
//!
//! The allocation is locked into physical memory when the OS permits;
//! failure to lock is reported and the pipeline continues with a weaker
//! real-time guarantee.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use log::{debug, warn};

use crate::error::PipelineError;
use crate::packet::{TsPacket, NULL_PACKET, TS_PACKET_SIZE};

/// Alignment of the buffer allocation.
const PAGE_SIZE: usize = 4096;

/// A fixed pool of TS packet slots addressed by sequence number.
pub struct PacketBuffer {
    ptr: NonNull<TsPacket>,
    count: usize,
    layout: Layout,
    locked: bool,
}

// The buffer is shared across worker threads; access discipline is
// enforced by the executor's cursor publication.
unsafe impl Send for PacketBuffer {}
unsafe impl Sync for PacketBuffer {}

impl PacketBuffer {
    /// Allocate a buffer of `count` packet slots, initialized to null
    /// packets, and try to lock it into physical memory.
    pub fn new(count: usize) -> Result<Self, PipelineError> {
        if count == 0 {
            return Err(PipelineError::BufferAllocation(count));
        }
        let layout = Layout::from_size_align(count * TS_PACKET_SIZE, PAGE_SIZE)
            .map_err(|_| PipelineError::BufferAllocation(count))?;
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw.cast::<TsPacket>()) else {
            return Err(PipelineError::BufferAllocation(count));
        };
        for i in 0..count {
            unsafe { ptr.as_ptr().add(i).write(NULL_PACKET) };
        }

        let locked = lock_memory(raw, layout.size());
        if locked {
            debug!(
                "packet buffer locked in memory: {} packets, {} bytes",
                count,
                layout.size()
            );
        } else {
            warn!(
                "packet buffer failed to lock into physical memory, \
                 risk of real-time issue"
            );
        }

        Ok(Self {
            ptr,
            count,
            layout,
            locked,
        })
    }

    /// Number of packet slots.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether the buffer is resident in physical memory.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Raw pointer to the slot of a sequence number.
    ///
    /// # Safety
    ///
    /// The caller must hold the exclusive processing window for `seq`:
    /// `cursor(predecessor) > seq >= cursor(self)`. Two stages never hold
    /// overlapping windows, which makes the returned pointer unique.
    pub unsafe fn slot(&self, seq: u64) -> *mut TsPacket {
        self.ptr.as_ptr().add((seq % self.count as u64) as usize)
    }

    /// Contiguous run of slots starting at `seq`, clamped to the end of
    /// the ring, at most `max` slots.
    ///
    /// # Safety
    ///
    /// Same window requirement as [`slot`](Self::slot), for every
    /// sequence number in the returned run.
    pub unsafe fn slice_mut(&self, seq: u64, max: usize) -> &mut [TsPacket] {
        let index = (seq % self.count as u64) as usize;
        let len = max.min(self.count - index);
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(index), len)
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        let raw = self.ptr.as_ptr().cast::<u8>();
        if self.locked {
            unlock_memory(raw, self.layout.size());
        }
        unsafe { dealloc(raw, self.layout) };
    }
}

#[cfg(unix)]
fn lock_memory(ptr: *mut u8, size: usize) -> bool {
    unsafe { libc::mlock(ptr.cast(), size) == 0 }
}

#[cfg(not(unix))]
fn lock_memory(_ptr: *mut u8, _size: usize) -> bool {
    false
}

#[cfg(unix)]
fn unlock_memory(ptr: *mut u8, size: usize) {
    unsafe {
        libc::munlock(ptr.cast(), size);
    }
}

#[cfg(not(unix))]
fn unlock_memory(_ptr: *mut u8, _size: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::pid;

    #[test]
    fn test_slots_initialized_to_null_packets() {
        let buf = PacketBuffer::new(16).unwrap();
        assert_eq!(buf.count(), 16);
        for seq in 0..16u64 {
            let pkt = unsafe { &*buf.slot(seq) };
            assert!(pkt.has_valid_sync());
            assert_eq!(pkt.pid(), pid::NULL);
        }
    }

    #[test]
    fn test_sequence_wraps_to_same_slot() {
        let buf = PacketBuffer::new(8).unwrap();
        unsafe {
            (*buf.slot(3)).set_pid(0x0123);
            // seq 11 maps onto the same slot as seq 3.
            assert_eq!((*buf.slot(11)).pid(), 0x0123);
            assert_eq!((*buf.slot(3 + 8 * 1000)).pid(), 0x0123);
        }
    }

    #[test]
    fn test_slice_clamped_at_ring_end() {
        let buf = PacketBuffer::new(8);
        let buf = buf.unwrap();
        let run = unsafe { buf.slice_mut(6, 100) };
        assert_eq!(run.len(), 2);
        let run = unsafe { buf.slice_mut(0, 100) };
        assert_eq!(run.len(), 8);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(PacketBuffer::new(0).is_err());
    }
}
