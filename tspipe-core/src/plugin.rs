//! Stage plugin capability traits.
//!
//! A pipeline is one input, zero or more processors, and one output. Each
//! stage owns an opaque plugin implementing one of the traits below.
//! Plugins report their own failures through the logging facade and
//! signal them by returning `false` (start/stop/send) or
//! [`ProcessStatus::End`] (processors); no panics cross this boundary in
//! steady state.

use crate::packet::TsPacket;

/// Verdict of a processor for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Pass the packet downstream, possibly rewritten in place.
    Ok,
    /// Remove the packet from the stream.
    Drop,
    /// Replace the packet with a null packet.
    Null,
    /// Fatal error: abort the pipeline with a non-zero exit status.
    End,
}

/// Per-packet context handed to processors.
///
/// Processors read the current stream bitrate from it and raise the
/// `flush` / `bitrate_changed` flags for the executor to act on at the
/// end of the batch.
#[derive(Debug, Default)]
pub struct ProcessContext {
    /// Current transport stream bitrate in bits/second, 0 when unknown.
    pub ts_bitrate: u32,
    /// Set by the processor to ask the output not to buffer further.
    pub flush: bool,
    /// Set by the processor when its reported bitrate changed.
    pub bitrate_changed: bool,
}

/// Capability set of an input stage plugin.
pub trait InputPlugin: Send {
    /// Plugin name, for logs.
    fn name(&self) -> &str;

    /// Initialize. Called once, before any packet.
    fn start(&mut self) -> bool {
        true
    }

    /// Release resources. Called once, after termination.
    fn stop(&mut self) -> bool {
        true
    }

    /// Fill `buffer` with TS packets, blocking until at least one is
    /// available. Returns the number of packets stored; 0 on clean end
    /// of stream or unrecoverable error.
    fn receive(&mut self, buffer: &mut [TsPacket]) -> usize;

    /// Input bitrate in bits/second, 0 when unknown.
    fn bitrate(&self) -> u32 {
        0
    }
}

/// Capability set of a processor stage plugin.
pub trait ProcessorPlugin: Send {
    /// Plugin name, for logs.
    fn name(&self) -> &str;

    /// Initialize. Called once, before any packet.
    fn start(&mut self) -> bool {
        true
    }

    /// Release resources. Called once, after termination.
    fn stop(&mut self) -> bool {
        true
    }

    /// Examine one packet and decide its fate. The packet may be
    /// rewritten in place.
    fn process(&mut self, pkt: &mut TsPacket, ctx: &mut ProcessContext) -> ProcessStatus;

    /// Bitrate known to this processor in bits/second, 0 when unknown.
    /// Re-read by the executor after `bitrate_changed`.
    fn bitrate(&self) -> u32 {
        0
    }
}

/// Capability set of an output stage plugin.
pub trait OutputPlugin: Send {
    /// Plugin name, for logs.
    fn name(&self) -> &str;

    /// Initialize the output device. Called once, after the stream
    /// bitrate is knowable.
    fn start(&mut self) -> bool {
        true
    }

    /// Release resources. Called once, after termination.
    fn stop(&mut self) -> bool {
        true
    }

    /// Write packets to the sink, blocking; pacing to the stream bitrate
    /// is the plugin's responsibility. Returns false on fatal error.
    fn send(&mut self, packets: &[TsPacket]) -> bool;

    /// Notification of a bitrate change, with the new rate in
    /// bits/second.
    fn bitrate_changed(&mut self, _bitrate: u32) {}
}
