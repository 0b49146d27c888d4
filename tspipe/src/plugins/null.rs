//! Trivial built-in processors.

use tspipe_core::packet::NULL_PACKET;
use tspipe_core::plugin::{ProcessContext, ProcessStatus, ProcessorPlugin};
use tspipe_core::TsPacket;

/// Processor passing every packet through untouched.
#[derive(Default)]
pub struct PassThrough;

impl ProcessorPlugin for PassThrough {
    fn name(&self) -> &str {
        "pass"
    }

    fn process(&mut self, _pkt: &mut TsPacket, _ctx: &mut ProcessContext) -> ProcessStatus {
        ProcessStatus::Ok
    }
}

/// Processor replacing every packet with a null packet, keeping the
/// stream bitrate intact.
#[derive(Default)]
pub struct Nullify {
    count: u64,
}

impl ProcessorPlugin for Nullify {
    fn name(&self) -> &str {
        "null"
    }

    fn stop(&mut self) -> bool {
        log::debug!("nullified {} packets", self.count);
        true
    }

    fn process(&mut self, pkt: &mut TsPacket, _ctx: &mut ProcessContext) -> ProcessStatus {
        *pkt = NULL_PACKET;
        self.count += 1;
        ProcessStatus::Ok
    }
}
