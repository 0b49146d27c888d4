//! Pipeline end-to-end: ordering, EOF drain, abort, fatal errors.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tspipe_core::error::PipelineError;
use tspipe_core::executor::{Pipeline, PipelineConfig};
use tspipe_core::packet::{pid, NULL_PACKET, TS_PACKET_SIZE};
use tspipe_core::plugin::{
    InputPlugin, OutputPlugin, ProcessContext, ProcessStatus, ProcessorPlugin,
};
use tspipe_core::stage::StageKind;
use tspipe_core::TsPacket;

/// Emits `total` stuffed packets tagged with a sequence number, then
/// signals end of stream.
struct SeqInput {
    total: u32,
    next: u32,
    bitrate: u32,
}

impl InputPlugin for SeqInput {
    fn name(&self) -> &str {
        "seq-input"
    }

    fn receive(&mut self, buffer: &mut [TsPacket]) -> usize {
        let remaining = (self.total - self.next) as usize;
        let count = buffer.len().min(remaining);
        for pkt in buffer.iter_mut().take(count) {
            *pkt = NULL_PACKET;
            pkt.b[4..8].copy_from_slice(&self.next.to_be_bytes());
            self.next += 1;
        }
        count
    }

    fn bitrate(&self) -> u32 {
        self.bitrate
    }
}

/// Input producing packets forever; used by the abort test.
struct EndlessInput;

impl InputPlugin for EndlessInput {
    fn name(&self) -> &str {
        "endless-input"
    }

    fn receive(&mut self, buffer: &mut [TsPacket]) -> usize {
        for pkt in buffer.iter_mut() {
            *pkt = NULL_PACKET;
        }
        buffer.len()
    }
}

#[derive(Default)]
struct NoopProcessor;

impl ProcessorPlugin for NoopProcessor {
    fn name(&self) -> &str {
        "noop"
    }

    fn process(&mut self, _pkt: &mut TsPacket, _ctx: &mut ProcessContext) -> ProcessStatus {
        ProcessStatus::Ok
    }
}

/// Fails fatally on the n-th packet.
struct FailingProcessor {
    countdown: u32,
}

impl ProcessorPlugin for FailingProcessor {
    fn name(&self) -> &str {
        "failing"
    }

    fn process(&mut self, _pkt: &mut TsPacket, _ctx: &mut ProcessContext) -> ProcessStatus {
        if self.countdown == 0 {
            return ProcessStatus::End;
        }
        self.countdown -= 1;
        ProcessStatus::Ok
    }
}

#[derive(Clone, Default)]
struct RecordingOutput {
    tags: Arc<Mutex<Vec<u32>>>,
    stopped: Arc<AtomicBool>,
}

impl OutputPlugin for RecordingOutput {
    fn name(&self) -> &str {
        "recording-output"
    }

    fn stop(&mut self) -> bool {
        self.stopped.store(true, Ordering::Relaxed);
        true
    }

    fn send(&mut self, packets: &[TsPacket]) -> bool {
        let mut tags = self.tags.lock().unwrap();
        for pkt in packets {
            assert_eq!(pkt.b[0], 0x47);
            tags.push(u32::from_be_bytes([pkt.b[4], pkt.b[5], pkt.b[6], pkt.b[7]]));
        }
        true
    }
}

#[test]
fn test_ten_thousand_packets_pass_through_in_order() {
    let output = RecordingOutput::default();
    let handle = Pipeline::new(PipelineConfig {
        buffer_size: 512 * TS_PACKET_SIZE,
    })
    .input(Box::new(SeqInput {
        total: 10_000,
        next: 0,
        bitrate: 1_000_000,
    }))
    .processor(Box::<NoopProcessor>::default())
    .output(Box::new(output.clone()))
    .start()
    .expect("pipeline start");

    let metrics = handle.metrics_handle();
    handle.wait().expect("graceful termination");

    let tags = output.tags.lock().unwrap();
    assert_eq!(tags.len(), 10_000);
    assert!(tags.iter().enumerate().all(|(i, &t)| t == i as u32));
    assert!(output.stopped.load(Ordering::Relaxed));

    // The bitrate cell kept the input's declared rate, published once.
    let snap = metrics.metrics();
    assert_eq!(snap.bitrate, 1_000_000);
    assert_eq!(snap.bitrate_version, 1);
}

#[test]
fn test_cursor_ordering_invariant() {
    let output = RecordingOutput::default();
    let handle = Pipeline::new(PipelineConfig {
        buffer_size: 256 * TS_PACKET_SIZE,
    })
    .input(Box::new(SeqInput {
        total: 50_000,
        next: 0,
        bitrate: 0,
    }))
    .processor(Box::<NoopProcessor>::default())
    .processor(Box::<NoopProcessor>::default())
    .output(Box::new(output.clone()))
    .start()
    .expect("pipeline start");

    let metrics = handle.metrics_handle();
    // Sample cursors while the pipeline runs: input >= p1 >= p2 >= output.
    for _ in 0..50 {
        let snap = metrics.metrics();
        if snap.stages.len() == 4 {
            let cursors: Vec<u64> = snap.stages.iter().map(|s| s.cursor).collect();
            assert!(cursors[0] >= cursors[1]);
            assert!(cursors[1] >= cursors[2]);
            assert!(cursors[2] >= cursors[3]);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    handle.wait().expect("graceful termination");
    assert_eq!(output.tags.lock().unwrap().len(), 50_000);
}

#[test]
fn test_stage_kinds_in_ring_order() {
    let output = RecordingOutput::default();
    let handle = Pipeline::new(PipelineConfig {
        buffer_size: 128 * TS_PACKET_SIZE,
    })
    .input(Box::new(SeqInput {
        total: 10,
        next: 0,
        bitrate: 0,
    }))
    .processor(Box::<NoopProcessor>::default())
    .output(Box::new(output.clone()))
    .start()
    .expect("pipeline start");

    let snap = handle.metrics();
    assert_eq!(snap.stages[0].kind, StageKind::Input);
    assert_eq!(snap.stages[1].kind, StageKind::Processor);
    assert_eq!(snap.stages[2].kind, StageKind::Output);
    handle.wait().expect("graceful termination");
}

#[test]
fn test_abort_terminates_endless_pipeline() {
    let output = RecordingOutput::default();
    let handle = Pipeline::new(PipelineConfig {
        buffer_size: 128 * TS_PACKET_SIZE,
    })
    .input(Box::new(EndlessInput))
    .output(Box::new(output.clone()))
    .start()
    .expect("pipeline start");

    let abort = handle.abort_handle();
    let seen = Arc::new(AtomicUsize::new(0));
    {
        let tags = Arc::clone(&output.tags);
        let seen = Arc::clone(&seen);
        std::thread::spawn(move || {
            // Let some packets through, then interrupt.
            loop {
                let n = tags.lock().unwrap().len();
                if n > 1000 {
                    seen.store(n, Ordering::Relaxed);
                    abort.abort();
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        });
    }

    // A user interrupt is a graceful termination: no fatal error.
    handle.wait().expect("abort is not fatal");
    assert!(seen.load(Ordering::Relaxed) > 1000);
    assert!(output.stopped.load(Ordering::Relaxed));
}

#[test]
fn test_fatal_processor_aborts_with_error() {
    let output = RecordingOutput::default();
    let handle = Pipeline::new(PipelineConfig {
        buffer_size: 128 * TS_PACKET_SIZE,
    })
    .input(Box::new(EndlessInput))
    .processor(Box::new(FailingProcessor { countdown: 500 }))
    .output(Box::new(output.clone()))
    .start()
    .expect("pipeline start");

    match handle.wait() {
        Err(PipelineError::Fatal) => {}
        other => panic!("expected fatal termination, got {other:?}"),
    }
    // The output plugin was still stopped to release its sink.
    assert!(output.stopped.load(Ordering::Relaxed));
    // Only packets published before the failure were delivered.
    assert!(output.tags.lock().unwrap().len() <= 500);
}

#[test]
fn test_every_output_packet_has_sync_byte() {
    // RecordingOutput asserts the sync byte on every packet; a run with
    // a processor nullifying half the stream must still hold it.
    struct HalfNull {
        toggle: bool,
    }
    impl ProcessorPlugin for HalfNull {
        fn name(&self) -> &str {
            "half-null"
        }
        fn process(&mut self, pkt: &mut TsPacket, _ctx: &mut ProcessContext) -> ProcessStatus {
            self.toggle = !self.toggle;
            if self.toggle {
                ProcessStatus::Null
            } else {
                *pkt = NULL_PACKET;
                pkt.set_pid(pid::NULL);
                ProcessStatus::Ok
            }
        }
    }

    let output = RecordingOutput::default();
    let handle = Pipeline::new(PipelineConfig {
        buffer_size: 128 * TS_PACKET_SIZE,
    })
    .input(Box::new(SeqInput {
        total: 2_000,
        next: 0,
        bitrate: 0,
    }))
    .processor(Box::new(HalfNull { toggle: false }))
    .output(Box::new(output.clone()))
    .start()
    .expect("pipeline start");
    handle.wait().expect("graceful termination");
    assert_eq!(output.tags.lock().unwrap().len(), 2_000);
}
