//! Pipeline executor.
//!
//! Spawns one worker thread per stage, all sharing the packet buffer and
//! the global cursor state. Workers advance through the stream in strict
//! ring order: each stage processes sequence numbers between its own
//! cursor and its predecessor's, publishes its new cursor under the
//! global mutex, and wakes everyone through the shared condition
//! variable.
//!
//! Termination is cooperative. On end of stream the input publishes its
//! `done` flag and each downstream stage drains up to its predecessor's
//! final cursor before stopping its plugin in its own thread. An
//! interrupt or a fatal plugin error instead fans the abort flag out to
//! every stage, which then publish their current cursor as final and
//! exit without touching further packets.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use log::{debug, info};

use crate::error::PipelineError;
use crate::packet::{TsPacket, NULL_PACKET, TS_PACKET_SIZE};
use crate::plugin::{InputPlugin, OutputPlugin, ProcessContext, ProcessStatus, ProcessorPlugin};
use crate::reporter::Reporter;
use crate::ring::PacketBuffer;
use crate::stage::{
    PipelineMetrics, PipelineShared, SharedState, StageKind, StageMetrics, StageSlot,
};

/// Default shared buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Nice value of the input worker; the input must always be ready to pull
/// packets from the source.
const INPUT_NICE: i32 = -10;
/// Nice value of the output worker, high but below the input.
const OUTPUT_NICE: i32 = -5;

/// Pipeline construction parameters.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Size of the shared packet buffer in bytes.
    pub buffer_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Builder for a pipeline: one input, processors in declaration order,
/// one output.
pub struct Pipeline {
    config: PipelineConfig,
    input: Option<Box<dyn InputPlugin>>,
    processors: Vec<Box<dyn ProcessorPlugin>>,
    output: Option<Box<dyn OutputPlugin>>,
    reporter: Option<Reporter>,
}

impl Pipeline {
    /// Start building a pipeline.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            input: None,
            processors: Vec::new(),
            output: None,
            reporter: None,
        }
    }

    /// Set the input stage.
    pub fn input(mut self, plugin: Box<dyn InputPlugin>) -> Self {
        self.input = Some(plugin);
        self
    }

    /// Append a processor stage.
    pub fn processor(mut self, plugin: Box<dyn ProcessorPlugin>) -> Self {
        self.processors.push(plugin);
        self
    }

    /// Set the output stage.
    pub fn output(mut self, plugin: Box<dyn OutputPlugin>) -> Self {
        self.output = Some(plugin);
        self
    }

    /// Route executor messages through an asynchronous reporter instead
    /// of the plain logging facade.
    pub fn reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Start the pipeline: start every plugin, allocate the shared
    /// buffer, then spawn the worker threads in ring order.
    pub fn start(self) -> Result<PipelineHandle, PipelineError> {
        let mut input = self
            .input
            .ok_or(PipelineError::IncompletePipeline("no input stage"))?;
        let mut output = self
            .output
            .ok_or(PipelineError::IncompletePipeline("no output stage"))?;
        let mut processors = self.processors;

        let n_stages = 2 + processors.len();
        let packet_count = self.config.buffer_size / TS_PACKET_SIZE;
        // Every stage must be able to hold a full batch in flight
        // without starving the others.
        if packet_count < n_stages * 4 {
            return Err(PipelineError::BufferTooSmall {
                buffer: packet_count,
                stages: n_stages,
            });
        }
        let batch = (packet_count / (2 * n_stages)).max(1);

        // Stage table in ring order: input, processors, output.
        let output_index = n_stages - 1;
        let mut stages = Vec::with_capacity(n_stages);
        stages.push(StageSlot {
            kind: StageKind::Input,
            name: input.name().to_string(),
            prev: output_index,
            next: if n_stages > 1 { 1 } else { 0 },
        });
        for (i, p) in processors.iter().enumerate() {
            stages.push(StageSlot {
                kind: StageKind::Processor,
                name: p.name().to_string(),
                prev: i,
                next: i + 2,
            });
        }
        stages.push(StageSlot {
            kind: StageKind::Output,
            name: output.name().to_string(),
            prev: output_index - 1,
            next: 0,
        });

        // Start the plugins in reverse ring order, input last, so that
        // downstream stages are ready before upstream ones produce.
        // The output device start is deferred until the bitrate is
        // knowable.
        for idx in (0..output_index).rev() {
            let (ok, name) = if idx == 0 {
                (input.start(), input.name().to_string())
            } else {
                let p = &mut processors[idx - 1];
                (p.start(), p.name().to_string())
            };
            if !ok {
                // Wind back the ones already started.
                for j in idx + 1..output_index {
                    if j == 0 {
                        input.stop();
                    } else {
                        processors[j - 1].stop();
                    }
                }
                return Err(PipelineError::StartFailed(name));
            }
        }

        // The shared packet buffer, published to every stage.
        let buffer = match PacketBuffer::new(packet_count) {
            Ok(buffer) => buffer,
            Err(e) => {
                for idx in (0..output_index).rev() {
                    if idx == 0 {
                        input.stop();
                    } else {
                        processors[idx - 1].stop();
                    }
                }
                return Err(e);
            }
        };
        let dropped = (0..packet_count)
            .map(|_| std::sync::atomic::AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        // The bitrate is now knowable: the input's report, or the first
        // processor's.
        let mut bitrate = input.bitrate();
        if bitrate == 0 {
            bitrate = processors.iter().map(|p| p.bitrate()).find(|&b| b != 0).unwrap_or(0);
        }
        debug!("pipeline start: {n_stages} stages, {packet_count} buffered packets, batch {batch}, bitrate {bitrate} b/s");

        if bitrate != 0 {
            output.bitrate_changed(bitrate);
        }
        if !output.start() {
            let name = output.name().to_string();
            for idx in (0..output_index).rev() {
                if idx == 0 {
                    input.stop();
                } else {
                    processors[idx - 1].stop();
                }
            }
            return Err(PipelineError::StartFailed(name));
        }

        let shared = Arc::new(PipelineShared {
            state: std::sync::Mutex::new(SharedState {
                cursors: vec![0; n_stages],
                done: vec![false; n_stages],
                aborted: vec![false; n_stages],
                bitrate,
                bitrate_version: u64::from(bitrate != 0),
                flush: false,
                fatal: false,
            }),
            cond: std::sync::Condvar::new(),
            buffer,
            dropped,
            stages,
            batch,
        });

        let reporter = self.reporter;

        // Spawn the workers in ring order starting from the input.
        let mut threads = Vec::with_capacity(n_stages);
        threads.push(spawn_worker("ts-input", {
            let sh = Arc::clone(&shared);
            let rep = reporter.clone();
            move || input_worker(sh, input, rep)
        }));
        for (i, plugin) in processors.into_iter().enumerate() {
            threads.push(spawn_worker("ts-proc", {
                let sh = Arc::clone(&shared);
                let rep = reporter.clone();
                move || processor_worker(sh, i + 1, plugin, rep)
            }));
        }
        threads.push(spawn_worker("ts-output", {
            let sh = Arc::clone(&shared);
            let rep = reporter.clone();
            move || output_worker(sh, output_index, output, rep)
        }));

        Ok(PipelineHandle { shared, threads })
    }
}

fn spawn_worker(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> thread::JoinHandle<()> {
    match thread::Builder::new().name(name.to_string()).spawn(body) {
        Ok(handle) => handle,
        Err(e) => {
            // Out of threads this early is unrecoverable.
            panic!("cannot spawn pipeline worker {name}: {e}");
        }
    }
}

/// Handle on a running pipeline.
pub struct PipelineHandle {
    shared: Arc<PipelineShared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl PipelineHandle {
    /// A handle that can abort the pipeline from any thread.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// A cloneable handle observing the pipeline from other threads.
    pub fn metrics_handle(&self) -> MetricsHandle {
        MetricsHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Snapshot of the stage cursors and the bitrate cell.
    pub fn metrics(&self) -> PipelineMetrics {
        snapshot_metrics(&self.shared)
    }

    /// Wait for every worker to terminate. Returns an error when a
    /// plugin failed fatally.
    pub fn wait(self) -> Result<(), PipelineError> {
        for t in self.threads {
            let _ = t.join();
        }
        let fatal = self.shared.lock().map(|st| st.fatal).unwrap_or(true);
        if fatal {
            Err(PipelineError::Fatal)
        } else {
            Ok(())
        }
    }
}

/// Abort capability, shared with interrupt handlers and monitors.
#[derive(Clone)]
pub struct AbortHandle {
    shared: Arc<PipelineShared>,
}

impl AbortHandle {
    /// Fan the abort flag out to every stage and wake all workers.
    pub fn abort(&self) {
        info!("pipeline abort requested, terminating");
        self.shared.abort_all();
    }
}

/// Observation capability, shared with the monitor thread.
#[derive(Clone)]
pub struct MetricsHandle {
    shared: Arc<PipelineShared>,
}

impl MetricsHandle {
    /// Snapshot of the stage cursors and the bitrate cell.
    pub fn metrics(&self) -> PipelineMetrics {
        snapshot_metrics(&self.shared)
    }

    /// True once every stage has terminated.
    pub fn finished(&self) -> bool {
        self.shared
            .lock()
            .map(|st| st.done.iter().all(|&d| d))
            .unwrap_or(true)
    }
}

fn snapshot_metrics(shared: &PipelineShared) -> PipelineMetrics {
    let (stages, bitrate, bitrate_version) = match shared.lock() {
        Some(st) => (
            shared
                .stages
                .iter()
                .enumerate()
                .map(|(i, s)| StageMetrics {
                    name: s.name.clone(),
                    kind: s.kind,
                    cursor: st.cursors[i],
                    done: st.done[i],
                    aborted: st.aborted[i],
                })
                .collect(),
            st.bitrate,
            st.bitrate_version,
        ),
        None => (Vec::new(), 0, 0),
    };
    PipelineMetrics {
        stages,
        bitrate,
        bitrate_version,
        buffer_packets: shared.buffer.count(),
        buffer_locked: shared.buffer.is_locked(),
    }
}

fn report_info(rep: &Option<Reporter>, msg: String) {
    match rep {
        Some(r) => r.info(msg),
        None => info!("{msg}"),
    }
}

fn report_debug(rep: &Option<Reporter>, msg: String) {
    match rep {
        Some(r) => r.debug(msg),
        None => debug!("{msg}"),
    }
}

/// What a worker decided to do after inspecting the shared state.
enum Job {
    /// Process this contiguous range of sequence numbers.
    Range { start: u64, count: u64 },
    /// Predecessor is done and fully drained.
    Drain,
    /// This stage was aborted.
    Abort,
    /// The worker state is unrecoverable (poisoned mutex).
    Poisoned,
}

fn input_worker(sh: Arc<PipelineShared>, mut plugin: Box<dyn InputPlugin>, rep: Option<Reporter>) {
    set_thread_nice(INPUT_NICE);
    let k = sh.buffer.count() as u64;
    let me = 0usize;
    let pred = sh.stages[me].prev;

    loop {
        // Claim a contiguous run of free slots.
        let claim = match sh.lock() {
            None => None,
            Some(mut st) => loop {
                if st.aborted[me] {
                    break None;
                }
                let in_flight = st.cursors[me].wrapping_sub(st.cursors[pred]);
                if in_flight < k {
                    let free = (k - in_flight).min(sh.batch as u64);
                    break Some((st.cursors[me], free));
                }
                st = match sh.cond.wait(st) {
                    Ok(st) => st,
                    Err(_) => break None,
                };
            },
        };
        let Some((start, max)) = claim else { break };

        // The run is clamped to the end of the ring so the plugin sees
        // one contiguous slice.
        let slots = unsafe { sh.buffer.slice_mut(start, max as usize) };
        for (off, slot) in slots.iter_mut().enumerate() {
            let index = ((start + off as u64) % k) as usize;
            sh.dropped[index].store(false, Ordering::Relaxed);
            *slot = NULL_PACKET;
        }

        let received = plugin.receive(slots);
        if received == 0 {
            report_debug(&rep, format!("{}: end of stream", plugin.name()));
            break;
        }

        if let Some(mut st) = sh.lock() {
            st.cursors[me] = st.cursors[me].wrapping_add(received as u64);
        } else {
            break;
        }
        sh.cond.notify_all();
    }

    if !plugin.stop() {
        report_debug(&rep, format!("{}: stop failed", plugin.name()));
    }
    if let Some(mut st) = sh.lock() {
        st.done[me] = true;
    }
    sh.cond.notify_all();
    report_debug(&rep, format!("{}: input terminated", plugin.name()));
}

/// Claim the next batch for a consuming stage (processor or output).
/// Also returns the bitrate cell so batches observe rate changes.
fn claim_batch(sh: &PipelineShared, me: usize, pred: usize) -> (Job, u32, u64, bool) {
    match sh.lock() {
        None => (Job::Poisoned, 0, 0, false),
        Some(mut st) => loop {
            if st.aborted[me] {
                break (Job::Abort, st.bitrate, st.bitrate_version, st.flush);
            }
            let avail = st.cursors[pred].wrapping_sub(st.cursors[me]);
            if avail > 0 {
                let count = avail.min(sh.batch as u64);
                break (
                    Job::Range {
                        start: st.cursors[me],
                        count,
                    },
                    st.bitrate,
                    st.bitrate_version,
                    st.flush,
                );
            }
            if st.done[pred] {
                break (Job::Drain, st.bitrate, st.bitrate_version, st.flush);
            }
            st = match sh.cond.wait(st) {
                Ok(st) => st,
                Err(_) => break (Job::Poisoned, 0, 0, false),
            };
        },
    }
}

fn processor_worker(
    sh: Arc<PipelineShared>,
    me: usize,
    mut plugin: Box<dyn ProcessorPlugin>,
    rep: Option<Reporter>,
) {
    let k = sh.buffer.count() as u64;
    let pred = sh.stages[me].prev;
    let mut fatal = false;

    loop {
        let (job, ts_bitrate, _, _) = claim_batch(&sh, me, pred);
        let (start, count) = match job {
            Job::Range { start, count } => (start, count),
            Job::Drain => break,
            Job::Abort | Job::Poisoned => break,
        };

        let mut processed = 0u64;
        let mut flush = false;
        let mut bitrate_changed = false;
        for off in 0..count {
            let seq = start + off;
            let slot_index = (seq % k) as usize;
            if sh.dropped[slot_index].load(Ordering::Relaxed) {
                processed = off + 1;
                continue;
            }
            let pkt = unsafe { &mut *sh.buffer.slot(seq) };
            let mut ctx = ProcessContext {
                ts_bitrate,
                flush: false,
                bitrate_changed: false,
            };
            let status = plugin.process(pkt, &mut ctx);
            flush |= ctx.flush;
            bitrate_changed |= ctx.bitrate_changed;
            match status {
                ProcessStatus::Ok => {}
                ProcessStatus::Drop => {
                    sh.dropped[slot_index].store(true, Ordering::Relaxed);
                }
                ProcessStatus::Null => {
                    *pkt = NULL_PACKET;
                }
                ProcessStatus::End => {
                    report_info(&rep, format!("{}: fatal error, aborting", plugin.name()));
                    fatal = true;
                    break;
                }
            }
            processed = off + 1;
        }

        if let Some(mut st) = sh.lock() {
            st.cursors[me] = start.wrapping_add(processed);
            if flush {
                st.flush = true;
            }
            if bitrate_changed {
                let b = plugin.bitrate();
                if b != 0 && b != st.bitrate {
                    report_debug(&rep, format!("{}: bitrate now {b} b/s", plugin.name()));
                    st.bitrate = b;
                    st.bitrate_version += 1;
                }
            }
            if fatal {
                st.fatal = true;
                for a in st.aborted.iter_mut() {
                    *a = true;
                }
            }
        } else {
            break;
        }
        sh.cond.notify_all();
        if fatal {
            break;
        }
    }

    if !plugin.stop() {
        report_debug(&rep, format!("{}: stop failed", plugin.name()));
    }
    if let Some(mut st) = sh.lock() {
        st.done[me] = true;
    }
    sh.cond.notify_all();
}

fn output_worker(
    sh: Arc<PipelineShared>,
    me: usize,
    mut plugin: Box<dyn OutputPlugin>,
    rep: Option<Reporter>,
) {
    set_thread_nice(OUTPUT_NICE);
    let k = sh.buffer.count() as u64;
    let pred = sh.stages[me].prev;
    let mut staging: Vec<TsPacket> = Vec::with_capacity(sh.batch);
    let mut seen_bitrate_version = match sh.lock() {
        Some(st) => st.bitrate_version,
        None => 0,
    };

    loop {
        let (job, bitrate, bitrate_version, _) = claim_batch(&sh, me, pred);
        if bitrate_version != seen_bitrate_version {
            seen_bitrate_version = bitrate_version;
            plugin.bitrate_changed(bitrate);
        }
        let (start, count) = match job {
            Job::Range { start, count } => (start, count),
            Job::Drain => break,
            Job::Abort | Job::Poisoned => break,
        };

        staging.clear();
        for off in 0..count {
            let seq = start + off;
            let slot_index = (seq % k) as usize;
            if !sh.dropped[slot_index].load(Ordering::Relaxed) {
                staging.push(unsafe { *sh.buffer.slot(seq) });
            }
        }

        if !staging.is_empty() && !plugin.send(&staging) {
            report_info(&rep, format!("{}: send failed, aborting", plugin.name()));
            if let Some(mut st) = sh.lock() {
                st.fatal = true;
                for a in st.aborted.iter_mut() {
                    *a = true;
                }
            }
            sh.cond.notify_all();
            break;
        }

        if let Some(mut st) = sh.lock() {
            st.cursors[me] = start.wrapping_add(count);
        } else {
            break;
        }
        sh.cond.notify_all();
    }

    if !plugin.stop() {
        report_debug(&rep, format!("{}: stop failed", plugin.name()));
    }
    if let Some(mut st) = sh.lock() {
        st.done[me] = true;
    }
    sh.cond.notify_all();
    report_debug(&rep, format!("{}: output terminated", plugin.name()));
}

#[cfg(target_os = "linux")]
fn set_thread_nice(nice: i32) {
    // On Linux, PRIO_PROCESS with pid 0 adjusts the calling thread.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if rc != 0 {
        debug!("cannot set worker nice value to {nice}");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_nice(_nice: i32) {}
