//! Scrambler stage.
//!
//! A processor that scrambles the components of one service. It watches
//! the PSI through its own section demux (SDT when the service is named,
//! then PAT, then the service's PMT), rewrites the PMT with a CA
//! descriptor pointing at the ECM PID, schedules crypto-periods in
//! packet-count time, replaces null packets with ECM packets at the
//! configured cadence, and encrypts the payloads of the selected
//! components.
//!
//! Crypto-period dynamics: during period N, scrambling uses CW(N); the
//! ECM broadcast switches to ECM(N) before or after the CW transition
//! depending on the sign of the ECMG's `delay_start`. Two period slots
//! are kept alive, and as soon as the older ECM is no longer needed the
//! following period is prepared in its slot. When a transition comes due
//! while the next ECM is still being ciphered, the stage enters degraded
//! mode: transitions freeze on the current CW and ECM until the next ECM
//! shows up at an insertion point.

mod crypto;
mod crypto_period;

pub use crypto::{ControlWord, CwGenerator, EntropyMode, Scrambling};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, error, info, warn};

use crate::demux::{DemuxControl, DemuxStatus, SectionDemux, TableHandler};
use crate::packet::{pid, scrambling, PidSet, TsPacket, NULL_PACKET, TS_PACKET_SIZE};
use crate::packetizer::{CyclingPacketizer, StuffingPolicy};
use crate::plugin::{ProcessContext, ProcessStatus, ProcessorPlugin};
use crate::section::table_id;
use crate::tables::{BinaryTable, CaDescriptor, Pat, Pmt, Sdt};

use crypto_period::CryptoPeriod;
use tspipe_ecmg::{ChannelStatus, EcmGenerator, EcmRequest};

/// Default ECM PID bitrate in bits/second.
pub const DEFAULT_ECM_BITRATE: u32 = 30_000;

/// Default crypto-period duration in milliseconds.
pub const DEFAULT_CP_DURATION_MS: u64 = 10_000;

/// The service to scramble, by id or by SDT name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRef {
    /// Service id, as listed in the PAT.
    Id(u16),
    /// Service name, resolved through the SDT (case- and
    /// blank-insensitive).
    Name(String),
}

/// Scrambler configuration. Constant after `start()`.
#[derive(Debug, Clone)]
pub struct ScramblerConfig {
    /// The service to scramble.
    pub service: ServiceRef,
    /// Insert CA descriptors at component level instead of program level.
    pub component_level: bool,
    /// Scramble audio components.
    pub scramble_audio: bool,
    /// Scramble video components.
    pub scramble_video: bool,
    /// Scramble subtitles components.
    pub scramble_subtitles: bool,
    /// Generate ECMs synchronously (offline processing).
    pub synchronous_ecmg: bool,
    /// Pass through packets that arrive already scrambled instead of
    /// failing.
    pub ignore_scrambled: bool,
    /// DVB SimulCrypt Super_CAS_Id; the high 16 bits become the
    /// CA_system_id of the inserted CA descriptor.
    pub super_cas_id: u32,
    /// Access criteria forwarded to the ECMG.
    pub access_criteria: Bytes,
    /// Private data of the inserted CA descriptor.
    pub ca_private_data: Bytes,
    /// Crypto-period duration in milliseconds.
    pub cp_duration_ms: u64,
    /// ECM PID bitrate in bits/second.
    pub ecm_bitrate: u32,
    /// ECM PID; allocated after the PMT PID when absent.
    pub ecm_pid: Option<u16>,
    /// Scramble one packet out of this many (1 = all packets).
    pub partial_scrambling: u64,
    /// Fixed control word: no ECMG, no crypto-period transitions,
    /// scrambling control always "even".
    pub fixed_cw: Option<ControlWord>,
    /// Control word entropy mode.
    pub entropy: EntropyMode,
}

impl Default for ScramblerConfig {
    fn default() -> Self {
        Self {
            service: ServiceRef::Id(1),
            component_level: false,
            scramble_audio: true,
            scramble_video: true,
            scramble_subtitles: false,
            synchronous_ecmg: false,
            ignore_scrambled: false,
            super_cas_id: 0,
            access_criteria: Bytes::new(),
            ca_private_data: Bytes::new(),
            cp_duration_ms: DEFAULT_CP_DURATION_MS,
            ecm_bitrate: DEFAULT_ECM_BITRATE,
            ecm_pid: None,
            partial_scrambling: 1,
            fixed_cw: None,
            entropy: EntropyMode::ReduceEntropy,
        }
    }
}

/// The scrambler processor stage.
pub struct ScramblerStage {
    core: Arc<Mutex<ScramblerCore>>,
    demux: SectionDemux,
}

impl ScramblerStage {
    /// Create a scrambler. The ECM generator is required unless a fixed
    /// control word is configured.
    pub fn new(config: ScramblerConfig, ecmg: Option<Box<dyn EcmGenerator>>) -> Self {
        let core = Arc::new(Mutex::new(ScramblerCore::new(config, ecmg)));
        let sink = TableSink {
            core: Arc::clone(&core),
        };
        let demux = SectionDemux::new(Some(Box::new(sink)), None, PidSet::none());
        Self { core, demux }
    }

    /// Status counters of the internal section demux.
    pub fn demux_status(&self) -> DemuxStatus {
        self.demux.status()
    }

    /// Number of packets scrambled so far.
    pub fn scrambled_count(&self) -> u64 {
        self.core.lock().map(|c| c.scrambled_count).unwrap_or(0)
    }

    /// The ECM PID in use, once allocated.
    pub fn ecm_pid(&self) -> Option<u16> {
        self.core.lock().ok().and_then(|c| c.ecm_pid)
    }
}

impl ProcessorPlugin for ScramblerStage {
    fn name(&self) -> &str {
        "scrambler"
    }

    fn start(&mut self) -> bool {
        let started = match self.core.lock() {
            Ok(mut core) => core.start(),
            Err(_) => false,
        };
        if !started {
            return false;
        }
        // Watch the SDT when the service is known by name, the PAT
        // otherwise.
        let initial_pid = match self.core.lock() {
            Ok(core) => {
                if core.service_id.is_some() {
                    pid::PAT
                } else {
                    pid::SDT
                }
            }
            Err(_) => return false,
        };
        self.demux.reset();
        self.demux.set_pid_filter(PidSet::none());
        self.demux.add_pid(initial_pid);
        true
    }

    fn stop(&mut self) -> bool {
        if let Ok(mut core) = self.core.lock() {
            debug!(
                "scrambled {} packets in {} PIDs",
                core.scrambled_count,
                core.scrambled_pids.count()
            );
            if let Some(gen) = core.ecmg.as_mut() {
                gen.disconnect();
            }
        }
        true
    }

    fn process(&mut self, pkt: &mut TsPacket, ctx: &mut ProcessContext) -> ProcessStatus {
        {
            let Ok(mut core) = self.core.lock() else {
                return ProcessStatus::End;
            };
            core.packet_count += 1;
            core.input_pids.set(pkt.pid());
            if ctx.ts_bitrate != 0 {
                core.ts_bitrate = ctx.ts_bitrate;
            }
        }

        // Track the PSI. Table callbacks re-lock the core.
        self.demux.feed(pkt);

        let Ok(mut core) = self.core.lock() else {
            return ProcessStatus::End;
        };
        core.process_packet(pkt)
    }
}

/// Demux-to-core bridge: table callbacks run on the stage's worker
/// thread and mutate the shared core under its own lock.
struct TableSink {
    core: Arc<Mutex<ScramblerCore>>,
}

impl TableHandler for TableSink {
    fn handle_table(&mut self, ctl: &mut DemuxControl, table: &BinaryTable) {
        if let Ok(mut core) = self.core.lock() {
            core.handle_table(ctl, table);
        }
    }
}

/// All mutable scrambler state.
struct ScramblerCore {
    config: ScramblerConfig,
    ecmg: Option<Box<dyn EcmGenerator>>,

    /// Resolved service id (immediately known when configured by id).
    service_id: Option<u16>,
    /// PMT PID of the service, from the PAT.
    pmt_pid: Option<u16>,
    /// ECM PID, configured or allocated after the PMT PID.
    ecm_pid: Option<u16>,

    abort: bool,
    /// Raised by asynchronous ECM continuations on failure.
    async_abort: Arc<AtomicBool>,
    /// PMT seen, scrambling set known, transmission may start.
    ready: bool,
    degraded_mode: bool,

    packet_count: u64,
    scrambled_count: u64,
    partial_clear: u64,
    pkt_insert_ecm: u64,
    pkt_change_cw: u64,
    pkt_change_ecm: u64,
    ts_bitrate: u32,
    ecm_cc: u8,

    scrambled_pids: PidSet,
    conflict_pids: PidSet,
    input_pids: PidSet,

    cp: [CryptoPeriod; 2],
    current_cw: usize,
    current_ecm: usize,
    current_key: Scrambling,
    cw_gen: CwGenerator,

    pzer_pmt: CyclingPacketizer,
    channel_status: ChannelStatus,
    delay_start_ms: i64,
}

impl ScramblerCore {
    fn new(config: ScramblerConfig, ecmg: Option<Box<dyn EcmGenerator>>) -> Self {
        let entropy = config.entropy;
        Self {
            config,
            ecmg,
            service_id: None,
            pmt_pid: None,
            ecm_pid: None,
            abort: false,
            async_abort: Arc::new(AtomicBool::new(false)),
            ready: false,
            degraded_mode: false,
            packet_count: 0,
            scrambled_count: 0,
            partial_clear: 0,
            pkt_insert_ecm: 0,
            pkt_change_cw: 0,
            pkt_change_ecm: 0,
            ts_bitrate: 0,
            ecm_cc: 0,
            scrambled_pids: PidSet::none(),
            conflict_pids: PidSet::none(),
            input_pids: PidSet::none(),
            cp: [CryptoPeriod::default(), CryptoPeriod::default()],
            current_cw: 0,
            current_ecm: 0,
            current_key: Scrambling::default(),
            cw_gen: CwGenerator::new(entropy),
            pzer_pmt: CyclingPacketizer::new(pid::NULL, StuffingPolicy::EndOfSection),
            channel_status: ChannelStatus::default(),
            delay_start_ms: 0,
        }
    }

    /// True when crypto-periods are driven by an ECM generator.
    fn ecmg_mode(&self) -> bool {
        self.config.fixed_cw.is_none()
    }

    fn start(&mut self) -> bool {
        self.scrambled_pids.reset();
        self.conflict_pids.reset();
        self.input_pids.reset();
        self.abort = false;
        self.async_abort.store(false, Ordering::Relaxed);
        self.ready = false;
        self.degraded_mode = false;
        self.packet_count = 0;
        self.scrambled_count = 0;
        self.partial_clear = 0;
        self.pkt_insert_ecm = 0;
        self.pkt_change_cw = 0;
        self.pkt_change_ecm = 0;
        self.ts_bitrate = 0;
        self.ecm_cc = 0;
        self.pmt_pid = None;
        self.ecm_pid = self.config.ecm_pid;
        self.current_cw = 0;
        self.current_ecm = 0;
        self.delay_start_ms = 0;
        self.pzer_pmt = CyclingPacketizer::new(pid::NULL, StuffingPolicy::EndOfSection);

        if self.config.partial_scrambling == 0 {
            error!("partial scrambling interval must be at least 1");
            return false;
        }
        if self.config.cp_duration_ms == 0 {
            error!("crypto-period duration must not be zero");
            return false;
        }

        self.service_id = match &self.config.service {
            ServiceRef::Id(id) => Some(*id),
            ServiceRef::Name(_) => None,
        };

        // Reserved PIDs are never available for ECM allocation.
        self.input_pids.set(pid::NULL);
        for reserved in 0..0x20 {
            self.input_pids.set(reserved);
        }

        if let Some(cw) = self.config.fixed_cw {
            let entropy = self.config.entropy;
            self.current_key.init(&cw, entropy);
            debug!("using fixed control word");
            return true;
        }

        if self.ecmg.is_none() {
            error!("specify either a fixed control word or an ECM generator");
            return false;
        }
        if self.config.ecm_bitrate == 0 {
            error!("ECM bitrate must not be zero");
            return false;
        }

        let cp_duration_cs = (self.config.cp_duration_ms / 100) as u16;
        let super_cas_id = self.config.super_cas_id;
        let status = match self.ecmg.as_mut() {
            Some(gen) => gen.channel_setup(super_cas_id, cp_duration_cs),
            None => return false,
        };
        match status {
            Ok(status) => {
                // delay_start is clamped to half a crypto-period in
                // either direction.
                let half = (self.config.cp_duration_ms / 2) as i64;
                self.channel_status = status;
                self.delay_start_ms = status.delay_start.clamp(-half, half);
                debug!(
                    "crypto-period duration: {} ms, delay start: {} ms",
                    self.config.cp_duration_ms, self.delay_start_ms
                );
            }
            Err(e) => {
                error!("ECMG channel setup failed: {e}");
                return false;
            }
        }

        // First and second crypto-periods; ECM generation may complete
        // asynchronously.
        self.cp[0] = CryptoPeriod::init_cycle(&mut self.cw_gen, 0);
        self.cp[1] = CryptoPeriod::init_next(&self.cp[0], &mut self.cw_gen);
        let cw0 = *self.cp[0].cw_current();
        let entropy = self.config.entropy;
        self.current_key.init(&cw0, entropy);
        self.generate_ecm(0);
        self.generate_ecm(1);

        !self.abort
    }

    /// Ask the ECMG for the ECM of one crypto-period slot.
    fn generate_ecm(&mut self, index: usize) {
        let request = EcmRequest {
            cp_number: self.cp[index].cp_number(),
            cw_current: *self.cp[index].cw_current(),
            cw_next: *self.cp[index].cw_next(),
            access_criteria: self.config.access_criteria.clone(),
            cp_duration_cs: (self.config.cp_duration_ms / 100) as u16,
        };
        let slot = self.cp[index].slot();
        let as_packets = self.channel_status.section_tspkt_flag;
        let synchronous = self.config.synchronous_ecmg;
        let Some(gen) = self.ecmg.as_mut() else {
            return;
        };

        if synchronous {
            match gen.generate_ecm(&request) {
                Ok(response) => {
                    if !slot.load(&response, as_packets) {
                        self.abort = true;
                    }
                }
                Err(e) => {
                    error!("ECM generation failed: {e}");
                    self.abort = true;
                }
            }
        } else {
            let async_abort = Arc::clone(&self.async_abort);
            let cp_number = request.cp_number;
            let done = Box::new(move |result: Result<tspipe_ecmg::EcmResponse, tspipe_ecmg::EcmgError>| {
                match result {
                    Ok(response) => {
                        if !slot.load(&response, as_packets) {
                            async_abort.store(true, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        error!("ECM generation failed for crypto-period {cp_number}: {e}");
                        async_abort.store(true, Ordering::Relaxed);
                    }
                }
            });
            if let Err(e) = gen.submit_ecm(&request, done) {
                error!("ECM submission failed: {e}");
                self.abort = true;
            }
        }
    }

    fn handle_table(&mut self, ctl: &mut DemuxControl, table: &BinaryTable) {
        match table.table_id() {
            table_id::PAT if table.source_pid() == pid::PAT => {
                if let Ok(pat) = Pat::parse(table) {
                    self.process_pat(ctl, &pat);
                }
            }
            table_id::SDT_ACTUAL if table.source_pid() == pid::SDT => {
                if let Ok(sdt) = Sdt::parse(table) {
                    self.process_sdt(ctl, &sdt);
                }
            }
            table_id::PMT => {
                if let Ok(pmt) = Pmt::parse(table) {
                    if self.service_id == Some(pmt.service_id) {
                        self.process_pmt(pmt);
                    }
                }
            }
            _ => {}
        }
    }

    fn process_sdt(&mut self, ctl: &mut DemuxControl, sdt: &Sdt) {
        let ServiceRef::Name(name) = &self.config.service else {
            return;
        };
        match sdt.find_service(name) {
            Some(id) => {
                info!("service id is 0x{id:04X}");
                self.service_id = Some(id);
                // The SDT is no longer needed; the PAT maps the id to
                // its PMT PID.
                ctl.remove_pid(pid::SDT);
                ctl.add_pid(pid::PAT);
            }
            None => {
                error!("service \"{name}\" not found in SDT");
                self.abort = true;
            }
        }
    }

    fn process_pat(&mut self, ctl: &mut DemuxControl, pat: &Pat) {
        // Every PMT PID is in use, whatever the service.
        for &pmt_pid in pat.pmts.values() {
            self.input_pids.set(pmt_pid);
        }
        let Some(service_id) = self.service_id else {
            return;
        };
        match pat.pmts.get(&service_id) {
            Some(&pmt_pid) => {
                if let Some(previous) = self.pmt_pid {
                    if previous != pmt_pid {
                        ctl.remove_pid(previous);
                    }
                }
                self.pmt_pid = Some(pmt_pid);
                ctl.add_pid(pmt_pid);
                self.pzer_pmt.set_pid(pmt_pid);
            }
            None => {
                error!("service id {service_id} (0x{service_id:04X}) not found in PAT");
                self.abort = true;
            }
        }
    }

    fn process_pmt(&mut self, mut pmt: Pmt) {
        // Collect the PIDs to scramble.
        for (&es_pid, stream) in &pmt.streams {
            self.input_pids.set(es_pid);
            if (self.config.scramble_audio && stream.is_audio())
                || (self.config.scramble_video && stream.is_video())
                || (self.config.scramble_subtitles && stream.is_subtitles())
            {
                self.scrambled_pids.set(es_pid);
                debug!("starting scrambling PID 0x{es_pid:04X}");
            }
        }

        // Allocate an ECM PID: first unused PID after the PMT PID.
        if self.ecm_pid.is_none() {
            let base = self.pmt_pid.unwrap_or(0x0020);
            let mut candidate = base + 1;
            while candidate < pid::NULL && self.input_pids.test(candidate) {
                candidate += 1;
            }
            if candidate >= pid::NULL {
                error!("cannot find an unused PID for ECM");
                self.abort = true;
                return;
            }
            info!("using PID 0x{candidate:04X} for ECM");
            self.ecm_pid = Some(candidate);
        }

        // Rewrite the PMT with a CA descriptor pointing at the ECM PID.
        if let Some(ecm_pid) = self.ecm_pid {
            let mut ca = CaDescriptor::new((self.config.super_cas_id >> 16) as u16, ecm_pid);
            ca.private_data = self.config.ca_private_data.clone();
            if self.config.component_level {
                for (&es_pid, stream) in pmt.streams.iter_mut() {
                    if self.scrambled_pids.test(es_pid) {
                        stream.descs.add(ca.build());
                    }
                }
            } else {
                pmt.descs.add(ca.build());
            }
        }
        match pmt.build() {
            Ok(table) => {
                self.pzer_pmt.remove_sections(table_id::PMT, pmt.service_id);
                self.pzer_pmt.add_table(&table);
            }
            Err(e) => {
                error!("cannot rebuild PMT: {e}");
                self.abort = true;
                return;
            }
        }

        self.ready = true;

        // Schedule the crypto-period transitions.
        if self.ecmg_mode() {
            if self.ts_bitrate == 0 {
                error!("unknown bitrate, cannot schedule crypto-periods");
                self.abort = true;
                return;
            }
            // Insert ECM packets as soon as possible.
            self.pkt_insert_ecm = self.packet_count;
            self.pkt_change_cw =
                self.packet_count + self.packet_distance(self.config.cp_duration_ms);
            // The first ECM transition leads or trails the CW transition
            // by |delay_start|, depending on its sign.
            let offset = self.packet_distance(self.delay_start_ms.unsigned_abs());
            self.pkt_change_ecm = if self.delay_start_ms > 0 {
                self.pkt_change_cw + offset
            } else {
                self.pkt_change_cw.saturating_sub(offset)
            };
        }
    }

    /// Packets covering `ms` milliseconds at the current TS bitrate.
    fn packet_distance(&self, ms: u64) -> u64 {
        u64::from(self.ts_bitrate) * ms / 1000 / (TS_PACKET_SIZE as u64 * 8)
    }

    /// Check degraded mode, entering it when the next ECM is late.
    fn in_degraded_mode(&mut self) -> bool {
        if self.degraded_mode {
            return true;
        }
        if self.cp[self.current_ecm ^ 1].ecm_ready() {
            return false;
        }
        warn!("next ECM not ready, entering degraded mode");
        self.degraded_mode = true;
        true
    }

    /// At ECM insertion points, leave degraded mode once the next ECM
    /// showed up, performing the deferred transitions.
    fn try_exit_degraded_mode(&mut self) {
        if !self.degraded_mode || !self.cp[self.current_ecm ^ 1].ecm_ready() {
            return;
        }
        info!("next ECM ready, exiting degraded mode");
        self.degraded_mode = false;

        let offset = self.packet_distance(self.delay_start_ms.unsigned_abs());
        if self.delay_start_ms < 0 {
            // ECM broadcast leads the crypto-period: switch it now and
            // push the CW change out.
            self.change_ecm();
            self.pkt_change_cw = self.packet_count + offset;
        } else {
            self.change_cw();
            self.pkt_change_ecm = self.packet_count + offset;
        }
    }

    fn change_cw(&mut self) {
        if self.in_degraded_mode() {
            return;
        }
        self.current_cw ^= 1;
        let cw = *self.cp[self.current_cw].cw_current();
        let entropy = self.config.entropy;
        self.current_key.init(&cw, entropy);
        debug!("using control word of crypto-period {}", self.cp[self.current_cw].cp_number());
        self.pkt_change_cw = self.packet_count + self.packet_distance(self.config.cp_duration_ms);
        // Once ECM(N) plays during cp(N), the previous slot is free:
        // prepare cp(N+1) in it.
        if self.current_ecm == self.current_cw {
            self.prepare_next_period();
        }
    }

    fn change_ecm(&mut self) {
        if self.in_degraded_mode() {
            return;
        }
        self.current_ecm ^= 1;
        self.pkt_change_ecm = self.packet_count + self.packet_distance(self.config.cp_duration_ms);
        if self.current_ecm == self.current_cw {
            self.prepare_next_period();
        }
    }

    /// Re-initialize the slot of the finished crypto-period from the
    /// running one and request its ECM.
    fn prepare_next_period(&mut self) {
        let next_index = self.current_cw ^ 1;
        self.cp[next_index] = CryptoPeriod::init_next(&self.cp[self.current_cw], &mut self.cw_gen);
        self.generate_ecm(next_index);
    }

    fn process_packet(&mut self, pkt: &mut TsPacket) -> ProcessStatus {
        if self.abort || self.async_abort.load(Ordering::Relaxed) {
            return ProcessStatus::End;
        }

        let packet_pid = pkt.pid();

        // The allocated ECM PID showing up in the input is a PID
        // collision: the multiplex would become ambiguous.
        if self.ecm_pid == Some(packet_pid) {
            error!(
                "ECM PID allocation conflict: PID 0x{packet_pid:04X} now found in input stream"
            );
            return ProcessStatus::End;
        }

        // Until the PMT is known, nullify everything.
        if !self.ready {
            *pkt = NULL_PACKET;
            return ProcessStatus::Ok;
        }

        // Substitute PMT packets with the rewritten PMT.
        if self.pmt_pid == Some(packet_pid) {
            self.pzer_pmt.next_packet(pkt);
            return ProcessStatus::Ok;
        }

        if self.ecmg_mode() {
            // Crypto-period transitions, in packet-count time.
            if self.packet_count >= self.pkt_change_cw {
                self.change_cw();
            }
            if self.packet_count >= self.pkt_change_ecm {
                self.change_ecm();
            }

            // Replace a null packet with the current ECM at the
            // insertion cadence.
            if packet_pid == pid::NULL && self.packet_count >= self.pkt_insert_ecm {
                self.pkt_insert_ecm +=
                    u64::from(self.ts_bitrate / self.config.ecm_bitrate).max(1);
                self.try_exit_degraded_mode();
                if let Some(ecm_pid) = self.ecm_pid {
                    let mut cc = self.ecm_cc;
                    self.cp[self.current_ecm].next_ecm_packet(pkt, ecm_pid, &mut cc);
                    self.ecm_cc = cc;
                }
                return ProcessStatus::Ok;
            }
        }

        // Only payload-bearing packets of selected components are
        // scrambled.
        if !pkt.has_payload() || !self.scrambled_pids.test(packet_pid) {
            return ProcessStatus::Ok;
        }

        // Packets already scrambled upstream use a different control
        // word; descrambling them downstream would be impossible.
        if pkt.is_scrambled() {
            if self.config.ignore_scrambled {
                if !self.conflict_pids.test(packet_pid) {
                    info!("found input scrambled packets in PID 0x{packet_pid:04X}, ignored");
                    self.conflict_pids.set(packet_pid);
                }
                return ProcessStatus::Ok;
            }
            error!("packet already scrambled in PID 0x{packet_pid:04X}");
            return ProcessStatus::End;
        }

        // Partial scrambling: one packet out of N.
        if self.partial_clear > 0 {
            self.partial_clear -= 1;
            return ProcessStatus::Ok;
        }
        self.partial_clear = self.config.partial_scrambling - 1;

        self.current_key.encrypt(pkt.payload_mut());
        self.scrambled_count += 1;

        let control = if self.ecmg_mode() {
            self.cp[self.current_cw].scrambling_control_value()
        } else {
            // A fixed key has no parity; "even" by convention.
            scrambling::EVEN_KEY
        };
        pkt.set_scrambling_control(control);

        ProcessStatus::Ok
    }
}
