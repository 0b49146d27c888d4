//! Section and table demultiplexer.
//!
//! Rebuilds PSI/SI sections and complete tables from the payloads of a
//! filtered set of PIDs. The demux is a per-PID state machine driven one
//! packet at a time through [`SectionDemux::feed`]; it never advances the
//! pipeline by itself.
//!
//! Handlers run on the feeding thread and may call back into the demux
//! through the [`DemuxControl`] passed to them: PID filter changes apply
//! after the callback returns, and a reset of the demux (or of the PID
//! being processed) aborts the current drain. Internally every reset
//! advances a monotonic epoch; the feeding code captures the epoch around
//! each callback and abandons the in-flight PID context when it moved.

use std::collections::HashMap;

use bytes::Bytes;

use crate::packet::{PidSet, TsPacket, CC_MAX, TS_PACKET_SIZE};
use crate::section::{
    total_length, ExtTableId, Section, MAX_SECTION_SIZE, MIN_LONG_SECTION_SIZE,
};
use crate::tables::BinaryTable;

/// Demux status counters. All counters are non-decreasing for the
/// lifetime of the demux.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStatus {
    /// TS packets with a wrong sync byte.
    pub invalid_ts: u64,
    /// Continuity counter discontinuities.
    pub discontinuities: u64,
    /// Scrambled TS packets on filtered PIDs.
    pub scrambled: u64,
    /// Sections with an invalid length field.
    pub inv_sect_length: u64,
    /// Sections with an inconsistent section number.
    pub inv_sect_index: u64,
    /// Long sections with a bad CRC-32.
    pub wrong_crc: u64,
}

impl DemuxStatus {
    /// Check if any counter is non-zero.
    pub fn has_errors(&self) -> bool {
        *self != DemuxStatus::default()
    }
}

impl std::fmt::Display for DemuxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Invalid TS packets: {}", self.invalid_ts)?;
        writeln!(f, "TS packet discontinuities: {}", self.discontinuities)?;
        writeln!(f, "Scrambled TS packets: {}", self.scrambled)?;
        writeln!(f, "Invalid section lengths: {}", self.inv_sect_length)?;
        writeln!(f, "Invalid section index: {}", self.inv_sect_index)?;
        write!(f, "Corrupted sections (bad CRC): {}", self.wrong_crc)
    }
}

/// Callback capability for complete sections.
pub trait SectionHandler: Send {
    /// Invoked for every reassembled section, including sections whose
    /// CRC-32 check failed (`section.valid()` is false in that case).
    fn handle_section(&mut self, ctl: &mut DemuxControl, section: &Section);
}

/// Callback capability for complete tables.
pub trait TableHandler: Send {
    /// Invoked when the last missing section of a table arrives.
    fn handle_table(&mut self, ctl: &mut DemuxControl, table: &BinaryTable);
}

/// Deferred demux operations available to handlers during dispatch.
///
/// Handlers cannot borrow the demux they were called from; instead they
/// record operations here and the demux applies them when the callback
/// returns.
#[derive(Debug, Default)]
pub struct DemuxControl {
    add_pids: Vec<u16>,
    remove_pids: Vec<u16>,
    reset_all: bool,
    reset_pids: Vec<u16>,
}

impl DemuxControl {
    /// Start filtering a PID.
    pub fn add_pid(&mut self, pid: u16) {
        self.add_pids.push(pid);
    }

    /// Stop filtering a PID.
    pub fn remove_pid(&mut self, pid: u16) {
        self.remove_pids.push(pid);
    }

    /// Drop all accumulated demux state.
    pub fn reset(&mut self) {
        self.reset_all = true;
    }

    /// Drop the accumulated state of one PID.
    pub fn reset_pid(&mut self, pid: u16) {
        self.reset_pids.push(pid);
    }
}

/// Per-table reassembly context.
#[derive(Debug, Default)]
struct TableContext {
    version: u8,
    sect_expected: usize,
    sect_received: usize,
    sects: Vec<Option<Section>>,
}

/// Per-PID reassembly context.
#[derive(Debug)]
struct PidContext {
    /// False until a section start has been located on this PID.
    sync: bool,
    /// Continuity counter of the last packet.
    continuity: u8,
    /// Partial section bytes, bounded by the maximum section size plus
    /// one packet payload.
    ts: Vec<u8>,
    /// Index of the last packet with a PUSI on this PID.
    pusi_pkt_index: u64,
    /// Table contexts keyed by extended table id.
    tids: HashMap<ExtTableId, TableContext>,
}

impl Default for PidContext {
    fn default() -> Self {
        Self {
            sync: false,
            continuity: 0,
            ts: Vec::with_capacity(MAX_SECTION_SIZE + TS_PACKET_SIZE),
            pusi_pkt_index: 0,
            tids: HashMap::new(),
        }
    }
}

impl PidContext {
    fn sync_lost(&mut self) {
        self.sync = false;
        self.ts.clear();
    }
}

/// What a batch of deferred control operations did to the PID currently
/// being drained.
struct ControlOutcome {
    /// The whole demux or the current PID was reset; its in-flight
    /// context must not be touched again.
    self_reset: bool,
}

/// The section demultiplexer.
pub struct SectionDemux {
    table_handler: Option<Box<dyn TableHandler>>,
    section_handler: Option<Box<dyn SectionHandler>>,
    pid_filter: PidSet,
    pids: HashMap<u16, PidContext>,
    status: DemuxStatus,
    packet_count: u64,
    epoch: u64,
}

impl SectionDemux {
    /// Create a demux. Either handler may be absent; with neither, the
    /// demux only maintains its status counters.
    pub fn new(
        table_handler: Option<Box<dyn TableHandler>>,
        section_handler: Option<Box<dyn SectionHandler>>,
        pid_filter: PidSet,
    ) -> Self {
        Self {
            table_handler,
            section_handler,
            pid_filter,
            pids: HashMap::new(),
            status: DemuxStatus::default(),
            packet_count: 0,
            epoch: 0,
        }
    }

    /// Start filtering a PID.
    pub fn add_pid(&mut self, pid: u16) {
        self.pid_filter.set(pid);
    }

    /// Stop filtering a PID.
    pub fn remove_pid(&mut self, pid: u16) {
        self.pid_filter.clear(pid);
    }

    /// Replace the whole PID filter.
    pub fn set_pid_filter(&mut self, filter: PidSet) {
        self.pid_filter = filter;
    }

    /// Drop all accumulated state. The PID filter is kept; the status
    /// counters keep their values.
    pub fn reset(&mut self) {
        self.pids.clear();
        self.epoch += 1;
    }

    /// Drop the accumulated state of one PID.
    pub fn reset_pid(&mut self, pid: u16) {
        self.pids.remove(&pid);
        self.epoch += 1;
    }

    /// Current status counters.
    pub fn status(&self) -> DemuxStatus {
        self.status
    }

    /// Number of packets fed so far, filtered or not.
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Advance the demux by one TS packet.
    pub fn feed(&mut self, pkt: &TsPacket) {
        if self.pid_filter.test(pkt.pid()) {
            self.process_packet(pkt);
        }
        self.packet_count += 1;
    }

    fn process_packet(&mut self, pkt: &TsPacket) {
        if !pkt.has_valid_sync() {
            self.status.invalid_ts += 1;
            return;
        }

        let pid = pkt.pid();
        // The context is taken out of the map for the duration of the
        // call so that handler callbacks can mutate the demux without
        // aliasing it; it is re-inserted on every early return.
        let mut pc = self.pids.remove(&pid).unwrap_or_default();

        // A scrambled packet cannot be decoded: drop it and lose
        // synchronization on the PID.
        if pkt.is_scrambled() {
            self.status.scrambled += 1;
            pc.sync_lost();
            self.pids.insert(pid, pc);
            return;
        }

        // Continuity check, only meaningful while in sync.
        if pc.sync {
            if pkt.cc() == pc.continuity {
                // Duplicate packet, silently dropped.
                self.pids.insert(pid, pc);
                return;
            }
            if pkt.cc() != (pc.continuity + 1) % CC_MAX {
                self.status.discontinuities += 1;
                pc.sync_lost();
            }
        }
        pc.continuity = pkt.cc();

        let header_size = pkt.header_size();
        if !pkt.has_payload() || header_size >= TS_PACKET_SIZE {
            self.pids.insert(pid, pc);
            return;
        }

        let full_payload = &pkt.b[header_size..];
        let mut pusi_pkt_index = pc.pusi_pkt_index;
        let mut payload: &[u8];
        let mut pointer_field: Option<usize>;

        if pkt.pusi() {
            pc.pusi_pkt_index = self.packet_count;
            // A PES packet starts with the 00 00 01 start code prefix,
            // which can never open a section (00 would be a PAT after a
            // zero pointer field, and a PAT cannot continue with 01).
            if full_payload.len() >= 3
                && full_payload[0] == 0x00
                && full_payload[1] == 0x00
                && full_payload[2] == 0x01
            {
                pc.sync_lost();
                self.pids.insert(pid, pc);
                return;
            }
            let pf = usize::from(full_payload[0]);
            let rest = &full_payload[1..];
            if pf >= rest.len() {
                // Inconsistent pointer field.
                pc.sync_lost();
                self.pids.insert(pid, pc);
                return;
            }
            payload = rest;
            pointer_field = Some(pf);
            if pf == 0 {
                pusi_pkt_index = self.packet_count;
            }
        } else {
            payload = full_payload;
            pointer_field = None;
        }

        if payload.is_empty() {
            self.pids.insert(pid, pc);
            return;
        }

        // Without synchronization, wait for a packet with a PUSI and
        // skip the tail of the previous section.
        if !pc.sync {
            let pf = match pointer_field {
                Some(pf) => pf,
                None => {
                    self.pids.insert(pid, pc);
                    return;
                }
            };
            payload = &payload[pf..];
            pointer_field = Some(0);
            pc.sync = true;
        }

        pc.ts.extend_from_slice(payload);

        // Offset, inside the accumulated buffer, of the section start
        // designated by this packet's pointer field. Used to detect a
        // truncated previous section.
        let pusi_offset = pointer_field.map(|pf| pc.ts.len() - payload.len() + pf);

        // Drain complete sections from the buffer.
        let mut start = 0usize;
        while pc.ts.len() - start >= 3 {
            let head = &pc.ts[start..];
            let mut section_ok = true;

            let len_field = u16::from_be_bytes([head[1], head[2]]);
            let long_header = len_field & 0x8000 != 0;
            let mut section_length = total_length(head);

            if section_length > MAX_SECTION_SIZE
                || (long_header && section_length < MIN_LONG_SECTION_SIZE)
            {
                self.status.inv_sect_length += 1;
                pc.sync_lost();
                self.pids.insert(pid, pc);
                return;
            }

            // Wait for the end of the section.
            if pc.ts.len() - start < section_length {
                break;
            }

            // A pointer field falling strictly inside this section means
            // the section was truncated in the stream: skip the bytes up
            // to the announced start.
            if let Some(po) = pusi_offset {
                if start < po && start + section_length > po {
                    section_ok = false;
                    section_length = po - start;
                }
            }

            let mut etid = ExtTableId::short(head[0]);
            let mut version = 0u8;
            let mut is_next = false;
            let mut section_number = 0u8;
            let mut last_section_number = 0u8;

            if section_ok && long_header {
                etid.tid_ext = u16::from_be_bytes([head[3], head[4]]);
                version = (head[5] >> 1) & 0x1F;
                is_next = head[5] & 0x01 == 0;
                section_number = head[6];
                last_section_number = head[7];
                if section_number > last_section_number {
                    self.status.inv_sect_index += 1;
                    section_ok = false;
                }
            }

            // Sections with the 'next' indicator are consumed but never
            // dispatched or stored.
            if is_next {
                section_ok = false;
            }

            if section_ok {
                let tc = pc.tids.entry(etid).or_default();

                // Short sections carry no version, so each one starts a
                // fresh table; long sections restart the context on a
                // version change.
                if !long_header || tc.sect_expected == 0 || tc.version != version {
                    tc.version = version;
                    tc.sect_expected = usize::from(last_section_number) + 1;
                    tc.sect_received = 0;
                    tc.sects = vec![None; tc.sect_expected];
                }

                if usize::from(last_section_number) != tc.sect_expected - 1 {
                    self.status.inv_sect_index += 1;
                    section_ok = false;
                }

                let slot_empty = section_ok
                    && tc.sects[usize::from(section_number)].is_none();

                // Build the Section only when someone will look at it.
                let mut section = None;
                if section_ok && (self.section_handler.is_some() || slot_empty) {
                    let raw = Bytes::copy_from_slice(&pc.ts[start..start + section_length]);
                    let mut s = Section::new(raw, pid, true);
                    s.set_pkt_indexes(pusi_pkt_index, self.packet_count);
                    if !s.valid() {
                        self.status.wrong_crc += 1;
                        section_ok = false;
                    }
                    section = Some(s);
                }

                if let Some(ref s) = section {
                    if self.section_handler.is_some() {
                        let mut ctl = DemuxControl::default();
                        if let Some(h) = self.section_handler.as_mut() {
                            h.handle_section(&mut ctl, s);
                        }
                        if self.apply_control(ctl, pid).self_reset {
                            return;
                        }
                    }
                }

                if section_ok && slot_empty {
                    if let (Some(s), Some(tc)) = (section, pc.tids.get_mut(&etid)) {
                        tc.sects[usize::from(section_number)] = Some(s);
                        tc.sect_received += 1;

                        // Table completed: assemble and dispatch.
                        if tc.sect_received == tc.sect_expected && self.table_handler.is_some() {
                            let sections: Vec<Section> =
                                tc.sects.iter().flatten().cloned().collect();
                            if let Ok(table) = BinaryTable::from_sections(sections) {
                                let mut ctl = DemuxControl::default();
                                if let Some(h) = self.table_handler.as_mut() {
                                    h.handle_table(&mut ctl, &table);
                                }
                                if self.apply_control(ctl, pid).self_reset {
                                    return;
                                }
                            }
                        }
                    }
                }
            }

            // Move to the next section in the buffer; it necessarily
            // starts in the current packet.
            start += section_length;
            pusi_pkt_index = self.packet_count;

            // 0xFF is not a valid table id: the rest of the buffer is
            // stuffing.
            if start < pc.ts.len() && pc.ts[start] == 0xFF {
                pc.ts.truncate(start);
            }
        }

        // Keep only the incomplete tail.
        if start >= pc.ts.len() {
            pc.ts.clear();
        } else if start > 0 {
            pc.ts.drain(..start);
        }

        self.pids.insert(pid, pc);
    }

    /// Apply the operations a handler recorded during its callback.
    fn apply_control(&mut self, ctl: DemuxControl, current_pid: u16) -> ControlOutcome {
        for pid in ctl.add_pids {
            self.pid_filter.set(pid);
        }
        for pid in &ctl.remove_pids {
            self.pid_filter.clear(*pid);
        }

        let mut self_reset = false;
        if ctl.reset_all {
            self.pids.clear();
            self.epoch += 1;
            self_reset = true;
        } else {
            for pid in ctl.reset_pids {
                self.pids.remove(&pid);
                self.epoch += 1;
                if pid == current_pid {
                    self_reset = true;
                }
            }
            // Removing a PID from the filter also invalidates the
            // context being drained.
            if ctl.remove_pids.contains(&current_pid) {
                self.pids.remove(&current_pid);
                self.epoch += 1;
                self_reset = true;
            }
        }
        ControlOutcome { self_reset }
    }
}

impl std::fmt::Debug for SectionDemux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionDemux")
            .field("pids", &self.pids.len())
            .field("status", &self.status)
            .field("packet_count", &self.packet_count)
            .finish()
    }
}
