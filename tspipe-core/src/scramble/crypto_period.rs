//! Crypto-period bookkeeping.
//!
//! Two crypto-period slots exist at any time: previous/current or
//! current/next, depending on where we stand relative to the ECM and CW
//! transition points. Each slot owns its packetized ECM behind a single
//! ready flag: the ECM continuation writes the packets first and sets the
//! flag last (release), the scrambler thread reads the flag at ECM-insert
//! points (acquire) before touching the packets. No other synchronization
//! crosses the ECMG boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error};

use crate::packet::{TsPacket, CC_MAX, NULL_PACKET, TS_PACKET_SIZE};
use crate::packetizer::OneShotPacketizer;
use crate::scramble::crypto::{ControlWord, CwGenerator};
use crate::section::Section;

use bytes::Bytes;
use tspipe_ecmg::EcmResponse;

/// Packetized ECM of one crypto-period, shared with the generation
/// continuation.
#[derive(Debug, Default)]
pub(crate) struct EcmSlot {
    /// Set (release) after `packets` is fully written.
    ready: AtomicBool,
    packets: Mutex<EcmPackets>,
}

#[derive(Debug, Default)]
struct EcmPackets {
    packets: Vec<TsPacket>,
    next: usize,
}

impl EcmSlot {
    /// Store a generated ECM and publish the ready flag.
    ///
    /// `as_packets` reflects the channel's `section_TSpkt_flag`: when
    /// set, the datagram is a whole number of TS packets; otherwise it
    /// is one section to packetize on the fly. Returns false on a
    /// malformed datagram.
    pub(crate) fn load(&self, response: &EcmResponse, as_packets: bool) -> bool {
        let datagram = &response.ecm_datagram;
        let mut packets = Vec::new();
        if as_packets {
            if datagram.is_empty() || datagram.len() % TS_PACKET_SIZE != 0 {
                error!(
                    "invalid ECM size ({} bytes), not a multiple of {}",
                    datagram.len(),
                    TS_PACKET_SIZE
                );
                return false;
            }
            for chunk in datagram.chunks_exact(TS_PACKET_SIZE) {
                let mut pkt = NULL_PACKET;
                pkt.b.copy_from_slice(chunk);
                packets.push(pkt);
            }
        } else {
            let section = Section::new(Bytes::copy_from_slice(datagram), 0, true);
            if !section.valid() {
                error!("ECMG returned an invalid ECM section ({} bytes)", datagram.len());
                return false;
            }
            // The emission PID is rewritten at insertion time, so the
            // packetizer PID is irrelevant here.
            let mut pzer = OneShotPacketizer::new(crate::packet::pid::NULL);
            pzer.add_section(section);
            pzer.get_packets(&mut packets);
        }

        if let Ok(mut guard) = self.packets.lock() {
            guard.next = 0;
            guard.packets = packets;
        } else {
            return false;
        }
        // Last write: publish.
        self.ready.store(true, Ordering::Release);
        true
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// One crypto-period: number, its two control words and its ECM.
#[derive(Debug, Default)]
pub(crate) struct CryptoPeriod {
    cp_number: u16,
    cw_current: ControlWord,
    cw_next: ControlWord,
    slot: Arc<EcmSlot>,
}

impl CryptoPeriod {
    /// First crypto-period of a session: two fresh control words.
    pub(crate) fn init_cycle(cw_gen: &mut CwGenerator, cp_number: u16) -> Self {
        Self {
            cp_number,
            cw_current: cw_gen.generate(),
            cw_next: cw_gen.generate(),
            slot: Arc::new(EcmSlot::default()),
        }
    }

    /// The crypto-period following `previous`: inherits its next control
    /// word and draws a new one.
    pub(crate) fn init_next(previous: &CryptoPeriod, cw_gen: &mut CwGenerator) -> Self {
        Self {
            cp_number: previous.cp_number.wrapping_add(1),
            cw_current: previous.cw_next,
            cw_next: cw_gen.generate(),
            slot: Arc::new(EcmSlot::default()),
        }
    }

    /// Crypto-period number.
    pub(crate) fn cp_number(&self) -> u16 {
        self.cp_number
    }

    /// Control word of this period.
    pub(crate) fn cw_current(&self) -> &ControlWord {
        &self.cw_current
    }

    /// Control word of the following period.
    pub(crate) fn cw_next(&self) -> &ControlWord {
        &self.cw_next
    }

    /// ECM storage, shared with the generation continuation.
    pub(crate) fn slot(&self) -> Arc<EcmSlot> {
        Arc::clone(&self.slot)
    }

    /// Whether the ECM of this period has been generated.
    pub(crate) fn ecm_ready(&self) -> bool {
        self.slot.ready()
    }

    /// Scrambling control value of this period: the key parity follows
    /// the crypto-period number.
    pub(crate) fn scrambling_control_value(&self) -> u8 {
        if self.cp_number & 1 != 0 {
            crate::packet::scrambling::ODD_KEY
        } else {
            crate::packet::scrambling::EVEN_KEY
        }
    }

    /// Overwrite `pkt` with the next ECM packet of the cycle, rewriting
    /// its PID and continuity counter. Emits a null packet when the ECM
    /// is not ready.
    pub(crate) fn next_ecm_packet(&self, pkt: &mut TsPacket, ecm_pid: u16, ecm_cc: &mut u8) {
        if !self.slot.ready() {
            *pkt = NULL_PACKET;
            return;
        }
        let Ok(mut guard) = self.slot.packets.lock() else {
            *pkt = NULL_PACKET;
            return;
        };
        if guard.packets.is_empty() {
            *pkt = NULL_PACKET;
            return;
        }
        let index = guard.next;
        *pkt = guard.packets[index];
        guard.next = (index + 1) % guard.packets.len();
        drop(guard);

        pkt.set_pid(ecm_pid);
        pkt.set_cc(*ecm_cc);
        *ecm_cc = (*ecm_cc + 1) % CC_MAX;
        debug!("inserted ECM packet for crypto-period {}", self.cp_number);
    }
}
