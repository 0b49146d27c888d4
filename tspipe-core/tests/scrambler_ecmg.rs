//! Scrambler crypto-period machinery against a mock ECM generator.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tspipe_core::packet::{pid, scrambling, NULL_PACKET};
use tspipe_core::packetizer::{CyclingPacketizer, StuffingPolicy};
use tspipe_core::plugin::{ProcessContext, ProcessStatus, ProcessorPlugin};
use tspipe_core::scramble::{ScramblerConfig, ScramblerStage, ServiceRef};
use tspipe_core::section::Section;
use tspipe_core::tables::{Pat, Pmt, PmtStream};
use tspipe_core::TsPacket;

use tspipe_ecmg::{
    ChannelStatus, EcmContinuation, EcmGenerator, EcmRequest, EcmResponse, EcmgError,
};

const PMT_PID: u16 = 0x0100;
const VIDEO_PID: u16 = 0x0101;
const TS_BITRATE: u32 = 1_000_000;
const CP_DURATION_MS: u64 = 2_000;

/// Packets per crypto-period at the test bitrate.
const PERIOD_PKTS: u64 = (TS_BITRATE as u64) * CP_DURATION_MS / 1000 / (188 * 8);

fn ecm_response(request: &EcmRequest) -> EcmResponse {
    // An ECM section carrying the crypto-period number and both CWs.
    let mut payload = Vec::new();
    payload.extend_from_slice(&request.cp_number.to_be_bytes());
    payload.extend_from_slice(&request.cw_current);
    payload.extend_from_slice(&request.cw_next);
    let section = Section::new_short(0x80, &payload);
    EcmResponse {
        ecm_datagram: section.bytes().clone(),
    }
}

/// Mock generator answering every request immediately.
struct ImmediateEcmg;

impl EcmGenerator for ImmediateEcmg {
    fn channel_setup(&mut self, _super_cas_id: u32, _cp_cs: u16) -> Result<ChannelStatus, EcmgError> {
        Ok(ChannelStatus {
            section_tspkt_flag: false,
            delay_start: 0,
        })
    }

    fn generate_ecm(&mut self, request: &EcmRequest) -> Result<EcmResponse, EcmgError> {
        Ok(ecm_response(request))
    }

    fn submit_ecm(&mut self, request: &EcmRequest, done: EcmContinuation) -> Result<(), EcmgError> {
        done(Ok(ecm_response(request)));
        Ok(())
    }
}

/// Mock generator that parks requests after the first `auto` ones; the
/// test releases them later through the shared queue.
#[derive(Clone)]
struct DeferredEcmg {
    auto: Arc<Mutex<usize>>,
    parked: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

impl DeferredEcmg {
    fn new(auto: usize) -> Self {
        Self {
            auto: Arc::new(Mutex::new(auto)),
            parked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn release_all(&self) {
        let parked: Vec<_> = self.parked.lock().unwrap().drain(..).collect();
        for run in parked {
            run();
        }
    }
}

impl EcmGenerator for DeferredEcmg {
    fn channel_setup(&mut self, _super_cas_id: u32, _cp_cs: u16) -> Result<ChannelStatus, EcmgError> {
        Ok(ChannelStatus {
            section_tspkt_flag: false,
            delay_start: 0,
        })
    }

    fn generate_ecm(&mut self, request: &EcmRequest) -> Result<EcmResponse, EcmgError> {
        Ok(ecm_response(request))
    }

    fn submit_ecm(&mut self, request: &EcmRequest, done: EcmContinuation) -> Result<(), EcmgError> {
        let mut auto = self.auto.lock().unwrap();
        if *auto > 0 {
            *auto -= 1;
            done(Ok(ecm_response(request)));
        } else {
            let response = ecm_response(request);
            self.parked
                .lock()
                .unwrap()
                .push(Box::new(move || done(Ok(response))));
        }
        Ok(())
    }
}

fn make_psi() -> (CyclingPacketizer, CyclingPacketizer) {
    let mut pat = Pat {
        version: 0,
        is_current: true,
        ts_id: 1,
        nit_pid: None,
        pmts: BTreeMap::new(),
    };
    pat.pmts.insert(1, PMT_PID);
    let mut pzer_pat = CyclingPacketizer::new(pid::PAT, StuffingPolicy::EndOfSection);
    pzer_pat.add_table(&pat.build().unwrap());

    let mut pmt = Pmt {
        version: 0,
        is_current: true,
        service_id: 1,
        pcr_pid: VIDEO_PID,
        ..Pmt::default()
    };
    pmt.streams.insert(
        VIDEO_PID,
        PmtStream {
            stream_type: 0x02,
            ..PmtStream::default()
        },
    );
    let mut pzer_pmt = CyclingPacketizer::new(PMT_PID, StuffingPolicy::EndOfSection);
    pzer_pmt.add_table(&pmt.build().unwrap());

    (pzer_pat, pzer_pmt)
}

/// Drive `count` packets through the stage: PSI up front, then a video
/// packet / null packet mix. Returns the outputs.
fn drive(
    stage: &mut ScramblerStage,
    pzer_pat: &mut CyclingPacketizer,
    pzer_pmt: &mut CyclingPacketizer,
    start_index: u64,
    count: u64,
    video_cc: &mut u8,
) -> Vec<TsPacket> {
    let mut out = Vec::new();
    for i in start_index..start_index + count {
        let mut pkt = NULL_PACKET;
        if i % 1000 == 0 {
            pzer_pat.next_packet(&mut pkt);
        } else if i % 1000 == 1 {
            pzer_pmt.next_packet(&mut pkt);
        } else if i % 3 != 2 {
            *video_cc = (*video_cc + 1) % 16;
            pkt.set_pid(VIDEO_PID);
            pkt.set_cc(*video_cc);
        }
        let mut ctx = ProcessContext {
            ts_bitrate: TS_BITRATE,
            ..ProcessContext::default()
        };
        let status = stage.process(&mut pkt, &mut ctx);
        assert_eq!(status, ProcessStatus::Ok, "at packet {i}");
        out.push(pkt);
    }
    out
}

fn ecmg_config(synchronous: bool) -> ScramblerConfig {
    ScramblerConfig {
        service: ServiceRef::Id(1),
        super_cas_id: 0x4AD0_0001,
        cp_duration_ms: CP_DURATION_MS,
        synchronous_ecmg: synchronous,
        ..ScramblerConfig::default()
    }
}

#[test]
fn test_crypto_period_transitions_toggle_parity() {
    let mut stage = ScramblerStage::new(ecmg_config(true), Some(Box::new(ImmediateEcmg)));
    assert!(ProcessorPlugin::start(&mut stage));

    let (mut pat, mut pmt) = make_psi();
    let mut cc = 0;
    // Three crypto-periods worth of traffic.
    let out = drive(&mut stage, &mut pat, &mut pmt, 0, PERIOD_PKTS * 3, &mut cc);
    assert!(ProcessorPlugin::stop(&mut stage));

    assert!(!stage.demux_status().has_errors());

    // ECM packets were inserted on the allocated PID.
    let ecm_pid = stage.ecm_pid().expect("ECM PID allocated");
    let ecm_count = out.iter().filter(|p| p.pid() == ecm_pid).count();
    assert!(ecm_count > 50, "only {ecm_count} ECM packets");

    // Scrambling control switches from even to odd at the first
    // transition and back at the second.
    let controls: Vec<u8> = out
        .iter()
        .filter(|p| p.pid() == VIDEO_PID)
        .map(|p| p.scrambling_control())
        .collect();
    assert!(controls.iter().all(|&c| c == scrambling::EVEN_KEY || c == scrambling::ODD_KEY));
    assert!(controls.contains(&scrambling::ODD_KEY));
    let first_odd = controls.iter().position(|&c| c == scrambling::ODD_KEY).unwrap();
    assert!(controls[..first_odd].iter().all(|&c| c == scrambling::EVEN_KEY));
    // After the second transition, even reappears.
    assert!(controls[first_odd..].contains(&scrambling::EVEN_KEY));
}

#[test]
fn test_degraded_mode_freezes_and_recovers() {
    // The first two ECMs (periods 0 and 1) complete; the third parks.
    let ecmg = DeferredEcmg::new(2);
    let mut stage = ScramblerStage::new(ecmg_config(false), Some(Box::new(ecmg.clone())));
    assert!(ProcessorPlugin::start(&mut stage));

    let (mut pat, mut pmt) = make_psi();
    let mut cc = 0;

    // Run past the second transition point: the ECM for period 2 is
    // missing, so the stage must enter degraded mode and keep the odd
    // key of period 1 instead of switching.
    let out = drive(&mut stage, &mut pat, &mut pmt, 0, PERIOD_PKTS * 3, &mut cc);
    let tail_controls: Vec<u8> = out[(PERIOD_PKTS * 2) as usize..]
        .iter()
        .filter(|p| p.pid() == VIDEO_PID)
        .map(|p| p.scrambling_control())
        .collect();
    assert!(!tail_controls.is_empty());
    assert!(
        tail_controls.iter().all(|&c| c == scrambling::ODD_KEY),
        "transitions must freeze in degraded mode"
    );

    // Release the parked ECM: the next insertion point exits degraded
    // mode and performs the deferred CW change back to an even period.
    ecmg.release_all();
    let out = drive(&mut stage, &mut pat, &mut pmt, PERIOD_PKTS * 3, 400, &mut cc);
    let controls: Vec<u8> = out
        .iter()
        .filter(|p| p.pid() == VIDEO_PID)
        .map(|p| p.scrambling_control())
        .collect();
    assert!(
        controls.iter().any(|&c| c == scrambling::EVEN_KEY),
        "degraded mode must end after the ECM arrives"
    );

    assert!(ProcessorPlugin::stop(&mut stage));
    assert!(!stage.demux_status().has_errors());
}
