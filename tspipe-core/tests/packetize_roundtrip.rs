//! Packetizer/demux round-trip laws.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tspipe_core::demux::{DemuxControl, SectionDemux, SectionHandler, TableHandler};
use tspipe_core::packet::PidSet;
use tspipe_core::packetizer::{CyclingPacketizer, OneShotPacketizer, StuffingPolicy};
use tspipe_core::section::Section;
use tspipe_core::tables::{BinaryTable, Pmt, PmtStream};
use tspipe_core::NULL_PACKET;

#[derive(Clone, Default)]
struct Catch {
    sections: Arc<Mutex<Vec<Bytes>>>,
    tables: Arc<Mutex<Vec<BinaryTable>>>,
}

impl SectionHandler for Catch {
    fn handle_section(&mut self, _ctl: &mut DemuxControl, section: &Section) {
        self.sections.lock().unwrap().push(section.bytes().clone());
    }
}

impl TableHandler for Catch {
    fn handle_table(&mut self, _ctl: &mut DemuxControl, table: &BinaryTable) {
        self.tables.lock().unwrap().push(table.clone());
    }
}

fn demux_on(pid: u16, catch: &Catch) -> SectionDemux {
    let mut filter = PidSet::none();
    filter.set(pid);
    SectionDemux::new(
        Some(Box::new(catch.clone())),
        Some(Box::new(catch.clone())),
        filter,
    )
}

#[test]
fn test_one_shot_roundtrip_for_various_sizes() {
    for payload_len in [1usize, 50, 170, 171, 172, 500, 1000, 4084] {
        let section = Section::new_long(0x72, 9, 2, true, 0, 0, &vec![0xC3; payload_len]);
        let catch = Catch::default();
        let mut demux = demux_on(0x0150, &catch);

        let mut pzer = OneShotPacketizer::new(0x0150);
        pzer.add_section(section.clone());
        let mut packets = Vec::new();
        pzer.get_packets(&mut packets);

        for pkt in &packets {
            demux.feed(pkt);
        }
        let sections = catch.sections.lock().unwrap();
        assert_eq!(sections.len(), 1, "payload_len={payload_len}");
        assert_eq!(&sections[0], section.bytes(), "payload_len={payload_len}");
        assert!(!demux.status().has_errors(), "payload_len={payload_len}");
    }
}

#[test]
fn test_cycling_roundtrip_table_dispatch() {
    let mut pmt = Pmt {
        version: 3,
        is_current: true,
        service_id: 7,
        pcr_pid: 0x0101,
        ..Pmt::default()
    };
    pmt.streams.insert(
        0x0101,
        PmtStream {
            stream_type: 0x1B,
            ..PmtStream::default()
        },
    );
    let table = pmt.build().unwrap();

    let catch = Catch::default();
    let mut demux = demux_on(0x0100, &catch);
    let mut pzer = CyclingPacketizer::new(0x0100, StuffingPolicy::EndOfSection);
    pzer.add_table(&table);

    // Three cycles: one table dispatch (same version, slots filled).
    for _ in 0..3 {
        let mut pkt = NULL_PACKET;
        pzer.next_packet(&mut pkt);
        demux.feed(&pkt);
    }
    assert_eq!(catch.tables.lock().unwrap().len(), 1);
    let parsed = Pmt::parse(&catch.tables.lock().unwrap()[0]).unwrap();
    assert_eq!(parsed, pmt);
    assert!(!demux.status().has_errors());
}

#[test]
fn test_packed_sections_all_recovered() {
    let sections: Vec<Section> = (0u8..5)
        .map(|i| Section::new_long(0x72, u16::from(i), 0, true, 0, 0, &[i; 30]))
        .collect();

    let catch = Catch::default();
    let mut demux = demux_on(0x0160, &catch);
    let mut pzer = CyclingPacketizer::new(0x0160, StuffingPolicy::EndOfCycle);
    for s in &sections {
        pzer.add_section(s.clone());
    }

    let mut emitted = 0;
    while pzer.cycle_count() == 0 {
        let mut pkt = NULL_PACKET;
        pzer.next_packet(&mut pkt);
        demux.feed(&pkt);
        emitted += 1;
        assert!(emitted < 100, "cycle never completed");
    }

    let got = catch.sections.lock().unwrap();
    assert_eq!(got.len(), 5);
    for (i, s) in sections.iter().enumerate() {
        assert_eq!(&got[i], s.bytes());
    }
    assert!(!demux.status().has_errors());
}

#[test]
fn test_multi_section_table_assembled() {
    // A two-section table: both sections must arrive before dispatch.
    let s0 = Section::new_long(0x72, 4, 1, true, 0, 1, &[0xA0; 40]);
    let s1 = Section::new_long(0x72, 4, 1, true, 1, 1, &[0xA1; 40]);

    let catch = Catch::default();
    let mut demux = demux_on(0x0170, &catch);
    let mut pzer = OneShotPacketizer::new(0x0170);
    pzer.add_section(s0.clone());
    let mut packets = Vec::new();
    pzer.get_packets(&mut packets);
    for pkt in &packets {
        demux.feed(pkt);
    }
    assert!(catch.tables.lock().unwrap().is_empty());

    let mut pzer = OneShotPacketizer::new(0x0170);
    pzer.add_section(s1.clone());
    let mut packets = Vec::new();
    pzer.get_packets(&mut packets);
    // Keep the PID's continuity counter consecutive.
    for (i, pkt) in packets.iter().enumerate() {
        let mut pkt = *pkt;
        pkt.set_cc((2 + i as u8) % 16);
        demux.feed(&pkt);
    }

    let tables = catch.tables.lock().unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].section_count(), 2);
    assert_eq!(tables[0].sections()[0].bytes(), s0.bytes());
    assert_eq!(tables[0].sections()[1].bytes(), s1.bytes());
}
