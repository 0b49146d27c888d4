//! Program Map Table.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};

use crate::error::TableError;
use crate::section::{table_id, Section};
use crate::tables::descriptors::descriptor_tag;
use crate::tables::{BinaryTable, DescriptorList, MAX_LONG_PAYLOAD};

/// Elementary stream types distinguished by the component classifier.
pub mod stream_type {
    /// MPEG-1 video.
    pub const MPEG1_VIDEO: u8 = 0x01;
    /// MPEG-2 video.
    pub const MPEG2_VIDEO: u8 = 0x02;
    /// MPEG-1 audio.
    pub const MPEG1_AUDIO: u8 = 0x03;
    /// MPEG-2 audio.
    pub const MPEG2_AUDIO: u8 = 0x04;
    /// Private PES data (subtitles travel here, with a subtitling descriptor).
    pub const PRIVATE_PES: u8 = 0x06;
    /// AAC audio (ADTS).
    pub const AAC_AUDIO: u8 = 0x0F;
    /// AAC audio (LATM).
    pub const LATM_AUDIO: u8 = 0x11;
    /// H.264/AVC video.
    pub const H264_VIDEO: u8 = 0x1B;
    /// H.265/HEVC video.
    pub const H265_VIDEO: u8 = 0x24;
}

/// One elementary stream entry of a PMT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PmtStream {
    /// Stream type.
    pub stream_type: u8,
    /// ES-level descriptor loop.
    pub descs: DescriptorList,
}

impl PmtStream {
    /// Check if the component is video.
    pub fn is_video(&self) -> bool {
        matches!(
            self.stream_type,
            stream_type::MPEG1_VIDEO
                | stream_type::MPEG2_VIDEO
                | stream_type::H264_VIDEO
                | stream_type::H265_VIDEO
        )
    }

    /// Check if the component is audio.
    pub fn is_audio(&self) -> bool {
        matches!(
            self.stream_type,
            stream_type::MPEG1_AUDIO
                | stream_type::MPEG2_AUDIO
                | stream_type::AAC_AUDIO
                | stream_type::LATM_AUDIO
        )
    }

    /// Check if the component is subtitles: private PES data carrying a
    /// subtitling descriptor.
    pub fn is_subtitles(&self) -> bool {
        self.stream_type == stream_type::PRIVATE_PES
            && self.descs.search(descriptor_tag::SUBTITLING).is_some()
    }
}

/// Parsed Program Map Table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pmt {
    /// Table version (5 bits).
    pub version: u8,
    /// Current/next indicator.
    pub is_current: bool,
    /// Service id of the program.
    pub service_id: u16,
    /// PID carrying the PCR of the program.
    pub pcr_pid: u16,
    /// Program-level descriptor loop.
    pub descs: DescriptorList,
    /// Elementary streams, keyed by PID.
    pub streams: BTreeMap<u16, PmtStream>,
}

impl Pmt {
    /// Parse a PMT from a complete binary table.
    pub fn parse(table: &BinaryTable) -> Result<Self, TableError> {
        if table.table_id() != table_id::PMT {
            return Err(TableError::UnexpectedTableId(table.table_id()));
        }
        let mut pmt = Pmt {
            version: table.version(),
            is_current: table.sections()[0].is_current(),
            service_id: table.table_id_extension(),
            ..Pmt::default()
        };
        for sect in table.sections() {
            let data = sect.payload();
            if data.len() < 4 {
                return Err(TableError::InvalidPayload("PMT fixed part truncated"));
            }
            pmt.pcr_pid = u16::from_be_bytes([data[0], data[1]]) & 0x1FFF;
            let program_info_len = usize::from(u16::from_be_bytes([data[2], data[3]]) & 0x0FFF);
            if data.len() < 4 + program_info_len {
                return Err(TableError::InvalidPayload("PMT program info truncated"));
            }
            pmt.descs = DescriptorList::parse(&data[4..4 + program_info_len])?;

            let mut es = &data[4 + program_info_len..];
            while !es.is_empty() {
                if es.len() < 5 {
                    return Err(TableError::InvalidPayload("PMT stream entry truncated"));
                }
                let stype = es[0];
                let pid = u16::from_be_bytes([es[1], es[2]]) & 0x1FFF;
                let es_info_len = usize::from(u16::from_be_bytes([es[3], es[4]]) & 0x0FFF);
                if es.len() < 5 + es_info_len {
                    return Err(TableError::InvalidPayload("PMT stream descriptors truncated"));
                }
                pmt.streams.insert(
                    pid,
                    PmtStream {
                        stream_type: stype,
                        descs: DescriptorList::parse(&es[5..5 + es_info_len])?,
                    },
                );
                es = &es[5 + es_info_len..];
            }
        }
        Ok(pmt)
    }

    /// Build a single-section binary table.
    pub fn build(&self) -> Result<BinaryTable, TableError> {
        let size = 4
            + self.descs.size()
            + self
                .streams
                .values()
                .map(|s| 5 + s.descs.size())
                .sum::<usize>();
        if size > MAX_LONG_PAYLOAD {
            return Err(TableError::PayloadTooLarge(size));
        }
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u16(0xE000 | (self.pcr_pid & 0x1FFF));
        buf.put_u16(0xF000 | (self.descs.size() as u16 & 0x0FFF));
        self.descs.build(&mut buf);
        for (&pid, stream) in &self.streams {
            buf.put_u8(stream.stream_type);
            buf.put_u16(0xE000 | (pid & 0x1FFF));
            buf.put_u16(0xF000 | (stream.descs.size() as u16 & 0x0FFF));
            stream.descs.build(&mut buf);
        }
        BinaryTable::from_section(Section::new_long(
            table_id::PMT,
            self.service_id,
            self.version,
            self.is_current,
            0,
            0,
            &buf,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{CaDescriptor, Descriptor};
    use bytes::Bytes;

    fn sample_pmt() -> Pmt {
        let mut pmt = Pmt {
            version: 2,
            is_current: true,
            service_id: 0x0001,
            pcr_pid: 0x0101,
            ..Pmt::default()
        };
        pmt.streams.insert(
            0x0101,
            PmtStream {
                stream_type: stream_type::MPEG2_VIDEO,
                descs: DescriptorList::new(),
            },
        );
        let mut audio = PmtStream {
            stream_type: stream_type::MPEG2_AUDIO,
            descs: DescriptorList::new(),
        };
        audio.descs.add(Descriptor::new(0x0A, Bytes::from_static(b"eng\x00")));
        pmt.streams.insert(0x0102, audio);
        pmt
    }

    #[test]
    fn test_pmt_roundtrip() {
        let mut pmt = sample_pmt();
        pmt.descs.add(CaDescriptor::new(0x4AD0, 0x0220).build());

        let table = pmt.build().unwrap();
        let parsed = Pmt::parse(&table).unwrap();
        assert_eq!(parsed, pmt);
    }

    #[test]
    fn test_component_classification() {
        let pmt = sample_pmt();
        assert!(pmt.streams[&0x0101].is_video());
        assert!(!pmt.streams[&0x0101].is_audio());
        assert!(pmt.streams[&0x0102].is_audio());

        let mut sub = PmtStream {
            stream_type: stream_type::PRIVATE_PES,
            descs: DescriptorList::new(),
        };
        assert!(!sub.is_subtitles());
        sub.descs
            .add(Descriptor::new(descriptor_tag::SUBTITLING, Bytes::from_static(&[0; 8])));
        assert!(sub.is_subtitles());
    }
}
