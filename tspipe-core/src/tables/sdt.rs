//! Service Description Table.
//!
//! Only the "actual transport stream" variant (table id 0x42) is modeled.
//! Service names come from the service descriptor (0x48) in each service
//! entry's descriptor loop.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};

use crate::error::TableError;
use crate::section::{table_id, Section};
use crate::tables::descriptors::descriptor_tag;
use crate::tables::{BinaryTable, Descriptor, DescriptorList, MAX_LONG_PAYLOAD};

/// One service entry of the SDT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdtService {
    /// EIT schedule flag.
    pub eit_schedule: bool,
    /// EIT present/following flag.
    pub eit_present_following: bool,
    /// Running status (3 bits).
    pub running_status: u8,
    /// CA mode: true when the service is scrambled.
    pub ca_controlled: bool,
    /// Descriptor loop.
    pub descs: DescriptorList,
}

impl SdtService {
    /// Service name from the service descriptor, when present.
    pub fn name(&self) -> Option<String> {
        let desc = self.descs.search(descriptor_tag::SERVICE)?;
        let p = &desc.payload;
        if p.len() < 2 {
            return None;
        }
        let provider_len = usize::from(p[1]);
        let name_off = 2 + provider_len;
        if p.len() < name_off + 1 {
            return None;
        }
        let name_len = usize::from(p[name_off]);
        if p.len() < name_off + 1 + name_len {
            return None;
        }
        Some(decode_dvb_string(&p[name_off + 1..name_off + 1 + name_len]))
    }

    /// Provider name from the service descriptor, when present.
    pub fn provider(&self) -> Option<String> {
        let desc = self.descs.search(descriptor_tag::SERVICE)?;
        let p = &desc.payload;
        if p.len() < 2 {
            return None;
        }
        let provider_len = usize::from(p[1]);
        if p.len() < 2 + provider_len {
            return None;
        }
        Some(decode_dvb_string(&p[2..2 + provider_len]))
    }

    /// Build a service descriptor carrying the given names.
    pub fn make_service_descriptor(service_type: u8, provider: &str, name: &str) -> Descriptor {
        let mut buf = BytesMut::with_capacity(3 + provider.len() + name.len());
        buf.put_u8(service_type);
        buf.put_u8(provider.len() as u8);
        buf.put_slice(provider.as_bytes());
        buf.put_u8(name.len() as u8);
        buf.put_slice(name.as_bytes());
        Descriptor::new(descriptor_tag::SERVICE, buf.freeze())
    }
}

/// Decode a DVB text field: an optional leading encoding byte below 0x20,
/// then character data taken as UTF-8, lossily.
fn decode_dvb_string(data: &[u8]) -> String {
    let text = match data.first() {
        Some(&b) if b < 0x20 => &data[1..],
        _ => data,
    };
    String::from_utf8_lossy(text).into_owned()
}

/// Parsed Service Description Table (actual TS).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sdt {
    /// Table version (5 bits).
    pub version: u8,
    /// Current/next indicator.
    pub is_current: bool,
    /// Transport stream id.
    pub ts_id: u16,
    /// Originating network id.
    pub original_network_id: u16,
    /// Services keyed by service id.
    pub services: BTreeMap<u16, SdtService>,
}

impl Sdt {
    /// Parse an SDT from a complete binary table.
    pub fn parse(table: &BinaryTable) -> Result<Self, TableError> {
        if table.table_id() != table_id::SDT_ACTUAL {
            return Err(TableError::UnexpectedTableId(table.table_id()));
        }
        let mut sdt = Sdt {
            version: table.version(),
            is_current: table.sections()[0].is_current(),
            ts_id: table.table_id_extension(),
            ..Sdt::default()
        };
        for sect in table.sections() {
            let data = sect.payload();
            if data.len() < 3 {
                return Err(TableError::InvalidPayload("SDT fixed part truncated"));
            }
            sdt.original_network_id = u16::from_be_bytes([data[0], data[1]]);
            let mut svc = &data[3..];
            while !svc.is_empty() {
                if svc.len() < 5 {
                    return Err(TableError::InvalidPayload("SDT service entry truncated"));
                }
                let service_id = u16::from_be_bytes([svc[0], svc[1]]);
                let loop_len = usize::from(u16::from_be_bytes([svc[3], svc[4]]) & 0x0FFF);
                if svc.len() < 5 + loop_len {
                    return Err(TableError::InvalidPayload("SDT descriptor loop truncated"));
                }
                sdt.services.insert(
                    service_id,
                    SdtService {
                        eit_schedule: svc[2] & 0x02 != 0,
                        eit_present_following: svc[2] & 0x01 != 0,
                        running_status: (svc[3] >> 5) & 0x07,
                        ca_controlled: svc[3] & 0x10 != 0,
                        descs: DescriptorList::parse(&svc[5..5 + loop_len])?,
                    },
                );
                svc = &svc[5 + loop_len..];
            }
        }
        Ok(sdt)
    }

    /// Build a single-section binary table.
    pub fn build(&self) -> Result<BinaryTable, TableError> {
        let size = 3 + self
            .services
            .values()
            .map(|s| 5 + s.descs.size())
            .sum::<usize>();
        if size > MAX_LONG_PAYLOAD {
            return Err(TableError::PayloadTooLarge(size));
        }
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u16(self.original_network_id);
        buf.put_u8(0xFF);
        for (&service_id, svc) in &self.services {
            buf.put_u16(service_id);
            buf.put_u8(0xFC | (u8::from(svc.eit_schedule) << 1) | u8::from(svc.eit_present_following));
            let flags = (svc.running_status & 0x07) << 5
                | (u8::from(svc.ca_controlled) << 4)
                | ((svc.descs.size() >> 8) as u8 & 0x0F);
            buf.put_u8(flags);
            buf.put_u8((svc.descs.size() & 0xFF) as u8);
            svc.descs.build(&mut buf);
        }
        BinaryTable::from_section(Section::new_long(
            table_id::SDT_ACTUAL,
            self.ts_id,
            self.version,
            self.is_current,
            0,
            0,
            &buf,
        ))
    }

    /// Find a service id by name, case-insensitive, ignoring blanks.
    pub fn find_service(&self, name: &str) -> Option<u16> {
        let wanted = normalize_name(name);
        self.services.iter().find_map(|(&id, svc)| {
            svc.name()
                .map(|n| normalize_name(&n) == wanted)
                .unwrap_or(false)
                .then_some(id)
        })
    }
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdt_roundtrip_and_name_lookup() {
        let mut sdt = Sdt {
            version: 4,
            is_current: true,
            ts_id: 0x0042,
            original_network_id: 0x2000,
            ..Sdt::default()
        };
        let mut svc = SdtService {
            running_status: 4,
            ..SdtService::default()
        };
        svc.descs
            .add(SdtService::make_service_descriptor(0x01, "Example Nets", "News One"));
        sdt.services.insert(0x0001, svc);

        let table = sdt.build().unwrap();
        let parsed = Sdt::parse(&table).unwrap();
        assert_eq!(parsed, sdt);
        assert_eq!(parsed.services[&1].name().as_deref(), Some("News One"));
        assert_eq!(parsed.services[&1].provider().as_deref(), Some("Example Nets"));

        // Lookup is case-insensitive and blank-insensitive.
        assert_eq!(parsed.find_service("newsone"), Some(1));
        assert_eq!(parsed.find_service("NEWS ONE"), Some(1));
        assert_eq!(parsed.find_service("other"), None);
    }
}
