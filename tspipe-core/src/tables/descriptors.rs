//! Descriptors and descriptor lists.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::TableError;

/// Descriptor tags used by the table model.
pub mod descriptor_tag {
    /// CA descriptor (0x09).
    pub const CA: u8 = 0x09;
    /// Service descriptor (0x48).
    pub const SERVICE: u8 = 0x48;
    /// Subtitling descriptor (0x59).
    pub const SUBTITLING: u8 = 0x59;
}

/// One raw descriptor: tag plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Descriptor tag.
    pub tag: u8,
    /// Descriptor payload, without tag and length bytes.
    pub payload: Bytes,
}

impl Descriptor {
    /// Create a descriptor from a tag and payload.
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Serialized size: tag, length byte, payload.
    pub fn size(&self) -> usize {
        2 + self.payload.len()
    }
}

/// An ordered descriptor list, as found in PMT/CAT/SDT loops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorList {
    descs: Vec<Descriptor>,
}

impl DescriptorList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw descriptor loop.
    pub fn parse(mut data: &[u8]) -> Result<Self, TableError> {
        let mut descs = Vec::new();
        while !data.is_empty() {
            if data.len() < 2 {
                return Err(TableError::InvalidDescriptor("truncated descriptor header"));
            }
            let tag = data[0];
            let len = usize::from(data[1]);
            if data.len() < 2 + len {
                return Err(TableError::InvalidDescriptor("truncated descriptor payload"));
            }
            descs.push(Descriptor::new(tag, Bytes::copy_from_slice(&data[2..2 + len])));
            data = &data[2 + len..];
        }
        Ok(Self { descs })
    }

    /// Serialize the loop.
    pub fn build(&self, buf: &mut BytesMut) {
        for d in &self.descs {
            buf.put_u8(d.tag);
            buf.put_u8(d.payload.len() as u8);
            buf.put_slice(&d.payload);
        }
    }

    /// Append a descriptor.
    pub fn add(&mut self, desc: Descriptor) {
        self.descs.push(desc);
    }

    /// Total serialized size of the loop.
    pub fn size(&self) -> usize {
        self.descs.iter().map(Descriptor::size).sum()
    }

    /// Iterate the descriptors.
    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.descs.iter()
    }

    /// First descriptor with the given tag, if any.
    pub fn search(&self, tag: u8) -> Option<&Descriptor> {
        self.descs.iter().find(|d| d.tag == tag)
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// Check for emptiness.
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }
}

/// A CA descriptor (tag 0x09): CA_system_id and the PID carrying ECMs
/// (in a PMT) or EMMs (in the CAT), plus opaque private data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaDescriptor {
    /// CA system identifier.
    pub cas_id: u16,
    /// ECM or EMM PID. Stored in the low 13 bits; the wire form carries
    /// 0xE000 in the reserved high bits.
    pub ca_pid: u16,
    /// Private data following the fixed part.
    pub private_data: Bytes,
}

impl CaDescriptor {
    /// Create a CA descriptor with empty private data.
    pub fn new(cas_id: u16, ca_pid: u16) -> Self {
        Self {
            cas_id,
            ca_pid: ca_pid & 0x1FFF,
            private_data: Bytes::new(),
        }
    }

    /// Parse from a raw descriptor.
    pub fn parse(desc: &Descriptor) -> Result<Self, TableError> {
        if desc.tag != descriptor_tag::CA {
            return Err(TableError::InvalidDescriptor("not a CA descriptor"));
        }
        if desc.payload.len() < 4 {
            return Err(TableError::InvalidDescriptor("CA descriptor too short"));
        }
        let p = &desc.payload;
        Ok(Self {
            cas_id: u16::from_be_bytes([p[0], p[1]]),
            ca_pid: u16::from_be_bytes([p[2], p[3]]) & 0x1FFF,
            private_data: desc.payload.slice(4..),
        })
    }

    /// Serialize to a raw descriptor.
    pub fn build(&self) -> Descriptor {
        let mut buf = BytesMut::with_capacity(4 + self.private_data.len());
        buf.put_u16(self.cas_id);
        buf.put_u16(0xE000 | (self.ca_pid & 0x1FFF));
        buf.put_slice(&self.private_data);
        Descriptor::new(descriptor_tag::CA, buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_list_roundtrip() {
        let mut list = DescriptorList::new();
        list.add(Descriptor::new(0x48, Bytes::from_static(&[0x01, 0x00, 0x00])));
        list.add(Descriptor::new(0x0A, Bytes::from_static(b"eng\x00")));

        let mut buf = BytesMut::new();
        list.build(&mut buf);
        let parsed = DescriptorList::parse(&buf).unwrap();
        assert_eq!(parsed, list);
        assert_eq!(parsed.size(), buf.len());
        assert!(parsed.search(0x0A).is_some());
        assert!(parsed.search(0x59).is_none());
    }

    #[test]
    fn test_descriptor_list_truncated() {
        assert!(DescriptorList::parse(&[0x48]).is_err());
        assert!(DescriptorList::parse(&[0x48, 0x05, 0x01]).is_err());
    }

    #[test]
    fn test_ca_descriptor_wire_form() {
        let mut ca = CaDescriptor::new(0x4AD0, 0x0234);
        ca.private_data = Bytes::from_static(&[0xDE, 0xAD]);
        let desc = ca.build();
        assert_eq!(desc.tag, descriptor_tag::CA);
        // Reserved bits 0xE000 are ORed into the PID field on the wire.
        assert_eq!(&desc.payload[..], &[0x4A, 0xD0, 0xE2, 0x34, 0xDE, 0xAD]);

        let parsed = CaDescriptor::parse(&desc).unwrap();
        assert_eq!(parsed, ca);
    }
}
