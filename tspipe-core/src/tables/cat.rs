//! Conditional Access Table.
//!
//! The CAT is transmitted on PID 0x0001 and carries a single descriptor
//! loop, typically CA descriptors pointing at EMM PIDs.

use bytes::BytesMut;

use crate::error::TableError;
use crate::section::{table_id, Section};
use crate::tables::{BinaryTable, DescriptorList, MAX_LONG_PAYLOAD};

/// Parsed Conditional Access Table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cat {
    /// Table version (5 bits).
    pub version: u8,
    /// Current/next indicator.
    pub is_current: bool,
    /// Descriptor loop.
    pub descs: DescriptorList,
}

impl Cat {
    /// Parse a CAT from a complete binary table.
    pub fn parse(table: &BinaryTable) -> Result<Self, TableError> {
        if table.table_id() != table_id::CAT {
            return Err(TableError::UnexpectedTableId(table.table_id()));
        }
        let mut cat = Cat {
            version: table.version(),
            is_current: table.sections()[0].is_current(),
            descs: DescriptorList::new(),
        };
        for sect in table.sections() {
            for desc in DescriptorList::parse(sect.payload())?.iter() {
                cat.descs.add(desc.clone());
            }
        }
        Ok(cat)
    }

    /// Build a single-section binary table.
    pub fn build(&self) -> Result<BinaryTable, TableError> {
        let size = self.descs.size();
        if size > MAX_LONG_PAYLOAD {
            return Err(TableError::PayloadTooLarge(size));
        }
        let mut buf = BytesMut::with_capacity(size);
        self.descs.build(&mut buf);
        BinaryTable::from_section(Section::new_long(
            table_id::CAT,
            0xFFFF,
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
    use crate::tables::CaDescriptor;

    #[test]
    fn test_cat_roundtrip() {
        let mut cat = Cat {
            version: 1,
            is_current: true,
            descs: DescriptorList::new(),
        };
        cat.descs.add(CaDescriptor::new(0x0B00, 0x0300).build());
        cat.descs.add(CaDescriptor::new(0x0B01, 0x0301).build());

        let table = cat.build().unwrap();
        assert_eq!(table.table_id(), table_id::CAT);
        let parsed = Cat::parse(&table).unwrap();
        assert_eq!(parsed, cat);
    }
}
