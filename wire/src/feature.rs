//! Feature bit negotiation of BOLT #9, reduced to the bits this peer
//! understands.

use std::collections::BTreeSet;
use std::fmt;

use crate::codec::{put_bytes16, take_bytes16, WireDecode, WireEncode, WireError};

/// The feature bits the peer knows how to negotiate. Even bit means
/// required, odd means optional.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[repr(u16)]
pub enum FeatureBit {
    DataLossProtectRequired = 0,
    DataLossProtectOptional = 1,
    InitialRoutingSync = 3,
    GossipQueriesRequired = 6,
    GossipQueriesOptional = 7,
}

impl FeatureBit {
    fn from_position(position: u16) -> Option<Self> {
        use self::FeatureBit::*;

        match position {
            0 => Some(DataLossProtectRequired),
            1 => Some(DataLossProtectOptional),
            3 => Some(InitialRoutingSync),
            6 => Some(GossipQueriesRequired),
            7 => Some(GossipQueriesOptional),
            _ => None,
        }
    }
}

/// A feature bitfield as it appears in `init`: big-endian, minimally sized.
/// Bits the catalogue does not name are preserved verbatim so an echoed
/// vector round-trips.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct RawFeatureVector {
    positions: BTreeSet<u16>,
}

impl RawFeatureVector {
    pub fn new() -> Self {
        RawFeatureVector {
            positions: BTreeSet::new(),
        }
    }

    pub fn set_bit(mut self, bit: FeatureBit) -> Self {
        self.positions.insert(bit as u16);
        self
    }

    pub fn is_set(&self, bit: FeatureBit) -> bool {
        self.positions.contains(&(bit as u16))
    }

    /// Positions set which the catalogue does not name and which sit at an
    /// even (required) position; a peer advertising one of these cannot be
    /// talked to.
    pub fn unknown_required_bits(&self) -> Vec<u16> {
        self.positions
            .iter()
            .copied()
            .filter(|p| p % 2 == 0 && FeatureBit::from_position(*p).is_none())
            .collect()
    }
}

impl fmt::Debug for RawFeatureVector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RawFeatureVector{:?}", self.positions)
    }
}

impl WireEncode for RawFeatureVector {
    fn encode(&self, buf: &mut Vec<u8>) {
        let len = match self.positions.iter().next_back() {
            None => 0,
            Some(highest) => usize::from(highest / 8) + 1,
        };
        let mut field = vec![0u8; len];
        for position in &self.positions {
            let byte = len - 1 - usize::from(position / 8);
            field[byte] |= 1 << (position % 8);
        }
        put_bytes16(buf, &field);
    }
}

impl WireDecode for RawFeatureVector {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        let field = take_bytes16(cursor)?;
        let mut positions = BTreeSet::new();
        let len = field.len();
        for (byte_index, byte) in field.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    let position = (len - 1 - byte_index) * 8 + bit;
                    positions.insert(position as u16);
                }
            }
        }
        Ok(RawFeatureVector { positions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{WireDecode, WireEncode};

    #[test]
    fn empty_vector_is_zero_length() {
        let mut buf = Vec::new();
        RawFeatureVector::new().encode(&mut buf);
        assert_eq!(buf, vec![0, 0]);
    }

    #[test]
    fn bits_land_in_the_low_bytes() {
        let v = RawFeatureVector::new()
            .set_bit(FeatureBit::DataLossProtectOptional)
            .set_bit(FeatureBit::GossipQueriesOptional);
        let mut buf = Vec::new();
        v.encode(&mut buf);
        // bits 1 and 7 in a single byte
        assert_eq!(buf, vec![0, 1, 0b1000_0010]);

        let mut cursor = &buf[..];
        let restored = RawFeatureVector::decode(&mut cursor).unwrap();
        assert_eq!(restored, v);
    }

    #[test]
    fn unknown_required_bit_is_reported() {
        // bit 12 set: 0b0001_0000 in the second byte from the right
        let raw = vec![0x00, 0x02, 0b0001_0000, 0x00];
        let mut cursor = &raw[..];
        let v = RawFeatureVector::decode(&mut cursor).unwrap();
        assert_eq!(v.unknown_required_bits(), vec![12]);
    }
}
