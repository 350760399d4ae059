//! BigSize integers and TLV streams of BOLT #1.

use crate::codec::{take, WireError};

/// Encodes a BigSize value, the big-endian cousin of Bitcoin's CompactSize.
pub fn encode_bigsize(value: u64, buf: &mut Vec<u8>) {
    if value < 0xfd {
        buf.push(value as u8);
    } else if value < 0x1_0000 {
        buf.push(0xfd);
        buf.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value < 0x1_0000_0000 {
        buf.push(0xfe);
        buf.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

/// Decodes a BigSize value, rejecting non-minimal encodings.
pub fn decode_bigsize(cursor: &mut &[u8]) -> Result<u64, WireError> {
    let tag = take(cursor, 1)?[0];
    match tag {
        0..=0xfc => Ok(u64::from(tag)),
        0xfd => {
            let raw = take(cursor, 2)?;
            let value = u64::from(u16::from_be_bytes([raw[0], raw[1]]));
            if value < 0xfd {
                return Err(WireError::Invalid("bigsize is not minimally encoded"));
            }
            Ok(value)
        }
        0xfe => {
            let raw = take(cursor, 4)?;
            let value = u64::from(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]));
            if value < 0x1_0000 {
                return Err(WireError::Invalid("bigsize is not minimally encoded"));
            }
            Ok(value)
        }
        0xff => {
            let raw = take(cursor, 8)?;
            let mut bytes = [0; 8];
            bytes.copy_from_slice(raw);
            let value = u64::from_be_bytes(bytes);
            if value < 0x1_0000_0000 {
                return Err(WireError::Invalid("bigsize is not minimally encoded"));
            }
            Ok(value)
        }
    }
}

/// One record of a TLV stream.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TlvRecord {
    pub tag: u64,
    pub value: Vec<u8>,
}

/// The optional extension tail of a message: records in strictly ascending
/// tag order, tags never repeating.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TlvStream {
    records: Vec<TlvRecord>,
}

impl TlvStream {
    pub fn new() -> Self {
        TlvStream { records: Vec::new() }
    }

    /// Appends a record keeping the stream sorted; replaces an existing
    /// record with the same tag.
    pub fn insert(&mut self, tag: u64, value: Vec<u8>) {
        match self.records.binary_search_by_key(&tag, |r| r.tag) {
            Ok(at) => self.records[at].value = value,
            Err(at) => self.records.insert(at, TlvRecord { tag, value }),
        }
    }

    pub fn get(&self, tag: u64) -> Option<&[u8]> {
        self.records
            .binary_search_by_key(&tag, |r| r.tag)
            .ok()
            .map(|at| self.records[at].value.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        for record in &self.records {
            encode_bigsize(record.tag, buf);
            encode_bigsize(record.value.len() as u64, buf);
            buf.extend_from_slice(&record.value);
        }
    }

    /// Consumes the remainder of a message as a TLV stream. Ordering and
    /// uniqueness violations are rejected.
    pub fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        let mut stream = TlvStream::new();
        let mut previous: Option<u64> = None;
        while !cursor.is_empty() {
            let tag = decode_bigsize(cursor)?;
            if let Some(previous) = previous {
                if tag <= previous {
                    return Err(WireError::Invalid("tlv tags must strictly ascend"));
                }
            }
            previous = Some(tag);

            let len = decode_bigsize(cursor)?;
            let len = usize::try_from(len)
                .map_err(|_| WireError::Invalid("tlv record length exceeds message"))?;
            let value = take(cursor, len)?.to_vec();
            stream.records.push(TlvRecord { tag, value });
        }
        Ok(stream)
    }
}
