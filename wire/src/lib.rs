#![forbid(unsafe_code)]

//! The wire language of the peer: every message of BOLT #1 and #2 this
//! node speaks, with its binary codec. Integers are big-endian, byte
//! strings carry a 16-bit length, TLV extensions trail in ascending tag
//! order.

mod codec;
mod feature;
pub mod message;
mod tlv;

pub use self::codec::{WireDecode, WireEncode, WireError};
pub use self::feature::{FeatureBit, RawFeatureVector};
pub use self::message::types::{
    ChannelFlags, ChannelId, ChannelKeys, CsvDelay, Hash256, HtlcId, MilliSatoshi, OnionBlob,
    RawPublicKey, RawSignature, Satoshi, SatoshiPerKiloWeight,
};
pub use self::message::*;
pub use self::tlv::{decode_bigsize, encode_bigsize, TlvRecord, TlvStream};
