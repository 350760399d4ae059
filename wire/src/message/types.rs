use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use crate::codec::{take, WireDecode, WireEncode, WireError};

/// An amount in whole satoshi, the on-chain unit.
#[derive(Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, Hash)]
pub struct Satoshi(pub u64);

/// An amount in thousandths of a satoshi, the unit of channel balances and
/// HTLCs.
#[derive(Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, Hash)]
pub struct MilliSatoshi(pub u64);

/// A commitment-transaction fee rate, satoshi per 1000 weight units.
#[derive(Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, Hash)]
pub struct SatoshiPerKiloWeight(pub u32);

/// An `OP_CHECKSEQUENCEVERIFY` delay in blocks.
#[derive(Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, Hash)]
pub struct CsvDelay(pub u16);

impl Satoshi {
    pub fn to_msat(self) -> MilliSatoshi {
        MilliSatoshi(self.0 * 1000)
    }
}

impl MilliSatoshi {
    /// Truncates towards zero, the direction on-chain outputs round.
    pub fn to_satoshi(self) -> Satoshi {
        Satoshi(self.0 / 1000)
    }

    pub fn checked_sub(self, rhs: MilliSatoshi) -> Option<MilliSatoshi> {
        self.0.checked_sub(rhs.0).map(MilliSatoshi)
    }

    pub fn saturating_sub(self, rhs: MilliSatoshi) -> MilliSatoshi {
        MilliSatoshi(self.0.saturating_sub(rhs.0))
    }
}

impl Add for MilliSatoshi {
    type Output = MilliSatoshi;

    fn add(self, rhs: MilliSatoshi) -> MilliSatoshi {
        MilliSatoshi(self.0 + rhs.0)
    }
}

impl AddAssign for MilliSatoshi {
    fn add_assign(&mut self, rhs: MilliSatoshi) {
        self.0 += rhs.0;
    }
}

impl Sub for MilliSatoshi {
    type Output = MilliSatoshi;

    fn sub(self, rhs: MilliSatoshi) -> MilliSatoshi {
        MilliSatoshi(self.0 - rhs.0)
    }
}

impl SubAssign for MilliSatoshi {
    fn sub_assign(&mut self, rhs: MilliSatoshi) {
        self.0 -= rhs.0;
    }
}

impl Sum for MilliSatoshi {
    fn sum<I: Iterator<Item = MilliSatoshi>>(iter: I) -> MilliSatoshi {
        MilliSatoshi(iter.map(|m| m.0).sum())
    }
}

impl From<Satoshi> for MilliSatoshi {
    fn from(v: Satoshi) -> Self {
        v.to_msat()
    }
}

impl From<MilliSatoshi> for Satoshi {
    fn from(v: MilliSatoshi) -> Self {
        v.to_satoshi()
    }
}

macro_rules! impl_codec_for_unit {
    ($($name:ident => $raw:ty),*) => {
        $(
            impl From<$raw> for $name {
                fn from(raw: $raw) -> Self {
                    $name(raw)
                }
            }

            impl From<$name> for $raw {
                fn from(v: $name) -> $raw {
                    v.0
                }
            }

            impl WireEncode for $name {
                fn encode(&self, buf: &mut Vec<u8>) {
                    self.0.encode(buf);
                }
            }

            impl WireDecode for $name {
                fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
                    <$raw>::decode(cursor).map($name)
                }
            }
        )*
    }
}

impl_codec_for_unit! {
    Satoshi => u64,
    MilliSatoshi => u64,
    SatoshiPerKiloWeight => u32,
    CsvDelay => u16
}

/// The 32-byte channel identifier: the temporary one chosen by the funder,
/// later the funding outpoint form.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    pub const ALL: ChannelId = ChannelId([0; 32]);

    /// Derives the permanent id from the funding transaction: the txid (in
    /// wire byte order) with the 16-bit output index folded into the low
    /// two bytes.
    pub fn from_funding_outpoint(txid: [u8; 32], output_index: u16) -> Self {
        let mut id = txid;
        id[30] ^= (output_index >> 8) as u8;
        id[31] ^= (output_index & 0xff) as u8;
        ChannelId(id)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let raw = hex::decode(s)?;
        let mut id = [0; 32];
        if raw.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        id.copy_from_slice(&raw);
        Ok(ChannelId(id))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ChannelId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl WireEncode for ChannelId {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl WireDecode for ChannelId {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        <[u8; 32]>::decode(cursor).map(ChannelId)
    }
}

/// A plain 32-byte hash: chain hashes, payment hashes, funding txids on the
/// wire.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The Bitcoin mainnet genesis hash in wire byte order, the
    /// `chain_hash` of BOLT #2 messages.
    pub const BITCOIN_CHAIN_HASH: Hash256 = Hash256([
        0x6f, 0xe2, 0x8c, 0x0a, 0xb6, 0xf1, 0xb3, 0x72, 0xc1, 0xa6, 0xa2, 0x46, 0xae, 0x63, 0xf7,
        0x4f, 0x93, 0x1e, 0x83, 0x65, 0xe1, 0x5a, 0x08, 0x9c, 0x68, 0xd6, 0x19, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ]);

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let raw = hex::decode(s)?;
        let mut hash = [0; 32];
        if raw.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        hash.copy_from_slice(&raw);
        Ok(Hash256(hash))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hash256({})", hex::encode(self.0))
    }
}

impl WireEncode for Hash256 {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl WireDecode for Hash256 {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        <[u8; 32]>::decode(cursor).map(Hash256)
    }
}

/// Per-side HTLC counter; monotonically assigned starting at zero.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct HtlcId(pub u64);

impl HtlcId {
    pub fn next(self) -> HtlcId {
        HtlcId(self.0 + 1)
    }
}

impl fmt::Display for HtlcId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl WireEncode for HtlcId {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl WireDecode for HtlcId {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        u64::decode(cursor).map(HtlcId)
    }
}

/// A compressed secp256k1 public key as it travels on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct RawPublicKey(pub PublicKey);

impl RawPublicKey {
    pub fn from_hex(s: &str) -> Result<Self, secp256k1::Error> {
        let raw = hex::decode(s).map_err(|_| secp256k1::Error::InvalidPublicKey)?;
        PublicKey::from_slice(&raw).map(RawPublicKey)
    }

    pub fn serialize(&self) -> [u8; 33] {
        self.0.serialize()
    }
}

impl From<PublicKey> for RawPublicKey {
    fn from(pk: PublicKey) -> Self {
        RawPublicKey(pk)
    }
}

impl WireEncode for RawPublicKey {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0.serialize());
    }
}

impl WireDecode for RawPublicKey {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        let raw = take(cursor, 33)?;
        PublicKey::from_slice(raw)
            .map(RawPublicKey)
            .map_err(|_| WireError::Invalid("not a point on the curve"))
    }
}

/// An ECDSA signature in the 64-byte compact wire form.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RawSignature(pub Signature);

impl RawSignature {
    pub fn serialize(&self) -> [u8; 64] {
        self.0.serialize_compact()
    }
}

impl From<Signature> for RawSignature {
    fn from(sig: Signature) -> Self {
        RawSignature(sig)
    }
}

impl WireEncode for RawSignature {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0.serialize_compact());
    }
}

impl WireDecode for RawSignature {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        let raw = take(cursor, 64)?;
        Signature::from_compact(raw)
            .map(RawSignature)
            .map_err(|_| WireError::Invalid("not a compact ecdsa signature"))
    }
}

/// The funding key and five basepoints a side commits to when opening a
/// channel, in the order they appear inside `open_channel` and
/// `accept_channel`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ChannelKeys {
    pub funding: RawPublicKey,
    pub revocation: RawPublicKey,
    pub payment: RawPublicKey,
    pub delayed_payment: RawPublicKey,
    pub htlc: RawPublicKey,
    pub first_per_commitment: RawPublicKey,
}

impl WireEncode for ChannelKeys {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.funding.encode(buf);
        self.revocation.encode(buf);
        self.payment.encode(buf);
        self.delayed_payment.encode(buf);
        self.htlc.encode(buf);
        self.first_per_commitment.encode(buf);
    }
}

impl WireDecode for ChannelKeys {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(ChannelKeys {
            funding: RawPublicKey::decode(cursor)?,
            revocation: RawPublicKey::decode(cursor)?,
            payment: RawPublicKey::decode(cursor)?,
            delayed_payment: RawPublicKey::decode(cursor)?,
            htlc: RawPublicKey::decode(cursor)?,
            first_per_commitment: RawPublicKey::decode(cursor)?,
        })
    }
}

/// The `channel_flags` byte of `open_channel`.
#[derive(Default, Copy, Clone, Eq, PartialEq, Debug)]
pub struct ChannelFlags(pub u8);

impl ChannelFlags {
    pub const ANNOUNCE_CHANNEL: ChannelFlags = ChannelFlags(1);

    pub fn announce_channel(&self) -> bool {
        self.0 & 1 != 0
    }
}

impl WireEncode for ChannelFlags {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl WireDecode for ChannelFlags {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        u8::decode(cursor).map(ChannelFlags)
    }
}

/// The fixed-size onion routing packet carried in `update_add_htlc`:
/// version byte, 33-byte ephemeral key, 1300 bytes of hop payload, 32-byte
/// HMAC.
#[derive(Clone)]
pub struct OnionBlob(pub Box<[u8; OnionBlob::SIZE]>);

impl OnionBlob {
    pub const SIZE: usize = 1 + 33 + 1300 + 32;

    pub fn zero() -> Self {
        OnionBlob(Box::new([0; Self::SIZE]))
    }
}

impl Default for OnionBlob {
    fn default() -> Self {
        Self::zero()
    }
}

impl PartialEq for OnionBlob {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for OnionBlob {}

impl fmt::Debug for OnionBlob {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OnionBlob({}..)", hex::encode(&self.0[..8]))
    }
}

impl WireEncode for OnionBlob {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0[..]);
    }
}

impl WireDecode for OnionBlob {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        let raw = take(cursor, Self::SIZE)?;
        let mut blob = Box::new([0; Self::SIZE]);
        blob.copy_from_slice(raw);
        Ok(OnionBlob(blob))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_folds_output_index() {
        let txid = [0x11; 32];
        let id = ChannelId::from_funding_outpoint(txid, 0x0203);
        assert_eq!(id.0[29], 0x11);
        assert_eq!(id.0[30], 0x11 ^ 0x02);
        assert_eq!(id.0[31], 0x11 ^ 0x03);
    }

    #[test]
    fn msat_sat_scaling_truncates() {
        assert_eq!(Satoshi(7).to_msat(), MilliSatoshi(7000));
        assert_eq!(MilliSatoshi(7999).to_satoshi(), Satoshi(7));
    }

    #[test]
    fn public_key_codec_rejects_garbage() {
        let mut cursor = &[0u8; 33][..];
        assert!(RawPublicKey::decode(&mut cursor).is_err());
    }
}
