use crate::codec::{WireDecode, WireEncode, WireError};
use crate::message::types::{ChannelId, Hash256, RawPublicKey, RawSignature};

/// The funder built the funding transaction and signs the fundee's first
/// commitment; the outpoint pins the channel to the chain.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FundingCreated {
    pub temporary_channel_id: ChannelId,
    /// Funding txid in wire byte order.
    pub funding_txid: Hash256,
    pub output_index: u16,
    /// The funder's signature over the fundee's initial commitment tx.
    pub signature: RawSignature,
}

impl WireEncode for FundingCreated {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.temporary_channel_id.encode(buf);
        self.funding_txid.encode(buf);
        self.output_index.encode(buf);
        self.signature.encode(buf);
    }
}

impl WireDecode for FundingCreated {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(FundingCreated {
            temporary_channel_id: ChannelId::decode(cursor)?,
            funding_txid: Hash256::decode(cursor)?,
            output_index: u16::decode(cursor)?,
            signature: RawSignature::decode(cursor)?,
        })
    }
}

/// The fundee's signature over the funder's initial commitment tx. First
/// message to use the funding-outpoint channel id.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FundingSigned {
    pub channel_id: ChannelId,
    pub signature: RawSignature,
}

impl WireEncode for FundingSigned {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        self.signature.encode(buf);
    }
}

impl WireDecode for FundingSigned {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(FundingSigned {
            channel_id: ChannelId::decode(cursor)?,
            signature: RawSignature::decode(cursor)?,
        })
    }
}

/// Sent once the funding transaction reached the agreed depth; carries the
/// per-commitment point for the next (first) commitment.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FundingLocked {
    pub channel_id: ChannelId,
    pub next_per_commitment_point: RawPublicKey,
}

impl WireEncode for FundingLocked {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        self.next_per_commitment_point.encode(buf);
    }
}

impl WireDecode for FundingLocked {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(FundingLocked {
            channel_id: ChannelId::decode(cursor)?,
            next_per_commitment_point: RawPublicKey::decode(cursor)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use secp256k1::{PublicKey, Secp256k1, SecretKey};

    use super::*;
    use crate::message::Message;

    fn test_point(fill: u8) -> RawPublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[fill; 32]).unwrap();
        RawPublicKey(PublicKey::from_secret_key(&secp, &sk))
    }

    fn test_signature() -> RawSignature {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x55; 32]).unwrap();
        let msg = secp256k1::Message::from_digest([0x66; 32]);
        RawSignature(secp.sign_ecdsa(&msg, &sk))
    }

    #[test]
    fn funding_created_round_trip() {
        let message = Message::FundingCreated(FundingCreated {
            temporary_channel_id: ChannelId([0x0a; 32]),
            funding_txid: Hash256([0x1b; 32]),
            output_index: 3,
            signature: test_signature(),
        });
        assert_eq!(Message::from_bytes(&message.to_bytes()).unwrap(), message);
    }

    #[test]
    fn funding_signed_round_trip() {
        let message = Message::FundingSigned(FundingSigned {
            channel_id: ChannelId([0x0b; 32]),
            signature: test_signature(),
        });
        assert_eq!(Message::from_bytes(&message.to_bytes()).unwrap(), message);
    }

    #[test]
    fn funding_locked_round_trip() {
        let message = Message::FundingLocked(FundingLocked {
            channel_id: ChannelId([0x0c; 32]),
            next_per_commitment_point: test_point(9),
        });
        assert_eq!(Message::from_bytes(&message.to_bytes()).unwrap(), message);
    }
}
