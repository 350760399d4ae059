use crate::codec::{put_bytes16, take_bytes16, WireDecode, WireEncode, WireError};
use crate::message::types::{
    ChannelId, Hash256, HtlcId, MilliSatoshi, OnionBlob, RawPublicKey, RawSignature,
    SatoshiPerKiloWeight,
};

/// Offers an HTLC: `amount` is locked against `payment_hash` until `expiry`
/// (absolute block height), with the onion telling the recipient where the
/// payment goes next. Irrevocable once committed.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct UpdateAddHtlc {
    pub channel_id: ChannelId,
    pub id: HtlcId,
    pub amount: MilliSatoshi,
    pub payment: Hash256,
    pub expiry: u32,
    pub onion_blob: OnionBlob,
}

impl WireEncode for UpdateAddHtlc {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        self.id.encode(buf);
        self.amount.encode(buf);
        self.payment.encode(buf);
        self.expiry.encode(buf);
        self.onion_blob.encode(buf);
    }
}

impl WireDecode for UpdateAddHtlc {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(UpdateAddHtlc {
            channel_id: ChannelId::decode(cursor)?,
            id: HtlcId::decode(cursor)?,
            amount: MilliSatoshi::decode(cursor)?,
            payment: Hash256::decode(cursor)?,
            expiry: u32::decode(cursor)?,
            onion_blob: OnionBlob::decode(cursor)?,
        })
    }
}

/// Settles an incoming HTLC by revealing the preimage of its payment hash.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct UpdateFulfillHtlc {
    pub channel_id: ChannelId,
    pub id: HtlcId,
    pub payment_preimage: [u8; 32],
}

impl WireEncode for UpdateFulfillHtlc {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        self.id.encode(buf);
        self.payment_preimage.encode(buf);
    }
}

impl WireDecode for UpdateFulfillHtlc {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(UpdateFulfillHtlc {
            channel_id: ChannelId::decode(cursor)?,
            id: HtlcId::decode(cursor)?,
            payment_preimage: <[u8; 32]>::decode(cursor)?,
        })
    }
}

/// Removes an incoming HTLC without paying it; the reason is an encrypted
/// onion error for the origin of the payment.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct UpdateFailHtlc {
    pub channel_id: ChannelId,
    pub id: HtlcId,
    pub reason: Vec<u8>,
}

impl WireEncode for UpdateFailHtlc {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        self.id.encode(buf);
        put_bytes16(buf, &self.reason);
    }
}

impl WireDecode for UpdateFailHtlc {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(UpdateFailHtlc {
            channel_id: ChannelId::decode(cursor)?,
            id: HtlcId::decode(cursor)?,
            reason: take_bytes16(cursor)?,
        })
    }
}

// BADONION must be set in the failure code of a malformed-onion report.
pub const FAILURE_CODE_BADONION: u16 = 0x8000;

/// Reports an onion the node could not even parse; unlike `UpdateFailHtlc`
/// the reason travels in the clear because no shared secret exists.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct UpdateFailMalformedHtlc {
    pub channel_id: ChannelId,
    pub id: HtlcId,
    pub sha256_of_onion: Hash256,
    pub failure_code: u16,
}

impl WireEncode for UpdateFailMalformedHtlc {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        self.id.encode(buf);
        self.sha256_of_onion.encode(buf);
        self.failure_code.encode(buf);
    }
}

impl WireDecode for UpdateFailMalformedHtlc {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(UpdateFailMalformedHtlc {
            channel_id: ChannelId::decode(cursor)?,
            id: HtlcId::decode(cursor)?,
            sha256_of_onion: Hash256::decode(cursor)?,
            failure_code: u16::decode(cursor)?,
        })
    }
}

/// The sender's signature over the receiver's next commitment transaction
/// plus one signature per untrimmed HTLC output, in output order.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CommitmentSigned {
    pub channel_id: ChannelId,
    pub signature: RawSignature,
    pub htlc_signatures: Vec<RawSignature>,
}

impl WireEncode for CommitmentSigned {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        self.signature.encode(buf);
        (self.htlc_signatures.len() as u16).encode(buf);
        for signature in &self.htlc_signatures {
            signature.encode(buf);
        }
    }
}

impl WireDecode for CommitmentSigned {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        let channel_id = ChannelId::decode(cursor)?;
        let signature = RawSignature::decode(cursor)?;
        let count = u16::decode(cursor)?;
        let mut htlc_signatures = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            htlc_signatures.push(RawSignature::decode(cursor)?);
        }
        Ok(CommitmentSigned {
            channel_id,
            signature,
            htlc_signatures,
        })
    }
}

/// Revokes the previous commitment by revealing its secret, and hands over
/// the point for the commitment after the one just signed.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RevokeAndAck {
    pub channel_id: ChannelId,
    pub revocation_preimage: [u8; 32],
    pub next_per_commitment_point: RawPublicKey,
}

impl WireEncode for RevokeAndAck {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        self.revocation_preimage.encode(buf);
        self.next_per_commitment_point.encode(buf);
    }
}

impl WireDecode for RevokeAndAck {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(RevokeAndAck {
            channel_id: ChannelId::decode(cursor)?,
            revocation_preimage: <[u8; 32]>::decode(cursor)?,
            next_per_commitment_point: RawPublicKey::decode(cursor)?,
        })
    }
}

/// The funder's new commitment fee rate; applies to both commitment
/// transactions once committed.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct UpdateFee {
    pub channel_id: ChannelId,
    pub fee: SatoshiPerKiloWeight,
}

impl WireEncode for UpdateFee {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        self.fee.encode(buf);
    }
}

impl WireDecode for UpdateFee {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(UpdateFee {
            channel_id: ChannelId::decode(cursor)?,
            fee: SatoshiPerKiloWeight::decode(cursor)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use secp256k1::{Secp256k1, SecretKey};

    use super::*;
    use crate::message::Message;

    fn signature(fill: u8) -> RawSignature {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[fill; 32]).unwrap();
        let digest = secp256k1::Message::from_digest([fill; 32]);
        RawSignature(secp.sign_ecdsa(&digest, &sk))
    }

    #[test]
    fn update_add_htlc_round_trip() {
        let mut onion = OnionBlob::zero();
        onion.0[0] = 0x00;
        onion.0[1] = 0x42;
        let message = Message::UpdateAddHtlc(UpdateAddHtlc {
            channel_id: ChannelId([0x77; 32]),
            id: HtlcId(5),
            amount: MilliSatoshi(42_000_000),
            payment: Hash256([0x88; 32]),
            expiry: 500_123,
            onion_blob: onion,
        });
        assert_eq!(Message::from_bytes(&message.to_bytes()).unwrap(), message);
    }

    #[test]
    fn fulfill_and_fail_round_trip() {
        let fulfill = Message::UpdateFulfillHtlc(UpdateFulfillHtlc {
            channel_id: ChannelId([0x01; 32]),
            id: HtlcId(0),
            payment_preimage: [0xab; 32],
        });
        assert_eq!(Message::from_bytes(&fulfill.to_bytes()).unwrap(), fulfill);

        let fail = Message::UpdateFailHtlc(UpdateFailHtlc {
            channel_id: ChannelId([0x01; 32]),
            id: HtlcId(1),
            reason: vec![0xde, 0xad, 0xbe, 0xef],
        });
        assert_eq!(Message::from_bytes(&fail.to_bytes()).unwrap(), fail);

        let malformed = Message::UpdateFailMalformedHtlc(UpdateFailMalformedHtlc {
            channel_id: ChannelId([0x01; 32]),
            id: HtlcId(2),
            sha256_of_onion: Hash256([0x13; 32]),
            failure_code: FAILURE_CODE_BADONION | 6,
        });
        assert_eq!(Message::from_bytes(&malformed.to_bytes()).unwrap(), malformed);
    }

    #[test]
    fn commitment_signed_counts_htlc_signatures() {
        let message = Message::CommitmentSigned(CommitmentSigned {
            channel_id: ChannelId([0x02; 32]),
            signature: signature(0x11),
            htlc_signatures: vec![signature(0x12), signature(0x13)],
        });
        let bytes = message.to_bytes();
        // type + channel_id + sig + count
        assert_eq!(bytes.len(), 2 + 32 + 64 + 2 + 2 * 64);
        assert_eq!(Message::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn revoke_and_ack_round_trip() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x41; 32]).unwrap();
        let message = Message::RevokeAndAck(RevokeAndAck {
            channel_id: ChannelId([0x03; 32]),
            revocation_preimage: [0x55; 32],
            next_per_commitment_point: RawPublicKey(secp256k1::PublicKey::from_secret_key(
                &secp, &sk,
            )),
        });
        assert_eq!(Message::from_bytes(&message.to_bytes()).unwrap(), message);
    }

    #[test]
    fn update_fee_round_trip() {
        let message = Message::UpdateFee(UpdateFee {
            channel_id: ChannelId([0x04; 32]),
            fee: SatoshiPerKiloWeight(2500),
        });
        assert_eq!(Message::from_bytes(&message.to_bytes()).unwrap(), message);
    }
}
