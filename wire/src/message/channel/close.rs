use crate::codec::{put_bytes16, take_bytes16, WireDecode, WireEncode, WireError};
use crate::message::types::{ChannelId, RawSignature, Satoshi};

/// Starts the cooperative close: no new HTLCs may be offered once either
/// side has sent or received this, and the channel drains towards
/// `closing_signed`.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ShutdownChannel {
    pub channel_id: ChannelId,
    /// The script the sender wants its funds paid to.
    pub script_pubkey: Vec<u8>,
}

impl WireEncode for ShutdownChannel {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        put_bytes16(buf, &self.script_pubkey);
    }
}

impl WireDecode for ShutdownChannel {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(ShutdownChannel {
            channel_id: ChannelId::decode(cursor)?,
            script_pubkey: take_bytes16(cursor)?,
        })
    }
}

/// A fee proposal for the closing transaction together with the signature
/// valid under that fee; the exchange repeats until both sides sign the
/// same fee.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ClosingSigned {
    pub channel_id: ChannelId,
    pub fee: Satoshi,
    pub signature: RawSignature,
}

impl WireEncode for ClosingSigned {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        self.fee.encode(buf);
        self.signature.encode(buf);
    }
}

impl WireDecode for ClosingSigned {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(ClosingSigned {
            channel_id: ChannelId::decode(cursor)?,
            fee: Satoshi::decode(cursor)?,
            signature: RawSignature::decode(cursor)?,
        })
    }
}
