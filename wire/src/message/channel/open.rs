use crate::codec::{WireDecode, WireEncode, WireError};
use crate::message::types::{
    ChannelFlags, ChannelId, ChannelKeys, CsvDelay, Hash256, MilliSatoshi, RawPublicKey, Satoshi,
    SatoshiPerKiloWeight,
};

/// The funder's request to set up a new channel: the amounts, limits and
/// public keys from which both initial commitment transactions follow.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct OpenChannel {
    /// The blockchain the channel will live on (genesis hash in wire byte
    /// order).
    pub chain_hash: Hash256,
    /// Identifies the channel per-peer until the funding transaction
    /// exists, at which point the funding-outpoint id replaces it.
    pub temporary_channel_id: ChannelId,
    /// The capacity the funder is locking up.
    pub funding: Satoshi,
    /// Funds the funder gives away to the other side unconditionally.
    pub push: MilliSatoshi,
    /// Outputs below this value are omitted from this node's commitment
    /// and HTLC transactions.
    pub dust_limit: Satoshi,
    /// Cap on the total of in-flight HTLCs the other node may offer.
    pub max_in_flight: MilliSatoshi,
    /// The minimum balance the other node must keep as a direct payment.
    pub channel_reserve: Satoshi,
    /// The smallest HTLC this node accepts.
    pub htlc_minimum: MilliSatoshi,
    /// Initial commitment fee rate, satoshi per 1000 weight.
    pub fee: SatoshiPerKiloWeight,
    /// How long the other node's to-self outputs are CSV-delayed.
    pub csv_delay: CsvDelay,
    /// Cap on the number of outstanding HTLCs the other node may offer.
    pub max_accepted_htlc_number: u16,
    pub keys: ChannelKeys,
    pub flags: ChannelFlags,
}

impl WireEncode for OpenChannel {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.chain_hash.encode(buf);
        self.temporary_channel_id.encode(buf);
        self.funding.encode(buf);
        self.push.encode(buf);
        self.dust_limit.encode(buf);
        self.max_in_flight.encode(buf);
        self.channel_reserve.encode(buf);
        self.htlc_minimum.encode(buf);
        self.fee.encode(buf);
        self.csv_delay.encode(buf);
        self.max_accepted_htlc_number.encode(buf);
        self.keys.encode(buf);
        self.flags.encode(buf);
    }
}

impl WireDecode for OpenChannel {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(OpenChannel {
            chain_hash: Hash256::decode(cursor)?,
            temporary_channel_id: ChannelId::decode(cursor)?,
            funding: Satoshi::decode(cursor)?,
            push: MilliSatoshi::decode(cursor)?,
            dust_limit: Satoshi::decode(cursor)?,
            max_in_flight: MilliSatoshi::decode(cursor)?,
            channel_reserve: Satoshi::decode(cursor)?,
            htlc_minimum: MilliSatoshi::decode(cursor)?,
            fee: SatoshiPerKiloWeight::decode(cursor)?,
            csv_delay: CsvDelay::decode(cursor)?,
            max_accepted_htlc_number: u16::decode(cursor)?,
            keys: ChannelKeys::decode(cursor)?,
            flags: ChannelFlags::decode(cursor)?,
        })
    }
}

/// The fundee's answer to `open_channel` with its own limits and keys.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct AcceptChannel {
    pub temporary_channel_id: ChannelId,
    pub dust_limit: Satoshi,
    pub max_htlc_value_in_flight: MilliSatoshi,
    pub channel_reserve: Satoshi,
    pub htlc_minimum: MilliSatoshi,
    /// Confirmations the fundee wants before `funding_locked`.
    pub minimum_accept_depth: u32,
    pub csv_delay: CsvDelay,
    pub max_accepted_htlc_number: u16,
    pub keys: ChannelKeys,
}

impl AcceptChannel {
    /// The mirror-the-funder acceptance: same limits, our keys.
    pub fn accept(open_channel: &OpenChannel, keys: &ChannelKeys) -> Self {
        AcceptChannel {
            temporary_channel_id: open_channel.temporary_channel_id,
            dust_limit: open_channel.dust_limit,
            max_htlc_value_in_flight: open_channel.max_in_flight,
            channel_reserve: open_channel.channel_reserve,
            htlc_minimum: open_channel.htlc_minimum,
            minimum_accept_depth: 1,
            csv_delay: open_channel.csv_delay,
            max_accepted_htlc_number: open_channel.max_accepted_htlc_number,
            keys: *keys,
        }
    }
}

impl WireEncode for AcceptChannel {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.temporary_channel_id.encode(buf);
        self.dust_limit.encode(buf);
        self.max_htlc_value_in_flight.encode(buf);
        self.channel_reserve.encode(buf);
        self.htlc_minimum.encode(buf);
        self.minimum_accept_depth.encode(buf);
        self.csv_delay.encode(buf);
        self.max_accepted_htlc_number.encode(buf);
        self.keys.encode(buf);
    }
}

impl WireDecode for AcceptChannel {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(AcceptChannel {
            temporary_channel_id: ChannelId::decode(cursor)?,
            dust_limit: Satoshi::decode(cursor)?,
            max_htlc_value_in_flight: MilliSatoshi::decode(cursor)?,
            channel_reserve: Satoshi::decode(cursor)?,
            htlc_minimum: MilliSatoshi::decode(cursor)?,
            minimum_accept_depth: u32::decode(cursor)?,
            csv_delay: CsvDelay::decode(cursor)?,
            max_accepted_htlc_number: u16::decode(cursor)?,
            keys: ChannelKeys::decode(cursor)?,
        })
    }
}

/// Exchanged on reconnection so both sides agree where the commitment
/// protocol stopped; the two trailing fields implement option_data_loss_protect.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ReestablishChannel {
    pub channel_id: ChannelId,
    /// The commitment number the sender expects to sign next.
    pub next_local_commitment_number: u64,
    /// The commitment number whose revocation the sender expects next.
    pub next_remote_revocation_number: u64,
    /// The last per-commitment secret the sender received, proof it is not
    /// running behind.
    pub last_remote_commit_secret: [u8; 32],
    /// The sender's current unrevoked per-commitment point.
    pub local_unrevoked_commit_point: RawPublicKey,
}

impl WireEncode for ReestablishChannel {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        self.next_local_commitment_number.encode(buf);
        self.next_remote_revocation_number.encode(buf);
        self.last_remote_commit_secret.encode(buf);
        self.local_unrevoked_commit_point.encode(buf);
    }
}

impl WireDecode for ReestablishChannel {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(ReestablishChannel {
            channel_id: ChannelId::decode(cursor)?,
            next_local_commitment_number: u64::decode(cursor)?,
            next_remote_revocation_number: u64::decode(cursor)?,
            last_remote_commit_secret: <[u8; 32]>::decode(cursor)?,
            local_unrevoked_commit_point: RawPublicKey::decode(cursor)?,
        })
    }
}
