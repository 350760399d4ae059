use wire::{AcceptChannel, ChannelKeys, CsvDelay, MilliSatoshi, OpenChannel, Satoshi};

/// Our side's static channel parameters: the limits we announced in
/// `open_channel` or `accept_channel` plus whether we funded the channel.
#[derive(Clone, Debug)]
pub struct LocalParams {
    pub dust_limit: Satoshi,
    pub max_htlc_value_in_flight: MilliSatoshi,
    /// The reserve the other side must maintain.
    pub channel_reserve: Satoshi,
    pub htlc_minimum: MilliSatoshi,
    /// The delay we imposed on the other side's to-self outputs.
    pub to_self_delay: CsvDelay,
    pub max_accepted_htlcs: u16,
    pub is_funder: bool,
    pub keys: ChannelKeys,
}

/// The counterparty's announced parameters.
#[derive(Clone, Debug)]
pub struct RemoteParams {
    pub dust_limit: Satoshi,
    pub max_htlc_value_in_flight: MilliSatoshi,
    /// The reserve we must maintain.
    pub channel_reserve: Satoshi,
    pub htlc_minimum: MilliSatoshi,
    /// The delay imposed on our to-self outputs.
    pub to_self_delay: CsvDelay,
    pub max_accepted_htlcs: u16,
    pub keys: ChannelKeys,
}

impl RemoteParams {
    pub fn from_open_channel(msg: &OpenChannel) -> Self {
        RemoteParams {
            dust_limit: msg.dust_limit,
            max_htlc_value_in_flight: msg.max_in_flight,
            channel_reserve: msg.channel_reserve,
            htlc_minimum: msg.htlc_minimum,
            to_self_delay: msg.csv_delay,
            max_accepted_htlcs: msg.max_accepted_htlc_number,
            keys: msg.keys,
        }
    }

    pub fn from_accept_channel(msg: &AcceptChannel) -> Self {
        RemoteParams {
            dust_limit: msg.dust_limit,
            max_htlc_value_in_flight: msg.max_htlc_value_in_flight,
            channel_reserve: msg.channel_reserve,
            htlc_minimum: msg.htlc_minimum,
            to_self_delay: msg.csv_delay,
            max_accepted_htlcs: msg.max_accepted_htlc_number,
            keys: msg.keys,
        }
    }
}
