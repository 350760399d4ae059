pub mod types;

mod setup;
pub use self::setup::*;

mod control;
pub use self::control::*;

mod channel;
pub use self::channel::*;

use crate::codec::{WireDecode, WireEncode, WireError};

macro_rules! message {
    (pub enum $name:ident { $($variant:ident($ty:ty, $rtt:expr, $unwrap_method:ident)),* $(,)? }) => {
        /// Tagged union over every message of the protocol. The 16-bit tag
        /// travels in front of the payload on the wire.
        #[derive(Clone, Eq, PartialEq, Debug)]
        pub enum $name {
            $($variant($ty),)*
        }

        impl $name {
            /// Payload limit imposed by the transport's 16-bit length,
            /// minus the type tag.
            pub const SIZE_LIMIT: usize = (u16::MAX as usize) - 2;

            /// The runtime type tag of this message.
            pub fn type_id(&self) -> u16 {
                match self {
                    $($name::$variant(_) => $rtt,)*
                }
            }

            $(
                pub fn $unwrap_method(&self) -> Option<&$ty> {
                    match self {
                        $name::$variant(payload) => Some(payload),
                        _ => None,
                    }
                }
            )*
        }

        impl WireEncode for $name {
            fn encode(&self, buf: &mut Vec<u8>) {
                match self {
                    $(
                        $name::$variant(payload) => {
                            $rtt.encode(buf);
                            payload.encode(buf);
                        },
                    )*
                }
            }
        }

        impl WireDecode for $name {
            fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
                let runtime_type = u16::decode(cursor)?;
                match runtime_type {
                    $(
                        t if t == $rtt => <$ty>::decode(cursor).map($name::$variant),
                    )*
                    t => Err(WireError::UnknownType(t)),
                }
            }
        }
    }
}

message! {
    pub enum Message {
        Init(Init, 16u16, as_init),
        Error(ErrorMessage, 17u16, as_error),
        Ping(Ping, 18u16, as_ping),
        Pong(Pong, 19u16, as_pong),
        OpenChannel(OpenChannel, 32u16, as_open_channel),
        AcceptChannel(AcceptChannel, 33u16, as_accept_channel),
        FundingCreated(FundingCreated, 34u16, as_funding_created),
        FundingSigned(FundingSigned, 35u16, as_funding_signed),
        FundingLocked(FundingLocked, 36u16, as_funding_locked),
        ShutdownChannel(ShutdownChannel, 38u16, as_shutdown_channel),
        ClosingNegotiation(ClosingSigned, 39u16, as_closing_negotiation),
        UpdateAddHtlc(UpdateAddHtlc, 128u16, as_update_add_htlc),
        UpdateFulfillHtlc(UpdateFulfillHtlc, 130u16, as_update_fulfill_htlc),
        UpdateFailHtlc(UpdateFailHtlc, 131u16, as_update_fail_htlc),
        CommitmentSigned(CommitmentSigned, 132u16, as_commitment_signed),
        RevokeAndAck(RevokeAndAck, 133u16, as_revoke_and_ack),
        UpdateFee(UpdateFee, 134u16, as_update_fee),
        UpdateFailMalformedHtlc(UpdateFailMalformedHtlc, 135u16, as_update_fail_malformed_htlc),
        ReestablishChannel(ReestablishChannel, 136u16, as_reestablish_channel),
    }
}

impl Message {
    /// The channel this message belongs to, when it names one.
    pub fn channel_id(&self) -> Option<types::ChannelId> {
        use self::Message::*;

        match self {
            Init(_) | Ping(_) | Pong(_) => None,
            Error(m) => Some(m.channel_id),
            OpenChannel(m) => Some(m.temporary_channel_id),
            AcceptChannel(m) => Some(m.temporary_channel_id),
            FundingCreated(m) => Some(m.temporary_channel_id),
            FundingSigned(m) => Some(m.channel_id),
            FundingLocked(m) => Some(m.channel_id),
            ShutdownChannel(m) => Some(m.channel_id),
            ClosingNegotiation(m) => Some(m.channel_id),
            UpdateAddHtlc(m) => Some(m.channel_id),
            UpdateFulfillHtlc(m) => Some(m.channel_id),
            UpdateFailHtlc(m) => Some(m.channel_id),
            CommitmentSigned(m) => Some(m.channel_id),
            RevokeAndAck(m) => Some(m.channel_id),
            UpdateFee(m) => Some(m.channel_id),
            UpdateFailMalformedHtlc(m) => Some(m.channel_id),
            ReestablishChannel(m) => Some(m.channel_id),
        }
    }
}
