#![forbid(unsafe_code)]

//! The per-channel state machine: routes wire messages, host commands and
//! on-chain events into the commitment ledger and emits the outbound
//! messages, watch requests and persistence checkpoints the driver must
//! perform. Pure transitions, no I/O.

mod events;
mod machine;

pub use self::events::{Action, Command, Event, WatchEvent, WatchRequest};
pub use self::machine::{
    ChannelConfig, ChannelState, ClosedData, ClosingData, ErrorInformationLeakData,
    NegotiatingData, NormalData, ShuttingDownData, WaitForAcceptChannelData,
    WaitForFundingCreatedData, WaitForFundingLockedData, WaitForFundingSignedData,
    WaitForInitData, WaitForOpenChannelData,
};
