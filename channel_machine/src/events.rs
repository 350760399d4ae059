//! The event and action vocabulary of the channel state machine. Every
//! transition is a pure function `(state, event) -> (state, actions)`;
//! the peer driver owns all I/O.

use bitcoin::{Transaction, Txid};
use channel::{ChannelError, Origin};
use wire::{
    ChannelId, Hash256, HtlcId, Message, MilliSatoshi, OnionBlob, Satoshi, SatoshiPerKiloWeight,
    UpdateAddHtlc, UpdateFailHtlc, UpdateFailMalformedHtlc, UpdateFulfillHtlc,
};

/// What the world can tell a channel.
#[derive(Clone, Debug)]
pub enum Event {
    MessageReceived(Message),
    ExecuteCommand(Command),
    WatchReceived(WatchEvent),
    NewBlock { height: u32 },
    Connected,
    Disconnected,
    /// A persisted channel loaded at startup; it stays offline until the
    /// peer connection is back.
    Restore(Box<crate::machine::ChannelState>),
}

/// Host-issued commands.
#[derive(Clone, Debug)]
pub enum Command {
    /// Open a channel as funder.
    InitFunder {
        temporary_channel_id: ChannelId,
        /// Built and reserved by the wallet; broadcast only after
        /// `funding_signed` verifies.
        funding_tx: Transaction,
        funding_output_index: u32,
        funding: Satoshi,
        push: MilliSatoshi,
        feerate: SatoshiPerKiloWeight,
        announce_channel: bool,
    },
    /// Wait for a remote `open_channel`.
    InitFundee,
    AddHtlc {
        amount: MilliSatoshi,
        payment_hash: Hash256,
        expiry: u32,
        onion: OnionBlob,
        origin: Origin,
    },
    FulfillHtlc {
        id: HtlcId,
        preimage: [u8; 32],
    },
    FailHtlc {
        id: HtlcId,
        reason: Vec<u8>,
    },
    UpdateFee {
        feerate: SatoshiPerKiloWeight,
    },
    /// Commit every pending change.
    Sign,
    Close {
        script_pubkey: Option<Vec<u8>>,
    },
}

/// On-chain notifications from the watcher collaborator.
#[derive(Clone, Debug)]
pub enum WatchEvent {
    Confirmed {
        txid: Txid,
        height: u32,
        depth: u32,
    },
    Spent {
        outpoint_txid: Txid,
        spending_txid: Txid,
    },
}

/// Subscriptions the machine asks the watcher for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchRequest {
    Confirmed { txid: Txid, min_depth: u32 },
    Spent { txid: Txid, output_index: u32 },
}

/// What a transition asks the driver to do. Ordering matters: a
/// `StoreState` always precedes the network sends whose effects it makes
/// durable.
#[derive(Clone, Debug)]
pub enum Action {
    SendMessage(Message),
    SendWatch(WatchRequest),
    /// Hand a fully signed transaction to the broadcaster: the funding tx
    /// after `funding_signed`, the witnessed commitment or closing tx
    /// when the channel goes to chain.
    PublishTx(Transaction),
    /// Persist the channel before any further network effect.
    StoreState,
    /// Self-reentry, e.g. an automatic `Sign` after acknowledgements.
    ProcessCommand(Command),
    /// The temporary channel id is replaced by the funding-derived one.
    ChannelIdSwitch { old: ChannelId, new: ChannelId },
    /// An incoming HTLC became irrevocably committed.
    ProcessAdd(UpdateAddHtlc),
    /// A settlement of one of our HTLCs, to relay upstream.
    ProcessFulfill {
        fulfill: UpdateFulfillHtlc,
        origin: Option<Origin>,
    },
    ProcessFail {
        fail: UpdateFailHtlc,
        origin: Option<Origin>,
    },
    ProcessFailMalformed {
        fail: UpdateFailMalformedHtlc,
        origin: Option<Origin>,
    },
    /// A host command was ill-timed or invalid; state is unchanged.
    CommandFailed(ChannelError),
}
