//! The channel lifecycle: one variant per phase, each carrying exactly
//! the data its transitions need, and one `process` function routing
//! events into the commitment ledger.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use secp256k1::{Message as Digest, PublicKey, Secp256k1};

use channel::commit::weight_to_fee;
use channel::tools::{new_2x2_multisig, spending_witness_2x2_multisig};
use channel::{
    ChannelError, CmdAddHtlc, CommitInput, Commitments, Forward, KeyManager, LocalParams,
    RemoteNextCommitInfo, RemoteParams,
};
use shachain::Index as ChainIndex;
use wire::{
    AcceptChannel, ChannelFlags, ChannelId, ChannelKeys, ClosingSigned, CsvDelay, ErrorMessage,
    FundingCreated, FundingLocked, FundingSigned, Hash256, Message, MilliSatoshi, OpenChannel,
    RawPublicKey, RawSignature, ReestablishChannel, RevokeAndAck, Satoshi, SatoshiPerKiloWeight,
    ShutdownChannel,
};

use crate::events::{Action, Command, Event, WatchEvent, WatchRequest};

// Weight of a two-output cooperative closing transaction, for the first
// fee proposal.
const CLOSING_TX_WEIGHT: u64 = 672;

/// The node-level template for channels this peer opens or accepts.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub chain_hash: Hash256,
    pub dust_limit: Satoshi,
    pub max_htlc_value_in_flight: MilliSatoshi,
    pub channel_reserve: Satoshi,
    pub htlc_minimum: MilliSatoshi,
    pub to_self_delay: CsvDelay,
    pub max_accepted_htlcs: u16,
    pub minimum_depth: u32,
    /// Where a cooperative close pays us by default.
    pub shutdown_script: Vec<u8>,
}

impl ChannelConfig {
    fn local_params(&self, keys: ChannelKeys, is_funder: bool) -> LocalParams {
        LocalParams {
            dust_limit: self.dust_limit,
            max_htlc_value_in_flight: self.max_htlc_value_in_flight,
            channel_reserve: self.channel_reserve,
            htlc_minimum: self.htlc_minimum,
            to_self_delay: self.to_self_delay,
            max_accepted_htlcs: self.max_accepted_htlcs,
            is_funder,
            keys,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WaitForInitData {
    pub config: ChannelConfig,
}

#[derive(Clone, Debug)]
pub struct WaitForOpenChannelData {
    pub config: ChannelConfig,
}

#[derive(Clone, Debug)]
pub struct WaitForAcceptChannelData {
    pub config: ChannelConfig,
    pub open: OpenChannel,
    pub funding_tx: Transaction,
    pub funding_output_index: u32,
}

#[derive(Clone, Debug)]
pub struct WaitForFundingCreatedData {
    pub config: ChannelConfig,
    pub open: OpenChannel,
    pub accept: AcceptChannel,
}

#[derive(Clone, Debug)]
pub struct WaitForFundingSignedData {
    pub config: ChannelConfig,
    pub commitments: Commitments,
    /// Held back until the counterparty's signature verifies.
    pub funding_tx: Transaction,
}

#[derive(Clone, Debug)]
pub struct WaitForFundingLockedData {
    pub commitments: Commitments,
    pub minimum_depth: u32,
    pub shutdown_script: Vec<u8>,
    pub our_locked_sent: bool,
    pub their_next_point: Option<PublicKey>,
}

#[derive(Clone, Debug)]
pub struct NormalData {
    pub commitments: Commitments,
    pub shutdown_script: Vec<u8>,
    pub current_height: u32,
}

#[derive(Clone, Debug)]
pub struct ShuttingDownData {
    pub commitments: Commitments,
    pub local_script: Vec<u8>,
    pub remote_script: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct NegotiatingData {
    pub commitments: Commitments,
    pub local_script: Vec<u8>,
    pub remote_script: Vec<u8>,
    pub local_fee: Option<Satoshi>,
}

#[derive(Clone, Debug)]
pub struct ClosingData {
    pub channel_id: ChannelId,
}

#[derive(Clone, Debug)]
pub struct ClosedData {
    pub channel_id: ChannelId,
}

#[derive(Clone, Debug)]
pub struct ErrorInformationLeakData {
    pub channel_id: ChannelId,
}

/// One variant per lifecycle phase. There is no common base: a state owns
/// exactly the fields its transitions may touch.
#[derive(Clone, Debug)]
pub enum ChannelState {
    WaitForInit(WaitForInitData),
    WaitForOpenChannel(WaitForOpenChannelData),
    WaitForAcceptChannel(WaitForAcceptChannelData),
    WaitForFundingCreated(WaitForFundingCreatedData),
    WaitForFundingSigned(WaitForFundingSignedData),
    WaitForFundingLocked(WaitForFundingLockedData),
    Normal(NormalData),
    ShuttingDown(ShuttingDownData),
    Negotiating(NegotiatingData),
    Closing(ClosingData),
    Closed(ClosedData),
    ErrorInformationLeak(ErrorInformationLeakData),
    /// The connection dropped; the ledger survives untouched.
    Offline(Box<ChannelState>),
    /// Reconnected, `channel_reestablish` sent, waiting for the peer's.
    Syncing(Box<ChannelState>),
}

impl ChannelState {
    pub fn new(config: ChannelConfig) -> Self {
        ChannelState::WaitForInit(WaitForInitData { config })
    }

    /// The commitment ledger, in every phase that has one.
    pub fn commitments(&self) -> Option<&Commitments> {
        match self {
            ChannelState::WaitForFundingSigned(d) => Some(&d.commitments),
            ChannelState::WaitForFundingLocked(d) => Some(&d.commitments),
            ChannelState::Normal(d) => Some(&d.commitments),
            ChannelState::ShuttingDown(d) => Some(&d.commitments),
            ChannelState::Negotiating(d) => Some(&d.commitments),
            ChannelState::Offline(inner) | ChannelState::Syncing(inner) => inner.commitments(),
            _ => None,
        }
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            ChannelState::Closing(d) => Some(d.channel_id),
            ChannelState::Closed(d) => Some(d.channel_id),
            ChannelState::ErrorInformationLeak(d) => Some(d.channel_id),
            other => other.commitments().map(|c| c.channel_id),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed(_))
    }

    /// The lifecycle phase, for logs and channel-map snapshots.
    pub fn phase(&self) -> &'static str {
        state_name(self)
    }

    /// Drives one event through the machine. Never panics on peer input;
    /// unexpected combinations are logged and ignored.
    pub fn process<K: KeyManager>(self, event: Event, key_manager: &K) -> (Self, Vec<Action>) {
        use ChannelState::*;

        match (self, event) {
            // Connection management applies to every phase.
            (state @ (Closing(_) | Closed(_) | ErrorInformationLeak(_)), Event::Disconnected) => {
                (state, Vec::new())
            }
            (Offline(inner), Event::Disconnected) => (Offline(inner), Vec::new()),
            (state, Event::Disconnected) => (Offline(Box::new(state)), Vec::new()),

            (Offline(inner), Event::Connected) => reconnect(*inner, key_manager),
            (Syncing(inner), Event::MessageReceived(Message::ReestablishChannel(msg))) => {
                resync(*inner, msg, key_manager)
            }
            (WaitForInit(_), Event::Restore(state)) => match *state {
                // A state persisted mid-disconnect is already wrapped.
                Offline(inner) => (Offline(inner), Vec::new()),
                other => (Offline(Box::new(other)), Vec::new()),
            },

            (WaitForInit(data), Event::ExecuteCommand(cmd)) => data.on_command(cmd, key_manager),
            (WaitForOpenChannel(data), Event::MessageReceived(Message::OpenChannel(msg))) => {
                data.on_open_channel(msg, key_manager)
            }
            (WaitForAcceptChannel(data), Event::MessageReceived(Message::AcceptChannel(msg))) => {
                data.on_accept_channel(msg, key_manager)
            }
            (WaitForFundingCreated(data), Event::MessageReceived(Message::FundingCreated(msg))) => {
                data.on_funding_created(msg, key_manager)
            }
            (WaitForFundingSigned(data), Event::MessageReceived(Message::FundingSigned(msg))) => {
                data.on_funding_signed(msg)
            }
            (WaitForFundingLocked(data), event) => data.on_event(event, key_manager),
            (Normal(data), Event::MessageReceived(msg)) => data.on_message(msg, key_manager),
            (Normal(data), Event::ExecuteCommand(cmd)) => data.on_command(cmd, key_manager),
            (Normal(data), Event::WatchReceived(we)) => data.on_watch(we),
            (Normal(data), Event::NewBlock { height }) => data.on_new_block(height, key_manager),
            (ShuttingDown(data), Event::MessageReceived(msg)) => data.on_message(msg, key_manager),
            (ShuttingDown(data), Event::ExecuteCommand(cmd)) => data.on_command(cmd, key_manager),
            (ShuttingDown(data), Event::WatchReceived(we)) => data.on_watch(we),
            (Negotiating(data), Event::MessageReceived(msg)) => data.on_message(msg, key_manager),
            (Negotiating(data), Event::WatchReceived(we)) => data.on_watch(we),
            (Closing(data), Event::WatchReceived(we)) => data.on_watch(we),

            (state, event) => {
                log::warn!(
                    "channel {:?}: ignoring {:?} in state {}",
                    state.channel_id(),
                    event_name(&event),
                    state_name(&state),
                );
                (state, Vec::new())
            }
        }
    }
}

fn state_name(state: &ChannelState) -> &'static str {
    use ChannelState::*;

    match state {
        WaitForInit(_) => "wait_for_init",
        WaitForOpenChannel(_) => "wait_for_open_channel",
        WaitForAcceptChannel(_) => "wait_for_accept_channel",
        WaitForFundingCreated(_) => "wait_for_funding_created",
        WaitForFundingSigned(_) => "wait_for_funding_signed",
        WaitForFundingLocked(_) => "wait_for_funding_locked",
        Normal(_) => "normal",
        ShuttingDown(_) => "shutting_down",
        Negotiating(_) => "negotiating",
        Closing(_) => "closing",
        Closed(_) => "closed",
        ErrorInformationLeak(_) => "error_information_leak",
        Offline(_) => "offline",
        Syncing(_) => "syncing",
    }
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::MessageReceived(_) => "message",
        Event::ExecuteCommand(_) => "command",
        Event::WatchReceived(_) => "watch",
        Event::NewBlock { .. } => "new_block",
        Event::Connected => "connected",
        Event::Disconnected => "disconnected",
        Event::Restore(_) => "restore",
    }
}

// A protocol violation with funds at stake: tell the peer, go to chain.
fn fail_channel(
    channel_id: ChannelId,
    publish: Option<Transaction>,
    reason: &str,
) -> (ChannelState, Vec<Action>) {
    let mut actions = vec![
        Action::StoreState,
        Action::SendMessage(Message::Error(ErrorMessage::new(channel_id, reason))),
    ];
    if let Some(tx) = publish {
        actions.push(Action::PublishTx(tx));
    }
    (ChannelState::Closing(ClosingData { channel_id }), actions)
}

// Assembles the latest fully signed local commitment before failing the
// channel; the counterparty's signature for it was retained when the
// commitment was received.
fn force_close_channel<K: KeyManager>(
    commitments: &Commitments,
    key_manager: &K,
    reason: &str,
) -> (ChannelState, Vec<Action>) {
    let publish = match commitments.signed_local_commit_tx(key_manager) {
        Ok(tx) => Some(tx),
        Err(e) => {
            log::error!(
                "channel {}: cannot assemble the local commitment: {}",
                commitments.channel_id,
                e,
            );
            None
        }
    };
    fail_channel(commitments.channel_id, publish, reason)
}

// A desync where publishing our commitment could hand the peer our funds.
fn information_leak(channel_id: ChannelId, reason: &str) -> (ChannelState, Vec<Action>) {
    (
        ChannelState::ErrorInformationLeak(ErrorInformationLeakData { channel_id }),
        vec![
            Action::StoreState,
            Action::SendMessage(Message::Error(ErrorMessage::new(channel_id, reason))),
        ],
    )
}

impl WaitForInitData {
    fn on_command<K: KeyManager>(self, cmd: Command, key_manager: &K) -> (ChannelState, Vec<Action>) {
        match cmd {
            Command::InitFunder {
                temporary_channel_id,
                funding_tx,
                funding_output_index,
                funding,
                push,
                feerate,
                announce_channel,
            } => {
                let open = OpenChannel {
                    chain_hash: self.config.chain_hash,
                    temporary_channel_id,
                    funding,
                    push,
                    dust_limit: self.config.dust_limit,
                    max_in_flight: self.config.max_htlc_value_in_flight,
                    channel_reserve: self.config.channel_reserve,
                    htlc_minimum: self.config.htlc_minimum,
                    fee: feerate,
                    csv_delay: self.config.to_self_delay,
                    max_accepted_htlc_number: self.config.max_accepted_htlcs,
                    keys: key_manager.channel_keys(),
                    flags: if announce_channel {
                        ChannelFlags::ANNOUNCE_CHANNEL
                    } else {
                        ChannelFlags(0)
                    },
                };
                let actions = vec![Action::SendMessage(Message::OpenChannel(open.clone()))];
                (
                    ChannelState::WaitForAcceptChannel(WaitForAcceptChannelData {
                        config: self.config,
                        open,
                        funding_tx,
                        funding_output_index,
                    }),
                    actions,
                )
            }
            Command::InitFundee => (
                ChannelState::WaitForOpenChannel(WaitForOpenChannelData {
                    config: self.config,
                }),
                Vec::new(),
            ),
            other => {
                log::warn!("wait_for_init: rejecting premature command {:?}", other);
                (
                    ChannelState::WaitForInit(self),
                    vec![Action::CommandFailed(ChannelError::ChannelUnavailable(
                        "the channel is not open yet",
                    ))],
                )
            }
        }
    }
}

impl WaitForOpenChannelData {
    fn on_open_channel<K: KeyManager>(
        self,
        msg: OpenChannel,
        key_manager: &K,
    ) -> (ChannelState, Vec<Action>) {
        if msg.chain_hash != self.config.chain_hash {
            let error = ErrorMessage::new(msg.temporary_channel_id, "unknown chain");
            return (
                ChannelState::Closed(ClosedData {
                    channel_id: msg.temporary_channel_id,
                }),
                vec![Action::SendMessage(Message::Error(error))],
            );
        }
        if msg.push > msg.funding.to_msat() {
            let error = ErrorMessage::new(msg.temporary_channel_id, "push exceeds funding");
            return (
                ChannelState::Closed(ClosedData {
                    channel_id: msg.temporary_channel_id,
                }),
                vec![Action::SendMessage(Message::Error(error))],
            );
        }

        let accept = AcceptChannel {
            temporary_channel_id: msg.temporary_channel_id,
            dust_limit: self.config.dust_limit,
            max_htlc_value_in_flight: self.config.max_htlc_value_in_flight,
            channel_reserve: self.config.channel_reserve,
            htlc_minimum: self.config.htlc_minimum,
            minimum_accept_depth: self.config.minimum_depth,
            csv_delay: self.config.to_self_delay,
            max_accepted_htlc_number: self.config.max_accepted_htlcs,
            keys: key_manager.channel_keys(),
        };
        let actions = vec![Action::SendMessage(Message::AcceptChannel(accept.clone()))];
        (
            ChannelState::WaitForFundingCreated(WaitForFundingCreatedData {
                config: self.config,
                open: msg,
                accept,
            }),
            actions,
        )
    }
}

impl WaitForAcceptChannelData {
    fn on_accept_channel<K: KeyManager>(
        self,
        msg: AcceptChannel,
        key_manager: &K,
    ) -> (ChannelState, Vec<Action>) {
        if msg.temporary_channel_id != self.open.temporary_channel_id {
            log::warn!("accept_channel for a different temporary id, ignoring");
            return (ChannelState::WaitForAcceptChannel(self), Vec::new());
        }

        let local_params = self
            .config
            .local_params(key_manager.channel_keys(), true);
        let remote_params = RemoteParams::from_accept_channel(&msg);

        let funding_txid = self.funding_tx.compute_txid();
        let channel_id = ChannelId::from_funding_outpoint(
            funding_txid.to_byte_array(),
            self.funding_output_index as u16,
        );
        let commit_input = CommitInput {
            txid: funding_txid,
            output_index: self.funding_output_index,
            amount: self.open.funding,
        };

        let commitments = match Commitments::initial(
            channel_id,
            local_params,
            remote_params,
            self.open.flags,
            commit_input,
            self.open.push,
            self.open.fee,
        ) {
            Ok(commitments) => commitments,
            Err(e) => {
                let error = ErrorMessage::new(channel_id, &e.to_string());
                return (
                    ChannelState::Closed(ClosedData { channel_id }),
                    vec![Action::SendMessage(Message::Error(error))],
                );
            }
        };

        let signature = match commitments.sign_initial_remote_commit(key_manager) {
            Ok(signature) => signature,
            Err(e) => {
                let error = ErrorMessage::new(channel_id, &e.to_string());
                return (
                    ChannelState::Closed(ClosedData { channel_id }),
                    vec![Action::SendMessage(Message::Error(error))],
                );
            }
        };

        let funding_created = FundingCreated {
            temporary_channel_id: self.open.temporary_channel_id,
            funding_txid: Hash256(funding_txid.to_byte_array()),
            output_index: self.funding_output_index as u16,
            signature,
        };
        let actions = vec![
            Action::ChannelIdSwitch {
                old: self.open.temporary_channel_id,
                new: channel_id,
            },
            Action::StoreState,
            Action::SendMessage(Message::FundingCreated(funding_created)),
        ];
        (
            ChannelState::WaitForFundingSigned(WaitForFundingSignedData {
                config: self.config,
                commitments,
                funding_tx: self.funding_tx,
            }),
            actions,
        )
    }
}

impl WaitForFundingCreatedData {
    fn on_funding_created<K: KeyManager>(
        self,
        msg: FundingCreated,
        key_manager: &K,
    ) -> (ChannelState, Vec<Action>) {
        let local_params = self
            .config
            .local_params(key_manager.channel_keys(), false);
        let remote_params = RemoteParams::from_open_channel(&self.open);

        let channel_id =
            ChannelId::from_funding_outpoint(msg.funding_txid.0, msg.output_index);
        let commit_input = CommitInput {
            txid: Txid::from_byte_array(msg.funding_txid.0),
            output_index: u32::from(msg.output_index),
            amount: self.open.funding,
        };

        let commitments = match Commitments::initial(
            channel_id,
            local_params,
            remote_params,
            self.open.flags,
            commit_input.clone(),
            self.open.push,
            self.open.fee,
        ) {
            Ok(commitments) => commitments,
            Err(e) => {
                let error = ErrorMessage::new(channel_id, &e.to_string());
                return (
                    ChannelState::Closed(ClosedData { channel_id }),
                    vec![Action::SendMessage(Message::Error(error))],
                );
            }
        };

        // The funder's signature covers our first commitment; nothing of
        // ours is at stake yet, a bad one just kills the opening.
        let commitments = match commitments.accept_initial_local_commit(&msg.signature) {
            Ok(commitments) => commitments,
            Err(_) => {
                let error =
                    ErrorMessage::new(channel_id, "invalid initial commitment signature");
                return (
                    ChannelState::Closed(ClosedData { channel_id }),
                    vec![Action::SendMessage(Message::Error(error))],
                );
            }
        };

        let signature = match commitments.sign_initial_remote_commit(key_manager) {
            Ok(signature) => signature,
            Err(e) => {
                let error = ErrorMessage::new(channel_id, &e.to_string());
                return (
                    ChannelState::Closed(ClosedData { channel_id }),
                    vec![Action::SendMessage(Message::Error(error))],
                );
            }
        };

        let funding_signed = FundingSigned {
            channel_id,
            signature,
        };
        let actions = vec![
            Action::ChannelIdSwitch {
                old: msg.temporary_channel_id,
                new: channel_id,
            },
            Action::StoreState,
            Action::SendMessage(Message::FundingSigned(funding_signed)),
            Action::SendWatch(WatchRequest::Confirmed {
                txid: commit_input.txid,
                min_depth: self.config.minimum_depth,
            }),
        ];
        (
            ChannelState::WaitForFundingLocked(WaitForFundingLockedData {
                commitments,
                minimum_depth: self.config.minimum_depth,
                shutdown_script: self.config.shutdown_script,
                our_locked_sent: false,
                their_next_point: None,
            }),
            actions,
        )
    }
}

impl WaitForFundingSignedData {
    fn on_funding_signed(self, msg: FundingSigned) -> (ChannelState, Vec<Action>) {
        let channel_id = self.commitments.channel_id;
        if msg.channel_id != channel_id {
            log::warn!("funding_signed for a different channel, ignoring");
            return (ChannelState::WaitForFundingSigned(self), Vec::new());
        }

        let commitments = match self.commitments.accept_initial_local_commit(&msg.signature) {
            Ok(commitments) => commitments,
            Err(_) => {
                // The funding tx was never broadcast; abandon without
                // loss.
                let error =
                    ErrorMessage::new(channel_id, "invalid initial commitment signature");
                return (
                    ChannelState::Closed(ClosedData { channel_id }),
                    vec![Action::SendMessage(Message::Error(error))],
                );
            }
        };

        let funding_txid = commitments.commit_input.txid;
        let actions = vec![
            Action::StoreState,
            Action::PublishTx(self.funding_tx),
            Action::SendWatch(WatchRequest::Confirmed {
                txid: funding_txid,
                min_depth: self.config.minimum_depth,
            }),
        ];
        (
            ChannelState::WaitForFundingLocked(WaitForFundingLockedData {
                commitments,
                minimum_depth: self.config.minimum_depth,
                shutdown_script: self.config.shutdown_script,
                our_locked_sent: false,
                their_next_point: None,
            }),
            actions,
        )
    }
}

impl WaitForFundingLockedData {
    fn on_event<K: KeyManager>(
        mut self,
        event: Event,
        key_manager: &K,
    ) -> (ChannelState, Vec<Action>) {
        let mut actions = Vec::new();
        match event {
            Event::WatchReceived(WatchEvent::Confirmed { txid, depth, .. })
                if txid == self.commitments.commit_input.txid
                    && depth >= self.minimum_depth
                    && !self.our_locked_sent =>
            {
                let next_point = match key_manager.commitment_point(1) {
                    Ok(point) => point,
                    Err(e) => {
                        log::error!("cannot derive commitment point 1: {}", e);
                        return (ChannelState::WaitForFundingLocked(self), Vec::new());
                    }
                };
                let locked = FundingLocked {
                    channel_id: self.commitments.channel_id,
                    next_per_commitment_point: RawPublicKey(next_point),
                };
                self.our_locked_sent = true;
                actions.push(Action::SendMessage(Message::FundingLocked(locked)));
            }
            Event::MessageReceived(Message::FundingLocked(msg)) => {
                self.their_next_point = Some(msg.next_per_commitment_point.0);
            }
            other => {
                log::warn!("wait_for_funding_locked: ignoring {:?}", event_name(&other));
                return (ChannelState::WaitForFundingLocked(self), Vec::new());
            }
        }

        if self.our_locked_sent {
            if let Some(their_point) = self.their_next_point {
                let mut commitments = self.commitments;
                commitments.remote_next_commit_info = RemoteNextCommitInfo::Revoked(their_point);
                actions.push(Action::StoreState);
                actions.push(Action::SendWatch(WatchRequest::Spent {
                    txid: commitments.commit_input.txid,
                    output_index: commitments.commit_input.output_index,
                }));
                return (
                    ChannelState::Normal(NormalData {
                        commitments,
                        shutdown_script: self.shutdown_script,
                        current_height: 0,
                    }),
                    actions,
                );
            }
        }
        (ChannelState::WaitForFundingLocked(self), actions)
    }
}

impl NormalData {
    fn on_command<K: KeyManager>(self, cmd: Command, key_manager: &K) -> (ChannelState, Vec<Action>) {
        match cmd {
            Command::AddHtlc {
                amount,
                payment_hash,
                expiry,
                onion,
                origin,
            } => {
                let cmd = CmdAddHtlc {
                    amount,
                    payment_hash,
                    expiry,
                    onion,
                };
                match self.commitments.send_add(cmd, origin, self.current_height) {
                    Ok((commitments, add)) => (
                        ChannelState::Normal(NormalData {
                            commitments,
                            ..self
                        }),
                        vec![
                            Action::SendMessage(Message::UpdateAddHtlc(add)),
                            Action::ProcessCommand(Command::Sign),
                        ],
                    ),
                    Err(e) => (
                        ChannelState::Normal(self),
                        vec![Action::CommandFailed(e)],
                    ),
                }
            }
            Command::FulfillHtlc { id, preimage } => {
                match self.commitments.send_fulfill(id, preimage) {
                    Ok((commitments, fulfill)) => (
                        ChannelState::Normal(NormalData {
                            commitments,
                            ..self
                        }),
                        vec![
                            Action::SendMessage(Message::UpdateFulfillHtlc(fulfill)),
                            Action::ProcessCommand(Command::Sign),
                        ],
                    ),
                    Err(e) => (
                        ChannelState::Normal(self),
                        vec![Action::CommandFailed(e)],
                    ),
                }
            }
            Command::FailHtlc { id, reason } => match self.commitments.send_fail(id, reason) {
                Ok((commitments, fail)) => (
                    ChannelState::Normal(NormalData {
                        commitments,
                        ..self
                    }),
                    vec![
                        Action::SendMessage(Message::UpdateFailHtlc(fail)),
                        Action::ProcessCommand(Command::Sign),
                    ],
                ),
                Err(e) => (
                    ChannelState::Normal(self),
                    vec![Action::CommandFailed(e)],
                ),
            },
            Command::UpdateFee { feerate } => match self.commitments.send_fee(feerate) {
                Ok((commitments, update)) => (
                    ChannelState::Normal(NormalData {
                        commitments,
                        ..self
                    }),
                    vec![
                        Action::SendMessage(Message::UpdateFee(update)),
                        Action::ProcessCommand(Command::Sign),
                    ],
                ),
                Err(e) => (
                    ChannelState::Normal(self),
                    vec![Action::CommandFailed(e)],
                ),
            },
            Command::Sign => match self.commitments.send_commit(key_manager) {
                Ok((commitments, commit_sig)) => (
                    ChannelState::Normal(NormalData {
                        commitments,
                        ..self
                    }),
                    vec![
                        Action::StoreState,
                        Action::SendMessage(Message::CommitmentSigned(commit_sig)),
                    ],
                ),
                // Benign preconditions: nothing to do yet.
                Err(ChannelError::CannotSignWithoutChanges)
                | Err(ChannelError::CannotSignBeforeRevocation) => {
                    (ChannelState::Normal(self), Vec::new())
                }
                Err(e) => (
                    ChannelState::Normal(self),
                    vec![Action::CommandFailed(e)],
                ),
            },
            Command::Close { script_pubkey } => {
                let local_script =
                    script_pubkey.unwrap_or_else(|| self.shutdown_script.clone());
                let shutdown = ShutdownChannel {
                    channel_id: self.commitments.channel_id,
                    script_pubkey: local_script.clone(),
                };
                (
                    ChannelState::ShuttingDown(ShuttingDownData {
                        commitments: self.commitments,
                        local_script,
                        remote_script: None,
                    }),
                    vec![
                        Action::StoreState,
                        Action::SendMessage(Message::ShutdownChannel(shutdown)),
                    ],
                )
            }
            Command::InitFunder { .. } | Command::InitFundee => (
                ChannelState::Normal(self),
                vec![Action::CommandFailed(ChannelError::ChannelUnavailable(
                    "the channel is already open",
                ))],
            ),
        }
    }

    fn on_message<K: KeyManager>(self, msg: Message, key_manager: &K) -> (ChannelState, Vec<Action>) {
        let channel_id = self.commitments.channel_id;

        match msg {
            Message::UpdateAddHtlc(add) => match self.commitments.receive_add(add) {
                Ok(commitments) => (
                    ChannelState::Normal(NormalData {
                        commitments,
                        ..self
                    }),
                    Vec::new(),
                ),
                Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
            },
            Message::UpdateFulfillHtlc(fulfill) => {
                match self.commitments.receive_fulfill(fulfill.clone()) {
                    Ok((commitments, origin)) => (
                        ChannelState::Normal(NormalData {
                            commitments,
                            ..self
                        }),
                        vec![Action::ProcessFulfill { fulfill, origin }],
                    ),
                    Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
                }
            }
            Message::UpdateFailHtlc(fail) => match self.commitments.receive_fail(fail) {
                Ok(commitments) => (
                    ChannelState::Normal(NormalData {
                        commitments,
                        ..self
                    }),
                    Vec::new(),
                ),
                Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
            },
            Message::UpdateFailMalformedHtlc(fail) => {
                match self.commitments.receive_fail_malformed(fail) {
                    Ok(commitments) => (
                        ChannelState::Normal(NormalData {
                            commitments,
                            ..self
                        }),
                        Vec::new(),
                    ),
                    Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
                }
            }
            Message::UpdateFee(update) => match self.commitments.receive_fee(update) {
                Ok(commitments) => (
                    ChannelState::Normal(NormalData {
                        commitments,
                        ..self
                    }),
                    Vec::new(),
                ),
                Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
            },
            Message::CommitmentSigned(commit_sig) => {
                match self.commitments.receive_commit(commit_sig, key_manager) {
                    Ok((commitments, revocation)) => {
                        let mut actions = vec![
                            Action::StoreState,
                            Action::SendMessage(Message::RevokeAndAck(revocation)),
                        ];
                        if commitments.local_has_changes() {
                            actions.push(Action::ProcessCommand(Command::Sign));
                        }
                        (
                            ChannelState::Normal(NormalData {
                                commitments,
                                ..self
                            }),
                            actions,
                        )
                    }
                    Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
                }
            }
            Message::RevokeAndAck(revocation) => {
                match self.commitments.receive_revocation(revocation) {
                    Ok((commitments, forwards)) => {
                        let mut actions = vec![Action::StoreState];
                        for forward in forwards {
                            actions.push(match forward {
                                Forward::Add(add) => Action::ProcessAdd(add),
                                Forward::Fail { fail, origin } => {
                                    Action::ProcessFail { fail, origin }
                                }
                                Forward::FailMalformed { fail, origin } => {
                                    Action::ProcessFailMalformed { fail, origin }
                                }
                            });
                        }
                        if commitments.local_has_changes() {
                            actions.push(Action::ProcessCommand(Command::Sign));
                        }
                        (
                            ChannelState::Normal(NormalData {
                                commitments,
                                ..self
                            }),
                            actions,
                        )
                    }
                    Err(ChannelError::CommitmentSyncError(reason)) => {
                        information_leak(channel_id, reason)
                    }
                    Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
                }
            }
            Message::ShutdownChannel(shutdown) => {
                let our_shutdown = ShutdownChannel {
                    channel_id,
                    script_pubkey: self.shutdown_script.clone(),
                };
                let state = ShuttingDownData {
                    commitments: self.commitments,
                    local_script: self.shutdown_script.clone(),
                    remote_script: Some(shutdown.script_pubkey),
                };
                let mut actions = vec![
                    Action::StoreState,
                    Action::SendMessage(Message::ShutdownChannel(our_shutdown)),
                ];
                let (state, more) = state.try_negotiating(key_manager);
                actions.extend(more);
                (state, actions)
            }
            Message::Error(error) => {
                log::warn!("peer failed channel {}: {}", channel_id, error.text());
                let mut actions = vec![Action::StoreState];
                match self.commitments.signed_local_commit_tx(key_manager) {
                    Ok(tx) => actions.push(Action::PublishTx(tx)),
                    Err(e) => log::error!(
                        "channel {}: cannot assemble the local commitment: {}",
                        channel_id,
                        e,
                    ),
                }
                (ChannelState::Closing(ClosingData { channel_id }), actions)
            }
            other => {
                log::warn!("normal: ignoring message type {}", other.type_id());
                (ChannelState::Normal(self), Vec::new())
            }
        }
    }

    fn on_watch(self, event: WatchEvent) -> (ChannelState, Vec<Action>) {
        match event {
            // The funding output was spent under us: a commitment (ours,
            // theirs, or a revoked one) hit the chain.
            WatchEvent::Spent { spending_txid, .. } => {
                log::warn!(
                    "channel {}: funding spent by {}",
                    self.commitments.channel_id,
                    spending_txid,
                );
                (
                    ChannelState::Closing(ClosingData {
                        channel_id: self.commitments.channel_id,
                    }),
                    vec![Action::StoreState],
                )
            }
            WatchEvent::Confirmed { .. } => (ChannelState::Normal(self), Vec::new()),
        }
    }

    fn on_new_block<K: KeyManager>(
        mut self,
        height: u32,
        key_manager: &K,
    ) -> (ChannelState, Vec<Action>) {
        self.current_height = height;

        // An expired outgoing HTLC can only be reclaimed on chain.
        let expired = self
            .commitments
            .local_commit
            .spec
            .htlcs
            .iter()
            .any(|h| {
                h.direction == channel::spec::Direction::Outgoing && h.add.expiry <= height
            });
        if expired {
            return force_close_channel(&self.commitments, key_manager, "htlc timed out");
        }
        (ChannelState::Normal(self), Vec::new())
    }
}

impl ShuttingDownData {
    fn on_command<K: KeyManager>(self, cmd: Command, key_manager: &K) -> (ChannelState, Vec<Action>) {
        match cmd {
            Command::AddHtlc { .. } => (
                ChannelState::ShuttingDown(self),
                vec![Action::CommandFailed(ChannelError::ChannelUnavailable(
                    "the channel is shutting down",
                ))],
            ),
            Command::FulfillHtlc { id, preimage } => {
                match self.commitments.send_fulfill(id, preimage) {
                    Ok((commitments, fulfill)) => (
                        ChannelState::ShuttingDown(ShuttingDownData {
                            commitments,
                            ..self
                        }),
                        vec![
                            Action::SendMessage(Message::UpdateFulfillHtlc(fulfill)),
                            Action::ProcessCommand(Command::Sign),
                        ],
                    ),
                    Err(e) => (
                        ChannelState::ShuttingDown(self),
                        vec![Action::CommandFailed(e)],
                    ),
                }
            }
            Command::FailHtlc { id, reason } => match self.commitments.send_fail(id, reason) {
                Ok((commitments, fail)) => (
                    ChannelState::ShuttingDown(ShuttingDownData {
                        commitments,
                        ..self
                    }),
                    vec![
                        Action::SendMessage(Message::UpdateFailHtlc(fail)),
                        Action::ProcessCommand(Command::Sign),
                    ],
                ),
                Err(e) => (
                    ChannelState::ShuttingDown(self),
                    vec![Action::CommandFailed(e)],
                ),
            },
            Command::Sign => match self.commitments.send_commit(key_manager) {
                Ok((commitments, commit_sig)) => (
                    ChannelState::ShuttingDown(ShuttingDownData {
                        commitments,
                        ..self
                    }),
                    vec![
                        Action::StoreState,
                        Action::SendMessage(Message::CommitmentSigned(commit_sig)),
                    ],
                ),
                Err(ChannelError::CannotSignWithoutChanges)
                | Err(ChannelError::CannotSignBeforeRevocation) => {
                    (ChannelState::ShuttingDown(self), Vec::new())
                }
                Err(e) => (
                    ChannelState::ShuttingDown(self),
                    vec![Action::CommandFailed(e)],
                ),
            },
            other => {
                log::warn!("shutting_down: rejecting command {:?}", other);
                (
                    ChannelState::ShuttingDown(self),
                    vec![Action::CommandFailed(ChannelError::ChannelUnavailable(
                        "the channel is shutting down",
                    ))],
                )
            }
        }
    }

    fn on_message<K: KeyManager>(self, msg: Message, key_manager: &K) -> (ChannelState, Vec<Action>) {
        let channel_id = self.commitments.channel_id;

        match msg {
            // No new HTLCs once shutdown started.
            Message::UpdateAddHtlc(_) => force_close_channel(
                &self.commitments,
                key_manager,
                "htlc added during shutdown",
            ),
            Message::UpdateFulfillHtlc(fulfill) => {
                match self.commitments.receive_fulfill(fulfill.clone()) {
                    Ok((commitments, origin)) => (
                        ChannelState::ShuttingDown(ShuttingDownData {
                            commitments,
                            ..self
                        }),
                        vec![Action::ProcessFulfill { fulfill, origin }],
                    ),
                    Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
                }
            }
            Message::UpdateFailHtlc(fail) => match self.commitments.receive_fail(fail) {
                Ok(commitments) => (
                    ChannelState::ShuttingDown(ShuttingDownData {
                        commitments,
                        ..self
                    }),
                    Vec::new(),
                ),
                Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
            },
            Message::UpdateFailMalformedHtlc(fail) => {
                match self.commitments.receive_fail_malformed(fail) {
                    Ok(commitments) => (
                        ChannelState::ShuttingDown(ShuttingDownData {
                            commitments,
                            ..self
                        }),
                        Vec::new(),
                    ),
                    Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
                }
            }
            Message::CommitmentSigned(commit_sig) => {
                match self.commitments.receive_commit(commit_sig, key_manager) {
                    Ok((commitments, revocation)) => {
                        let mut actions = vec![
                            Action::StoreState,
                            Action::SendMessage(Message::RevokeAndAck(revocation)),
                        ];
                        if commitments.local_has_changes() {
                            actions.push(Action::ProcessCommand(Command::Sign));
                        }
                        let state = ShuttingDownData {
                            commitments,
                            ..self
                        };
                        let (state, more) = state.try_negotiating(key_manager);
                        actions.extend(more);
                        (state, actions)
                    }
                    Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
                }
            }
            Message::RevokeAndAck(revocation) => {
                match self.commitments.receive_revocation(revocation) {
                    Ok((commitments, forwards)) => {
                        let mut actions = vec![Action::StoreState];
                        for forward in forwards {
                            actions.push(match forward {
                                Forward::Add(add) => Action::ProcessAdd(add),
                                Forward::Fail { fail, origin } => {
                                    Action::ProcessFail { fail, origin }
                                }
                                Forward::FailMalformed { fail, origin } => {
                                    Action::ProcessFailMalformed { fail, origin }
                                }
                            });
                        }
                        if commitments.local_has_changes() {
                            actions.push(Action::ProcessCommand(Command::Sign));
                        }
                        let state = ShuttingDownData {
                            commitments,
                            ..self
                        };
                        let (state, more) = state.try_negotiating(key_manager);
                        actions.extend(more);
                        (state, actions)
                    }
                    Err(ChannelError::CommitmentSyncError(reason)) => {
                        information_leak(channel_id, reason)
                    }
                    Err(e) => force_close_channel(&self.commitments, key_manager, &e.to_string()),
                }
            }
            Message::ShutdownChannel(shutdown) => {
                let state = ShuttingDownData {
                    remote_script: Some(shutdown.script_pubkey),
                    ..self
                };
                let (state, actions) = state.try_negotiating(key_manager);
                (state, actions)
            }
            Message::Error(error) => {
                log::warn!("peer failed channel {}: {}", channel_id, error.text());
                let mut actions = vec![Action::StoreState];
                match self.commitments.signed_local_commit_tx(key_manager) {
                    Ok(tx) => actions.push(Action::PublishTx(tx)),
                    Err(e) => log::error!(
                        "channel {}: cannot assemble the local commitment: {}",
                        channel_id,
                        e,
                    ),
                }
                (ChannelState::Closing(ClosingData { channel_id }), actions)
            }
            other => {
                log::warn!("shutting_down: ignoring message type {}", other.type_id());
                (ChannelState::ShuttingDown(self), Vec::new())
            }
        }
    }

    fn on_watch(self, event: WatchEvent) -> (ChannelState, Vec<Action>) {
        match event {
            WatchEvent::Spent { .. } => (
                ChannelState::Closing(ClosingData {
                    channel_id: self.commitments.channel_id,
                }),
                vec![Action::StoreState],
            ),
            WatchEvent::Confirmed { .. } => (ChannelState::ShuttingDown(self), Vec::new()),
        }
    }

    // Once the channel is drained and both scripts are known, the funder
    // opens fee negotiation.
    fn try_negotiating<K: KeyManager>(self, key_manager: &K) -> (ChannelState, Vec<Action>) {
        let drained = self.commitments.local_commit.spec.htlcs.is_empty()
            && self.commitments.remote_commit.spec.htlcs.is_empty()
            && !self.commitments.local_has_changes()
            && !self.commitments.remote_has_changes();
        let remote_script = match (&self.remote_script, drained) {
            (Some(script), true) => script.clone(),
            _ => return (ChannelState::ShuttingDown(self), Vec::new()),
        };

        let mut negotiating = NegotiatingData {
            commitments: self.commitments,
            local_script: self.local_script,
            remote_script,
            local_fee: None,
        };

        if negotiating.commitments.local_params.is_funder {
            let fee = weight_to_fee(
                CLOSING_TX_WEIGHT,
                negotiating.commitments.local_commit.spec.feerate,
            );
            let closing = match closing_signed(&negotiating, fee, key_manager) {
                Ok(closing) => closing,
                Err(e) => {
                    return force_close_channel(
                        &negotiating.commitments,
                        key_manager,
                        &e.to_string(),
                    );
                }
            };
            negotiating.local_fee = Some(fee);
            (
                ChannelState::Negotiating(negotiating),
                vec![
                    Action::StoreState,
                    Action::SendMessage(Message::ClosingNegotiation(closing)),
                ],
            )
        } else {
            (
                ChannelState::Negotiating(negotiating),
                vec![Action::StoreState],
            )
        }
    }
}

impl NegotiatingData {
    fn on_message<K: KeyManager>(self, msg: Message, key_manager: &K) -> (ChannelState, Vec<Action>) {
        let channel_id = self.commitments.channel_id;

        match msg {
            Message::ClosingNegotiation(their_closing) => {
                let (closing_tx, digest) =
                    match closing_tx(&self, their_closing.fee) {
                        Ok(pair) => pair,
                        Err(e) => {
                            return force_close_channel(
                                &self.commitments,
                                key_manager,
                                &e.to_string(),
                            )
                        }
                    };
                let secp = Secp256k1::new();
                if secp
                    .verify_ecdsa(
                        &Digest::from_digest(digest),
                        &their_closing.signature.0,
                        &self.commitments.remote_params.keys.funding.0,
                    )
                    .is_err()
                {
                    return force_close_channel(
                        &self.commitments,
                        key_manager,
                        "invalid closing signature",
                    );
                }

                match self.local_fee {
                    // Their fee matches our proposal (or we had none and
                    // accept theirs): the close is final.
                    Some(ours) if ours == their_closing.fee => {
                        let signed =
                            self.witnessed_closing_tx(closing_tx, digest, &their_closing, key_manager);
                        let closing_txid = signed.compute_txid();
                        (
                            ChannelState::Closing(ClosingData { channel_id }),
                            vec![
                                Action::StoreState,
                                Action::PublishTx(signed),
                                Action::SendWatch(WatchRequest::Confirmed {
                                    txid: closing_txid,
                                    min_depth: 1,
                                }),
                            ],
                        )
                    }
                    previous => {
                        // Step towards their proposal; once the midpoint
                        // lands on their fee we are done next round.
                        let our_fee = match previous {
                            Some(ours) => Satoshi((ours.0 + their_closing.fee.0) / 2),
                            None => their_closing.fee,
                        };
                        let closing = match closing_signed(&self, our_fee, key_manager) {
                            Ok(closing) => closing,
                            Err(e) => {
                                return force_close_channel(
                                    &self.commitments,
                                    key_manager,
                                    &e.to_string(),
                                )
                            }
                        };
                        let mut actions = vec![
                            Action::StoreState,
                            Action::SendMessage(Message::ClosingNegotiation(closing)),
                        ];
                        if our_fee == their_closing.fee {
                            let signed = self.witnessed_closing_tx(
                                closing_tx,
                                digest,
                                &their_closing,
                                key_manager,
                            );
                            let closing_txid = signed.compute_txid();
                            actions.push(Action::PublishTx(signed));
                            actions.push(Action::SendWatch(WatchRequest::Confirmed {
                                txid: closing_txid,
                                min_depth: 1,
                            }));
                            return (
                                ChannelState::Closing(ClosingData { channel_id }),
                                actions,
                            );
                        }
                        (
                            ChannelState::Negotiating(NegotiatingData {
                                local_fee: Some(our_fee),
                                ..self
                            }),
                            actions,
                        )
                    }
                }
            }
            Message::Error(error) => {
                log::warn!("peer failed channel {}: {}", channel_id, error.text());
                let mut actions = vec![Action::StoreState];
                match self.commitments.signed_local_commit_tx(key_manager) {
                    Ok(tx) => actions.push(Action::PublishTx(tx)),
                    Err(e) => log::error!(
                        "channel {}: cannot assemble the local commitment: {}",
                        channel_id,
                        e,
                    ),
                }
                (ChannelState::Closing(ClosingData { channel_id }), actions)
            }
            other => {
                log::warn!("negotiating: ignoring message type {}", other.type_id());
                (ChannelState::Negotiating(self), Vec::new())
            }
        }
    }

    // Completes the agreed closing transaction with both funding
    // signatures: theirs just verified, ours freshly produced over the
    // same digest.
    fn witnessed_closing_tx<K: KeyManager>(
        &self,
        mut closing_tx: Transaction,
        digest: [u8; 32],
        their_closing: &ClosingSigned,
        key_manager: &K,
    ) -> Transaction {
        let our_signature = key_manager.sign_funding(digest);
        closing_tx.input[0].witness = spending_witness_2x2_multisig(
            &self.commitments.local_params.keys.funding.0,
            &self.commitments.remote_params.keys.funding.0,
            &our_signature,
            &their_closing.signature.0,
        );
        closing_tx
    }

    fn on_watch(self, event: WatchEvent) -> (ChannelState, Vec<Action>) {
        match event {
            WatchEvent::Spent { .. } => (
                ChannelState::Closing(ClosingData {
                    channel_id: self.commitments.channel_id,
                }),
                vec![Action::StoreState],
            ),
            WatchEvent::Confirmed { .. } => (ChannelState::Negotiating(self), Vec::new()),
        }
    }
}

impl ClosingData {
    fn on_watch(self, event: WatchEvent) -> (ChannelState, Vec<Action>) {
        match event {
            WatchEvent::Confirmed { depth, .. } if depth >= 1 => (
                ChannelState::Closed(ClosedData {
                    channel_id: self.channel_id,
                }),
                vec![Action::StoreState],
            ),
            _ => (ChannelState::Closing(self), Vec::new()),
        }
    }
}

// The symmetric cooperative-close transaction: both balances paid out
// directly, the fee taken from the funder's output.
fn closing_tx(
    negotiating: &NegotiatingData,
    fee: Satoshi,
) -> Result<(Transaction, [u8; 32]), ChannelError> {
    let commitments = &negotiating.commitments;
    let spec = &commitments.local_commit.spec;

    let mut to_local = spec.to_local.to_satoshi().0;
    let mut to_remote = spec.to_remote.to_satoshi().0;
    if commitments.local_params.is_funder {
        to_local = to_local.saturating_sub(fee.0);
    } else {
        to_remote = to_remote.saturating_sub(fee.0);
    }

    let dust = commitments.local_params.dust_limit.0;
    let mut outputs: Vec<(TxOut, ())> = Vec::new();
    if to_local >= dust {
        outputs.push((
            TxOut {
                value: Amount::from_sat(to_local),
                script_pubkey: ScriptBuf::from_bytes(negotiating.local_script.clone()),
            },
            (),
        ));
    }
    if to_remote >= dust {
        outputs.push((
            TxOut {
                value: Amount::from_sat(to_remote),
                script_pubkey: ScriptBuf::from_bytes(negotiating.remote_script.clone()),
            },
            (),
        ));
    }
    channel::bip69::sort_outputs(&mut outputs, |_, _| std::cmp::Ordering::Equal);

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: commitments.commit_input.txid,
                vout: commitments.commit_input.output_index,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs.into_iter().map(|(out, ())| out).collect(),
    };

    let funding_script = new_2x2_multisig(
        &commitments.local_params.keys.funding.serialize(),
        &commitments.remote_params.keys.funding.serialize(),
    );
    let digest = SighashCache::new(&tx)
        .p2wsh_signature_hash(
            0,
            &funding_script,
            Amount::from_sat(commitments.commit_input.amount.0),
            EcdsaSighashType::All,
        )
        .map_err(|_| ChannelError::CommitmentSyncError("closing tx has no input"))?
        .to_byte_array();

    Ok((tx, digest))
}

fn closing_signed<K: KeyManager>(
    negotiating: &NegotiatingData,
    fee: Satoshi,
    key_manager: &K,
) -> Result<ClosingSigned, ChannelError> {
    let (_tx, digest) = closing_tx(negotiating, fee)?;
    Ok(ClosingSigned {
        channel_id: negotiating.commitments.channel_id,
        fee,
        signature: RawSignature(key_manager.sign_funding(digest)),
    })
}

// On reconnection both sides announce where the protocol stopped.
fn reconnect<K: KeyManager>(inner: ChannelState, key_manager: &K) -> (ChannelState, Vec<Action>) {
    let Some(commitments) = inner.commitments() else {
        // Nothing committed yet: the opening restarts from scratch.
        return (inner, Vec::new());
    };

    let last_secret = if commitments.remote_commit.index > 0 {
        commitments
            .remote_per_commitment_secrets
            .look_up(ChainIndex::from_commitment_number(
                commitments.remote_commit.index - 1,
            ))
            .unwrap_or([0; 32])
    } else {
        [0; 32]
    };

    let current_point = match key_manager.commitment_point(commitments.local_commit.index) {
        Ok(point) => point,
        Err(e) => {
            log::error!("cannot derive our commitment point: {}", e);
            return (inner, Vec::new());
        }
    };

    let reestablish = ReestablishChannel {
        channel_id: commitments.channel_id,
        next_local_commitment_number: commitments.local_commit.index + 1,
        next_remote_revocation_number: commitments.remote_commit.index,
        last_remote_commit_secret: last_secret,
        local_unrevoked_commit_point: RawPublicKey(current_point),
    };

    (
        ChannelState::Syncing(Box::new(inner)),
        vec![Action::SendMessage(Message::ReestablishChannel(reestablish))],
    )
}

// Compares the peer's view of the protocol position with ours and
// retransmits whatever the disconnection swallowed.
fn resync<K: KeyManager>(
    inner: ChannelState,
    their: ReestablishChannel,
    key_manager: &K,
) -> (ChannelState, Vec<Action>) {
    let Some(commitments) = inner.commitments() else {
        return (inner, Vec::new());
    };
    let channel_id = commitments.channel_id;

    // The peer proves knowledge of commitments we never made: our state
    // is behind theirs and publishing ours would hand them everything.
    if their.next_remote_revocation_number > commitments.local_commit.index {
        return information_leak(
            channel_id,
            "peer is ahead of us, refusing to use stale state",
        );
    }

    let mut actions = Vec::new();

    // They missed our last revocation.
    if their.next_remote_revocation_number + 1 == commitments.local_commit.index {
        let revoked_index = commitments.local_commit.index - 1;
        let (secret, next_point) = match (
            key_manager.commitment_secret(revoked_index),
            key_manager.commitment_point(commitments.local_commit.index + 1),
        ) {
            (Ok(secret), Ok(point)) => (secret, point),
            _ => {
                return information_leak(channel_id, "cannot rebuild revocation");
            }
        };
        actions.push(Action::SendMessage(Message::RevokeAndAck(RevokeAndAck {
            channel_id,
            revocation_preimage: secret,
            next_per_commitment_point: RawPublicKey(next_point),
        })));
    } else if their.next_remote_revocation_number != commitments.local_commit.index {
        return information_leak(channel_id, "revocation numbers do not reconcile");
    }

    // They missed the commitment signature we have in flight.
    if let RemoteNextCommitInfo::Waiting(waiting) = &commitments.remote_next_commit_info {
        if their.next_local_commitment_number == waiting.next_remote_commit.index {
            actions.push(Action::SendMessage(Message::CommitmentSigned(
                waiting.sent.clone(),
            )));
        } else if their.next_local_commitment_number != waiting.next_remote_commit.index + 1 {
            return information_leak(channel_id, "commitment numbers do not reconcile");
        }
    } else if their.next_local_commitment_number != commitments.remote_commit.index + 1 {
        return information_leak(channel_id, "commitment numbers do not reconcile");
    }

    actions.push(Action::ProcessCommand(Command::Sign));
    (inner, actions)
}
