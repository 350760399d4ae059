//! The per-peer driver: one cooperative task owning the encrypted
//! transport and every channel with this peer. Events are strictly
//! serialised per channel; all I/O suspends only on the transport, the
//! bounded queues, and the ping timer.

use std::collections::HashMap;
use std::{error, fmt};

use bitcoin::Transaction;
use bytes::BytesMut;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Duration};

use brontide::{ActOne, ActThree, ActTwo, HandshakeError, HandshakeNew, Machine};
use channel::tools::sha256;
use channel::{validate_received_amount, KeyManager, Origin};
use channel_machine::{Action, ChannelConfig, ChannelState, Command, Event, WatchEvent};
use wire::{
    ChannelId, FeatureBit, Hash256, Message, MilliSatoshi, OnionBlob, Ping, Pong,
    RawFeatureVector, Satoshi, SatoshiPerKiloWeight,
};

use crate::driver::{ChannelsDb, DbError, Transport, TransportIoError, Watcher};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PING_PAD_BYTES: u16 = 8;
// Ceiling on ProcessCommand re-entry per external event.
const MAX_REENTRY: usize = 16;

#[derive(Debug)]
pub enum PeerError {
    Transport(TransportIoError),
    Noise(brontide::TransportError),
    Handshake(HandshakeError),
    Db(DbError),
    PeerUnresponsive,
    IncompatibleFeatures(Vec<u16>),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerError::Transport(e) => write!(f, "transport: {}", e),
            PeerError::Noise(e) => write!(f, "noise: {}", e),
            PeerError::Handshake(e) => write!(f, "handshake: {}", e),
            PeerError::Db(e) => write!(f, "{}", e),
            PeerError::PeerUnresponsive => write!(f, "peer stopped answering pings"),
            PeerError::IncompatibleFeatures(bits) => {
                write!(f, "peer requires unknown feature bits {:?}", bits)
            }
        }
    }
}

impl error::Error for PeerError {}

impl From<TransportIoError> for PeerError {
    fn from(e: TransportIoError) -> Self {
        PeerError::Transport(e)
    }
}

impl From<brontide::TransportError> for PeerError {
    fn from(e: brontide::TransportError) -> Self {
        PeerError::Noise(e)
    }
}

impl From<HandshakeError> for PeerError {
    fn from(e: HandshakeError) -> Self {
        PeerError::Handshake(e)
    }
}

impl From<DbError> for PeerError {
    fn from(e: DbError) -> Self {
        PeerError::Db(e)
    }
}

/// The transport lifecycle as the host observes it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Closed,
    Establishing,
    Established,
}

/// What the peer reports to its listeners.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    PaymentRequestGenerated {
        payment_hash: Hash256,
        amount: MilliSatoshi,
    },
    PaymentReceived {
        payment_hash: Hash256,
        amount: MilliSatoshi,
    },
    PaymentSent {
        channel_id: ChannelId,
    },
    PaymentFailed {
        channel_id: ChannelId,
    },
    ChannelsSnapshot(Vec<(ChannelId, &'static str)>),
}

/// Host requests into the peer task.
#[derive(Debug)]
pub enum PeerCommand {
    OpenChannel {
        temporary_channel_id: ChannelId,
        /// Built and reserved by the wallet; broadcast only once the
        /// counterparty has signed our first commitment.
        funding_tx: Transaction,
        funding_output_index: u32,
        funding: Satoshi,
        push: MilliSatoshi,
        feerate: SatoshiPerKiloWeight,
        announce_channel: bool,
    },
    SendPayment {
        channel_id: ChannelId,
        amount: MilliSatoshi,
        payment_hash: Hash256,
        expiry: u32,
        onion: OnionBlob,
    },
    AddInvoice {
        amount: MilliSatoshi,
        preimage: [u8; 32],
    },
    CloseChannel {
        channel_id: ChannelId,
    },
    WatchDelivery {
        channel_id: ChannelId,
        event: WatchEvent,
    },
    BlockConnected {
        height: u32,
    },
    Disconnect,
}

/// The host's side of a running peer.
pub struct PeerHandle {
    pub commands: mpsc::Sender<PeerCommand>,
    pub status: watch::Receiver<ConnectionStatus>,
    pub events: mpsc::Receiver<PeerEvent>,
}

struct Invoice {
    amount: MilliSatoshi,
    preimage: [u8; 32],
}

pub struct Peer<T, K, W, D> {
    machine: Machine,
    transport: T,
    key_manager: K,
    watcher: W,
    db: D,
    config: ChannelConfig,
    channels: HashMap<ChannelId, ChannelState>,
    invoices: HashMap<Hash256, Invoice>,
    commands: mpsc::Receiver<PeerCommand>,
    events: mpsc::Sender<PeerEvent>,
    status: watch::Sender<ConnectionStatus>,
    read_buffer: BytesMut,
    unanswered_pings: u8,
}

// One iteration of the peer loop wakes up for exactly one of these.
enum Turn {
    Incoming(Result<Vec<u8>, TransportIoError>),
    Host(Option<PeerCommand>),
    Ping,
}

impl<T, K, W, D> Peer<T, K, W, D>
where
    T: Transport,
    K: KeyManager,
    W: Watcher,
    D: ChannelsDb,
{
    /// Wraps an established noise session into a peer task plus its host
    /// handle. Channels persisted for this peer are restored offline.
    pub fn new(
        machine: Machine,
        transport: T,
        key_manager: K,
        watcher: W,
        db: D,
        config: ChannelConfig,
    ) -> (Self, PeerHandle) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Establishing);

        let mut channels = HashMap::new();
        match db.list_local_channels() {
            Ok(persisted) => {
                for (channel_id, state) in persisted {
                    let restored = ChannelState::new(config.clone());
                    let (restored, _) = restored
                        .process(Event::Restore(Box::new(state)), &key_manager);
                    channels.insert(channel_id, restored);
                }
            }
            Err(e) => log::error!("cannot list persisted channels: {}", e),
        }

        let peer = Peer {
            machine,
            transport,
            key_manager,
            watcher,
            db,
            config,
            channels,
            invoices: HashMap::new(),
            commands: command_rx,
            events: event_tx,
            status: status_tx,
            read_buffer: BytesMut::with_capacity(0x1_0000),
            unanswered_pings: 0,
        };
        let handle = PeerHandle {
            commands: command_tx,
            status: status_rx,
            events: event_rx,
        };
        (peer, handle)
    }

    /// The peer event loop; returns when the host disconnects or the
    /// transport dies. Channel state survives in the db either way.
    pub async fn run(mut self) -> Result<(), PeerError> {
        let init = Message::Init(wire::Init::new(
            RawFeatureVector::new(),
            RawFeatureVector::new().set_bit(FeatureBit::DataLossProtectOptional),
        ));
        self.send_message(init).await?;
        let _ = self.status.send(ConnectionStatus::Established);

        let channel_ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for channel_id in channel_ids {
            self.route(channel_id, Event::Connected).await?;
        }

        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.tick().await; // first tick fires immediately

        let result = loop {
            // The select only wraps the wakeup; the handlers below run
            // with the borrows released.
            let turn = tokio::select! {
                incoming = self.transport.receive_some(0x1_0000) => Turn::Incoming(incoming),
                command = self.commands.recv() => Turn::Host(command),
                _ = ping_timer.tick() => Turn::Ping,
            };

            match turn {
                Turn::Incoming(Ok(bytes)) => {
                    self.read_buffer.extend_from_slice(&bytes);
                    if let Err(e) = self.drain_messages().await {
                        break Err(e);
                    }
                }
                Turn::Incoming(Err(e)) => break Err(PeerError::Transport(e)),
                Turn::Host(None) | Turn::Host(Some(PeerCommand::Disconnect)) => break Ok(()),
                Turn::Host(Some(command)) => {
                    if let Err(e) = self.handle_command(command).await {
                        break Err(e);
                    }
                }
                Turn::Ping => {
                    if let Err(e) = self.keepalive().await {
                        break Err(e);
                    }
                }
            }
        };

        self.disconnect_channels();
        let _ = self.status.send(ConnectionStatus::Closed);
        self.transport.close().await;
        result
    }

    async fn drain_messages(&mut self) -> Result<(), PeerError> {
        while let Some(message) = self.machine.read(&mut self.read_buffer)? {
            self.handle_message(message).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::Init(init) => {
                let unknown = init.local_features.unknown_required_bits();
                if !unknown.is_empty() {
                    return Err(PeerError::IncompatibleFeatures(unknown));
                }
                log::debug!("peer features: {:?}", init.local_features);
                Ok(())
            }
            Message::Ping(ping) => {
                // An oversize request is ignored rather than answered.
                if usize::from(ping.pong_length) + 4 <= usize::from(u16::MAX) {
                    self.send_message(Message::Pong(Pong::new(&ping))).await?;
                }
                Ok(())
            }
            Message::Pong(_) => {
                self.unanswered_pings = 0;
                Ok(())
            }
            Message::Error(error) if error.channel_id == ChannelId::ALL => {
                log::warn!("peer failed all channels: {}", error.text());
                let channel_ids: Vec<ChannelId> = self.channels.keys().copied().collect();
                for channel_id in channel_ids {
                    self.route(
                        channel_id,
                        Event::MessageReceived(Message::Error(error.clone())),
                    )
                    .await?;
                }
                Ok(())
            }
            message => {
                let Some(channel_id) = message.channel_id() else {
                    log::warn!("unroutable message type {}", message.type_id());
                    return Ok(());
                };

                if !self.channels.contains_key(&channel_id) {
                    if let Message::OpenChannel(_) = &message {
                        // A fresh inbound channel.
                        let state = ChannelState::new(self.config.clone());
                        let (state, _) = state.process(
                            Event::ExecuteCommand(Command::InitFundee),
                            &self.key_manager,
                        );
                        self.channels.insert(channel_id, state);
                    } else {
                        log::warn!(
                            "message type {} for unknown channel {}",
                            message.type_id(),
                            channel_id,
                        );
                        return Ok(());
                    }
                }
                self.route(channel_id, Event::MessageReceived(message)).await
            }
        }
    }

    async fn handle_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        match command {
            PeerCommand::OpenChannel {
                temporary_channel_id,
                funding_tx,
                funding_output_index,
                funding,
                push,
                feerate,
                announce_channel,
            } => {
                let state = ChannelState::new(self.config.clone());
                self.channels.insert(temporary_channel_id, state);
                self.route(
                    temporary_channel_id,
                    Event::ExecuteCommand(Command::InitFunder {
                        temporary_channel_id,
                        funding_tx,
                        funding_output_index,
                        funding,
                        push,
                        feerate,
                        announce_channel,
                    }),
                )
                .await
            }
            PeerCommand::SendPayment {
                channel_id,
                amount,
                payment_hash,
                expiry,
                onion,
            } => {
                self.route(
                    channel_id,
                    Event::ExecuteCommand(Command::AddHtlc {
                        amount,
                        payment_hash,
                        expiry,
                        onion,
                        origin: Origin::Local,
                    }),
                )
                .await
            }
            PeerCommand::AddInvoice { amount, preimage } => {
                let payment_hash = Hash256(sha256(&preimage));
                self.invoices
                    .insert(payment_hash, Invoice { amount, preimage });
                let _ = self
                    .events
                    .send(PeerEvent::PaymentRequestGenerated {
                        payment_hash,
                        amount,
                    })
                    .await;
                Ok(())
            }
            PeerCommand::CloseChannel { channel_id } => {
                self.route(
                    channel_id,
                    Event::ExecuteCommand(Command::Close {
                        script_pubkey: None,
                    }),
                )
                .await
            }
            PeerCommand::WatchDelivery { channel_id, event } => {
                self.route(channel_id, Event::WatchReceived(event)).await
            }
            PeerCommand::BlockConnected { height } => {
                let channel_ids: Vec<ChannelId> = self.channels.keys().copied().collect();
                for channel_id in channel_ids {
                    self.route(channel_id, Event::NewBlock { height }).await?;
                }
                Ok(())
            }
            PeerCommand::Disconnect => Ok(()),
        }
    }

    // Runs one event (and any self-reentrant commands it spawns) through
    // a channel's machine, executing the resulting actions in order.
    async fn route(&mut self, channel_id: ChannelId, event: Event) -> Result<(), PeerError> {
        let Some(mut state) = self.channels.remove(&channel_id) else {
            log::warn!("no channel {}", channel_id);
            return Ok(());
        };
        let mut current_id = channel_id;

        let mut pending = std::collections::VecDeque::from([event]);
        let mut rounds = 0;
        while let Some(event) = pending.pop_front() {
            rounds += 1;
            if rounds > MAX_REENTRY {
                log::error!("channel {}: re-entry runaway, dropping events", current_id);
                break;
            }

            let (next, actions) = state.process(event, &self.key_manager);
            state = next;

            for action in actions {
                match action {
                    Action::StoreState => {
                        self.db.add_or_update_channel(current_id, &state)?;
                    }
                    Action::SendMessage(message) => {
                        self.send_message(message).await?;
                    }
                    Action::SendWatch(request) => match request {
                        channel_machine::WatchRequest::Confirmed { txid, min_depth } => {
                            self.watcher.watch_confirmed(current_id, txid, min_depth);
                        }
                        channel_machine::WatchRequest::Spent { txid, output_index } => {
                            self.watcher.watch_spent(current_id, txid, output_index);
                        }
                    },
                    Action::PublishTx(tx) => self.watcher.publish(tx),
                    Action::ProcessCommand(command) => {
                        pending.push_back(Event::ExecuteCommand(command));
                    }
                    Action::ChannelIdSwitch { old, new } => {
                        debug_assert_eq!(old, current_id);
                        self.db.remove_channel(old)?;
                        current_id = new;
                    }
                    Action::ProcessAdd(add) => {
                        let command = self.settle_incoming(&add);
                        pending.push_back(Event::ExecuteCommand(command));
                    }
                    Action::ProcessFulfill { origin, .. } => {
                        if matches!(origin, Some(Origin::Local) | None) {
                            let _ = self
                                .events
                                .send(PeerEvent::PaymentSent {
                                    channel_id: current_id,
                                })
                                .await;
                        }
                    }
                    Action::ProcessFail { origin, .. }
                    | Action::ProcessFailMalformed { origin, .. } => {
                        if matches!(origin, Some(Origin::Local) | None) {
                            let _ = self
                                .events
                                .send(PeerEvent::PaymentFailed {
                                    channel_id: current_id,
                                })
                                .await;
                        }
                    }
                    Action::CommandFailed(e) => {
                        log::warn!("channel {}: command rejected: {}", current_id, e);
                    }
                }
            }
        }

        self.channels.insert(current_id, state);
        self.snapshot().await;
        Ok(())
    }

    // An incoming HTLC reached irrevocability: pay an invoice we know,
    // fail everything else (this node does not relay).
    fn settle_incoming(&mut self, add: &wire::UpdateAddHtlc) -> Command {
        match self.invoices.get(&add.payment) {
            Some(invoice) if validate_received_amount(invoice.amount, add.amount) => {
                let preimage = invoice.preimage;
                let amount = invoice.amount;
                self.invoices.remove(&add.payment);
                // Best effort: listener queues are drained by the host.
                if let Err(e) = self.events.try_send(PeerEvent::PaymentReceived {
                    payment_hash: add.payment,
                    amount,
                }) {
                    log::warn!("listener queue full, dropping event: {}", e);
                }
                Command::FulfillHtlc {
                    id: add.id,
                    preimage,
                }
            }
            Some(_) => Command::FailHtlc {
                id: add.id,
                reason: b"incorrect payment amount".to_vec(),
            },
            None => Command::FailHtlc {
                id: add.id,
                reason: b"unknown payment hash".to_vec(),
            },
        }
    }

    async fn send_message(&mut self, message: Message) -> Result<(), PeerError> {
        let mut frame = BytesMut::new();
        self.machine.write(&message, &mut frame)?;
        self.transport.send(&frame, true).await?;
        Ok(())
    }

    async fn keepalive(&mut self) -> Result<(), PeerError> {
        if self.unanswered_pings >= 2 {
            return Err(PeerError::PeerUnresponsive);
        }
        self.unanswered_pings += 1;
        if let Ok(ping) = Ping::new(PING_PAD_BYTES, PING_PAD_BYTES) {
            self.send_message(Message::Ping(ping)).await?;
        }
        Ok(())
    }

    fn disconnect_channels(&mut self) {
        let channel_ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for channel_id in channel_ids {
            if let Some(state) = self.channels.remove(&channel_id) {
                let (state, _) = state.process(Event::Disconnected, &self.key_manager);
                if let Err(e) = self.db.add_or_update_channel(channel_id, &state) {
                    log::error!("cannot persist channel {} at disconnect: {}", channel_id, e);
                }
                self.channels.insert(channel_id, state);
            }
        }
    }

    async fn snapshot(&mut self) {
        let snapshot: Vec<(ChannelId, &'static str)> = self
            .channels
            .iter()
            .map(|(id, state)| (*id, state.phase()))
            .collect();
        if let Err(e) = self.events.try_send(PeerEvent::ChannelsSnapshot(snapshot)) {
            log::debug!("listener queue full, dropping snapshot: {}", e);
        }
    }
}

/// Runs the initiator side of the noise handshake over a transport.
pub async fn initiator_handshake<T: Transport>(
    transport: &mut T,
    local_secret: SecretKey,
    remote_public: PublicKey,
) -> Result<Machine, PeerError> {
    timeout(HANDSHAKE_TIMEOUT, async {
        let handshake = HandshakeNew::new(true, local_secret, remote_public)
            .map_err(HandshakeError::Crypto)?;
        let (act_one, handshake) = handshake.gen_act_one()?;
        transport.send(act_one.as_ref(), true).await?;

        let mut act_two = ActTwo::default();
        act_two
            .as_mut()
            .copy_from_slice(&transport.receive_fully(ActTwo::SIZE).await?);
        let handshake = handshake.recv_act_two(act_two)?;

        let (act_three, machine) = handshake.gen_act_three()?;
        transport.send(act_three.as_ref(), true).await?;
        Ok(machine)
    })
    .await
    .map_err(|_| PeerError::Transport(TransportIoError::Unknown("handshake timeout".into())))?
}

/// Runs the responder side of the noise handshake over a transport.
pub async fn responder_handshake<T: Transport>(
    transport: &mut T,
    local_secret: SecretKey,
) -> Result<Machine, PeerError> {
    timeout(HANDSHAKE_TIMEOUT, async {
        let local_public = PublicKey::from_secret_key(&Secp256k1::new(), &local_secret);
        let handshake = HandshakeNew::new(false, local_secret, local_public)
            .map_err(HandshakeError::Crypto)?;

        let mut act_one = ActOne::default();
        act_one
            .as_mut()
            .copy_from_slice(&transport.receive_fully(ActOne::SIZE).await?);
        let handshake = handshake.recv_act_one(act_one)?;

        let (act_two, handshake) = handshake.gen_act_two()?;
        transport.send(act_two.as_ref(), true).await?;

        let mut act_three = ActThree::default();
        act_three
            .as_mut()
            .copy_from_slice(&transport.receive_fully(ActThree::SIZE).await?);
        let machine = handshake.recv_act_three(act_three)?;
        Ok(machine)
    })
    .await
    .map_err(|_| PeerError::Transport(TransportIoError::Unknown("handshake timeout".into())))?
}
