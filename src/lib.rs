#![forbid(unsafe_code)]

//! fulgurd: a Lightning Network peer. The member crates hold the core —
//! `brontide` for the encrypted transport, `wire` for the message
//! catalogue, `channel` for the commitment ledger, `channel_machine` for
//! the per-channel lifecycle — while this crate drives them: one
//! cooperative task per peer, bounded queues in and out, and the
//! collaborator seams for the chain watcher and the channel store.

pub mod driver;
pub mod peer;

pub use self::driver::{
    ChannelsDb, DbError, LogWatcher, MemoryChannelsDb, StreamTransport, TcpTransport, Transport,
    TransportIoError, Watcher,
};
pub use self::peer::{
    initiator_handshake, responder_handshake, ConnectionStatus, Peer, PeerCommand, PeerError,
    PeerEvent, PeerHandle,
};
