//! The collaborator contracts the peer consumes: the byte transport under
//! the noise machine, the on-chain watcher, and the channel store. The
//! core never performs I/O itself; it goes through these seams.

use std::collections::BTreeMap;
use std::{error, fmt};

use bitcoin::{Transaction, Txid};
use channel_machine::ChannelState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use wire::ChannelId;

/// Transport-level failures. All of these are transient: the peer
/// reconnects after backoff and channel state survives them.
#[derive(Debug)]
pub enum TransportIoError {
    ConnectionRefused,
    ConnectionClosed,
    Unknown(String),
}

impl fmt::Display for TransportIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportIoError::ConnectionRefused => write!(f, "connection refused"),
            TransportIoError::ConnectionClosed => write!(f, "connection closed"),
            TransportIoError::Unknown(what) => write!(f, "transport error: {}", what),
        }
    }
}

impl error::Error for TransportIoError {}

impl From<std::io::Error> for TransportIoError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;

        match e.kind() {
            ConnectionRefused => TransportIoError::ConnectionRefused,
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => {
                TransportIoError::ConnectionClosed
            }
            _ => TransportIoError::Unknown(e.to_string()),
        }
    }
}

/// A byte pipe to one peer. The noise machine frames and encrypts above
/// this.
pub trait Transport {
    fn send(
        &mut self,
        bytes: &[u8],
        flush: bool,
    ) -> impl std::future::Future<Output = Result<(), TransportIoError>> + Send;

    fn receive_fully(
        &mut self,
        n: usize,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, TransportIoError>> + Send;

    /// Reads whatever is available, at most `max` bytes.
    fn receive_some(
        &mut self,
        max: usize,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, TransportIoError>> + Send;

    fn close(&mut self) -> impl std::future::Future<Output = ()> + Send;
}

/// `Transport` over any async byte stream; TCP in production, an
/// in-memory duplex in tests.
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        StreamTransport { stream }
    }
}

pub type TcpTransport = StreamTransport<TcpStream>;

impl<S> Transport for StreamTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, bytes: &[u8], flush: bool) -> Result<(), TransportIoError> {
        self.stream.write_all(bytes).await?;
        if flush {
            self.stream.flush().await?;
        }
        Ok(())
    }

    async fn receive_fully(&mut self, n: usize) -> Result<Vec<u8>, TransportIoError> {
        let mut buffer = vec![0; n];
        self.stream.read_exact(&mut buffer).await?;
        Ok(buffer)
    }

    async fn receive_some(&mut self, max: usize) -> Result<Vec<u8>, TransportIoError> {
        let mut buffer = vec![0; max];
        let n = self.stream.read(&mut buffer).await?;
        if n == 0 {
            return Err(TransportIoError::ConnectionClosed);
        }
        buffer.truncate(n);
        Ok(buffer)
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// On-chain collaborator: subscriptions for the channel machines and the
/// broadcast hand-off for the fully signed transactions the machines
/// decide to publish.
pub trait Watcher {
    fn watch_confirmed(&mut self, channel_id: ChannelId, txid: Txid, min_depth: u32);
    fn watch_spent(&mut self, channel_id: ChannelId, txid: Txid, output_index: u32);
    fn publish(&mut self, tx: Transaction);
}

/// A watcher that only records what it was asked; the daemon wires a real
/// chain backend here.
#[derive(Default)]
pub struct LogWatcher;

impl Watcher for LogWatcher {
    fn watch_confirmed(&mut self, channel_id: ChannelId, txid: Txid, min_depth: u32) {
        log::info!(
            "watch confirmed: channel {} txid {} depth {}",
            channel_id,
            txid,
            min_depth,
        );
    }

    fn watch_spent(&mut self, channel_id: ChannelId, txid: Txid, output_index: u32) {
        log::info!(
            "watch spent: channel {} outpoint {}:{}",
            channel_id,
            txid,
            output_index,
        );
    }

    fn publish(&mut self, tx: Transaction) {
        log::info!("publish requested: {}", tx.compute_txid());
    }
}

#[derive(Debug)]
pub struct DbError(pub String);

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "channels db error: {}", self.0)
    }
}

impl error::Error for DbError {}

/// Durable channel storage. `StoreState` actions must be acknowledged
/// here before the corresponding network message leaves the box.
pub trait ChannelsDb {
    fn add_or_update_channel(
        &mut self,
        channel_id: ChannelId,
        state: &ChannelState,
    ) -> Result<(), DbError>;

    fn list_local_channels(&self) -> Result<Vec<(ChannelId, ChannelState)>, DbError>;

    fn remove_channel(&mut self, channel_id: ChannelId) -> Result<(), DbError>;
}

/// In-memory store, for tests and throwaway nodes.
#[derive(Default)]
pub struct MemoryChannelsDb {
    channels: BTreeMap<ChannelId, ChannelState>,
}

impl ChannelsDb for MemoryChannelsDb {
    fn add_or_update_channel(
        &mut self,
        channel_id: ChannelId,
        state: &ChannelState,
    ) -> Result<(), DbError> {
        self.channels.insert(channel_id, state.clone());
        Ok(())
    }

    fn list_local_channels(&self) -> Result<Vec<(ChannelId, ChannelState)>, DbError> {
        Ok(self
            .channels
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect())
    }

    fn remove_channel(&mut self, channel_id: ChannelId) -> Result<(), DbError> {
        self.channels.remove(&channel_id);
        Ok(())
    }
}
