#![forbid(unsafe_code)]

//! The commitment ledger of a payment channel: balances, in-flight HTLCs,
//! pending change queues, commitment transactions, and the revocation
//! history. Operations are pure; each returns a successor ledger plus the
//! wire messages to emit.

pub mod bip69;
pub mod commit;
mod commitments;
pub mod derivation;
mod error;
mod keys;
mod params;
pub mod spec;
pub mod tools;

pub use self::commitments::{
    validate_received_amount, CmdAddHtlc, CommitInput, Commitments, Forward, LocalChanges,
    LocalCommit, Origin, RemoteChanges, RemoteCommit, RemoteNextCommitInfo,
    WaitingForRevocation, MAX_HTLC_EXPIRY_DELTA,
};
pub use self::error::ChannelError;
pub use self::keys::{KeyManager, MemoryKeyManager};
pub use self::params::{LocalParams, RemoteParams};
