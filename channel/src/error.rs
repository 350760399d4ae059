use std::{error, fmt};

use wire::{HtlcId, MilliSatoshi};

/// Failures of the commitment protocol operations.
///
/// Validation failures leave the ledger untouched and are safe to report
/// to the caller. The cryptographic ones are channel-fatal: the state
/// machine reacts by force-closing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChannelError {
    InsufficientFunds {
        missing: MilliSatoshi,
    },
    HtlcValueTooSmall {
        minimum: MilliSatoshi,
        actual: MilliSatoshi,
    },
    HtlcValueTooHighInFlight {
        maximum: MilliSatoshi,
    },
    ExpiryTooBig {
        maximum: u32,
        actual: u32,
    },
    TooManyAcceptedHtlcs {
        maximum: u16,
    },
    UnexpectedHtlcId {
        expected: HtlcId,
        actual: HtlcId,
    },
    UnknownHtlcId(HtlcId),
    InvalidHtlcPreimage(HtlcId),
    InvalidFailureCode(u16),
    CannotAffordFees {
        missing: MilliSatoshi,
    },
    FeeratePrecondition(&'static str),
    CannotSignWithoutChanges,
    CannotSignBeforeRevocation,
    /// The channel cannot take this command in its current lifecycle
    /// phase.
    ChannelUnavailable(&'static str),
    InvalidCommitmentSignature,
    InvalidHtlcSignature,
    HtlcSignatureCountMismatch {
        expected: usize,
        actual: usize,
    },
    InvalidRevocation,
    CommitmentSyncError(&'static str),
    /// A key tweak failed; with honest randomness this does not happen.
    Crypto(secp256k1::Error),
}

impl ChannelError {
    /// Whether the error condemns the channel (cryptographic faults
    /// force-close) or merely rejects the operation.
    pub fn is_fatal(&self) -> bool {
        use self::ChannelError::*;

        matches!(
            self,
            InvalidCommitmentSignature
                | InvalidHtlcSignature
                | HtlcSignatureCountMismatch { .. }
                | InvalidRevocation
                | CommitmentSyncError(_)
        )
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::ChannelError::*;

        match self {
            InsufficientFunds { missing } => {
                write!(f, "insufficient funds, missing {} msat", missing.0)
            }
            HtlcValueTooSmall { minimum, actual } => write!(
                f,
                "htlc value {} msat is below the minimum of {} msat",
                actual.0, minimum.0,
            ),
            HtlcValueTooHighInFlight { maximum } => write!(
                f,
                "in-flight htlc value would exceed the cap of {} msat",
                maximum.0,
            ),
            ExpiryTooBig { maximum, actual } => write!(
                f,
                "htlc expiry {} is beyond the maximum of {}",
                actual, maximum,
            ),
            TooManyAcceptedHtlcs { maximum } => {
                write!(f, "would exceed the cap of {} accepted htlcs", maximum)
            }
            UnexpectedHtlcId { expected, actual } => write!(
                f,
                "peer added htlc {} while the next id must be {}",
                actual, expected,
            ),
            UnknownHtlcId(id) => write!(f, "no settleable htlc with id {}", id),
            InvalidHtlcPreimage(id) => {
                write!(f, "preimage does not match the hash of htlc {}", id)
            }
            InvalidFailureCode(code) => {
                write!(f, "failure code {:#06x} lacks the BADONION bit", code)
            }
            CannotAffordFees { missing } => write!(
                f,
                "cannot afford the new commitment fee, missing {} msat",
                missing.0,
            ),
            FeeratePrecondition(what) => write!(f, "fee update rejected: {}", what),
            CannotSignWithoutChanges => write!(f, "nothing to sign"),
            CannotSignBeforeRevocation => {
                write!(f, "awaiting revocation of the previous commitment")
            }
            ChannelUnavailable(what) => write!(f, "channel unavailable: {}", what),
            InvalidCommitmentSignature => write!(f, "commitment signature does not verify"),
            InvalidHtlcSignature => write!(f, "an htlc signature does not verify"),
            HtlcSignatureCountMismatch { expected, actual } => write!(
                f,
                "commitment carries {} htlc signatures, {} outputs need one",
                actual, expected,
            ),
            InvalidRevocation => write!(f, "revealed secret contradicts the revoked commitment"),
            CommitmentSyncError(what) => write!(f, "commitment protocol out of sync: {}", what),
            Crypto(e) => write!(f, "crypto error: {}", e),
        }
    }
}

impl error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ChannelError::Crypto(e) => Some(e),
            _ => None,
        }
    }
}

impl From<secp256k1::Error> for ChannelError {
    fn from(e: secp256k1::Error) -> Self {
        ChannelError::Crypto(e)
    }
}
