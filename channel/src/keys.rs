//! The key-manager collaborator: derives the channel's key families and
//! signs commitment-level transactions. Pure with respect to channel
//! state; the ledger hands it digests, never transactions.

use secp256k1::ecdsa::Signature;
use secp256k1::{Error, Message, PublicKey, Secp256k1, SecretKey};
use shachain::RevocationProducer;
use wire::{ChannelKeys, RawPublicKey};

use crate::derivation::{derive_privkey, per_commitment_point};
use crate::tools::sha256;

pub trait KeyManager {
    /// The public funding key and basepoints announced when opening.
    fn channel_keys(&self) -> ChannelKeys;

    /// The per-commitment point for the n-th local commitment.
    fn commitment_point(&self, n: u64) -> Result<PublicKey, Error>;

    /// The per-commitment secret revealed when the n-th commitment is
    /// revoked.
    fn commitment_secret(&self, n: u64) -> Result<[u8; 32], Error>;

    /// Signs a commitment transaction digest with the funding key.
    fn sign_funding(&self, digest: [u8; 32]) -> Signature;

    /// Signs a second-level HTLC transaction digest with the htlc key
    /// tweaked by the given per-commitment point.
    fn sign_htlc(&self, digest: [u8; 32], per_commitment_point: &PublicKey)
        -> Result<Signature, Error>;
}

/// A key manager holding its secrets in memory, every family derived
/// deterministically from one 32-byte node-scoped seed.
#[derive(Clone)]
pub struct MemoryKeyManager {
    funding: SecretKey,
    revocation_base: SecretKey,
    payment_base: SecretKey,
    delayed_payment_base: SecretKey,
    htlc_base: SecretKey,
    producer: RevocationProducer,
}

impl MemoryKeyManager {
    pub fn from_seed(seed: [u8; 32]) -> Result<Self, Error> {
        let family = |label: &[u8]| -> Result<SecretKey, Error> {
            SecretKey::from_slice(&sha256(&[&seed[..], label].concat()))
        };

        Ok(MemoryKeyManager {
            funding: family(b"funding")?,
            revocation_base: family(b"revocation")?,
            payment_base: family(b"payment")?,
            delayed_payment_base: family(b"delayed_payment")?,
            htlc_base: family(b"htlc")?,
            producer: RevocationProducer::new(sha256(&[&seed[..], &b"shachain"[..]].concat())),
        })
    }

    fn public(&self, sk: &SecretKey) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), sk)
    }
}

impl KeyManager for MemoryKeyManager {
    fn channel_keys(&self) -> ChannelKeys {
        let first = self
            .commitment_point(0)
            .expect("the shachain root derives every point");
        ChannelKeys {
            funding: RawPublicKey(self.public(&self.funding)),
            revocation: RawPublicKey(self.public(&self.revocation_base)),
            payment: RawPublicKey(self.public(&self.payment_base)),
            delayed_payment: RawPublicKey(self.public(&self.delayed_payment_base)),
            htlc: RawPublicKey(self.public(&self.htlc_base)),
            first_per_commitment: RawPublicKey(first),
        }
    }

    fn commitment_point(&self, n: u64) -> Result<PublicKey, Error> {
        let secret = self.commitment_secret(n)?;
        per_commitment_point(&secret)
    }

    fn commitment_secret(&self, n: u64) -> Result<[u8; 32], Error> {
        self.producer
            .at_index(n)
            .map_err(|_| Error::InvalidSecretKey)
    }

    fn sign_funding(&self, digest: [u8; 32]) -> Signature {
        let secp = Secp256k1::new();
        secp.sign_ecdsa(&Message::from_digest(digest), &self.funding)
    }

    fn sign_htlc(
        &self,
        digest: [u8; 32],
        per_commitment_point: &PublicKey,
    ) -> Result<Signature, Error> {
        let htlc_sk = derive_privkey(&self.htlc_base, per_commitment_point)?;
        let secp = Secp256k1::new();
        Ok(secp.sign_ecdsa(&Message::from_digest(digest), &htlc_sk))
    }
}
