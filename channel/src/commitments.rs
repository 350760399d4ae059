//! The commitment ledger: both commitment transactions of a channel, the
//! pending-change queues between them, and the pure operations of the
//! BOLT #2 update protocol. Every operation returns a successor value;
//! validation failures leave the ledger untouched.

use std::collections::BTreeMap;

use bitcoin::hashes::Hash as _;
use bitcoin::{Transaction, Txid};
use secp256k1::{Message, PublicKey, Secp256k1};
use shachain::{Index as ChainIndex, RevocationStore};
use wire::{
    ChannelFlags, ChannelId, CommitmentSigned, Hash256, HtlcId, MilliSatoshi, OnionBlob,
    RawPublicKey, RawSignature, RevokeAndAck, Satoshi, SatoshiPerKiloWeight, UpdateAddHtlc,
    UpdateFailHtlc, UpdateFailMalformedHtlc, UpdateFee, UpdateFulfillHtlc,
    FAILURE_CODE_BADONION,
};

use crate::commit::CommitTx;
use crate::derivation::{derive_pubkey, derive_revocation_pubkey, per_commitment_point};
use crate::error::ChannelError;
use crate::keys::KeyManager;
use crate::params::{LocalParams, RemoteParams};
use crate::spec::{htlc_output_fee_msat, Change, CommitmentSpec, Direction, DirectedHtlc};
use crate::tools::{get_obscuring_number, sha256, spending_witness_2x2_multisig};

/// An offered HTLC must expire within this many blocks.
pub const MAX_HTLC_EXPIRY_DELTA: u32 = 2016;

/// A host request to offer an HTLC.
#[derive(Clone, Debug)]
pub struct CmdAddHtlc {
    pub amount: MilliSatoshi,
    pub payment_hash: Hash256,
    pub expiry: u32,
    pub onion: OnionBlob,
}

/// Where an outgoing HTLC came from, so its settlement can be routed back.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Origin {
    /// We initiated the payment.
    Local,
    /// Relayed from another channel.
    Relayed {
        original_channel_id: ChannelId,
        original_htlc_id: HtlcId,
        amount_in: MilliSatoshi,
    },
}

/// Effects of an irrevocably committed remote change, for the upstream
/// layer to act on.
#[derive(Clone, Debug)]
pub enum Forward {
    /// An incoming HTLC is now committed on both sides.
    Add(UpdateAddHtlc),
    Fail {
        fail: UpdateFailHtlc,
        origin: Option<Origin>,
    },
    FailMalformed {
        fail: UpdateFailMalformedHtlc,
        origin: Option<Origin>,
    },
}

#[derive(Clone, Debug)]
pub struct LocalCommit {
    pub index: u64,
    pub spec: CommitmentSpec,
    pub txid: Txid,
    /// The counterparty's signature over this commitment. Without it the
    /// 2-of-2 witness cannot be assembled, so it is kept for as long as
    /// the commitment is publishable.
    pub remote_signature: Option<RawSignature>,
    /// Their signatures over the second-level HTLC transactions, in
    /// commitment output order.
    pub remote_htlc_signatures: Vec<RawSignature>,
}

#[derive(Clone, Debug)]
pub struct RemoteCommit {
    pub index: u64,
    pub spec: CommitmentSpec,
    pub txid: Txid,
    pub remote_per_commitment_point: PublicKey,
}

/// Our changes travel proposed → signed (covered by a commit we sent) →
/// acked (the remote revoked the commitment without them).
#[derive(Clone, Debug, Default)]
pub struct LocalChanges {
    pub proposed: Vec<Change>,
    pub signed: Vec<Change>,
    pub acked: Vec<Change>,
}

impl LocalChanges {
    pub fn all(&self) -> Vec<Change> {
        let mut all = self.proposed.clone();
        all.extend_from_slice(&self.signed);
        all.extend_from_slice(&self.acked);
        all
    }

    fn iter_all(&self) -> impl Iterator<Item = &Change> {
        self.proposed
            .iter()
            .chain(self.signed.iter())
            .chain(self.acked.iter())
    }
}

/// Remote changes travel proposed → acked (we signed a commitment with
/// them) → signed (we signed their inclusion into our counterparty's
/// commitment).
#[derive(Clone, Debug, Default)]
pub struct RemoteChanges {
    pub proposed: Vec<Change>,
    pub acked: Vec<Change>,
    pub signed: Vec<Change>,
}

impl RemoteChanges {
    pub fn all(&self) -> Vec<Change> {
        let mut all = self.proposed.clone();
        all.extend_from_slice(&self.acked);
        all.extend_from_slice(&self.signed);
        all
    }

    fn iter_all(&self) -> impl Iterator<Item = &Change> {
        self.proposed
            .iter()
            .chain(self.acked.iter())
            .chain(self.signed.iter())
    }
}

/// A commitment we signed for the remote and whose predecessor they have
/// not yet revoked.
#[derive(Clone, Debug)]
pub struct WaitingForRevocation {
    pub next_remote_commit: RemoteCommit,
    pub sent: CommitmentSigned,
    pub sent_after_local_commit_index: u64,
}

#[derive(Clone, Debug)]
pub enum RemoteNextCommitInfo {
    /// A signed commitment is in flight; no new signature until the
    /// revocation arrives.
    Waiting(Box<WaitingForRevocation>),
    /// The per-commitment point the next remote commitment will use.
    Revoked(PublicKey),
}

/// The funding outpoint both commitment transactions spend.
#[derive(Clone, Debug)]
pub struct CommitInput {
    pub txid: Txid,
    pub output_index: u32,
    pub amount: Satoshi,
}

/// The complete per-channel commitment state.
#[derive(Clone, Debug)]
pub struct Commitments {
    pub local_params: LocalParams,
    pub remote_params: RemoteParams,
    pub channel_flags: ChannelFlags,
    pub local_commit: LocalCommit,
    pub remote_commit: RemoteCommit,
    pub local_changes: LocalChanges,
    pub remote_changes: RemoteChanges,
    pub local_next_htlc_id: HtlcId,
    pub remote_next_htlc_id: HtlcId,
    pub origin_map: BTreeMap<HtlcId, Origin>,
    pub remote_next_commit_info: RemoteNextCommitInfo,
    pub commit_input: CommitInput,
    pub remote_per_commitment_secrets: RevocationStore,
    pub channel_id: ChannelId,
    pub obscuring_factor: u64,
}

impl Commitments {
    /// Builds the ledger for a freshly funded channel: both sides'
    /// index-0 commitments derived from the funding amount and the
    /// pushed balance.
    #[allow(clippy::too_many_arguments)]
    pub fn initial(
        channel_id: ChannelId,
        local_params: LocalParams,
        remote_params: RemoteParams,
        channel_flags: ChannelFlags,
        commit_input: CommitInput,
        push: MilliSatoshi,
        feerate: SatoshiPerKiloWeight,
    ) -> Result<Commitments, ChannelError> {
        let capacity = commit_input.amount.to_msat();
        let (to_local, to_remote) = if local_params.is_funder {
            (capacity - push, push)
        } else {
            (push, capacity - push)
        };

        let (funder_payment, fundee_payment) = if local_params.is_funder {
            (local_params.keys.payment, remote_params.keys.payment)
        } else {
            (remote_params.keys.payment, local_params.keys.payment)
        };
        let obscuring_factor = get_obscuring_number(
            &funder_payment.serialize(),
            &fundee_payment.serialize(),
        );

        let local_spec = CommitmentSpec::new(feerate, to_local, to_remote);
        let remote_spec = CommitmentSpec::new(feerate, to_remote, to_local);

        let mut commitments = Commitments {
            channel_id,
            channel_flags,
            local_commit: LocalCommit {
                index: 0,
                spec: local_spec,
                txid: Txid::all_zeros(),
                remote_signature: None,
                remote_htlc_signatures: Vec::new(),
            },
            remote_commit: RemoteCommit {
                index: 0,
                spec: remote_spec,
                txid: Txid::all_zeros(),
                remote_per_commitment_point: remote_params.keys.first_per_commitment.0,
            },
            local_changes: LocalChanges::default(),
            remote_changes: RemoteChanges::default(),
            local_next_htlc_id: HtlcId(0),
            remote_next_htlc_id: HtlcId(0),
            origin_map: BTreeMap::new(),
            remote_next_commit_info: RemoteNextCommitInfo::Revoked(
                remote_params.keys.first_per_commitment.0,
            ),
            commit_input,
            remote_per_commitment_secrets: RevocationStore::new(),
            obscuring_factor,
            local_params,
            remote_params,
        };

        let local_point = commitments.local_params.keys.first_per_commitment.0;
        let local_tx =
            commitments.local_commit_tx(&commitments.local_commit.spec, 0, &local_point)?;
        commitments.local_commit.txid = local_tx.build().txid();

        let remote_point = commitments.remote_commit.remote_per_commitment_point;
        let remote_tx =
            commitments.remote_commit_tx(&commitments.remote_commit.spec, 0, &remote_point)?;
        commitments.remote_commit.txid = remote_tx.build().txid();

        Ok(commitments)
    }

    /// Signature over the remote's initial commitment, for
    /// `funding_created` / `funding_signed`.
    pub fn sign_initial_remote_commit(
        &self,
        key_manager: &impl KeyManager,
    ) -> Result<RawSignature, ChannelError> {
        let point = self.remote_params.keys.first_per_commitment.0;
        let tx = self.remote_commit_tx(&self.remote_commit.spec, 0, &point)?;
        let built = tx.build();
        Ok(RawSignature(key_manager.sign_funding(tx.sighash(&built))))
    }

    /// Verifies the counterparty's signature over our initial commitment
    /// and retains it; the commitment is unpublishable without it.
    pub fn accept_initial_local_commit(
        &self,
        signature: &RawSignature,
    ) -> Result<Commitments, ChannelError> {
        let point = self.local_params.keys.first_per_commitment.0;
        let tx = self.local_commit_tx(&self.local_commit.spec, 0, &point)?;
        let built = tx.build();
        if !tx.verify(&built, &self.remote_params.keys.funding.0, &signature.0) {
            return Err(ChannelError::InvalidCommitmentSignature);
        }

        let mut next = self.clone();
        next.local_commit.remote_signature = Some(*signature);
        Ok(next)
    }

    /// Assembles the current local commitment with its complete 2-of-2
    /// witness, ready for broadcast on a force close.
    pub fn signed_local_commit_tx(
        &self,
        key_manager: &impl KeyManager,
    ) -> Result<Transaction, ChannelError> {
        let remote_signature = self
            .local_commit
            .remote_signature
            .ok_or(ChannelError::ChannelUnavailable(
                "no counterparty signature for the local commitment",
            ))?;

        let point = key_manager.commitment_point(self.local_commit.index)?;
        let tx = self.local_commit_tx(&self.local_commit.spec, self.local_commit.index, &point)?;
        let built = tx.build();
        let local_signature = key_manager.sign_funding(tx.sighash(&built));

        let mut transaction = built.tx;
        transaction.input[0].witness = spending_witness_2x2_multisig(
            &self.local_params.keys.funding.0,
            &self.remote_params.keys.funding.0,
            &local_signature,
            &remote_signature.0,
        );
        Ok(transaction)
    }

    pub fn local_has_changes(&self) -> bool {
        !self.remote_changes.acked.is_empty() || !self.local_changes.proposed.is_empty()
    }

    pub fn remote_has_changes(&self) -> bool {
        !self.local_changes.acked.is_empty() || !self.remote_changes.proposed.is_empty()
    }

    /// How much more the local side can lock into a new HTLC (spec-level
    /// projection with every pending local change applied).
    pub fn available_balance_for_send(&self) -> MilliSatoshi {
        let reduced = self
            .local_commit
            .spec
            .reduce(&self.local_changes.all(), &self.remote_changes.acked);

        if reduced.directed_count(Direction::Outgoing)
            >= usize::from(self.remote_params.max_accepted_htlcs)
        {
            return MilliSatoshi(0);
        }

        let reserve = self.remote_params.channel_reserve.to_msat();
        let fees = if self.local_params.is_funder {
            let delta = htlc_output_fee_msat(reduced.feerate);
            reduced.commit_tx_fee_msat(self.local_params.dust_limit, 1) + delta + delta
        } else {
            MilliSatoshi(0)
        };

        let available = reduced
            .to_local
            .saturating_sub(reserve)
            .saturating_sub(fees);

        let in_flight = reduced.directed_value_in_flight(Direction::Outgoing);
        let value_room = self
            .remote_params
            .max_htlc_value_in_flight
            .saturating_sub(in_flight);
        available.min(value_room)
    }

    /// How much the remote side can still send our way.
    pub fn available_balance_for_receive(&self) -> MilliSatoshi {
        let reduced = self
            .local_commit
            .spec
            .reduce(&self.local_changes.acked, &self.remote_changes.all());

        if reduced.directed_count(Direction::Incoming)
            >= usize::from(self.local_params.max_accepted_htlcs)
        {
            return MilliSatoshi(0);
        }

        let reserve = self.local_params.channel_reserve.to_msat();
        let fees = if self.local_params.is_funder {
            MilliSatoshi(0)
        } else {
            let delta = htlc_output_fee_msat(reduced.feerate);
            reduced.commit_tx_fee_msat(self.local_params.dust_limit, 1) + delta + delta
        };

        let available = reduced
            .to_remote
            .saturating_sub(reserve)
            .saturating_sub(fees);

        let in_flight = reduced.directed_value_in_flight(Direction::Incoming);
        let value_room = self
            .local_params
            .max_htlc_value_in_flight
            .saturating_sub(in_flight);
        available.min(value_room)
    }

    /// Offers a new HTLC, validated against the projected remote
    /// commitment.
    pub fn send_add(
        &self,
        cmd: CmdAddHtlc,
        origin: Origin,
        current_height: u32,
    ) -> Result<(Commitments, UpdateAddHtlc), ChannelError> {
        let maximum = current_height + MAX_HTLC_EXPIRY_DELTA;
        if cmd.expiry > maximum {
            return Err(ChannelError::ExpiryTooBig {
                maximum,
                actual: cmd.expiry,
            });
        }
        if cmd.amount < self.remote_params.htlc_minimum {
            return Err(ChannelError::HtlcValueTooSmall {
                minimum: self.remote_params.htlc_minimum,
                actual: cmd.amount,
            });
        }

        let add = UpdateAddHtlc {
            channel_id: self.channel_id,
            id: self.local_next_htlc_id,
            amount: cmd.amount,
            payment: cmd.payment_hash,
            expiry: cmd.expiry,
            onion_blob: cmd.onion,
        };

        // The remote's view with everything already pending, the new HTLC
        // accounted for separately so the arithmetic stays unsigned.
        let reduced = self
            .remote_commit
            .spec
            .reduce(&self.remote_changes.acked, &self.local_changes.proposed);

        let outgoing_count = reduced.directed_count(Direction::Incoming) + 1;
        if outgoing_count > usize::from(self.remote_params.max_accepted_htlcs) {
            return Err(ChannelError::TooManyAcceptedHtlcs {
                maximum: self.remote_params.max_accepted_htlcs,
            });
        }

        let in_flight = reduced.directed_value_in_flight(Direction::Incoming) + cmd.amount;
        if in_flight > self.remote_params.max_htlc_value_in_flight {
            return Err(ChannelError::HtlcValueTooHighInFlight {
                maximum: self.remote_params.max_htlc_value_in_flight,
            });
        }

        let new_untrimmed = !DirectedHtlc {
            direction: Direction::Incoming,
            add: add.clone(),
        }
        .is_trimmed(self.remote_params.dust_limit, reduced.feerate);
        let fees = if self.local_params.is_funder {
            let delta = htlc_output_fee_msat(reduced.feerate);
            reduced.commit_tx_fee_msat(self.remote_params.dust_limit, usize::from(new_untrimmed))
                + delta
                + delta
        } else {
            MilliSatoshi(0)
        };

        let missing = i128::from(reduced.to_remote.0)
            - i128::from(cmd.amount.0)
            - i128::from(self.remote_params.channel_reserve.to_msat().0)
            - i128::from(fees.0);
        if missing < 0 {
            return Err(ChannelError::InsufficientFunds {
                missing: MilliSatoshi((-missing) as u64),
            });
        }

        let mut next = self.clone();
        next.local_changes.proposed.push(Change::Add(add.clone()));
        next.local_next_htlc_id = self.local_next_htlc_id.next();
        next.origin_map.insert(add.id, origin);
        Ok((next, add))
    }

    /// Accepts a peer-offered HTLC, validated against the projected local
    /// commitment.
    pub fn receive_add(&self, add: UpdateAddHtlc) -> Result<Commitments, ChannelError> {
        if add.id != self.remote_next_htlc_id {
            return Err(ChannelError::UnexpectedHtlcId {
                expected: self.remote_next_htlc_id,
                actual: add.id,
            });
        }
        if add.amount < self.local_params.htlc_minimum {
            return Err(ChannelError::HtlcValueTooSmall {
                minimum: self.local_params.htlc_minimum,
                actual: add.amount,
            });
        }

        let reduced = self
            .local_commit
            .spec
            .reduce(&self.local_changes.acked, &self.remote_changes.proposed);

        let incoming_count = reduced.directed_count(Direction::Incoming) + 1;
        if incoming_count > usize::from(self.local_params.max_accepted_htlcs) {
            return Err(ChannelError::TooManyAcceptedHtlcs {
                maximum: self.local_params.max_accepted_htlcs,
            });
        }

        let in_flight = reduced.directed_value_in_flight(Direction::Incoming) + add.amount;
        if in_flight > self.local_params.max_htlc_value_in_flight {
            return Err(ChannelError::HtlcValueTooHighInFlight {
                maximum: self.local_params.max_htlc_value_in_flight,
            });
        }

        let new_untrimmed = !DirectedHtlc {
            direction: Direction::Incoming,
            add: add.clone(),
        }
        .is_trimmed(self.local_params.dust_limit, reduced.feerate);
        // The funder pays the commit fee; only burden the sender if the
        // sender funds the channel.
        let fees = if self.local_params.is_funder {
            MilliSatoshi(0)
        } else {
            reduced.commit_tx_fee_msat(self.local_params.dust_limit, usize::from(new_untrimmed))
        };

        let missing = i128::from(reduced.to_remote.0)
            - i128::from(add.amount.0)
            - i128::from(self.local_params.channel_reserve.to_msat().0)
            - i128::from(fees.0);
        if missing < 0 {
            return Err(ChannelError::InsufficientFunds {
                missing: MilliSatoshi((-missing) as u64),
            });
        }

        let mut next = self.clone();
        next.remote_changes.proposed.push(Change::Add(add));
        next.remote_next_htlc_id = self.remote_next_htlc_id.next();
        Ok(next)
    }

    // An HTLC can only be settled while it is present in both commitments.
    fn remote_spec_for_lookup(&self) -> &CommitmentSpec {
        match &self.remote_next_commit_info {
            RemoteNextCommitInfo::Waiting(waiting) => &waiting.next_remote_commit.spec,
            RemoteNextCommitInfo::Revoked(_) => &self.remote_commit.spec,
        }
    }

    fn incoming_htlc_cross_signed(&self, id: HtlcId) -> Option<&UpdateAddHtlc> {
        let local = self.local_commit.spec.find(Direction::Incoming, id)?;
        self.remote_spec_for_lookup().find(Direction::Outgoing, id)?;
        Some(&local.add)
    }

    fn outgoing_htlc_cross_signed(&self, id: HtlcId) -> Option<&UpdateAddHtlc> {
        let local = self.local_commit.spec.find(Direction::Outgoing, id)?;
        self.remote_spec_for_lookup().find(Direction::Incoming, id)?;
        Some(&local.add)
    }

    fn local_settlement_pending(&self, id: HtlcId) -> bool {
        self.local_changes.iter_all().any(|c| match c {
            Change::Fulfill(m) => m.id == id,
            Change::Fail(m) => m.id == id,
            Change::FailMalformed(m) => m.id == id,
            _ => false,
        })
    }

    fn remote_settlement_pending(&self, id: HtlcId) -> bool {
        self.remote_changes.iter_all().any(|c| match c {
            Change::Fulfill(m) => m.id == id,
            Change::Fail(m) => m.id == id,
            Change::FailMalformed(m) => m.id == id,
            _ => false,
        })
    }

    /// Settles an incoming HTLC with its preimage.
    pub fn send_fulfill(
        &self,
        id: HtlcId,
        payment_preimage: [u8; 32],
    ) -> Result<(Commitments, UpdateFulfillHtlc), ChannelError> {
        let htlc = self
            .incoming_htlc_cross_signed(id)
            .ok_or(ChannelError::UnknownHtlcId(id))?;
        if self.local_settlement_pending(id) {
            return Err(ChannelError::UnknownHtlcId(id));
        }
        if sha256(&payment_preimage) != htlc.payment.0 {
            return Err(ChannelError::InvalidHtlcPreimage(id));
        }

        let fulfill = UpdateFulfillHtlc {
            channel_id: self.channel_id,
            id,
            payment_preimage,
        };
        let mut next = self.clone();
        next.local_changes.proposed.push(Change::Fulfill(fulfill.clone()));
        Ok((next, fulfill))
    }

    /// The peer settled one of our offered HTLCs; returns the origin so
    /// the preimage propagates upstream right away.
    pub fn receive_fulfill(
        &self,
        fulfill: UpdateFulfillHtlc,
    ) -> Result<(Commitments, Option<Origin>), ChannelError> {
        let htlc = self
            .outgoing_htlc_cross_signed(fulfill.id)
            .ok_or(ChannelError::UnknownHtlcId(fulfill.id))?;
        if self.remote_settlement_pending(fulfill.id) {
            return Err(ChannelError::UnknownHtlcId(fulfill.id));
        }
        if sha256(&fulfill.payment_preimage) != htlc.payment.0 {
            return Err(ChannelError::InvalidHtlcPreimage(fulfill.id));
        }

        let origin = self.origin_map.get(&fulfill.id).cloned();
        let mut next = self.clone();
        next.remote_changes.proposed.push(Change::Fulfill(fulfill));
        Ok((next, origin))
    }

    /// Fails an incoming HTLC back to its offerer.
    pub fn send_fail(
        &self,
        id: HtlcId,
        reason: Vec<u8>,
    ) -> Result<(Commitments, UpdateFailHtlc), ChannelError> {
        self.incoming_htlc_cross_signed(id)
            .ok_or(ChannelError::UnknownHtlcId(id))?;
        if self.local_settlement_pending(id) {
            return Err(ChannelError::UnknownHtlcId(id));
        }

        let fail = UpdateFailHtlc {
            channel_id: self.channel_id,
            id,
            reason,
        };
        let mut next = self.clone();
        next.local_changes.proposed.push(Change::Fail(fail.clone()));
        Ok((next, fail))
    }

    /// Reports an incoming HTLC whose onion we could not parse.
    pub fn send_fail_malformed(
        &self,
        id: HtlcId,
        sha256_of_onion: Hash256,
        failure_code: u16,
    ) -> Result<(Commitments, UpdateFailMalformedHtlc), ChannelError> {
        if failure_code & FAILURE_CODE_BADONION == 0 {
            return Err(ChannelError::InvalidFailureCode(failure_code));
        }
        self.incoming_htlc_cross_signed(id)
            .ok_or(ChannelError::UnknownHtlcId(id))?;
        if self.local_settlement_pending(id) {
            return Err(ChannelError::UnknownHtlcId(id));
        }

        let fail = UpdateFailMalformedHtlc {
            channel_id: self.channel_id,
            id,
            sha256_of_onion,
            failure_code,
        };
        let mut next = self.clone();
        next.local_changes
            .proposed
            .push(Change::FailMalformed(fail.clone()));
        Ok((next, fail))
    }

    pub fn receive_fail(&self, fail: UpdateFailHtlc) -> Result<Commitments, ChannelError> {
        self.outgoing_htlc_cross_signed(fail.id)
            .ok_or(ChannelError::UnknownHtlcId(fail.id))?;
        if self.remote_settlement_pending(fail.id) {
            return Err(ChannelError::UnknownHtlcId(fail.id));
        }

        let mut next = self.clone();
        next.remote_changes.proposed.push(Change::Fail(fail));
        Ok(next)
    }

    pub fn receive_fail_malformed(
        &self,
        fail: UpdateFailMalformedHtlc,
    ) -> Result<Commitments, ChannelError> {
        if fail.failure_code & FAILURE_CODE_BADONION == 0 {
            return Err(ChannelError::InvalidFailureCode(fail.failure_code));
        }
        self.outgoing_htlc_cross_signed(fail.id)
            .ok_or(ChannelError::UnknownHtlcId(fail.id))?;
        if self.remote_settlement_pending(fail.id) {
            return Err(ChannelError::UnknownHtlcId(fail.id));
        }

        let mut next = self.clone();
        next.remote_changes.proposed.push(Change::FailMalformed(fail));
        Ok(next)
    }

    /// Proposes a new commitment fee rate. Funder only; the funder must
    /// still afford the fee at the new rate.
    pub fn send_fee(
        &self,
        fee: SatoshiPerKiloWeight,
    ) -> Result<(Commitments, UpdateFee), ChannelError> {
        if !self.local_params.is_funder {
            return Err(ChannelError::FeeratePrecondition(
                "only the funder changes the fee",
            ));
        }
        if fee.0 == 0 {
            return Err(ChannelError::FeeratePrecondition("feerate must be positive"));
        }

        let update = UpdateFee {
            channel_id: self.channel_id,
            fee,
        };
        let mut changes = self.local_changes.proposed.clone();
        changes.push(Change::Fee(update.clone()));
        let reduced = self
            .remote_commit
            .spec
            .reduce(&self.remote_changes.acked, &changes);

        let fees = reduced.commit_tx_fee_msat(self.remote_params.dust_limit, 0);
        let missing = i128::from(reduced.to_remote.0)
            - i128::from(self.remote_params.channel_reserve.to_msat().0)
            - i128::from(fees.0);
        if missing < 0 {
            return Err(ChannelError::CannotAffordFees {
                missing: MilliSatoshi((-missing) as u64),
            });
        }

        let mut next = self.clone();
        next.local_changes.proposed.push(Change::Fee(update.clone()));
        Ok((next, update))
    }

    pub fn receive_fee(&self, update: UpdateFee) -> Result<Commitments, ChannelError> {
        if self.local_params.is_funder {
            return Err(ChannelError::FeeratePrecondition(
                "the non-funder cannot change the fee",
            ));
        }
        if update.fee.0 == 0 {
            return Err(ChannelError::FeeratePrecondition("feerate must be positive"));
        }

        let mut changes = self.remote_changes.proposed.clone();
        changes.push(Change::Fee(update.clone()));
        let reduced = self
            .local_commit
            .spec
            .reduce(&self.local_changes.acked, &changes);

        let fees = reduced.commit_tx_fee_msat(self.local_params.dust_limit, 0);
        let missing = i128::from(reduced.to_remote.0)
            - i128::from(self.local_params.channel_reserve.to_msat().0)
            - i128::from(fees.0);
        if missing < 0 {
            return Err(ChannelError::CannotAffordFees {
                missing: MilliSatoshi((-missing) as u64),
            });
        }

        let mut next = self.clone();
        next.remote_changes.proposed.push(Change::Fee(update));
        Ok(next)
    }

    /// Signs the remote's next commitment over everything we proposed and
    /// everything of theirs we acked.
    pub fn send_commit(
        &self,
        key_manager: &impl KeyManager,
    ) -> Result<(Commitments, CommitmentSigned), ChannelError> {
        let remote_next_point = match &self.remote_next_commit_info {
            RemoteNextCommitInfo::Waiting(_) => {
                return Err(ChannelError::CannotSignBeforeRevocation)
            }
            RemoteNextCommitInfo::Revoked(point) => *point,
        };
        if !self.local_has_changes() {
            return Err(ChannelError::CannotSignWithoutChanges);
        }

        let spec = self
            .remote_commit
            .spec
            .reduce(&self.remote_changes.acked, &self.local_changes.proposed);
        let index = self.remote_commit.index + 1;
        let tx = self.remote_commit_tx(&spec, index, &remote_next_point)?;
        let built = tx.build();

        let signature = RawSignature(key_manager.sign_funding(tx.sighash(&built)));
        let mut htlc_signatures = Vec::new();
        for (digest, _) in tx.htlc_sighashes(&built) {
            htlc_signatures.push(RawSignature(
                key_manager.sign_htlc(digest, &remote_next_point)?,
            ));
        }

        let commit_sig = CommitmentSigned {
            channel_id: self.channel_id,
            signature,
            htlc_signatures,
        };

        let mut next = self.clone();
        next.local_changes = LocalChanges {
            proposed: Vec::new(),
            signed: self.local_changes.proposed.clone(),
            acked: self.local_changes.acked.clone(),
        };
        next.remote_changes = RemoteChanges {
            proposed: self.remote_changes.proposed.clone(),
            acked: Vec::new(),
            signed: self.remote_changes.acked.clone(),
        };
        next.remote_next_commit_info =
            RemoteNextCommitInfo::Waiting(Box::new(WaitingForRevocation {
                next_remote_commit: RemoteCommit {
                    index,
                    spec,
                    txid: built.txid(),
                    remote_per_commitment_point: remote_next_point,
                },
                sent: commit_sig.clone(),
                sent_after_local_commit_index: self.local_commit.index,
            }));

        Ok((next, commit_sig))
    }

    /// Verifies a received signature over our next commitment, advances
    /// the local commit and answers with the revocation of the previous
    /// one.
    pub fn receive_commit(
        &self,
        commit: CommitmentSigned,
        key_manager: &impl KeyManager,
    ) -> Result<(Commitments, RevokeAndAck), ChannelError> {
        if !self.remote_has_changes() {
            return Err(ChannelError::CannotSignWithoutChanges);
        }

        let spec = self
            .local_commit
            .spec
            .reduce(&self.local_changes.acked, &self.remote_changes.proposed);
        let index = self.local_commit.index + 1;
        let local_next_point = key_manager.commitment_point(index)?;
        let tx = self.local_commit_tx(&spec, index, &local_next_point)?;
        let built = tx.build();

        if !tx.verify(&built, &self.remote_params.keys.funding.0, &commit.signature.0) {
            return Err(ChannelError::InvalidCommitmentSignature);
        }

        let htlc_sighashes = tx.htlc_sighashes(&built);
        if htlc_sighashes.len() != commit.htlc_signatures.len() {
            return Err(ChannelError::HtlcSignatureCountMismatch {
                expected: htlc_sighashes.len(),
                actual: commit.htlc_signatures.len(),
            });
        }
        let secp = Secp256k1::new();
        for ((digest, _), signature) in htlc_sighashes.iter().zip(&commit.htlc_signatures) {
            if secp
                .verify_ecdsa(
                    &Message::from_digest(*digest),
                    &signature.0,
                    &tx.remote_htlc_pubkey,
                )
                .is_err()
            {
                return Err(ChannelError::InvalidHtlcSignature);
            }
        }

        // Revoking the current commitment reveals its secret and commits
        // to the point two steps ahead.
        let revocation_preimage = key_manager.commitment_secret(self.local_commit.index)?;
        let next_point_after = key_manager.commitment_point(self.local_commit.index + 2)?;
        let revocation = RevokeAndAck {
            channel_id: self.channel_id,
            revocation_preimage,
            next_per_commitment_point: RawPublicKey(next_point_after),
        };

        let mut next = self.clone();
        next.local_commit = LocalCommit {
            index,
            spec,
            txid: built.txid(),
            remote_signature: Some(commit.signature),
            remote_htlc_signatures: commit.htlc_signatures.clone(),
        };
        next.local_changes.acked = Vec::new();
        next.remote_changes = RemoteChanges {
            proposed: Vec::new(),
            acked: {
                let mut acked = self.remote_changes.acked.clone();
                acked.extend_from_slice(&self.remote_changes.proposed);
                acked
            },
            signed: self.remote_changes.signed.clone(),
        };

        Ok((next, revocation))
    }

    /// Consumes the peer's revocation: stores the revealed secret,
    /// promotes the pending remote commitment, and reports the changes
    /// that just became irrevocable.
    pub fn receive_revocation(
        &self,
        revocation: RevokeAndAck,
    ) -> Result<(Commitments, Vec<Forward>), ChannelError> {
        let waiting = match &self.remote_next_commit_info {
            RemoteNextCommitInfo::Revoked(_) => {
                return Err(ChannelError::CommitmentSyncError(
                    "revocation received while no commitment was pending",
                ))
            }
            RemoteNextCommitInfo::Waiting(waiting) => waiting.as_ref(),
        };

        let revealed_point = per_commitment_point(&revocation.revocation_preimage)?;
        if revealed_point != self.remote_commit.remote_per_commitment_point {
            return Err(ChannelError::InvalidRevocation);
        }

        let mut secrets = self.remote_per_commitment_secrets.clone();
        secrets
            .add_next_entry(
                ChainIndex::from_commitment_number(self.remote_commit.index),
                revocation.revocation_preimage,
            )
            .map_err(|_| ChannelError::InvalidRevocation)?;

        let mut next = self.clone();
        let mut forwards = Vec::new();
        for change in &self.remote_changes.signed {
            match change {
                Change::Add(add) => forwards.push(Forward::Add(add.clone())),
                Change::Fail(fail) => forwards.push(Forward::Fail {
                    fail: fail.clone(),
                    origin: next.origin_map.remove(&fail.id),
                }),
                Change::FailMalformed(fail) => forwards.push(Forward::FailMalformed {
                    fail: fail.clone(),
                    origin: next.origin_map.remove(&fail.id),
                }),
                // Fulfills were already propagated on reception.
                Change::Fulfill(fulfill) => {
                    next.origin_map.remove(&fulfill.id);
                }
                Change::Fee(_) => {}
            }
        }

        next.local_changes = LocalChanges {
            proposed: self.local_changes.proposed.clone(),
            signed: Vec::new(),
            acked: {
                let mut acked = self.local_changes.acked.clone();
                acked.extend_from_slice(&self.local_changes.signed);
                acked
            },
        };
        next.remote_changes.signed = Vec::new();
        next.remote_commit = waiting.next_remote_commit.clone();
        next.remote_next_commit_info =
            RemoteNextCommitInfo::Revoked(revocation.next_per_commitment_point.0);
        next.remote_per_commitment_secrets = secrets;

        Ok((next, forwards))
    }

    // The commitment transaction owned by us at the given index and
    // per-commitment point.
    fn local_commit_tx(
        &self,
        spec: &CommitmentSpec,
        index: u64,
        local_point: &PublicKey,
    ) -> Result<CommitTx, ChannelError> {
        Ok(CommitTx {
            funding_amount: self.commit_input.amount,
            local_funding_pubkey: self.local_params.keys.funding.0,
            remote_funding_pubkey: self.remote_params.keys.funding.0,
            feerate_per_kw: spec.feerate,
            dust_limit: self.local_params.dust_limit,
            local_pays_fee: self.local_params.is_funder,
            to_local_msat: spec.to_local,
            to_remote_msat: spec.to_remote,
            obscured_commit_number: index ^ self.obscuring_factor,
            local_htlc_pubkey: derive_pubkey(&self.local_params.keys.htlc.0, local_point)?,
            remote_htlc_pubkey: derive_pubkey(&self.remote_params.keys.htlc.0, local_point)?,
            local_revocation_pubkey: derive_revocation_pubkey(
                &self.remote_params.keys.revocation.0,
                local_point,
            )?,
            local_delayedpubkey: derive_pubkey(
                &self.local_params.keys.delayed_payment.0,
                local_point,
            )?,
            local_delay: self.remote_params.to_self_delay,
            remotepubkey: derive_pubkey(&self.remote_params.keys.payment.0, local_point)?,
            funding_tx_id: self.commit_input.txid,
            funding_output_index: self.commit_input.output_index,
            htlcs: spec.htlcs.iter().map(DirectedHtlc::to_commit_htlc).collect(),
        })
    }

    // The counterparty's commitment transaction; `spec` is expressed from
    // their point of view.
    fn remote_commit_tx(
        &self,
        spec: &CommitmentSpec,
        index: u64,
        remote_point: &PublicKey,
    ) -> Result<CommitTx, ChannelError> {
        Ok(CommitTx {
            funding_amount: self.commit_input.amount,
            local_funding_pubkey: self.remote_params.keys.funding.0,
            remote_funding_pubkey: self.local_params.keys.funding.0,
            feerate_per_kw: spec.feerate,
            dust_limit: self.remote_params.dust_limit,
            local_pays_fee: !self.local_params.is_funder,
            to_local_msat: spec.to_local,
            to_remote_msat: spec.to_remote,
            obscured_commit_number: index ^ self.obscuring_factor,
            local_htlc_pubkey: derive_pubkey(&self.remote_params.keys.htlc.0, remote_point)?,
            remote_htlc_pubkey: derive_pubkey(&self.local_params.keys.htlc.0, remote_point)?,
            local_revocation_pubkey: derive_revocation_pubkey(
                &self.local_params.keys.revocation.0,
                remote_point,
            )?,
            local_delayedpubkey: derive_pubkey(
                &self.remote_params.keys.delayed_payment.0,
                remote_point,
            )?,
            local_delay: self.local_params.to_self_delay,
            remotepubkey: derive_pubkey(&self.local_params.keys.payment.0, remote_point)?,
            funding_tx_id: self.commit_input.txid,
            funding_output_index: self.commit_input.output_index,
            htlcs: spec.htlcs.iter().map(DirectedHtlc::to_commit_htlc).collect(),
        })
    }
}

/// A receiver checking a payment against its invoice accepts the amount
/// when it is at least the invoiced amount and no more than twice it
/// (overpaying slightly helps obscure the payment).
pub fn validate_received_amount(invoice: MilliSatoshi, received: MilliSatoshi) -> bool {
    received >= invoice && received.0 <= invoice.0 * 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MemoryKeyManager;
    use wire::{ChannelKeys, CsvDelay};

    const HEIGHT: u32 = 400_000;

    fn side_params(keys: ChannelKeys, is_funder: bool, capacity: MilliSatoshi) -> LocalParams {
        LocalParams {
            dust_limit: Satoshi(546),
            max_htlc_value_in_flight: capacity,
            channel_reserve: Satoshi(0),
            htlc_minimum: MilliSatoshi(0),
            to_self_delay: CsvDelay(144),
            max_accepted_htlcs: 30,
            is_funder,
            keys,
        }
    }

    fn as_remote(p: &LocalParams) -> RemoteParams {
        RemoteParams {
            dust_limit: p.dust_limit,
            max_htlc_value_in_flight: p.max_htlc_value_in_flight,
            channel_reserve: p.channel_reserve,
            htlc_minimum: p.htlc_minimum,
            to_self_delay: p.to_self_delay,
            max_accepted_htlcs: p.max_accepted_htlcs,
            keys: p.keys,
        }
    }

    // Alice funds the channel; Bob starts with the pushed amount.
    fn test_channel(
        a_msat: u64,
        b_msat: u64,
        feerate: u32,
    ) -> (Commitments, MemoryKeyManager, Commitments, MemoryKeyManager) {
        let akm = MemoryKeyManager::from_seed([0xAA; 32]).unwrap();
        let bkm = MemoryKeyManager::from_seed([0xBB; 32]).unwrap();

        let capacity = Satoshi((a_msat + b_msat) / 1000);
        let commit_input = CommitInput {
            txid: Txid::from_byte_array([0x42; 32]),
            output_index: 0,
            amount: capacity,
        };

        let a_params = side_params(akm.channel_keys(), true, capacity.to_msat());
        let b_params = side_params(bkm.channel_keys(), false, capacity.to_msat());

        let channel_id = ChannelId([0x24; 32]);
        let push = MilliSatoshi(b_msat);
        let feerate = SatoshiPerKiloWeight(feerate);

        let mut a = Commitments::initial(
            channel_id,
            a_params.clone(),
            as_remote(&b_params),
            ChannelFlags(1),
            commit_input.clone(),
            push,
            feerate,
        )
        .unwrap();
        let mut b = Commitments::initial(
            channel_id,
            b_params,
            as_remote(&a_params),
            ChannelFlags(1),
            commit_input,
            push,
            feerate,
        )
        .unwrap();

        // As if funding_locked had been exchanged.
        a.remote_next_commit_info =
            RemoteNextCommitInfo::Revoked(bkm.commitment_point(1).unwrap());
        b.remote_next_commit_info =
            RemoteNextCommitInfo::Revoked(akm.commitment_point(1).unwrap());

        (a, akm, b, bkm)
    }

    fn cross_sign(
        sender: &Commitments,
        sender_km: &MemoryKeyManager,
        receiver: &Commitments,
        receiver_km: &MemoryKeyManager,
    ) -> (Commitments, Commitments, Vec<Forward>) {
        let (s1, sig) = sender.send_commit(sender_km).unwrap();
        let (r1, revocation) = receiver.receive_commit(sig, receiver_km).unwrap();
        let (s2, forwards) = s1.receive_revocation(revocation).unwrap();
        (s2, r1, forwards)
    }

    // Signs back and forth until neither side has pending changes.
    fn converge(
        a: Commitments,
        akm: &MemoryKeyManager,
        b: Commitments,
        bkm: &MemoryKeyManager,
    ) -> (Commitments, Commitments) {
        let (mut a, mut b) = (a, b);
        loop {
            if a.local_has_changes() {
                let (na, nb, _) = cross_sign(&a, akm, &b, bkm);
                a = na;
                b = nb;
                continue;
            }
            if b.local_has_changes() {
                let (nb, na, _) = cross_sign(&b, bkm, &a, akm);
                a = na;
                b = nb;
                continue;
            }
            return (a, b);
        }
    }

    fn cmd_add(amount: u64, preimage: [u8; 32]) -> CmdAddHtlc {
        CmdAddHtlc {
            amount: MilliSatoshi(amount),
            payment_hash: Hash256(sha256(&preimage)),
            expiry: HEIGHT + 144,
            onion: OnionBlob::zero(),
        }
    }

    #[test]
    fn success_payment_round_trip() {
        let (a0, b0) = (772_760_000u64, 190_000_000u64);
        let (a, akm, b, bkm) = test_channel(a0, b0, 0);
        let capacity = a.local_commit.spec.total_funds();
        let preimage = [0x77; 32];

        let (a, add) = a
            .send_add(cmd_add(42_000_000, preimage), Origin::Local, HEIGHT)
            .unwrap();
        let b = b.receive_add(add).unwrap();
        let (a, b) = converge(a, &akm, b, &bkm);

        assert_eq!(a.local_commit.spec.to_local, MilliSatoshi(a0 - 42_000_000));
        assert_eq!(a.local_commit.spec.to_remote, MilliSatoshi(b0));
        assert_eq!(
            a.local_commit.spec.htlc_value_in_flight(),
            MilliSatoshi(42_000_000),
        );
        assert_eq!(a.local_commit.spec.total_funds(), capacity);
        assert_eq!(a.local_next_htlc_id, HtlcId(1));
        assert_eq!(b.remote_next_htlc_id, HtlcId(1));

        let (b, fulfill) = b.send_fulfill(HtlcId(0), preimage).unwrap();
        let (a, origin) = a.receive_fulfill(fulfill).unwrap();
        assert_eq!(origin, Some(Origin::Local));
        let (a, b) = converge(a, &akm, b, &bkm);

        assert_eq!(a.local_commit.spec.to_local, MilliSatoshi(a0 - 42_000_000));
        assert_eq!(a.local_commit.spec.to_remote, MilliSatoshi(b0 + 42_000_000));
        assert_eq!(b.local_commit.spec.to_local, MilliSatoshi(b0 + 42_000_000));
        assert!(a.local_commit.spec.htlcs.is_empty());
        assert_eq!(a.local_commit.spec.total_funds(), capacity);

        // Revocation completeness: every revoked remote secret is
        // recoverable.
        for n in 0..a.remote_per_commitment_secrets.len() {
            assert!(a
                .remote_per_commitment_secrets
                .look_up(ChainIndex::from_commitment_number(n))
                .is_some());
        }
    }

    #[test]
    fn failed_payment_round_trip() {
        let (a0, b0) = (772_760_000u64, 190_000_000u64);
        let (a, akm, b, bkm) = test_channel(a0, b0, 0);
        let preimage = [0x78; 32];

        let (a, add) = a
            .send_add(cmd_add(42_000_000, preimage), Origin::Local, HEIGHT)
            .unwrap();
        let b = b.receive_add(add).unwrap();
        let (a, b) = converge(a, &akm, b, &bkm);

        let (b, fail) = b.send_fail(HtlcId(0), vec![0x2f]).unwrap();
        let a = a.receive_fail(fail).unwrap();
        let (a, b) = converge(a, &akm, b, &bkm);

        assert_eq!(a.local_commit.spec.to_local, MilliSatoshi(a0));
        assert_eq!(a.local_commit.spec.to_remote, MilliSatoshi(b0));
        assert_eq!(b.local_commit.spec.to_local, MilliSatoshi(b0));
        assert!(a.local_commit.spec.htlcs.is_empty());
        assert!(b.local_commit.spec.htlcs.is_empty());
    }

    #[test]
    fn concurrent_htlcs_and_available_balances() {
        let (a0, b0) = (772_760_000u64, 190_000_000u64);
        let feerate = 10_000u32;
        let fee = 1_720_000u64; // one extra htlc output at this feerate
        let (a, akm, b, bkm) = test_channel(a0, b0, feerate);

        // funder: balance minus the one-extra-htlc commit fee and the
        // two-output fee buffer
        let base_fee = (724 + 172) * u64::from(feerate); // msat
        let avail0 = a0 - base_fee - 2 * fee;
        assert_eq!(a.available_balance_for_send(), MilliSatoshi(avail0));
        assert_eq!(b.available_balance_for_send(), MilliSatoshi(b0));

        let (p1, p2, p3) = (10_000_000u64, 20_000_000u64, 40_000_000u64);
        let (pre1, pre2, pre3) = ([1u8; 32], [2u8; 32], [3u8; 32]);

        let (a, add1) = a.send_add(cmd_add(p1, pre1), Origin::Local, HEIGHT).unwrap();
        assert_eq!(a.available_balance_for_send(), MilliSatoshi(avail0 - p1 - fee));

        let (a, add2) = a.send_add(cmd_add(p2, pre2), Origin::Local, HEIGHT).unwrap();
        assert_eq!(
            a.available_balance_for_send(),
            MilliSatoshi(avail0 - p1 - fee - p2 - fee),
        );

        let (b, add3) = b.send_add(cmd_add(p3, pre3), Origin::Local, HEIGHT).unwrap();
        assert_eq!(b.available_balance_for_send(), MilliSatoshi(b0 - p3));

        let b = b.receive_add(add1).unwrap();
        let b = b.receive_add(add2).unwrap();
        let a = a.receive_add(add3).unwrap();
        let (a, b) = converge(a, &akm, b, &bkm);

        // Bob's committed htlc adds one more output Alice pays fee for.
        assert_eq!(
            a.available_balance_for_send(),
            MilliSatoshi(avail0 - p1 - fee - p2 - fee - fee),
        );

        let (b, fulfill1) = b.send_fulfill(HtlcId(0), pre1).unwrap();
        let (b, fail2) = b.send_fail(HtlcId(1), vec![0x11]).unwrap();
        let (a, _) = a.receive_fulfill(fulfill1).unwrap();
        let a = a.receive_fail(fail2).unwrap();
        let (a, fulfill3) = a.send_fulfill(HtlcId(0), pre3).unwrap();
        let (b, _) = b.receive_fulfill(fulfill3).unwrap();
        let (a, b) = converge(a, &akm, b, &bkm);

        assert_eq!(a.local_commit.spec.to_local, MilliSatoshi(a0 - p1 + p3));
        assert_eq!(a.local_commit.spec.to_remote, MilliSatoshi(b0 + p1 - p3));
        assert_eq!(b.local_commit.spec.to_local, MilliSatoshi(b0 + p1 - p3));
        assert!(a.local_commit.spec.htlcs.is_empty());
    }

    #[test]
    fn funder_keeps_the_fee_buffer() {
        let feerate = 2_500u32;
        let (a, _akm, _b, _bkm) = test_channel(100_000_000, 50_000_000, feerate);

        let base_fee = (724 + 172) * u64::from(feerate); // msat
        let delta = 172 * u64::from(feerate);
        let avail0 = 100_000_000 - base_fee - 2 * delta;
        assert_eq!(a.available_balance_for_send(), MilliSatoshi(avail0));

        // Drain the channel to exactly zero available.
        let (a, _add) = a
            .send_add(cmd_add(avail0, [0x0a; 32]), Origin::Local, HEIGHT)
            .unwrap();
        assert_eq!(a.available_balance_for_send(), MilliSatoshi(0));

        // The buffer absorbs a moderate fee increase...
        let (a, _update) = a.send_fee(SatoshiPerKiloWeight(3_000)).unwrap();

        // ...but nothing more fits in flight.
        let err = a
            .send_add(cmd_add(100, [0x0b; 32]), Origin::Local, HEIGHT)
            .unwrap_err();
        assert!(matches!(err, ChannelError::InsufficientFunds { .. }));
    }

    #[test]
    fn out_of_order_add_is_rejected() {
        let (a, _akm, b, _bkm) = test_channel(100_000_000, 50_000_000, 0);
        let (_a, mut add) = a
            .send_add(cmd_add(10_000_000, [0x0c; 32]), Origin::Local, HEIGHT)
            .unwrap();
        add.id = HtlcId(5);
        let err = b.receive_add(add).unwrap_err();
        assert!(matches!(err, ChannelError::UnexpectedHtlcId { .. }));
    }

    #[test]
    fn expiry_too_far_is_rejected() {
        let (a, _akm, _b, _bkm) = test_channel(100_000_000, 50_000_000, 0);
        let mut cmd = cmd_add(10_000_000, [0x0d; 32]);
        cmd.expiry = HEIGHT + MAX_HTLC_EXPIRY_DELTA + 1;
        let err = a.send_add(cmd, Origin::Local, HEIGHT).unwrap_err();
        assert!(matches!(err, ChannelError::ExpiryTooBig { .. }));
    }

    #[test]
    fn sign_without_changes_is_benign() {
        let (a, akm, _b, _bkm) = test_channel(100_000_000, 50_000_000, 0);
        let err = a.send_commit(&akm).unwrap_err();
        assert_eq!(err, ChannelError::CannotSignWithoutChanges);
        assert!(!err.is_fatal());
    }

    #[test]
    fn tampered_commit_signature_is_fatal() {
        let (a, akm, b, bkm) = test_channel(100_000_000, 50_000_000, 0);
        let (a, add) = a
            .send_add(cmd_add(10_000_000, [0x0e; 32]), Origin::Local, HEIGHT)
            .unwrap();
        let b = b.receive_add(add).unwrap();

        let (_a, mut sig) = a.send_commit(&akm).unwrap();
        sig.signature = RawSignature(akm.sign_funding([0; 32]));
        let err = b.receive_commit(sig, &bkm).unwrap_err();
        assert_eq!(err, ChannelError::InvalidCommitmentSignature);
        assert!(err.is_fatal());
    }

    #[test]
    fn wrong_revocation_secret_is_fatal() {
        let (a, akm, b, bkm) = test_channel(100_000_000, 50_000_000, 0);
        let (a, add) = a
            .send_add(cmd_add(10_000_000, [0x0f; 32]), Origin::Local, HEIGHT)
            .unwrap();
        let b = b.receive_add(add).unwrap();

        let (a, sig) = a.send_commit(&akm).unwrap();
        let (_b, mut revocation) = b.receive_commit(sig, &bkm).unwrap();
        revocation.revocation_preimage = [9; 32];
        let err = a.receive_revocation(revocation).unwrap_err();
        assert_eq!(err, ChannelError::InvalidRevocation);
    }

    #[test]
    fn unexpected_revocation_is_a_sync_error() {
        let (a, _akm, _b, bkm) = test_channel(100_000_000, 50_000_000, 0);
        let revocation = RevokeAndAck {
            channel_id: a.channel_id,
            revocation_preimage: bkm.commitment_secret(0).unwrap(),
            next_per_commitment_point: RawPublicKey(bkm.commitment_point(2).unwrap()),
        };
        let err = a.receive_revocation(revocation).unwrap_err();
        assert!(matches!(err, ChannelError::CommitmentSyncError(_)));
    }

    #[test]
    fn committed_incoming_htlc_is_forwarded_on_revocation() {
        let (a, akm, b, bkm) = test_channel(100_000_000, 50_000_000, 0);
        let (a, add) = a
            .send_add(cmd_add(10_000_000, [0x1a; 32]), Origin::Local, HEIGHT)
            .unwrap();
        let b = b.receive_add(add.clone()).unwrap();

        // Alice signs, Bob revokes: nothing forwarded on Alice's side yet.
        let (a, b, forwards) = cross_sign(&a, &akm, &b, &bkm);
        assert!(forwards.is_empty());

        // Bob signs back; when Alice revokes, Bob's view of the add is
        // irrevocable and surfaces for processing.
        let (_b, _a, forwards) = cross_sign(&b, &bkm, &a, &akm);
        assert_eq!(forwards.len(), 1);
        match &forwards[0] {
            Forward::Add(forwarded) => assert_eq!(forwarded.id, add.id),
            other => panic!("expected an add forward, got {:?}", other),
        }
    }

    #[test]
    fn force_close_commitment_is_fully_signed() {
        use crate::tools::new_2x2_multisig;

        let (a, akm, b, bkm) = test_channel(100_000_000, 50_000_000, 1_000);

        // Before any signature exchange the commitment cannot go to chain.
        assert!(a.signed_local_commit_tx(&akm).is_err());

        let (a, add) = a
            .send_add(cmd_add(10_000_000, [0x2a; 32]), Origin::Local, HEIGHT)
            .unwrap();
        let b = b.receive_add(add).unwrap();
        let (a, _b) = converge(a, &akm, b, &bkm);

        let tx = a.signed_local_commit_tx(&akm).unwrap();
        assert_eq!(tx.compute_txid(), a.local_commit.txid);
        assert_eq!(tx.input[0].previous_output.txid, a.commit_input.txid);

        let items: Vec<&[u8]> = tx.input[0].witness.iter().collect();
        assert_eq!(items.len(), 4);
        assert!(items[0].is_empty());

        let funding_script = new_2x2_multisig(
            &a.local_params.keys.funding.serialize(),
            &a.remote_params.keys.funding.serialize(),
        );
        assert_eq!(items[3], funding_script.as_bytes());

        // Both funding keys signed the published transaction.
        let digest = bitcoin::sighash::SighashCache::new(&tx)
            .p2wsh_signature_hash(
                0,
                &funding_script,
                bitcoin::Amount::from_sat(a.commit_input.amount.0),
                bitcoin::sighash::EcdsaSighashType::All,
            )
            .unwrap()
            .to_byte_array();
        let message = Message::from_digest(digest);
        let secp = Secp256k1::new();
        let mut keys = vec![a.local_params.keys.funding.0, a.remote_params.keys.funding.0];
        for item in &items[1..3] {
            let signature =
                secp256k1::ecdsa::Signature::from_der(&item[..item.len() - 1]).unwrap();
            let at = keys
                .iter()
                .position(|pk| secp.verify_ecdsa(&message, &signature, pk).is_ok())
                .expect("a signature from one of the funding keys");
            keys.remove(at);
        }
    }

    #[test]
    fn received_amount_must_cover_the_invoice_at_most_twice() {
        let invoice = MilliSatoshi(10_000);
        assert!(!validate_received_amount(invoice, MilliSatoshi(9_999)));
        assert!(validate_received_amount(invoice, MilliSatoshi(10_000)));
        assert!(validate_received_amount(invoice, MilliSatoshi(20_000)));
        assert!(!validate_received_amount(invoice, MilliSatoshi(20_001)));
    }
}
