//! The commitment specification: the balances and HTLC set a commitment
//! transaction is built from, and the reduction of pending change lists
//! onto it.

use wire::{
    HtlcId, MilliSatoshi, Satoshi, SatoshiPerKiloWeight, UpdateAddHtlc, UpdateFailHtlc,
    UpdateFailMalformedHtlc, UpdateFee, UpdateFulfillHtlc,
};

use crate::commit::{
    htlc_success_fee, htlc_timeout_fee, weight_to_fee, Htlc, HtlcDirection,
    BASE_COMMITMENT_WEIGHT, PER_HTLC_COMMITMENT_WEIGHT,
};

/// One element of a pending-change queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Change {
    Add(UpdateAddHtlc),
    Fulfill(UpdateFulfillHtlc),
    Fail(UpdateFailHtlc),
    FailMalformed(UpdateFailMalformedHtlc),
    Fee(UpdateFee),
}

/// Direction of an HTLC relative to the owner of the spec it sits in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Offered to the owner; its amount came out of the counterparty.
    Incoming,
    /// Offered by the owner.
    Outgoing,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Incoming => Direction::Outgoing,
            Direction::Outgoing => Direction::Incoming,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectedHtlc {
    pub direction: Direction,
    pub add: UpdateAddHtlc,
}

impl DirectedHtlc {
    /// The same HTLC as the owner's commitment transaction sees it.
    pub fn to_commit_htlc(&self) -> Htlc {
        Htlc {
            direction: match self.direction {
                Direction::Incoming => HtlcDirection::Accepted,
                Direction::Outgoing => HtlcDirection::Offered,
            },
            amount: self.add.amount,
            expiry: self.add.expiry,
            payment_hash: self.add.payment.0,
        }
    }

    pub fn is_trimmed(&self, dust_limit: Satoshi, feerate: SatoshiPerKiloWeight) -> bool {
        let claim_fee = match self.direction {
            Direction::Incoming => htlc_success_fee(feerate),
            Direction::Outgoing => htlc_timeout_fee(feerate),
        };
        self.add.amount.to_satoshi().0 < dust_limit.0 + claim_fee.0
    }
}

/// The contents of one commitment transaction, fee and on-chain details
/// aside: who owns what and which HTLCs are in flight.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommitmentSpec {
    pub htlcs: Vec<DirectedHtlc>,
    pub feerate: SatoshiPerKiloWeight,
    pub to_local: MilliSatoshi,
    pub to_remote: MilliSatoshi,
}

impl CommitmentSpec {
    pub fn new(
        feerate: SatoshiPerKiloWeight,
        to_local: MilliSatoshi,
        to_remote: MilliSatoshi,
    ) -> Self {
        CommitmentSpec {
            htlcs: Vec::new(),
            feerate,
            to_local,
            to_remote,
        }
    }

    pub fn find(&self, direction: Direction, id: HtlcId) -> Option<&DirectedHtlc> {
        self.htlcs
            .iter()
            .find(|h| h.direction == direction && h.add.id == id)
    }

    /// Sum of all in-flight HTLC amounts.
    pub fn htlc_value_in_flight(&self) -> MilliSatoshi {
        self.htlcs.iter().map(|h| h.add.amount).sum()
    }

    /// Sum of in-flight HTLC amounts in one direction.
    pub fn directed_value_in_flight(&self, direction: Direction) -> MilliSatoshi {
        self.htlcs
            .iter()
            .filter(|h| h.direction == direction)
            .map(|h| h.add.amount)
            .sum()
    }

    pub fn directed_count(&self, direction: Direction) -> usize {
        self.htlcs.iter().filter(|h| h.direction == direction).count()
    }

    /// Balances plus everything in flight; constant for the life of the
    /// channel (the capacity, in msat).
    pub fn total_funds(&self) -> MilliSatoshi {
        self.to_local + self.to_remote + self.htlc_value_in_flight()
    }

    fn add_htlc(&mut self, direction: Direction, add: &UpdateAddHtlc) {
        match direction {
            Direction::Outgoing => self.to_local -= add.amount,
            Direction::Incoming => self.to_remote -= add.amount,
        }
        self.htlcs.push(DirectedHtlc {
            direction,
            add: add.clone(),
        });
    }

    // A settlement sent by `settler` removes an HTLC that was incoming for
    // that settler; a fulfill pays the settler, a failure refunds the
    // offerer.
    fn settle_htlc(&mut self, settled_direction: Direction, id: HtlcId, fulfilled: bool) {
        let Some(at) = self
            .htlcs
            .iter()
            .position(|h| h.direction == settled_direction && h.add.id == id)
        else {
            return;
        };
        let amount = self.htlcs[at].add.amount;
        match (settled_direction, fulfilled) {
            // Our incoming HTLC fulfilled by us: we keep the money.
            (Direction::Incoming, true) => self.to_local += amount,
            (Direction::Incoming, false) => self.to_remote += amount,
            // Our outgoing HTLC fulfilled by them: they keep the money.
            (Direction::Outgoing, true) => self.to_remote += amount,
            (Direction::Outgoing, false) => self.to_local += amount,
        }
        self.htlcs.remove(at);
    }

    /// Applies both sides' pending changes: all additions first, then the
    /// settlements and fee updates, mirroring the order the protocol
    /// guarantees (a settlement always refers to a committed addition).
    pub fn reduce(
        &self,
        owner_changes: &[Change],
        counterparty_changes: &[Change],
    ) -> CommitmentSpec {
        let mut spec = self.clone();

        for change in owner_changes {
            if let Change::Add(add) = change {
                spec.add_htlc(Direction::Outgoing, add);
            }
        }
        for change in counterparty_changes {
            if let Change::Add(add) = change {
                spec.add_htlc(Direction::Incoming, add);
            }
        }

        for change in owner_changes {
            match change {
                Change::Add(_) => {}
                Change::Fulfill(m) => spec.settle_htlc(Direction::Incoming, m.id, true),
                Change::Fail(m) => spec.settle_htlc(Direction::Incoming, m.id, false),
                Change::FailMalformed(m) => spec.settle_htlc(Direction::Incoming, m.id, false),
                Change::Fee(m) => spec.feerate = m.fee,
            }
        }
        for change in counterparty_changes {
            match change {
                Change::Add(_) => {}
                Change::Fulfill(m) => spec.settle_htlc(Direction::Outgoing, m.id, true),
                Change::Fail(m) => spec.settle_htlc(Direction::Outgoing, m.id, false),
                Change::FailMalformed(m) => spec.settle_htlc(Direction::Outgoing, m.id, false),
                Change::Fee(m) => spec.feerate = m.fee,
            }
        }

        spec
    }

    /// Commitment transaction fee for this spec, optionally with
    /// hypothetical extra untrimmed HTLC outputs.
    pub fn commit_tx_fee(&self, dust_limit: Satoshi, extra_htlcs: usize) -> Satoshi {
        let untrimmed = self
            .htlcs
            .iter()
            .filter(|h| !h.is_trimmed(dust_limit, self.feerate))
            .count()
            + extra_htlcs;
        weight_to_fee(
            BASE_COMMITMENT_WEIGHT + untrimmed as u64 * PER_HTLC_COMMITMENT_WEIGHT,
            self.feerate,
        )
    }

    pub fn commit_tx_fee_msat(&self, dust_limit: Satoshi, extra_htlcs: usize) -> MilliSatoshi {
        self.commit_tx_fee(dust_limit, extra_htlcs).to_msat()
    }
}

/// The commit fee delta of one more untrimmed HTLC output.
pub fn htlc_output_fee_msat(feerate: SatoshiPerKiloWeight) -> MilliSatoshi {
    weight_to_fee(PER_HTLC_COMMITMENT_WEIGHT, feerate).to_msat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::{ChannelId, Hash256, OnionBlob};

    fn add(id: u64, amount: u64) -> UpdateAddHtlc {
        UpdateAddHtlc {
            channel_id: ChannelId([0; 32]),
            id: HtlcId(id),
            amount: MilliSatoshi(amount),
            payment: Hash256([id as u8; 32]),
            expiry: 500 + id as u32,
            onion_blob: OnionBlob::zero(),
        }
    }

    fn fulfill(id: u64) -> Change {
        Change::Fulfill(UpdateFulfillHtlc {
            channel_id: ChannelId([0; 32]),
            id: HtlcId(id),
            payment_preimage: [0; 32],
        })
    }

    fn fail(id: u64) -> Change {
        Change::Fail(UpdateFailHtlc {
            channel_id: ChannelId([0; 32]),
            id: HtlcId(id),
            reason: Vec::new(),
        })
    }

    #[test]
    fn additions_move_funds_into_flight() {
        let spec = CommitmentSpec::new(
            SatoshiPerKiloWeight(0),
            MilliSatoshi(100_000),
            MilliSatoshi(50_000),
        );
        let reduced = spec.reduce(
            &[Change::Add(add(0, 10_000))],
            &[Change::Add(add(0, 5_000))],
        );
        assert_eq!(reduced.to_local, MilliSatoshi(90_000));
        assert_eq!(reduced.to_remote, MilliSatoshi(45_000));
        assert_eq!(reduced.htlc_value_in_flight(), MilliSatoshi(15_000));
        assert_eq!(reduced.total_funds(), spec.total_funds());
    }

    #[test]
    fn fulfill_pays_the_settler_fail_refunds() {
        let base = CommitmentSpec::new(
            SatoshiPerKiloWeight(0),
            MilliSatoshi(100_000),
            MilliSatoshi(50_000),
        );
        // Two incoming HTLCs are committed.
        let committed = base.reduce(
            &[],
            &[Change::Add(add(0, 7_000)), Change::Add(add(1, 3_000))],
        );

        // The owner fulfills one and fails the other.
        let settled = committed.reduce(&[fulfill(0), fail(1)], &[]);
        assert_eq!(settled.to_local, MilliSatoshi(107_000));
        assert_eq!(settled.to_remote, MilliSatoshi(43_000));
        assert!(settled.htlcs.is_empty());
        assert_eq!(settled.total_funds(), base.total_funds());
    }

    #[test]
    fn fee_update_applies_to_the_projection() {
        let spec = CommitmentSpec::new(
            SatoshiPerKiloWeight(1000),
            MilliSatoshi(100_000),
            MilliSatoshi(50_000),
        );
        let reduced = spec.reduce(
            &[Change::Fee(UpdateFee {
                channel_id: ChannelId([0; 32]),
                fee: SatoshiPerKiloWeight(2500),
            })],
            &[],
        );
        assert_eq!(reduced.feerate, SatoshiPerKiloWeight(2500));
    }

    #[test]
    fn commit_fee_counts_only_untrimmed() {
        let mut spec = CommitmentSpec::new(
            SatoshiPerKiloWeight(10_000),
            MilliSatoshi(1_000_000_000),
            MilliSatoshi(1_000_000_000),
        );
        // 100 sat HTLC is trimmed at this feerate, 100_000 sat is not.
        spec = spec.reduce(
            &[
                Change::Add(add(0, 100_000)),
                Change::Add(add(1, 100_000_000)),
            ],
            &[],
        );
        let fee = spec.commit_tx_fee(Satoshi(546), 0);
        assert_eq!(
            fee,
            weight_to_fee(
                BASE_COMMITMENT_WEIGHT + PER_HTLC_COMMITMENT_WEIGHT,
                SatoshiPerKiloWeight(10_000),
            ),
        );
    }
}
