//! Commitment transaction construction per BOLT #3, plus the second-level
//! HTLC transactions whose signatures travel in `commitment_signed`.

use std::cmp::Ordering;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use wire::{CsvDelay, MilliSatoshi, Satoshi, SatoshiPerKiloWeight};

use crate::bip69::sort_outputs;
use crate::tools::{accepted_htlc, new_2x2_multisig, offered_htlc, to_local_script, v0_p2wpkh};

pub const HTLC_TIMEOUT_WEIGHT: u64 = 663;
pub const HTLC_SUCCESS_WEIGHT: u64 = 703;
pub const BASE_COMMITMENT_WEIGHT: u64 = 724;
pub const PER_HTLC_COMMITMENT_WEIGHT: u64 = 172;

pub fn weight_to_fee(weight: u64, feerate: SatoshiPerKiloWeight) -> Satoshi {
    Satoshi(weight * u64::from(feerate.0) / 1000)
}

pub fn htlc_timeout_fee(feerate: SatoshiPerKiloWeight) -> Satoshi {
    weight_to_fee(HTLC_TIMEOUT_WEIGHT, feerate)
}

pub fn htlc_success_fee(feerate: SatoshiPerKiloWeight) -> Satoshi {
    weight_to_fee(HTLC_SUCCESS_WEIGHT, feerate)
}

/// Direction of an HTLC relative to the owner of the commitment
/// transaction it appears in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HtlcDirection {
    /// Owed to the owner once the preimage is known.
    Accepted,
    /// Offered by the owner; claimable by the counterparty with the
    /// preimage, refundable after the timeout.
    Offered,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Htlc {
    pub direction: HtlcDirection,
    pub amount: MilliSatoshi,
    pub expiry: u32,
    pub payment_hash: [u8; 32],
}

impl Htlc {
    /// Whether this HTLC is too small to be worth an output once its
    /// claiming transaction's fee is subtracted.
    pub fn is_trimmed(&self, dust_limit: Satoshi, feerate: SatoshiPerKiloWeight) -> bool {
        let claim_fee = match self.direction {
            HtlcDirection::Accepted => htlc_success_fee(feerate),
            HtlcDirection::Offered => htlc_timeout_fee(feerate),
        };
        self.amount.to_satoshi().0 < dust_limit.0 + claim_fee.0
    }
}

/// Everything needed to build one side's commitment transaction. "Local"
/// here is the owner of the transaction, not necessarily this node.
#[derive(Clone, Debug)]
pub struct CommitTx {
    pub funding_amount: Satoshi,
    pub local_funding_pubkey: PublicKey,
    pub remote_funding_pubkey: PublicKey,

    pub feerate_per_kw: SatoshiPerKiloWeight,
    pub dust_limit: Satoshi,
    /// The owner pays the commit fee iff the owner funded the channel.
    pub local_pays_fee: bool,

    pub to_local_msat: MilliSatoshi,
    pub to_remote_msat: MilliSatoshi,

    pub obscured_commit_number: u64,

    pub local_htlc_pubkey: PublicKey,
    pub remote_htlc_pubkey: PublicKey,

    pub local_revocation_pubkey: PublicKey,
    pub local_delayedpubkey: PublicKey,
    pub local_delay: CsvDelay,

    pub remotepubkey: PublicKey,

    pub funding_tx_id: Txid,
    pub funding_output_index: u32,

    pub htlcs: Vec<Htlc>,
}

/// A built commitment: the transaction plus which output each untrimmed
/// HTLC landed on after ordering.
pub struct BuiltCommitTx {
    pub tx: Transaction,
    pub htlc_outputs: Vec<(u32, Htlc)>,
}

impl BuiltCommitTx {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

impl CommitTx {
    pub fn funding_script(&self) -> ScriptBuf {
        new_2x2_multisig(
            &self.local_funding_pubkey.serialize(),
            &self.remote_funding_pubkey.serialize(),
        )
    }

    fn commit_weight(&self) -> u64 {
        let untrimmed = self
            .htlcs
            .iter()
            .filter(|h| !h.is_trimmed(self.dust_limit, self.feerate_per_kw))
            .count() as u64;
        BASE_COMMITMENT_WEIGHT + untrimmed * PER_HTLC_COMMITMENT_WEIGHT
    }

    pub fn build(&self) -> BuiltCommitTx {
        let mut outputs: Vec<(TxOut, Option<Htlc>)> = Vec::new();

        for htlc in &self.htlcs {
            if htlc.is_trimmed(self.dust_limit, self.feerate_per_kw) {
                continue;
            }
            let lock_script = match htlc.direction {
                HtlcDirection::Accepted => accepted_htlc(
                    &self.local_revocation_pubkey,
                    &self.remote_htlc_pubkey,
                    &self.local_htlc_pubkey,
                    htlc.payment_hash,
                    htlc.expiry,
                ),
                HtlcDirection::Offered => offered_htlc(
                    &self.local_revocation_pubkey,
                    &self.remote_htlc_pubkey,
                    &self.local_htlc_pubkey,
                    htlc.payment_hash,
                ),
            };
            outputs.push((
                TxOut {
                    value: Amount::from_sat(htlc.amount.to_satoshi().0),
                    script_pubkey: lock_script.to_p2wsh(),
                },
                Some(htlc.clone()),
            ));
        }

        let base_fee = weight_to_fee(self.commit_weight(), self.feerate_per_kw);

        let mut to_local = self.to_local_msat.to_satoshi().0;
        let mut to_remote = self.to_remote_msat.to_satoshi().0;
        if self.local_pays_fee {
            to_local = to_local.saturating_sub(base_fee.0);
        } else {
            to_remote = to_remote.saturating_sub(base_fee.0);
        }

        if to_local >= self.dust_limit.0 {
            outputs.push((
                TxOut {
                    value: Amount::from_sat(to_local),
                    script_pubkey: to_local_script(
                        &self.local_delayedpubkey,
                        self.local_delay.0,
                        &self.local_revocation_pubkey,
                    )
                    .to_p2wsh(),
                },
                None,
            ));
        }

        if to_remote >= self.dust_limit.0 {
            outputs.push((
                TxOut {
                    value: Amount::from_sat(to_remote),
                    script_pubkey: v0_p2wpkh(&self.remotepubkey),
                },
                None,
            ));
        }

        // Two HTLC outputs can be byte-identical; expiry decides.
        sort_outputs(&mut outputs, |a, b| match (a, b) {
            (Some(a), Some(b)) => a.expiry.cmp(&b.expiry),
            _ => Ordering::Equal,
        });

        let sequence = crate::tools::get_sequence(self.obscured_commit_number);
        let locktime = crate::tools::get_locktime(self.obscured_commit_number);

        let mut htlc_outputs = Vec::new();
        let mut tx_outputs = Vec::with_capacity(outputs.len());
        for (vout, (output, htlc)) in outputs.into_iter().enumerate() {
            if let Some(htlc) = htlc {
                htlc_outputs.push((vout as u32, htlc));
            }
            tx_outputs.push(output);
        }

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(locktime),
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: self.funding_tx_id,
                    vout: self.funding_output_index,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence(sequence),
                witness: Witness::new(),
            }],
            output: tx_outputs,
        };

        BuiltCommitTx { tx, htlc_outputs }
    }

    /// The digest the funding signatures commit to.
    pub fn sighash(&self, built: &BuiltCommitTx) -> [u8; 32] {
        let sighash = SighashCache::new(&built.tx)
            .p2wsh_signature_hash(
                0,
                &self.funding_script(),
                Amount::from_sat(self.funding_amount.0),
                EcdsaSighashType::All,
            )
            .expect("the commitment has exactly one input");
        sighash.to_byte_array()
    }

    pub fn sign(&self, funding_sk: &SecretKey) -> Signature {
        let built = self.build();
        let digest = self.sighash(&built);
        let secp = Secp256k1::new();
        secp.sign_ecdsa(&Message::from_digest(digest), funding_sk)
    }

    pub fn verify(&self, built: &BuiltCommitTx, pk: &PublicKey, signature: &Signature) -> bool {
        let digest = self.sighash(built);
        let secp = Secp256k1::new();
        secp.verify_ecdsa(&Message::from_digest(digest), signature, pk)
            .is_ok()
    }

    /// Sighashes of the second-level HTLC transactions, one per untrimmed
    /// HTLC in commitment output order. Both htlc keys must sign these.
    pub fn htlc_sighashes(&self, built: &BuiltCommitTx) -> Vec<([u8; 32], Htlc)> {
        let commit_txid = built.txid();
        built
            .htlc_outputs
            .iter()
            .map(|(vout, htlc)| {
                let htlc_tx = self.htlc_tx(commit_txid, *vout, htlc);
                let witness_script = match htlc.direction {
                    HtlcDirection::Accepted => accepted_htlc(
                        &self.local_revocation_pubkey,
                        &self.remote_htlc_pubkey,
                        &self.local_htlc_pubkey,
                        htlc.payment_hash,
                        htlc.expiry,
                    ),
                    HtlcDirection::Offered => offered_htlc(
                        &self.local_revocation_pubkey,
                        &self.remote_htlc_pubkey,
                        &self.local_htlc_pubkey,
                        htlc.payment_hash,
                    ),
                };
                let sighash = SighashCache::new(&htlc_tx)
                    .p2wsh_signature_hash(
                        0,
                        &witness_script,
                        Amount::from_sat(htlc.amount.to_satoshi().0),
                        EcdsaSighashType::All,
                    )
                    .expect("the htlc transaction has exactly one input");
                (sighash.to_byte_array(), htlc.clone())
            })
            .collect()
    }

    // HTLC-timeout (offered) or HTLC-success (accepted) transaction: one
    // input spending the htlc output, one CSV-delayed output back to the
    // owner.
    fn htlc_tx(&self, commit_txid: Txid, vout: u32, htlc: &Htlc) -> Transaction {
        let (fee, locktime) = match htlc.direction {
            HtlcDirection::Offered => (htlc_timeout_fee(self.feerate_per_kw), htlc.expiry),
            HtlcDirection::Accepted => (htlc_success_fee(self.feerate_per_kw), 0),
        };
        let value = htlc.amount.to_satoshi().0.saturating_sub(fee.0);

        Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(locktime),
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: commit_txid,
                    vout,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence(0),
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: to_local_script(
                    &self.local_delayedpubkey,
                    self.local_delay.0,
                    &self.local_revocation_pubkey,
                )
                .to_p2wsh(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::consensus::encode::{deserialize, serialize};

    use super::*;
    use crate::tools::{s2byte32, s2privkey, s2pubkey, sha256, spending_witness_2x2_multisig};

    // The BOLT #3 appendix C example channel.
    struct Example {
        commit_tx: CommitTx,
        local_funding_privkey: SecretKey,
        remote_funding_privkey: SecretKey,
    }

    fn example(feerate: u32, to_local_msat: u64, with_htlcs: bool) -> Example {
        let htlcs = if with_htlcs {
            vec![
                Htlc {
                    direction: HtlcDirection::Accepted,
                    amount: MilliSatoshi(1000000),
                    expiry: 500,
                    payment_hash: sha256(&s2byte32(
                        "0000000000000000000000000000000000000000000000000000000000000000",
                    )),
                },
                Htlc {
                    direction: HtlcDirection::Accepted,
                    amount: MilliSatoshi(2000000),
                    expiry: 501,
                    payment_hash: sha256(&s2byte32(
                        "0101010101010101010101010101010101010101010101010101010101010101",
                    )),
                },
                Htlc {
                    direction: HtlcDirection::Offered,
                    amount: MilliSatoshi(2000000),
                    expiry: 502,
                    payment_hash: sha256(&s2byte32(
                        "0202020202020202020202020202020202020202020202020202020202020202",
                    )),
                },
                Htlc {
                    direction: HtlcDirection::Offered,
                    amount: MilliSatoshi(3000000),
                    expiry: 503,
                    payment_hash: sha256(&s2byte32(
                        "0303030303030303030303030303030303030303030303030303030303030303",
                    )),
                },
                Htlc {
                    direction: HtlcDirection::Accepted,
                    amount: MilliSatoshi(4000000),
                    expiry: 504,
                    payment_hash: sha256(&s2byte32(
                        "0404040404040404040404040404040404040404040404040404040404040404",
                    )),
                },
            ]
        } else {
            Vec::new()
        };

        Example {
            commit_tx: CommitTx {
                funding_amount: Satoshi(10000000),
                local_funding_pubkey: s2pubkey(
                    "023da092f6980e58d2c037173180e9a465476026ee50f96695963e8efe436f54eb",
                ),
                remote_funding_pubkey: s2pubkey(
                    "030e9f7b623d2ccc7c9bd44d66d5ce21ce504c0acf6385a132cec6d3c39fa711c1",
                ),
                feerate_per_kw: SatoshiPerKiloWeight(feerate),
                dust_limit: Satoshi(546),
                local_pays_fee: true,
                to_local_msat: MilliSatoshi(to_local_msat),
                to_remote_msat: MilliSatoshi(3000000000),
                obscured_commit_number: 0x2bb038521914 ^ 42,
                local_htlc_pubkey: s2pubkey(
                    "030d417a46946384f88d5f3337267c5e579765875dc4daca813e21734b140639e7",
                ),
                remote_htlc_pubkey: s2pubkey(
                    "0394854aa6eab5b2a8122cc726e9dded053a2184d88256816826d6231c068d4a5b",
                ),
                local_revocation_pubkey: s2pubkey(
                    "0212a140cd0c6539d07cd08dfe09984dec3251ea808b892efeac3ede9402bf2b19",
                ),
                local_delayedpubkey: s2pubkey(
                    "03fd5960528dc152014952efdb702a88f71e3c1653b2314431701ec77e57fde83c",
                ),
                local_delay: CsvDelay(144),
                remotepubkey: s2pubkey(
                    "0394854aa6eab5b2a8122cc726e9dded053a2184d88256816826d6231c068d4a5b",
                ),
                funding_tx_id: "8984484a580b825b9972d7adb15050b3ab624ccd731946b3eeddb92f4e7ef6be"
                    .parse()
                    .unwrap(),
                funding_output_index: 0,
                htlcs,
            },
            local_funding_privkey: s2privkey(
                "30ff4956bbdd3222d44cc5e8a1261dab1e07957bdac5ae88fe3261ef321f3749",
            ),
            remote_funding_privkey: s2privkey(
                "1552dfba4f6cf29a62a0af13c8d6981d36d0ef8d61ba10fb0fe90da7634d7e13",
            ),
        }
    }

    fn assert_tx_eq(tx1: &Transaction, tx2: &Transaction, ignore_witness: bool) {
        assert_eq!(tx1.version, tx2.version);
        assert_eq!(tx1.lock_time, tx2.lock_time);
        assert_eq!(tx1.input.len(), tx2.input.len());
        for i in 0..tx1.input.len() {
            assert_eq!(tx1.input[i].previous_output, tx2.input[i].previous_output);
            assert_eq!(tx1.input[i].script_sig, tx2.input[i].script_sig);
            assert_eq!(tx1.input[i].sequence, tx2.input[i].sequence);
            if !ignore_witness {
                assert_eq!(tx1.input[i].witness, tx2.input[i].witness);
            }
        }
        assert_eq!(tx1.output, tx2.output);
    }

    #[test]
    fn simple_commitment_tx_with_no_htlcs() {
        // name: simple commitment tx with no HTLCs
        let expected: Transaction = deserialize(
            &hex::decode(
                "02000000000101bef67e4e2fb9ddeeb3461973cd4c62abb35050b1add772995b820b584a488489\
                 000000000038b02b8002c0c62d0000000000160014ccf1af2f2aabee14bb40fa3851ab2301de84\
                 311054a56a00000000002200204adb4e2f00643db396dd120d4e7dc17625f5f2c11a40d857accc\
                 862d6b7dd80e0400473044022051b75c73198c6deee1a875871c3961832909acd297c6b908d59e\
                 3319e5185a46022055c419379c5051a78d00dbbce11b5b664a0c22815fbcc6fcef6b1937c38369\
                 3901483045022100f51d2e566a70ba740fc5d8c0f07b9b93d2ed741c3c0860c613173de7d39e79\
                 68022041376d520e9c0e1ad52248ddf4b22e12be8763007df977253ef45a4ca3bdb7c001475221\
                 023da092f6980e58d2c037173180e9a465476026ee50f96695963e8efe436f54eb21030e9f7b62\
                 3d2ccc7c9bd44d66d5ce21ce504c0acf6385a132cec6d3c39fa711c152ae3e195220",
            )
            .unwrap(),
        )
        .unwrap();

        let ex = example(15000, 7000000000, false);
        let built = ex.commit_tx.build();
        assert_tx_eq(&built.tx, &expected, true);

        let local_sig = ex.commit_tx.sign(&ex.local_funding_privkey);
        assert_eq!(
            hex::encode(local_sig.serialize_der()),
            "3044022051b75c73198c6deee1a875871c3961832909acd297c6b908d59e3319e5185a46022055\
             c419379c5051a78d00dbbce11b5b664a0c22815fbcc6fcef6b1937c3836939",
        );

        let remote_sig = ex.commit_tx.sign(&ex.remote_funding_privkey);
        assert_eq!(
            hex::encode(remote_sig.serialize_der()),
            "3045022100f51d2e566a70ba740fc5d8c0f07b9b93d2ed741c3c0860c613173de7d39e79680220\
             41376d520e9c0e1ad52248ddf4b22e12be8763007df977253ef45a4ca3bdb7c0",
        );

        assert!(ex
            .commit_tx
            .verify(&built, &ex.commit_tx.local_funding_pubkey, &local_sig));
        assert!(!ex
            .commit_tx
            .verify(&built, &ex.commit_tx.local_funding_pubkey, &remote_sig));

        // Complete the witness and compare the full serialisation.
        let mut tx = built.tx.clone();
        tx.input[0].witness = spending_witness_2x2_multisig(
            &ex.commit_tx.local_funding_pubkey,
            &ex.commit_tx.remote_funding_pubkey,
            &local_sig,
            &remote_sig,
        );
        assert_eq!(serialize(&tx), serialize(&expected));
    }

    #[test]
    fn commitment_tx_with_all_five_htlcs_untrimmed_minimum_feerate() {
        // name: commitment tx with all five HTLCs untrimmed (minimum feerate)
        let expected: Transaction = deserialize(
            &hex::decode(
                "02000000000101bef67e4e2fb9ddeeb3461973cd4c62abb35050b1add772995b820b584a488489\
                 000000000038b02b8007e80300000000000022002052bfef0479d7b293c27e0f1eb294bea154c6\
                 3a3294ef092c19af51409bce0e2ad007000000000000220020403d394747cae42e98ff01734ad5\
                 c08f82ba123d3d9a620abda88989651e2ab5d007000000000000220020748eba944fedc8827f6b\
                 06bc44678f93c0f9e6078b35c6331ed31e75f8ce0c2db80b000000000000220020c20b5d1f8584\
                 fd90443e7b7b720136174fa4b9333c261d04dbbd012635c0f419a00f0000000000002200208c48\
                 d15160397c9731df9bc3b236656efb6665fbfe92b4a6878e88a499f741c4c0c62d000000000016\
                 0014ccf1af2f2aabee14bb40fa3851ab2301de843110e0a06a00000000002200204adb4e2f0064\
                 3db396dd120d4e7dc17625f5f2c11a40d857accc862d6b7dd80e0400473044022027\
                 5b0c325a5e9355650dc30c0eccfbc7efb23987c24b556b9dfdd40effca18d202206caceb2c0678\
                 36c51f296740c7ae807ffcbfbf1dd3a0d56b6de9a5b247985f060147304402204fd4928835db1c\
                 cdfc40f5c78ce9bd65249b16348df81f0c44328dcdefc97d630220194d3869c38bc732dd87d13d\
                 2958015e2fc16829e74cd4377f84d215c0b7060601475221023da092f6980e58d2c03717318\
                 0e9a465476026ee50f96695963e8efe436f54eb21030e9f7b623d2ccc7c9bd44d66d5ce21ce50\
                 4c0acf6385a132cec6d3c39fa711c152ae3e195220",
            )
            .unwrap(),
        )
        .unwrap();

        let ex = example(0, 6988000000, true);
        let built = ex.commit_tx.build();
        assert_tx_eq(&built.tx, &expected, true);

        // All five HTLCs have outputs, ordered 1M, 2M(501), 2M(502), 3M, 4M.
        assert_eq!(built.htlc_outputs.len(), 5);
        let expiries: Vec<u32> = built.htlc_outputs.iter().map(|(_, h)| h.expiry).collect();
        assert_eq!(expiries, vec![500, 501, 502, 503, 504]);

        // One second-level sighash per untrimmed HTLC, in output order.
        let sighashes = ex.commit_tx.htlc_sighashes(&built);
        assert_eq!(sighashes.len(), 5);
    }

    #[test]
    fn trimmed_htlcs_leave_no_output() {
        // At this feerate every HTLC is below dust + claim fee.
        let ex = example(9651181, 6988000000, true);
        let built = ex.commit_tx.build();
        assert!(built.htlc_outputs.is_empty());
        // to_local swallowed by the fee, to_remote survives.
        assert_eq!(built.tx.output.len(), 1);
    }
}
