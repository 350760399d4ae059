//! Script builders and helpers shared by the commitment machinery.

use bitcoin::blockdata::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CLTV, OP_CSV, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUAL,
    OP_EQUALVERIFY, OP_HASH160, OP_IF, OP_NOTIF, OP_SIZE, OP_SWAP,
};
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::{hash160, ripemd160, Hash};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{ScriptBuf, WPubkeyHash, Witness};
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};

pub fn sha256(x: &[u8]) -> [u8; 32] {
    let mut hash = [0; 32];
    hash.copy_from_slice(&Sha256::digest(x));
    hash
}

// Funding keys go into the witness script in lexicographic order of their
// compressed serialisation.
pub fn ordered<'a>(pk1: &'a [u8; 33], pk2: &'a [u8; 33]) -> (&'a [u8; 33], &'a [u8; 33]) {
    if pk1 <= pk2 {
        (pk1, pk2)
    } else {
        (pk2, pk1)
    }
}

/// The funding output witness script: 2 <pk_low> <pk_high> 2 CHECKMULTISIG.
pub fn new_2x2_multisig(pk1: &[u8; 33], pk2: &[u8; 33]) -> ScriptBuf {
    let (first, second) = ordered(pk1, pk2);
    Builder::new()
        .push_int(2)
        .push_slice(first)
        .push_slice(second)
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

pub fn v0_p2wpkh(pk: &PublicKey) -> ScriptBuf {
    let hash = hash160::Hash::hash(&pk.serialize());
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(hash.to_byte_array()))
}

// OP_IF
//     # Penalty transaction
//     <revocationpubkey>
// OP_ELSE
//     `to_self_delay` OP_CSV OP_DROP
//     <local_delayedpubkey>
// OP_ENDIF
// OP_CHECKSIG
pub fn to_local_script(
    local_delayedpubkey: &PublicKey,
    to_self_delay: u16,
    revocationpubkey: &PublicKey,
) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_IF)
        .push_slice(revocationpubkey.serialize())
        .push_opcode(OP_ELSE)
        .push_int(i64::from(to_self_delay))
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_slice(local_delayedpubkey.serialize())
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

// OP_DUP OP_HASH160 <RIPEMD160(SHA256(revocationpubkey))> OP_EQUAL
// OP_IF
//     OP_CHECKSIG
// OP_ELSE
//     <remote_htlcpubkey> OP_SWAP OP_SIZE 32 OP_EQUAL
//     OP_NOTIF
//         # To local node via HTLC-timeout transaction (timelocked).
//         OP_DROP 2 OP_SWAP <local_htlcpubkey> 2 OP_CHECKMULTISIG
//     OP_ELSE
//         # To remote node with preimage.
//         OP_HASH160 <RIPEMD160(payment_hash)> OP_EQUALVERIFY
//         OP_CHECKSIG
//     OP_ENDIF
// OP_ENDIF
pub fn offered_htlc(
    revocationpubkey: &PublicKey,
    remote_htlcpubkey: &PublicKey,
    local_htlcpubkey: &PublicKey,
    payment_hash: [u8; 32],
) -> ScriptBuf {
    let revocation_hash = hash160::Hash::hash(&revocationpubkey.serialize());
    let payment_ripemd = ripemd160::Hash::hash(&payment_hash);
    Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(revocation_hash.to_byte_array())
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_slice(remote_htlcpubkey.serialize())
        .push_opcode(OP_SWAP)
        .push_opcode(OP_SIZE)
        .push_int(32)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_NOTIF)
        .push_opcode(OP_DROP)
        .push_int(2)
        .push_opcode(OP_SWAP)
        .push_slice(local_htlcpubkey.serialize())
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ELSE)
        .push_opcode(OP_HASH160)
        .push_slice(payment_ripemd.to_byte_array())
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_ENDIF)
        .into_script()
}

// OP_DUP OP_HASH160 <RIPEMD160(SHA256(revocationpubkey))> OP_EQUAL
// OP_IF
//     OP_CHECKSIG
// OP_ELSE
//     <remote_htlcpubkey> OP_SWAP OP_SIZE 32 OP_EQUAL
//     OP_IF
//         # To local node via HTLC-success transaction.
//         OP_HASH160 <RIPEMD160(payment_hash)> OP_EQUALVERIFY
//         2 OP_SWAP <local_htlcpubkey> 2 OP_CHECKMULTISIG
//     OP_ELSE
//         # To remote node after timeout.
//         OP_DROP <cltv_expiry> OP_CLTV OP_DROP
//         OP_CHECKSIG
//     OP_ENDIF
// OP_ENDIF
pub fn accepted_htlc(
    revocationpubkey: &PublicKey,
    remote_htlcpubkey: &PublicKey,
    local_htlcpubkey: &PublicKey,
    payment_hash: [u8; 32],
    cltv_expiry: u32,
) -> ScriptBuf {
    let revocation_hash = hash160::Hash::hash(&revocationpubkey.serialize());
    let payment_ripemd = ripemd160::Hash::hash(&payment_hash);
    Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(revocation_hash.to_byte_array())
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_slice(remote_htlcpubkey.serialize())
        .push_opcode(OP_SWAP)
        .push_opcode(OP_SIZE)
        .push_int(32)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_HASH160)
        .push_slice(payment_ripemd.to_byte_array())
        .push_opcode(OP_EQUALVERIFY)
        .push_int(2)
        .push_opcode(OP_SWAP)
        .push_slice(local_htlcpubkey.serialize())
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ELSE)
        .push_opcode(OP_DROP)
        .push_int(i64::from(cltv_expiry))
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_ENDIF)
        .into_script()
}

/// The witness spending a 2-of-2 funding output: the CHECKMULTISIG dummy,
/// both SIGHASH_ALL signatures in the key order of the witness script, and
/// the script itself. `sig1`/`sig2` belong to `pk1`/`pk2` respectively.
pub fn spending_witness_2x2_multisig(
    pk1: &PublicKey,
    pk2: &PublicKey,
    sig1: &Signature,
    sig2: &Signature,
) -> Witness {
    let script = new_2x2_multisig(&pk1.serialize(), &pk2.serialize());
    let (first, second) = if pk1.serialize() <= pk2.serialize() {
        (sig1, sig2)
    } else {
        (sig2, sig1)
    };

    let mut witness = Witness::new();
    witness.push(Vec::new());
    let mut der = first.serialize_der().to_vec();
    der.push(EcdsaSighashType::All as u8);
    witness.push(der);
    let mut der = second.serialize_der().to_vec();
    der.push(EcdsaSighashType::All as u8);
    witness.push(der);
    witness.push(script.to_bytes());
    witness
}

/// The 48-bit number XORed into commitment numbers before they are spread
/// over the sequence and locktime fields: lower 6 bytes of
/// SHA256(funder_payment_basepoint || fundee_payment_basepoint).
pub fn get_obscuring_number(
    funder_payment_basepoint: &[u8],
    fundee_payment_basepoint: &[u8],
) -> u64 {
    let concatenated = [funder_payment_basepoint, fundee_payment_basepoint].concat();
    let digest = sha256(&concatenated);

    let mut obscuring_number = 0;
    for i in 0..6 {
        obscuring_number += u64::from(digest[31 - i]) << (i * 8);
    }
    obscuring_number
}

/// Upper 24 bits of the obscured commitment number, behind the 0x80 marker.
pub fn get_sequence(obscured_commit_number: u64) -> u32 {
    (0x80 << 24) | ((obscured_commit_number >> 24) & 0xff_ffff) as u32
}

/// Lower 24 bits of the obscured commitment number, behind the 0x20 marker.
pub fn get_locktime(obscured_commit_number: u64) -> u32 {
    (0x20 << 24) | (obscured_commit_number & 0xff_ffff) as u32
}

pub fn s2privkey(s: &str) -> SecretKey {
    SecretKey::from_slice(&hex::decode(s).expect("valid hex")).expect("valid key")
}

pub fn s2pubkey(s: &str) -> PublicKey {
    PublicKey::from_slice(&hex::decode(s).expect("valid hex")).expect("valid point")
}

pub fn s2byte32(s: &str) -> [u8; 32] {
    let mut out = [0; 32];
    out.copy_from_slice(&hex::decode(s).expect("valid hex"));
    out
}
