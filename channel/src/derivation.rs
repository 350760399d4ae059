//! BOLT #3 key derivation: every commitment-level key is the tweak of a
//! static basepoint by the commitment's per-commitment point.

use secp256k1::{Error, PublicKey, Scalar, Secp256k1, SecretKey};

use crate::tools::sha256;

fn tweak_scalar(bytes: [u8; 32]) -> Result<Scalar, Error> {
    Scalar::from_be_bytes(bytes).map_err(|_| Error::InvalidTweak)
}

/// pubkey = basepoint + SHA256(per_commitment_point || basepoint) * G
pub fn derive_pubkey(
    base_point: &PublicKey,
    per_commitment_point: &PublicKey,
) -> Result<PublicKey, Error> {
    let ctx = Secp256k1::new();
    let joined = [
        &per_commitment_point.serialize()[..],
        &base_point.serialize()[..],
    ]
    .concat();
    let h = sha256(&joined);
    base_point.add_exp_tweak(&ctx, &tweak_scalar(h)?)
}

/// privkey = basepoint_secret + SHA256(per_commitment_point || basepoint)
pub fn derive_privkey(
    base_point_secret: &SecretKey,
    per_commitment_point: &PublicKey,
) -> Result<SecretKey, Error> {
    let ctx = Secp256k1::new();
    let base_point = PublicKey::from_secret_key(&ctx, base_point_secret);
    let joined = [
        &per_commitment_point.serialize()[..],
        &base_point.serialize()[..],
    ]
    .concat();
    let h = sha256(&joined);
    base_point_secret.add_tweak(&tweak_scalar(h)?)
}

/// revocation_pubkey = revocation_basepoint * SHA256(revocation_basepoint || per_commitment_point)
///      + per_commitment_point * SHA256(per_commitment_point || revocation_basepoint)
pub fn derive_revocation_pubkey(
    revocation_base_point: &PublicKey,
    per_commitment_point: &PublicKey,
) -> Result<PublicKey, Error> {
    let ctx = Secp256k1::new();

    let joined1 = [
        &revocation_base_point.serialize()[..],
        &per_commitment_point.serialize()[..],
    ]
    .concat();
    let joined2 = [
        &per_commitment_point.serialize()[..],
        &revocation_base_point.serialize()[..],
    ]
    .concat();
    let h1 = sha256(&joined1);
    let h2 = sha256(&joined2);

    let pk1 = revocation_base_point.mul_tweak(&ctx, &tweak_scalar(h1)?)?;
    let pk2 = per_commitment_point.mul_tweak(&ctx, &tweak_scalar(h2)?)?;
    pk1.combine(&pk2)
}

/// revocation_privkey = revocation_basepoint_secret * SHA256(revocation_basepoint || per_commitment_point)
///      + per_commitment_secret * SHA256(per_commitment_point || revocation_basepoint)
pub fn derive_revocation_privkey(
    revocation_base_point_secret: &SecretKey,
    per_commitment_point_secret: &SecretKey,
) -> Result<SecretKey, Error> {
    let ctx = Secp256k1::new();

    let revocation_base_point = PublicKey::from_secret_key(&ctx, revocation_base_point_secret);
    let per_commitment_point = PublicKey::from_secret_key(&ctx, per_commitment_point_secret);

    let joined1 = [
        &revocation_base_point.serialize()[..],
        &per_commitment_point.serialize()[..],
    ]
    .concat();
    let joined2 = [
        &per_commitment_point.serialize()[..],
        &revocation_base_point.serialize()[..],
    ]
    .concat();
    let h1 = sha256(&joined1);
    let h2 = sha256(&joined2);

    let sk1 = revocation_base_point_secret.mul_tweak(&tweak_scalar(h1)?)?;
    let sk2 = per_commitment_point_secret.mul_tweak(&tweak_scalar(h2)?)?;
    sk1.add_tweak(&tweak_scalar(sk2.secret_bytes())?)
}

/// The per-commitment point is simply the secret interpreted as a key.
pub fn per_commitment_point(per_commitment_secret: &[u8; 32]) -> Result<PublicKey, Error> {
    let ctx = Secp256k1::new();
    let sk = SecretKey::from_slice(per_commitment_secret)?;
    Ok(PublicKey::from_secret_key(&ctx, &sk))
}
