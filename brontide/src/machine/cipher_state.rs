use std::fmt;

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use hkdf::Hkdf;
use sha2::Sha256;

pub const MAC_SIZE: usize = 16;

// A key encrypts or decrypts at most this many times before it is ratcheted
// forward through the chaining key. Keeps the nonce far away from its
// exhaustion bound.
pub const KEY_ROTATE_INTERVAL: u64 = 1000;

/// One direction of an established session: a ChaCha20-Poly1305 key, the
/// 64-bit nonce counting its uses, and the HKDF salt the next key is
/// derived from.
pub struct CipherState {
    salt: [u8; 32],
    secret_key: [u8; 32],
    nonce: u64,
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

impl CipherState {
    pub fn new(salt: [u8; 32], secret_key: [u8; 32]) -> Self {
        CipherState {
            salt,
            secret_key,
            nonce: 0,
        }
    }

    // BOLT #8 nonces: 32 zero bits then the counter, little-endian.
    fn nonce_bytes(&self) -> [u8; 12] {
        let mut nonce = [0; 12];
        nonce[4..].copy_from_slice(&self.nonce.to_le_bytes());
        nonce
    }

    /// Encrypts `plain_text` under the current (key, nonce), appending the
    /// ciphertext to `cipher_text` and returning the detached tag.
    pub fn encrypt(
        &mut self,
        associated_data: &[u8],
        cipher_text: &mut Vec<u8>,
        plain_text: &[u8],
    ) -> Result<[u8; MAC_SIZE], chacha20poly1305::aead::Error> {
        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.secret_key));

        let start = cipher_text.len();
        cipher_text.extend_from_slice(plain_text);
        let tag = aead.encrypt_in_place_detached(
            Nonce::from_slice(&self.nonce_bytes()),
            associated_data,
            &mut cipher_text[start..],
        )?;

        self.advance();

        let mut out = [0; MAC_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    /// Authenticates and decrypts one chunk, appending the plaintext to
    /// `plain_text`. The nonce only advances on success; a forged chunk
    /// leaves the state untouched.
    pub fn decrypt(
        &mut self,
        associated_data: &[u8],
        plain_text: &mut Vec<u8>,
        cipher_text: &[u8],
        tag: [u8; MAC_SIZE],
    ) -> Result<(), chacha20poly1305::aead::Error> {
        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.secret_key));

        let start = plain_text.len();
        plain_text.extend_from_slice(cipher_text);
        let result = aead.decrypt_in_place_detached(
            Nonce::from_slice(&self.nonce_bytes()),
            associated_data,
            &mut plain_text[start..],
            Tag::from_slice(&tag),
        );

        match result {
            Ok(()) => {
                self.advance();
                Ok(())
            }
            Err(e) => {
                plain_text.truncate(start);
                Err(e)
            }
        }
    }

    fn advance(&mut self) {
        self.nonce += 1;
        if self.nonce == KEY_ROTATE_INTERVAL {
            self.rotate_key();
        }
    }

    // newChainingKey, newKey = HKDF(chainingKey, currentKey); nonce resets.
    fn rotate_key(&mut self) {
        let hkdf = Hkdf::<Sha256>::new(Some(&self.salt), &self.secret_key);
        let mut okm = [0; 64];
        hkdf.expand(&[], &mut okm)
            .expect("64 bytes is a valid hkdf output length");

        self.salt.copy_from_slice(&okm[..32]);
        self.secret_key.copy_from_slice(&okm[32..]);
        self.nonce = 0;
    }

    #[cfg(test)]
    pub fn secret_key(&self) -> [u8; 32] {
        self.secret_key
    }
}
