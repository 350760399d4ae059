use std::fmt;

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use super::cipher_state::{CipherState, MAC_SIZE};

/// Houses the handshake digest and the HKDF chaining key while the
/// handshake runs, together with the cipher state keyed by the most recent
/// DH result. The final session keys fall out of the accumulated
/// triple-DH.
pub struct SymmetricState {
    cipher_state: CipherState,

    // Salt of the HKDF ratchet: every mix_key folds a DH result into it.
    chaining_key: [u8; 32],

    // Cumulative hash of every handshake message; never sent, used as the
    // AEAD associated data so transcripts cannot be spliced.
    handshake_digest: [u8; 32],
}

impl fmt::Debug for SymmetricState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SymmetricState")
            .field("chaining_key", &hex::encode(self.chaining_key))
            .field("handshake_digest", &hex::encode(self.handshake_digest))
            .finish_non_exhaustive()
    }
}

impl SymmetricState {
    pub fn new(protocol_name: &str) -> Self {
        let digest: [u8; 32] = Sha256::digest(protocol_name.as_bytes()).into();

        SymmetricState {
            cipher_state: CipherState::new([0; 32], [0; 32]),
            chaining_key: digest,
            handshake_digest: digest,
        }
    }

    /// The HKDF key ratchet, called with each DH output. The first 32
    /// bytes become the next chaining key, the last 32 the temporary key
    /// for AEAD operations until the next DH.
    pub fn mix_key(&mut self, input: &[u8]) {
        let hkdf = Hkdf::<Sha256>::new(Some(&self.chaining_key), input);
        let mut okm = [0; 64];
        hkdf.expand(&[], &mut okm)
            .expect("64 bytes is a valid hkdf output length");

        self.chaining_key.copy_from_slice(&okm[..32]);

        let mut temp_key = [0; 32];
        temp_key.copy_from_slice(&okm[32..]);
        self.cipher_state = CipherState::new([0; 32], temp_key);
    }

    /// Folds data into the cumulative handshake digest.
    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.handshake_digest);
        hasher.update(data);
        self.handshake_digest.copy_from_slice(&hasher.finalize());
    }

    /// Encrypts with the handshake digest as associated data, then mixes
    /// ciphertext and tag back into the digest.
    pub fn encrypt_and_hash(
        &mut self,
        plain_text: &[u8],
        cipher_text: &mut Vec<u8>,
    ) -> Result<[u8; MAC_SIZE], chacha20poly1305::aead::Error> {
        let start = cipher_text.len();
        let tag = self
            .cipher_state
            .encrypt(&self.handshake_digest, cipher_text, plain_text)?;

        let mut cipher_text_with_mac = cipher_text[start..].to_vec();
        cipher_text_with_mac.extend_from_slice(&tag);
        self.mix_hash(&cipher_text_with_mac);

        Ok(tag)
    }

    /// Mirror of `encrypt_and_hash` for the receiving side.
    pub fn decrypt_and_hash(
        &mut self,
        cipher_text: &[u8],
        tag: [u8; MAC_SIZE],
    ) -> Result<Vec<u8>, chacha20poly1305::aead::Error> {
        let mut plain_text = Vec::new();
        self.cipher_state
            .decrypt(&self.handshake_digest, &mut plain_text, cipher_text, tag)?;

        let mut cipher_text_with_mac = cipher_text.to_vec();
        cipher_text_with_mac.extend_from_slice(&tag);
        self.mix_hash(&cipher_text_with_mac);

        Ok(plain_text)
    }

    /// Final split: derives the two directional session keys from the
    /// chaining key, which also becomes the rotation salt for both.
    pub fn into_pair(self) -> (CipherState, CipherState) {
        let hkdf = Hkdf::<Sha256>::new(Some(&self.chaining_key), &[]);
        let mut okm = [0; 64];
        hkdf.expand(&[], &mut okm)
            .expect("64 bytes is a valid hkdf output length");

        let mut send_key = [0; 32];
        send_key.copy_from_slice(&okm[..32]);

        let mut recv_key = [0; 32];
        recv_key.copy_from_slice(&okm[32..]);

        let salt = self.chaining_key;
        (
            CipherState::new(salt, send_key),
            CipherState::new(salt, recv_key),
        )
    }

    pub fn chaining_key(&self) -> [u8; 32] {
        self.chaining_key
    }

    #[cfg(test)]
    pub fn handshake_digest(&self) -> [u8; 32] {
        self.handshake_digest
    }
}
