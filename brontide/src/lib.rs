#![forbid(unsafe_code)]

//! Brontide: the BOLT #8 encrypted and authenticated transport.
//!
//! Peers run the Noise_XK handshake (the initiator must already know the
//! responder's static public key), then exchange records framed as two
//! ChaCha20-Poly1305 chunks: an encrypted 2-byte length and the encrypted
//! payload, each with its 16-byte tag.

mod machine;

pub use self::machine::{
    ActOne, ActThree, ActTwo, CipherState, Handshake, HandshakeActOne, HandshakeError,
    HandshakeInitiatorActOne, HandshakeNew, Machine, TransportError, KEY_ROTATE_INTERVAL,
    MAC_SIZE,
};
