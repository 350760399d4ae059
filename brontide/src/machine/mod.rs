mod cipher_state;
mod handshake;
mod symmetric_state;

pub use self::cipher_state::{CipherState, KEY_ROTATE_INTERVAL, MAC_SIZE};
pub use self::handshake::{
    ActOne, ActThree, ActTwo, Handshake, HandshakeActOne, HandshakeError,
    HandshakeInitiatorActOne, HandshakeNew, Machine, TransportError,
};

#[cfg(test)]
mod test_bolt0008;
