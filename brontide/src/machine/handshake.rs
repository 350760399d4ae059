use std::{error, fmt};

use bytes::{BufMut, BytesMut};
use secp256k1::ecdh::SharedSecret;
use secp256k1::{Error as EcdsaError, PublicKey, Secp256k1, SecretKey};
use wire::{Message, WireDecode, WireEncode, WireError};

use super::cipher_state::{CipherState, MAC_SIZE};
use super::symmetric_state::SymmetricState;

// ecdh performs an ECDH operation between public and private. The returned
// value is the sha256 of the compressed shared point.
fn ecdh(pk: &PublicKey, sk: &SecretKey) -> [u8; 32] {
    SharedSecret::new(pk, sk).secret_bytes()
}

#[derive(Debug)]
pub enum HandshakeError {
    Crypto(EcdsaError),
    Cipher,
    UnknownHandshakeVersion(String),
}

impl error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            HandshakeError::Crypto(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::HandshakeError::*;

        match self {
            Crypto(e) => write!(f, "crypto error: {}", e),
            Cipher => write!(f, "handshake payload failed authentication"),
            UnknownHandshakeVersion(msg) => write!(f, "{}", msg),
        }
    }
}

/// Failures of the steady-state record layer.
#[derive(Debug)]
pub enum TransportError {
    /// A chunk failed its Poly1305 tag; the session is dead.
    DecryptionFailure,
    /// Refusing to frame a payload above the 16-bit length.
    FrameTooLarge(usize),
    /// The decrypted payload is not a well-formed message.
    Wire(WireError),
}

impl error::Error for TransportError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            TransportError::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::TransportError::*;

        match self {
            DecryptionFailure => write!(f, "record failed authentication"),
            FrameTooLarge(size) => write!(
                f,
                "payload of {} bytes exceeds the max allowed message length of (2^16)-1",
                size,
            ),
            Wire(e) => write!(f, "wire error: {}", e),
        }
    }
}

impl From<WireError> for TransportError {
    fn from(e: WireError) -> Self {
        TransportError::Wire(e)
    }
}

// Any message carrying a different version byte aborts the handshake
// immediately.
#[repr(u8)]
#[derive(Eq, PartialEq)]
enum HandshakeVersion {
    _0 = 0,
}

/// Act one, initiator to responder: version, an ephemeral key, and a tag
/// proving knowledge of the responder's static key.
///
/// 1 + 33 + 16
pub struct ActOne {
    pub bytes: [u8; ActOne::SIZE],
}

impl Default for ActOne {
    fn default() -> Self {
        ActOne {
            bytes: [0; Self::SIZE],
        }
    }
}

impl AsRef<[u8]> for ActOne {
    fn as_ref(&self) -> &[u8] {
        &self.bytes[..]
    }
}

impl AsMut<[u8]> for ActOne {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..]
    }
}

impl ActOne {
    pub const SIZE: usize = 1 + 33 + MAC_SIZE;

    fn new(version: HandshakeVersion, key: [u8; 33], tag: [u8; MAC_SIZE]) -> Self {
        let mut s = ActOne {
            bytes: [0; Self::SIZE],
        };
        s.bytes[0] = version as _;
        s.bytes[1..34].copy_from_slice(&key);
        s.bytes[34..].copy_from_slice(&tag);
        s
    }

    fn version(&self) -> Result<HandshakeVersion, ()> {
        match self.bytes[0] {
            0 => Ok(HandshakeVersion::_0),
            _ => Err(()),
        }
    }

    fn key(&self) -> Result<PublicKey, EcdsaError> {
        PublicKey::from_slice(&self.bytes[1..34])
    }

    fn tag(&self) -> [u8; MAC_SIZE] {
        let mut v = [0; MAC_SIZE];
        v.copy_from_slice(&self.bytes[34..]);
        v
    }
}

/// Act two, responder to initiator: same layout as act one, carrying the
/// responder's ephemeral key.
pub type ActTwo = ActOne;

/// Act three, initiator to responder: version, the initiator's encrypted
/// static key with its tag, and a final tag over empty plaintext.
///
/// 1 + 33 + 16 + 16
pub struct ActThree {
    pub bytes: [u8; ActThree::SIZE],
}

impl Default for ActThree {
    fn default() -> Self {
        ActThree {
            bytes: [0; Self::SIZE],
        }
    }
}

impl AsRef<[u8]> for ActThree {
    fn as_ref(&self) -> &[u8] {
        &self.bytes[..]
    }
}

impl AsMut<[u8]> for ActThree {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..]
    }
}

impl ActThree {
    pub const SIZE: usize = 1 + 33 + 2 * MAC_SIZE;

    fn new(
        version: HandshakeVersion,
        key: Vec<u8>,
        tag_first: [u8; MAC_SIZE],
        tag_second: [u8; MAC_SIZE],
    ) -> Self {
        let mut s = ActThree {
            bytes: [0; Self::SIZE],
        };
        s.bytes[0] = version as _;
        s.bytes[1..34].copy_from_slice(&key);
        s.bytes[34..50].copy_from_slice(&tag_first);
        s.bytes[50..].copy_from_slice(&tag_second);
        s
    }

    fn version(&self) -> Result<HandshakeVersion, ()> {
        match self.bytes[0] {
            0 => Ok(HandshakeVersion::_0),
            _ => Err(()),
        }
    }

    fn key(&self) -> &[u8] {
        &self.bytes[1..34]
    }

    fn tag_first(&self) -> [u8; MAC_SIZE] {
        let mut v = [0; MAC_SIZE];
        v.copy_from_slice(&self.bytes[34..50]);
        v
    }

    fn tag_second(&self) -> [u8; MAC_SIZE] {
        let mut v = [0; MAC_SIZE];
        v.copy_from_slice(&self.bytes[50..]);
        v
    }
}

// The precise Noise instantiation. Both sides must agree on this string
// and on the prologue or the very first tag check fails.
static PROTOCOL_NAME: &str = "Noise_XK_secp256k1_ChaChaPoly_SHA256";
static PROLOGUE: &[u8] = b"lightning";

/// Handshake state before any act was produced or consumed.
pub struct HandshakeNew {
    symmetric_state: SymmetricState,
    local_static: SecretKey,
    remote_static: PublicKey,
    pub ephemeral_gen: fn() -> Result<SecretKey, EcdsaError>,
}

impl HandshakeNew {
    pub fn new(
        initiator: bool,
        local_secret: SecretKey,
        remote_public: PublicKey,
    ) -> Result<Self, EcdsaError> {
        let mut symmetric_state = SymmetricState::new(PROTOCOL_NAME);
        symmetric_state.mix_hash(PROLOGUE);
        if initiator {
            symmetric_state.mix_hash(&remote_public.serialize());
        } else {
            let local_pub = PublicKey::from_secret_key(&Secp256k1::new(), &local_secret);
            symmetric_state.mix_hash(&local_pub.serialize());
        }

        Ok(HandshakeNew {
            symmetric_state,
            local_static: local_secret,
            remote_static: remote_public,
            ephemeral_gen: || {
                let sk: [u8; 32] = rand::random();
                SecretKey::from_slice(&sk)
            },
        })
    }

    // gen_act_one generates the initial packet to be sent from initiator to
    // responder: a fresh ephemeral key is hashed into the handshake digest
    // and an ECDH against the responder's static key keys the first tag.
    //
    //    -> e, es
    pub fn gen_act_one(mut self) -> Result<(ActOne, HandshakeInitiatorActOne), HandshakeError> {
        // e
        let local_ephemeral = (self.ephemeral_gen)().map_err(HandshakeError::Crypto)?;

        let local_ephemeral_pub =
            PublicKey::from_secret_key(&Secp256k1::new(), &local_ephemeral);
        let ephemeral = local_ephemeral_pub.serialize();
        self.symmetric_state.mix_hash(&ephemeral);

        // es
        let s = ecdh(&self.remote_static, &local_ephemeral);
        self.symmetric_state.mix_key(&s);

        let auth_payload = self
            .symmetric_state
            .encrypt_and_hash(&[], &mut Vec::new())
            .map_err(|_| HandshakeError::Cipher)?;

        let act_one = ActOne::new(HandshakeVersion::_0, ephemeral, auth_payload);
        let handshake_act_one = HandshakeInitiatorActOne {
            base: self,
            local_ephemeral,
        };
        Ok((act_one, handshake_act_one))
    }

    // recv_act_one is the responder's mirror image: extend the digest with
    // the initiator's ephemeral and derive the same shared secret from our
    // static key. An initiator who does not know our static key fails
    // here.
    pub fn recv_act_one(mut self, act_one: ActOne) -> Result<HandshakeActOne, HandshakeError> {
        if act_one.version().is_err() {
            let msg = format!("Act One: invalid handshake version: {}", act_one.bytes[0]);
            return Err(HandshakeError::UnknownHandshakeVersion(msg));
        }

        // e
        let remote_ephemeral = act_one.key().map_err(HandshakeError::Crypto)?;
        self.symmetric_state.mix_hash(&remote_ephemeral.serialize());

        // es
        let s = ecdh(&remote_ephemeral, &self.local_static);
        self.symmetric_state.mix_key(&s);

        self.symmetric_state
            .decrypt_and_hash(&[], act_one.tag())
            .map_err(|_| HandshakeError::Cipher)?;

        Ok(HandshakeActOne {
            base: self,
            remote_ephemeral,
        })
    }

    #[cfg(test)]
    pub fn handshake_digest(&self) -> [u8; 32] {
        self.symmetric_state.handshake_digest()
    }
}

/// Responder state after a valid act one.
pub struct HandshakeActOne {
    base: HandshakeNew,
    remote_ephemeral: PublicKey,
}

impl HandshakeActOne {
    // gen_act_two builds the responder's packet: identical in layout to
    // act one but mixing an ephemeral-ephemeral ECDH.
    //
    //    <- e, ee
    pub fn gen_act_two(mut self) -> Result<(ActTwo, Handshake), HandshakeError> {
        // e
        let local_ephemeral = (self.base.ephemeral_gen)().map_err(HandshakeError::Crypto)?;

        let local_ephemeral_pub =
            PublicKey::from_secret_key(&Secp256k1::new(), &local_ephemeral);
        let ephemeral = local_ephemeral_pub.serialize();
        self.base.symmetric_state.mix_hash(&ephemeral);

        // ee
        let s = ecdh(&self.remote_ephemeral, &local_ephemeral);
        self.base.symmetric_state.mix_key(&s);

        let auth_payload = self
            .base
            .symmetric_state
            .encrypt_and_hash(&[], &mut Vec::new())
            .map_err(|_| HandshakeError::Cipher)?;

        let act_two = ActTwo::new(HandshakeVersion::_0, ephemeral, auth_payload);
        let handshake = Handshake {
            base: self.base,
            local_ephemeral,
            remote_ephemeral: self.remote_ephemeral,
        };
        Ok((act_two, handshake))
    }
}

/// Initiator state between sending act one and receiving act two.
pub struct HandshakeInitiatorActOne {
    base: HandshakeNew,
    local_ephemeral: SecretKey,
}

impl HandshakeInitiatorActOne {
    // recv_act_two processes the responder's packet; success authenticates
    // the responder to the initiator.
    pub fn recv_act_two(mut self, act_two: ActTwo) -> Result<Handshake, HandshakeError> {
        if act_two.version().is_err() {
            let msg = format!("Act Two: invalid handshake version: {}", act_two.bytes[0]);
            return Err(HandshakeError::UnknownHandshakeVersion(msg));
        }

        // e
        let remote_ephemeral = act_two.key().map_err(HandshakeError::Crypto)?;
        self.base
            .symmetric_state
            .mix_hash(&remote_ephemeral.serialize());

        // ee
        let s = ecdh(&remote_ephemeral, &self.local_ephemeral);
        self.base.symmetric_state.mix_key(&s);

        self.base
            .symmetric_state
            .decrypt_and_hash(&[], act_two.tag())
            .map_err(|_| HandshakeError::Cipher)?;

        Ok(Handshake {
            base: self.base,
            local_ephemeral: self.local_ephemeral,
            remote_ephemeral,
        })
    }
}

/// Both sides hold this state around act three; afterwards it splits into
/// the steady-state `Machine`.
pub struct Handshake {
    base: HandshakeNew,
    local_ephemeral: SecretKey,
    remote_ephemeral: PublicKey,
}

impl Handshake {
    // gen_act_three transmits the initiator's static key under strong
    // forward secrecy and performs the final ECDH, yielding the session.
    //
    //    -> s, se
    pub fn gen_act_three(mut self) -> Result<(ActThree, Machine), HandshakeError> {
        let local_static_pub =
            PublicKey::from_secret_key(&Secp256k1::new(), &self.base.local_static);
        let our_pubkey = local_static_pub.serialize();
        let mut cipher_text = Vec::with_capacity(our_pubkey.len());
        let tag = self
            .base
            .symmetric_state
            .encrypt_and_hash(&our_pubkey, &mut cipher_text)
            .map_err(|_| HandshakeError::Cipher)?;

        let s = ecdh(&self.remote_ephemeral, &self.base.local_static);
        self.base.symmetric_state.mix_key(&s);

        let auth_payload = self
            .base
            .symmetric_state
            .encrypt_and_hash(&[], &mut Vec::new())
            .map_err(|_| HandshakeError::Cipher)?;

        let act_three = ActThree::new(HandshakeVersion::_0, cipher_text, tag, auth_payload);

        Ok((act_three, self.split(false)))
    }

    // recv_act_three teaches the responder the initiator's static key;
    // decrypting it successfully is what authenticates the initiator.
    pub fn recv_act_three(mut self, act_three: ActThree) -> Result<Machine, HandshakeError> {
        if act_three.version().is_err() {
            let msg = format!(
                "Act Three: invalid handshake version: {}",
                act_three.bytes[0],
            );
            return Err(HandshakeError::UnknownHandshakeVersion(msg));
        }

        // s
        let remote_pub = self
            .base
            .symmetric_state
            .decrypt_and_hash(act_three.key(), act_three.tag_first())
            .map_err(|_| HandshakeError::Cipher)?;
        self.base.remote_static =
            PublicKey::from_slice(&remote_pub).map_err(HandshakeError::Crypto)?;

        // se
        let se = ecdh(&self.base.remote_static, &self.local_ephemeral);
        self.base.symmetric_state.mix_key(&se);

        self.base
            .symmetric_state
            .decrypt_and_hash(&[], act_three.tag_second())
            .map_err(|_| HandshakeError::Cipher)?;

        // The responder reads with the initiator's sending key.
        Ok(self.split(true))
    }

    fn split(self, swap: bool) -> Machine {
        let chaining_key = self.base.symmetric_state.chaining_key();
        let (send, recv) = self.base.symmetric_state.into_pair();
        let (send, recv) = if swap { (recv, send) } else { (send, recv) };
        Machine {
            send_cipher: send,
            recv_cipher: recv,
            remote_static: self.base.remote_static,
            chaining_key,
            pending_length: None,
        }
    }
}

// Number of bytes used to prefix-encode the length of a record payload.
const LENGTH_HEADER_SIZE: usize = 2;

/// The steady-state transport: one cipher per direction, each record
/// framed as an encrypted length chunk followed by an encrypted payload
/// chunk.
pub struct Machine {
    send_cipher: CipherState,
    recv_cipher: CipherState,
    remote_static: PublicKey,
    chaining_key: [u8; 32],
    // A record's length chunk is decrypted as soon as 18 bytes are
    // buffered; the value parks here until the payload arrives in full.
    pending_length: Option<usize>,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Machine")
            .field("send_cipher", &self.send_cipher)
            .field("recv_cipher", &self.recv_cipher)
            .field("remote_static", &self.remote_static)
            .finish_non_exhaustive()
    }
}

impl Machine {
    pub fn remote_static(&self) -> &PublicKey {
        &self.remote_static
    }

    /// Frames and encrypts one raw payload into `dst`.
    pub fn write_frame(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), TransportError> {
        if payload.len() > usize::from(u16::MAX) {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }
        let length_buffer = (payload.len() as u16).to_be_bytes();

        dst.reserve(payload.len() + LENGTH_HEADER_SIZE + MAC_SIZE * 2);

        let mut cipher_text = Vec::with_capacity(payload.len() + LENGTH_HEADER_SIZE);
        let tag = self
            .send_cipher
            .encrypt(&[], &mut cipher_text, &length_buffer)
            .map_err(|_| TransportError::DecryptionFailure)?;
        dst.put_slice(&cipher_text);
        dst.put_slice(&tag);

        cipher_text.clear();
        let tag = self
            .send_cipher
            .encrypt(&[], &mut cipher_text, payload)
            .map_err(|_| TransportError::DecryptionFailure)?;
        dst.put_slice(&cipher_text);
        dst.put_slice(&tag);

        Ok(())
    }

    /// Encodes and frames one wire message.
    pub fn write(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), TransportError> {
        self.write_frame(&item.to_bytes(), dst)
    }

    /// Consumes as much of `src` as forms a complete record and returns
    /// its payload; `None` until enough bytes are buffered. Call again
    /// after feeding more data.
    pub fn read_frame(&mut self, src: &mut BytesMut) -> Result<Option<Vec<u8>>, TransportError> {
        let length = match self.pending_length {
            Some(length) => length,
            None => {
                if src.len() < LENGTH_HEADER_SIZE + MAC_SIZE {
                    return Ok(None);
                }
                let cipher = src.split_to(LENGTH_HEADER_SIZE);
                let tag = Self::take_tag(src);

                let mut plain = Vec::with_capacity(LENGTH_HEADER_SIZE);
                self.recv_cipher
                    .decrypt(&[], &mut plain, cipher.as_ref(), tag)
                    .map_err(|_| TransportError::DecryptionFailure)?;

                let length = usize::from(u16::from_be_bytes([plain[0], plain[1]]));
                self.pending_length = Some(length);
                length
            }
        };

        if src.len() < length + MAC_SIZE {
            return Ok(None);
        }
        self.pending_length = None;

        let cipher = src.split_to(length);
        let tag = Self::take_tag(src);

        let mut plain = Vec::with_capacity(length);
        self.recv_cipher
            .decrypt(&[], &mut plain, cipher.as_ref(), tag)
            .map_err(|_| TransportError::DecryptionFailure)?;

        Ok(Some(plain))
    }

    /// Reads and decodes one wire message, if a whole record is buffered.
    pub fn read(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        match self.read_frame(src)? {
            None => Ok(None),
            Some(payload) => Ok(Some(Message::from_bytes(&payload)?)),
        }
    }

    fn take_tag(src: &mut BytesMut) -> [u8; MAC_SIZE] {
        let tag_bytes = src.split_to(MAC_SIZE);
        let mut tag = [0; MAC_SIZE];
        tag.copy_from_slice(tag_bytes.as_ref());
        tag
    }

    #[cfg(test)]
    pub fn send_cipher_key(&self) -> [u8; 32] {
        self.send_cipher.secret_key()
    }

    #[cfg(test)]
    pub fn recv_cipher_key(&self) -> [u8; 32] {
        self.recv_cipher.secret_key()
    }

    #[cfg(test)]
    pub fn chaining_key(&self) -> [u8; 32] {
        self.chaining_key
    }
}
