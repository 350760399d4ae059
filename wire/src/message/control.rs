use crate::codec::{put_bytes16, take_bytes16, WireDecode, WireEncode, WireError};

// A ping/pong must leave room for the 16-bit type and length embellishments
// inside the 65535-byte message limit.
const PING_OVERHEAD: usize = 2 + 2 + 2;
const PONG_OVERHEAD: usize = 2 + 2;

/// Keep-alive message. Serves two purposes: keeps long-lived TCP
/// connections open and, with random padding, obfuscates the traffic
/// pattern.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Ping {
    pub pong_length: u16,
    pub data: Vec<u8>,
}

impl Ping {
    /// Builds a ping with `length` bytes of random padding asking for a
    /// `pong_length`-byte pong. Fails when either side of the exchange
    /// would exceed the message size limit.
    pub fn new(length: u16, pong_length: u16) -> Result<Self, ()> {
        if usize::from(length) + PING_OVERHEAD > usize::from(u16::MAX)
            || usize::from(pong_length) + PONG_OVERHEAD > usize::from(u16::MAX)
        {
            return Err(());
        }
        Ok(Ping {
            pong_length,
            data: vec![0; usize::from(length)],
        })
    }
}

impl WireEncode for Ping {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.pong_length.encode(buf);
        put_bytes16(buf, &self.data);
    }
}

impl WireDecode for Ping {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Ping {
            pong_length: u16::decode(cursor)?,
            data: take_bytes16(cursor)?,
        })
    }
}

/// The answer to a `Ping`; carries exactly the number of ignored bytes the
/// ping asked for. A ping asking for an oversize pong is ignored instead.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Pong {
    pub data: Vec<u8>,
}

impl Pong {
    pub fn new(ping: &Ping) -> Self {
        Pong {
            data: vec![0; usize::from(ping.pong_length)],
        }
    }
}

impl WireEncode for Pong {
    fn encode(&self, buf: &mut Vec<u8>) {
        put_bytes16(buf, &self.data);
    }
}

impl WireDecode for Pong {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Pong {
            data: take_bytes16(cursor)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn ping_reference_bytes() {
        let msg_bytes = hex::decode("0012000a000401020304").unwrap();

        let correct = Ping {
            pong_length: 10,
            data: hex::decode("01020304").unwrap(),
        };
        let message = Message::from_bytes(&msg_bytes).unwrap();
        assert_eq!(message, Message::Ping(correct.clone()));
        assert_eq!(Message::Ping(correct).to_bytes(), msg_bytes);
    }

    #[test]
    fn pong_reference_bytes() {
        let msg_bytes = hex::decode("0013000201c8").unwrap();

        let correct = Pong {
            data: hex::decode("01c8").unwrap(),
        };
        let message = Message::from_bytes(&msg_bytes).unwrap();
        assert_eq!(message, Message::Pong(correct.clone()));
        assert_eq!(Message::Pong(correct).to_bytes(), msg_bytes);
    }

    #[test]
    fn oversize_ping_is_rejected_at_construction() {
        assert!(Ping::new(u16::MAX, 16).is_err());
        assert!(Ping::new(16, u16::MAX).is_err());
        assert!(Ping::new(256, 256).is_ok());
    }

    #[test]
    fn pong_answers_requested_length() {
        let ping = Ping::new(4, 17).unwrap();
        assert_eq!(Pong::new(&ping).data.len(), 17);
    }
}
