use crate::codec::{put_bytes16, take_bytes16, WireDecode, WireEncode, WireError};
use crate::feature::RawFeatureVector;
use crate::message::types::{ChannelId, Hash256};
use crate::tlv::TlvStream;

// TLV tag of the chain-hash list carried by `init`.
const INIT_TLV_NETWORKS: u64 = 1;

/// The first message either side sends once the transport is up, carrying
/// the feature bits it understands. A connection proceeds only when the
/// required sets are mutually supported.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Init {
    pub global_features: RawFeatureVector,
    pub local_features: RawFeatureVector,
    /// Chains the node is interested in; absent means all chains.
    pub networks: Option<Vec<Hash256>>,
}

impl Init {
    pub fn new(global_features: RawFeatureVector, local_features: RawFeatureVector) -> Self {
        Init {
            global_features,
            local_features,
            networks: None,
        }
    }
}

impl WireEncode for Init {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.global_features.encode(buf);
        self.local_features.encode(buf);
        if let Some(networks) = &self.networks {
            let mut value = Vec::with_capacity(networks.len() * 32);
            for chain in networks {
                value.extend_from_slice(&chain.0);
            }
            let mut stream = TlvStream::new();
            stream.insert(INIT_TLV_NETWORKS, value);
            stream.encode(buf);
        }
    }
}

impl WireDecode for Init {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        let global_features = RawFeatureVector::decode(cursor)?;
        let local_features = RawFeatureVector::decode(cursor)?;
        let stream = TlvStream::decode(cursor)?;
        let networks = match stream.get(INIT_TLV_NETWORKS) {
            None => None,
            Some(value) => {
                if value.len() % 32 != 0 {
                    return Err(WireError::Invalid("networks tlv is not whole chain hashes"));
                }
                let mut chains = Vec::with_capacity(value.len() / 32);
                for raw in value.chunks(32) {
                    let mut hash = [0; 32];
                    hash.copy_from_slice(raw);
                    chains.push(Hash256(hash));
                }
                Some(chains)
            }
        };
        Ok(Init {
            global_features,
            local_features,
            networks,
        })
    }
}

/// A protocol failure report. A zeroed channel id refers to all channels
/// with the peer; the connection is expected to die after one of these.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ErrorMessage {
    pub channel_id: ChannelId,
    pub data: Vec<u8>,
}

impl ErrorMessage {
    pub fn new(channel_id: ChannelId, text: &str) -> Self {
        ErrorMessage {
            channel_id,
            data: text.as_bytes().to_vec(),
        }
    }

    /// The payload interpreted as text, for operator logs.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl WireEncode for ErrorMessage {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.channel_id.encode(buf);
        put_bytes16(buf, &self.data);
    }
}

impl WireDecode for ErrorMessage {
    fn decode(cursor: &mut &[u8]) -> Result<Self, WireError> {
        Ok(ErrorMessage {
            channel_id: ChannelId::decode(cursor)?,
            data: take_bytes16(cursor)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureBit::*;
    use crate::message::Message;

    #[test]
    fn init_reference_bytes() {
        let data = vec![0, 16, 0, 0, 0, 1, 138];

        let message = Message::from_bytes(&data).unwrap();
        let init = message.as_init().expect("an init message");
        assert!(init.local_features.is_set(DataLossProtectOptional));
        assert!(init.local_features.is_set(InitialRoutingSync));
        assert!(init.local_features.is_set(GossipQueriesOptional));

        assert_eq!(Message::Init(init.clone()).to_bytes(), data);
    }

    #[test]
    fn init_with_networks_round_trip() {
        let init = Init {
            global_features: RawFeatureVector::new(),
            local_features: RawFeatureVector::new().set_bit(DataLossProtectOptional),
            networks: Some(vec![Hash256::BITCOIN_CHAIN_HASH]),
        };
        let encoded = Message::Init(init.clone()).to_bytes();
        let restored = Message::from_bytes(&encoded).unwrap();
        assert_eq!(restored, Message::Init(init));
    }

    #[test]
    fn error_message_round_trip() {
        let error = ErrorMessage::new(ChannelId([3; 32]), "sync error");
        let encoded = Message::Error(error.clone()).to_bytes();
        let restored = Message::from_bytes(&encoded).unwrap();
        assert_eq!(restored, Message::Error(error));
    }
}
