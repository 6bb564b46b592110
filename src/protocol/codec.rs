//! Codec for encoding/decoding protocol messages to/from frames
//!
//! This module provides the bridge between typed messages and binary frames.

use super::frame::{Frame, FrameType};
use super::messages::{NodeAddr, Package, RosterSync, StoreSync};
use bytes::Bytes;
use std::io::{self, Error as IoError, ErrorKind};

/// Trait for messages that can be encoded to frames
pub trait Encodable {
    /// Get the frame type for this message
    fn frame_type(&self) -> FrameType;

    /// Encode the message payload to bytes
    fn encode_payload(&self) -> io::Result<Bytes>;

    /// Encode the complete frame
    fn encode_frame(&self) -> io::Result<Frame> {
        Ok(Frame::new(self.frame_type(), self.encode_payload()?))
    }
}

/// Trait for messages that can be decoded from frames
pub trait Decodable: Sized {
    /// Expected frame type for this message
    fn expected_frame_type() -> FrameType;

    /// Decode the message from a payload
    fn decode_payload(payload: &[u8]) -> io::Result<Self>;

    /// Decode from a complete frame, validating the frame type
    fn decode_frame(frame: &Frame) -> io::Result<Self> {
        if frame.frame_type != Self::expected_frame_type() {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "Expected frame type {:?}, got {:?}",
                    Self::expected_frame_type(),
                    frame.frame_type
                ),
            ));
        }
        Self::decode_payload(&frame.payload)
    }
}

/// Helper macro to implement Encodable and Decodable for a message type
macro_rules! impl_codec {
    ($type:ty, $frame_type:expr) => {
        impl Encodable for $type {
            fn frame_type(&self) -> FrameType {
                $frame_type
            }

            fn encode_payload(&self) -> io::Result<Bytes> {
                serde_json::to_vec(self)
                    .map(Bytes::from)
                    .map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }

        impl Decodable for $type {
            fn expected_frame_type() -> FrameType {
                $frame_type
            }

            fn decode_payload(payload: &[u8]) -> io::Result<Self> {
                serde_json::from_slice(payload).map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }
    };
}

impl_codec!(Package, FrameType::Package);
impl_codec!(StoreSync, FrameType::StoreSync);
impl_codec!(RosterSync, FrameType::RosterSync);

/// Any frame decoded into its typed message, matched exhaustively by the
/// frame-type discriminator
#[derive(Debug, Clone)]
pub enum Inbound {
    Package(Package),
    StoreSync(StoreSync),
    RosterSync(RosterSync),
    Probe(NodeAddr),
    Reply(NodeAddr),
}

impl Inbound {
    /// Decode a frame into a typed message
    pub fn decode(frame: &Frame) -> io::Result<Self> {
        let payload = &frame.payload;

        let json_err = |e: serde_json::Error| IoError::new(ErrorKind::InvalidData, e);

        match frame.frame_type {
            FrameType::Package => Ok(Self::Package(
                serde_json::from_slice(payload).map_err(json_err)?,
            )),
            FrameType::StoreSync => Ok(Self::StoreSync(
                serde_json::from_slice(payload).map_err(json_err)?,
            )),
            FrameType::RosterSync => Ok(Self::RosterSync(
                serde_json::from_slice(payload).map_err(json_err)?,
            )),
            FrameType::Probe => Ok(Self::Probe(
                serde_json::from_slice(payload).map_err(json_err)?,
            )),
            FrameType::Reply => Ok(Self::Reply(
                serde_json::from_slice(payload).map_err(json_err)?,
            )),
        }
    }

    /// Get the frame type of this message
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Package(_) => FrameType::Package,
            Self::StoreSync(_) => FrameType::StoreSync,
            Self::RosterSync(_) => FrameType::RosterSync,
            Self::Probe(_) => FrameType::Probe,
            Self::Reply(_) => FrameType::Reply,
        }
    }
}

/// Encode a message directly to wire bytes (convenience function)
pub fn encode<T: Encodable>(msg: &T) -> io::Result<Bytes> {
    msg.encode_frame().map(|f| f.encode_to_bytes())
}

/// Decode a frame to a specific message type (convenience function)
pub fn decode<T: Decodable>(frame: &Frame) -> io::Result<T> {
    T::decode_frame(frame)
}

fn node_addr_frame(frame_type: FrameType, addr: &NodeAddr) -> io::Result<Bytes> {
    let payload = serde_json::to_vec(addr)
        .map(Bytes::from)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
    Ok(Frame::new(frame_type, payload).encode_to_bytes())
}

/// Encode a discovery probe datagram
pub fn encode_probe(addr: &NodeAddr) -> io::Result<Bytes> {
    node_addr_frame(FrameType::Probe, addr)
}

/// Encode a discovery reply datagram
pub fn encode_reply(addr: &NodeAddr) -> io::Result<Bytes> {
    node_addr_frame(FrameType::Reply, addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = Package::direct(3, "Hello, World!", vec![1, 2]);

        let frame = original.encode_frame().unwrap();
        assert_eq!(frame.frame_type, FrameType::Package);

        let decoded = Package::decode_frame(&frame).unwrap();
        assert_eq!(original.receiver_id, decoded.receiver_id);
        assert_eq!(original.message, decoded.message);
        assert_eq!(original.files, decoded.files);
    }

    #[test]
    fn test_inbound_enum() {
        let msg = Package::registration("Alice");
        let frame = msg.encode_frame().unwrap();

        let decoded = Inbound::decode(&frame).unwrap();
        assert_eq!(decoded.frame_type(), FrameType::Package);

        match decoded {
            Inbound::Package(package) => {
                assert_eq!(package.sender_name.as_deref(), Some("Alice"));
                assert!(package.is_for_connection);
            }
            _ => panic!("Expected Package message"),
        }
    }

    #[test]
    fn test_wrong_frame_type() {
        let msg = Package::broadcast("hi", vec![]);
        let frame = msg.encode_frame().unwrap();

        // Try to decode as a store sync (wrong type)
        let result = StoreSync::decode_frame(&frame);
        assert!(result.is_err());
    }

    #[test]
    fn test_probe_and_reply_share_payload_shape() {
        let addr = NodeAddr::new("192.168.1.20", 9000);

        let probe = Frame::decode_complete(&encode_probe(&addr).unwrap()).unwrap();
        let reply = Frame::decode_complete(&encode_reply(&addr).unwrap()).unwrap();

        match Inbound::decode(&probe).unwrap() {
            Inbound::Probe(decoded) => assert_eq!(decoded, addr),
            other => panic!("Expected Probe, got {:?}", other.frame_type()),
        }
        match Inbound::decode(&reply).unwrap() {
            Inbound::Reply(decoded) => assert_eq!(decoded, addr),
            other => panic!("Expected Reply, got {:?}", other.frame_type()),
        }
    }

    #[test]
    fn test_undecodable_payload() {
        let frame = Frame::new(FrameType::Package, "not json");
        assert!(Inbound::decode(&frame).is_err());
    }

    #[test]
    fn test_encode_helper() {
        let msg = Package::registration("Alice");
        let bytes = encode(&msg).unwrap();
        assert!(!bytes.is_empty());

        let frame = Frame::decode_complete(&bytes).unwrap();
        let decoded: Package = decode(&frame).unwrap();
        assert_eq!(decoded.sender_name.as_deref(), Some("Alice"));
    }
}
