use crate::error::LinkError;
use core::fmt;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Largest frame body the packet transport carries (the link MTU).
pub const MAX_FRAME_SIZE: usize = 256;
pub const PACKET_HEADER_LEN: usize = 4;
pub const MAX_PACKET_PAYLOAD: usize = MAX_FRAME_SIZE - PACKET_HEADER_LEN;
pub const REQUEST_LEN: usize = 3;

/// Highest multiplexing key the transport can address.
pub const MAX_MUX_KEY: u8 = 31;

/// Subscription mask meaning "every topic".
pub const ALL_TOPICS: TopicMask = 0;

const_assert!(PACKET_HEADER_LEN + MAX_PACKET_PAYLOAD == MAX_FRAME_SIZE);
const_assert!(REQUEST_LEN <= MAX_FRAME_SIZE);

pub type TopicMask = u16;
pub type FrameBuffer = Vec<u8, MAX_FRAME_SIZE>;
pub type PayloadBuffer = Vec<u8, MAX_PACKET_PAYLOAD>;

/// Logical service port on a shared link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct MuxKey(u8);

impl MuxKey {
    // Housekeeping keys sit at the top of the range, clear of data keys.
    pub const PING: MuxKey = MuxKey(28);
    pub const BUF_FREE: MuxKey = MuxKey(29);
    pub const UPTIME: MuxKey = MuxKey(30);
    pub const CONTROL: MuxKey = MuxKey(MAX_MUX_KEY);

    pub const SERVICE_KEYS: [MuxKey; 3] = [MuxKey::PING, MuxKey::BUF_FREE, MuxKey::UPTIME];

    pub fn new(value: u8) -> Result<Self, LinkError> {
        if value > MAX_MUX_KEY {
            return Err(LinkError::InvalidKey(value));
        }
        Ok(MuxKey(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Keys answered by the housekeeping service, never usable for data.
    pub fn is_service(self) -> bool {
        MuxKey::SERVICE_KEYS.contains(&self)
    }
}

impl TryFrom<u8> for MuxKey {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MuxKey::new(value)
    }
}

impl From<MuxKey> for u8 {
    fn from(key: MuxKey) -> Self {
        key.0
    }
}

impl fmt::Display for MuxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node address on the spacecraft network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(pub u8);

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// One unit of exchange on a link: a multiplexing key and a bounded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    key: MuxKey,
    body: FrameBuffer,
}

impl Frame {
    pub fn new(key: MuxKey, body: &[u8]) -> Result<Self, LinkError> {
        let body = Vec::from_slice(body).map_err(|()| LinkError::PayloadTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        })?;
        Ok(Self { key, body })
    }

    pub fn key(&self) -> MuxKey {
        self.key
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// A telemetry sample as carried between processes.
///
/// The payload is bounded at construction; a packet that exists always fits
/// in a single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryPacket {
    source_id: u16,
    payload: PayloadBuffer,
}

impl TelemetryPacket {
    pub fn new(source_id: u16, payload: &[u8]) -> Result<Self, LinkError> {
        let payload = Vec::from_slice(payload).map_err(|()| LinkError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PACKET_PAYLOAD,
        })?;
        Ok(Self { source_id, payload })
    }

    pub fn source_id(&self) -> u16 {
        self.source_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn to_frame(&self, key: MuxKey) -> Result<Frame, LinkError> {
        let size = PACKET_HEADER_LEN + self.payload.len();
        let overflow = |()| LinkError::PayloadTooLarge { size, max: MAX_FRAME_SIZE };

        let mut body = FrameBuffer::new();
        let len = self.payload.len() as u16;
        body.extend_from_slice(&self.source_id.to_be_bytes()).map_err(overflow)?;
        body.extend_from_slice(&len.to_be_bytes()).map_err(overflow)?;
        body.extend_from_slice(&self.payload).map_err(overflow)?;
        Ok(Frame { key, body })
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, LinkError> {
        let body = frame.body();
        if body.len() < PACKET_HEADER_LEN {
            return Err(LinkError::Malformed("telemetry packet header truncated"));
        }
        let source_id = u16::from_be_bytes([body[0], body[1]]);
        let len = u16::from_be_bytes([body[2], body[3]]) as usize;
        let payload = &body[PACKET_HEADER_LEN..];
        if payload.len() != len {
            return Err(LinkError::Malformed("telemetry packet length mismatch"));
        }
        Self::new(source_id, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    Snapshot,
    Disconnect,
}

impl RequestKind {
    fn to_wire(self) -> u8 {
        match self {
            RequestKind::Subscribe => 1,
            RequestKind::Unsubscribe => 2,
            RequestKind::Snapshot => 3,
            RequestKind::Disconnect => 4,
        }
    }

    fn from_wire(value: u8) -> Result<Self, LinkError> {
        match value {
            1 => Ok(RequestKind::Subscribe),
            2 => Ok(RequestKind::Unsubscribe),
            3 => Ok(RequestKind::Snapshot),
            4 => Ok(RequestKind::Disconnect),
            _ => Err(LinkError::Malformed("unknown request kind")),
        }
    }
}

/// Control message from a subscriber to a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRequest {
    pub kind: RequestKind,
    pub topic_mask: TopicMask,
}

impl TelemetryRequest {
    pub fn subscribe(topic_mask: TopicMask) -> Self {
        Self { kind: RequestKind::Subscribe, topic_mask }
    }

    pub fn unsubscribe(topic_mask: TopicMask) -> Self {
        Self { kind: RequestKind::Unsubscribe, topic_mask }
    }

    pub fn snapshot(topic_mask: TopicMask) -> Self {
        Self { kind: RequestKind::Snapshot, topic_mask }
    }

    pub fn disconnect() -> Self {
        Self { kind: RequestKind::Disconnect, topic_mask: ALL_TOPICS }
    }

    pub fn to_frame(&self, key: MuxKey) -> Result<Frame, LinkError> {
        let mask = self.topic_mask.to_be_bytes();
        Frame::new(key, &[self.kind.to_wire(), mask[0], mask[1]])
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, LinkError> {
        let body = frame.body();
        if body.len() != REQUEST_LEN {
            return Err(LinkError::Malformed("telemetry request length"));
        }
        Ok(Self {
            kind: RequestKind::from_wire(body[0])?,
            topic_mask: u16::from_be_bytes([body[1], body[2]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_key_bounds() {
        assert!(MuxKey::new(0).is_ok());
        assert!(MuxKey::new(MAX_MUX_KEY).is_ok());
        assert_eq!(MuxKey::new(32), Err(LinkError::InvalidKey(32)));
    }

    #[test]
    fn test_service_keys_clear_of_low_data_keys() {
        for value in 0..MuxKey::PING.value() {
            assert!(!MuxKey::new(value).unwrap().is_service());
        }
        assert!(MuxKey::SERVICE_KEYS.iter().all(|key| key.is_service()));
        assert!(!MuxKey::CONTROL.is_service());
    }

    #[test]
    fn test_packet_payload_limit() {
        let fits = [0xAB; MAX_PACKET_PAYLOAD];
        assert!(TelemetryPacket::new(7, &fits).is_ok());

        let too_big = [0xAB; MAX_PACKET_PAYLOAD + 1];
        let err = TelemetryPacket::new(7, &too_big).unwrap_err();
        assert_eq!(err, LinkError::PayloadTooLarge { size: MAX_PACKET_PAYLOAD + 1, max: MAX_PACKET_PAYLOAD });
        assert!(err.is_config_error());
    }

    #[test]
    fn test_packet_frame_layout() {
        let key = MuxKey::new(5).unwrap();
        let packet = TelemetryPacket::new(0x0102, b"hi").unwrap();
        let frame = packet.to_frame(key).unwrap();

        assert_eq!(frame.key(), key);
        assert_eq!(frame.body(), &[0x01, 0x02, 0x00, 0x02, b'h', b'i']);
        assert_eq!(TelemetryPacket::from_frame(&frame).unwrap(), packet);
    }

    #[test]
    fn test_full_size_packet_fills_frame() {
        let packet = TelemetryPacket::new(1, &[0x55; MAX_PACKET_PAYLOAD]).unwrap();
        let frame = packet.to_frame(MuxKey::new(3).unwrap()).unwrap();
        assert_eq!(frame.len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let frame = Frame::new(MuxKey::new(5).unwrap(), &[0x00, 0x01, 0x00]).unwrap();
        assert!(matches!(TelemetryPacket::from_frame(&frame), Err(LinkError::Malformed(_))));

        let frame = Frame::new(MuxKey::new(5).unwrap(), &[0x00, 0x01, 0x00, 0x09, 0x01]).unwrap();
        assert!(matches!(TelemetryPacket::from_frame(&frame), Err(LinkError::Malformed(_))));
    }

    #[test]
    fn test_request_encoding() {
        let request = TelemetryRequest::subscribe(0x8001);
        let frame = request.to_frame(MuxKey::CONTROL).unwrap();
        assert_eq!(frame.body(), &[1, 0x80, 0x01]);
        assert_eq!(TelemetryRequest::from_frame(&frame).unwrap(), request);

        let bogus = Frame::new(MuxKey::CONTROL, &[9, 0, 0]).unwrap();
        assert!(TelemetryRequest::from_frame(&bogus).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let body = [0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            Frame::new(MuxKey::PING, &body),
            Err(LinkError::PayloadTooLarge { .. })
        ));
    }
}
