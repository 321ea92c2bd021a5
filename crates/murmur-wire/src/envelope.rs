// Topic-addressed framing over the wire buffer codec.
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, WireBuffer};

const TOPIC_LEN_BYTES: usize = 4;
const REFERENCE_BYTES: usize = 8;

/// A topic-addressed, framed unit of payload.
///
/// The routing header is a length-prefixed UTF-8 topic followed by a
/// fixed-width correlation reference (`0` = unset). A frame whose header is
/// all blank is a keepalive. On the wire:
///
/// `[topic-length: u32][topic bytes][reference: u64][payload bytes]`
///
/// ```
/// use murmur_wire::Envelope;
///
/// let mut message = Envelope::new("prices");
/// message.data_mut().write_f64(101.25);
/// let frame = message.encode().expect("encode");
/// let mut decoded = Envelope::decode(frame).expect("decode");
/// assert_eq!(decoded.topic(), "prices");
/// assert_eq!(decoded.data_mut().read_f64().expect("read"), 101.25);
/// ```
#[derive(Clone, PartialEq)]
pub struct Envelope {
    // Fixed at construction; only the payload is mutable afterwards.
    topic: String,
    reference: u64,
    data: WireBuffer,
}

impl Envelope {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            reference: 0,
            data: WireBuffer::new(),
        }
    }

    pub fn with_reference(topic: impl Into<String>, reference: u64) -> Self {
        Self {
            topic: topic.into(),
            reference,
            data: WireBuffer::new(),
        }
    }

    /// Routing-only frame with an all-blank header, dropped by receivers.
    pub fn keepalive() -> Self {
        Self::new("")
    }

    /// Subscribe control message: the payload is the requested delivery
    /// count (`0` = unsubscribe, `u32::MAX` = unlimited).
    pub fn subscribe(topic: impl Into<String>, count: u32) -> Self {
        let mut message = Self::new(topic);
        message.data.write_length(count);
        message
    }

    /// Nonzero correlation reference for request/response pairing.
    pub fn random_reference() -> u64 {
        rand::random::<u64>().max(1)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn reference(&self) -> u64 {
        self.reference
    }

    pub fn set_reference(&mut self, reference: u64) {
        self.reference = reference;
    }

    pub fn data(&self) -> &WireBuffer {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut WireBuffer {
        &mut self.data
    }

    /// New envelope carrying only the routing fields, no payload; used for
    /// unsubscribe and ack control messages.
    pub fn clone_header(&self) -> Self {
        Self::with_reference(self.topic.clone(), self.reference)
    }

    /// Request/response pairing: topics and references both equal.
    pub fn matches(&self, other: &Self) -> bool {
        self.topic == other.topic && self.reference == other.reference
    }

    /// Delivery filtering: topics equal.
    pub fn matches_topic(&self, other: &Self) -> bool {
        self.topic == other.topic
    }

    pub fn is_keepalive(&self) -> bool {
        self.topic.is_empty() && self.reference == 0
    }

    pub fn encode(&self) -> Result<Bytes> {
        let topic_bytes = self.topic.as_bytes();
        let topic_len = u32::try_from(topic_bytes.len()).map_err(|_| Error::FrameTooLarge)?;
        let payload = self.data.as_slice();
        let mut buf = BytesMut::with_capacity(
            TOPIC_LEN_BYTES + topic_bytes.len() + REFERENCE_BYTES + payload.len(),
        );
        buf.put_u32(topic_len);
        buf.extend_from_slice(topic_bytes);
        buf.put_u64(self.reference);
        buf.extend_from_slice(payload);
        Ok(buf.freeze())
    }

    pub fn decode(frame: Bytes) -> Result<Self> {
        let mut buf = frame;
        if buf.remaining() < TOPIC_LEN_BYTES {
            return Err(Error::Incomplete);
        }
        let topic_len = buf.get_u32() as usize;
        if buf.remaining() < topic_len + REFERENCE_BYTES {
            return Err(Error::Incomplete);
        }
        let topic_bytes = buf.copy_to_bytes(topic_len);
        let topic = String::from_utf8(topic_bytes.to_vec()).map_err(|_| Error::InvalidUtf8)?;
        let reference = buf.get_u64();
        Ok(Self {
            topic,
            reference,
            data: WireBuffer::from_slice(&buf),
        })
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}: {}> {:?}",
            if self.topic.is_empty() {
                "(blank)"
            } else {
                &self.topic
            },
            self.reference,
            self.data
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_header_and_payload() {
        let mut message = Envelope::with_reference("orders", 99);
        message.data_mut().write_string("first").expect("write");
        message.data_mut().write_u32(7);
        let frame = message.encode().expect("encode");

        let mut decoded = Envelope::decode(frame).expect("decode");
        assert_eq!(decoded.topic(), "orders");
        assert_eq!(decoded.reference(), 99);
        assert_eq!(decoded.data_mut().read_string().expect("read"), "first");
        assert_eq!(decoded.data_mut().read_u32().expect("read"), 7);
        assert!(decoded.data().at_end());
    }

    #[test]
    fn clone_header_drops_the_payload() {
        let mut message = Envelope::with_reference("orders", 5);
        message.data_mut().write_u64(123);
        let header = message.clone_header();
        assert_eq!(header.topic(), "orders");
        assert_eq!(header.reference(), 5);
        assert!(header.data().is_empty());
    }

    #[test]
    fn matching_requires_equal_references_only_for_full_match() {
        let request = Envelope::with_reference("quotes", 10);
        let response = Envelope::with_reference("quotes", 10);
        let unrelated = Envelope::with_reference("quotes", 11);
        assert!(request.matches(&response));
        assert!(!request.matches(&unrelated));
        assert!(request.matches_topic(&unrelated));
        assert!(!request.matches_topic(&Envelope::new("trades")));
    }

    #[test]
    fn keepalive_has_a_blank_header() {
        let ping = Envelope::keepalive();
        assert!(ping.is_keepalive());
        let frame = ping.encode().expect("encode");
        let decoded = Envelope::decode(frame).expect("decode");
        assert!(decoded.is_keepalive());
        assert!(!Envelope::new("orders").is_keepalive());
        assert!(!Envelope::with_reference("", 3).is_keepalive());
    }

    #[test]
    fn subscribe_control_carries_the_count() {
        let mut message = Envelope::subscribe("prices", 3);
        assert_eq!(message.data_mut().read_length().expect("count"), 3);

        let mut unlimited = Envelope::subscribe("prices", crate::UNLIMITED);
        assert_eq!(
            unlimited.data_mut().read_length().expect("count"),
            crate::UNLIMITED
        );
    }

    #[test]
    fn decode_rejects_truncated_frames() {
        assert_eq!(
            Envelope::decode(Bytes::from_static(b"\x00\x00")).expect_err("short"),
            Error::Incomplete
        );
        // Declared topic longer than the frame.
        assert_eq!(
            Envelope::decode(Bytes::from_static(b"\x00\x00\x00\xffab")).expect_err("topic"),
            Error::Incomplete
        );
    }

    #[test]
    fn decode_rejects_invalid_topic_utf8() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.extend_from_slice(&[0xff, 0xfe]);
        buf.put_u64(0);
        assert_eq!(
            Envelope::decode(buf.freeze()).expect_err("utf8"),
            Error::InvalidUtf8
        );
    }

    #[test]
    fn random_references_are_nonzero() {
        for _ in 0..32 {
            assert_ne!(Envelope::random_reference(), 0);
        }
    }
}
