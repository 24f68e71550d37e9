//! Chunk framing: producer ids, status codes, and the delimited chunk syntax.
//!
//! A producer chunk is the textual triple `"<id>:<status>:<payload>"` with
//! decimal id and status and a JSON payload. The root chunk is bare JSON and
//! never passes through [`Frame`]. Status bytes for futures and sequences
//! overlap numerically; the decoder disambiguates by the producer kind the
//! announcing placeholder declared.

use std::fmt;

use crate::error::DecodeError;

/// Identifier of one producer within an encode/decode pair.
///
/// Strictly positive and unique per pair, assigned in registration order.
/// Zero is reserved and never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId(u64);

impl ProducerId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        debug_assert!(raw > 0, "producer id zero is reserved");
        ProducerId(raw)
    }

    /// Raw numeric value as it appears on the wire.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out producer ids in registration order.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    last: u64,
}

impl IdAllocator {
    pub(crate) fn allocate(&mut self) -> ProducerId {
        self.last += 1;
        ProducerId(self.last)
    }
}

/// Frame status for future producers. Wire values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FutureStatus {
    /// The future resolved with a value.
    Ok = 0,
    /// The future failed with a cause.
    Err = 1,
}

impl FutureStatus {
    /// Wire byte for this status.
    pub fn wire(self) -> u8 {
        self as u8
    }

    /// Parse a wire byte, `None` if it is outside the future status set.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FutureStatus::Ok),
            1 => Some(FutureStatus::Err),
            _ => None,
        }
    }
}

/// Frame status for sequence producers. Wire values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SequenceStatus {
    /// The sequence produced an item.
    Yield = 0,
    /// The sequence terminated abnormally.
    Error = 1,
    /// The sequence terminated normally with a return value.
    Return = 2,
}

impl SequenceStatus {
    /// Wire byte for this status.
    pub fn wire(self) -> u8 {
        self as u8
    }

    /// Parse a wire byte, `None` if it is outside the sequence status set.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SequenceStatus::Yield),
            1 => Some(SequenceStatus::Error),
            2 => Some(SequenceStatus::Return),
            _ => None,
        }
    }
}

/// One producer chunk: `(id, status, payload)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Producer the frame belongs to.
    pub id: ProducerId,
    /// Raw status byte; interpretation depends on the producer kind.
    pub status: u8,
    /// JSON text of the frame value.
    pub payload: String,
}

impl Frame {
    /// Render the delimited chunk form.
    pub fn to_chunk(&self) -> String {
        format!("{}:{}:{}", self.id, self.status, self.payload)
    }

    /// Parse a chunk in the delimited form.
    pub fn parse(chunk: &str) -> Result<Frame, DecodeError> {
        let mut parts = chunk.splitn(3, ':');
        let (id, status, payload) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(status), Some(payload)) => (id, status, payload),
            _ => return Err(malformed(chunk)),
        };
        if !is_decimal(id) || !is_decimal(status) {
            return Err(malformed(chunk));
        }
        let id: u64 = id.parse().map_err(|_| malformed(chunk))?;
        let status: u8 = status.parse().map_err(|_| malformed(chunk))?;
        if id == 0 {
            return Err(malformed(chunk));
        }
        Ok(Frame {
            id: ProducerId::from_raw(id),
            status,
            payload: payload.to_string(),
        })
    }
}

fn is_decimal(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

fn malformed(chunk: &str) -> DecodeError {
    // Cap the echoed chunk so a huge payload does not flood error text.
    let mut chunk = chunk.to_string();
    if chunk.len() > 96 {
        let cut = (0..=96).rev().find(|i| chunk.is_char_boundary(*i)).unwrap_or(0);
        chunk.truncate(cut);
        chunk.push('…');
    }
    DecodeError::MalformedChunk { chunk }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame {
            id: ProducerId::from_raw(7),
            status: SequenceStatus::Return.wire(),
            payload: "\"done\"".to_string(),
        };
        let chunk = frame.to_chunk();
        assert_eq!(chunk, "7:2:\"done\"");
        assert_eq!(Frame::parse(&chunk).expect("parse"), frame);
    }

    #[test]
    fn test_payload_may_contain_delimiters() {
        let frame = Frame::parse("3:0:{\"url\":\"a:b:c\"}").expect("parse");
        assert_eq!(frame.id.get(), 3);
        assert_eq!(frame.payload, "{\"url\":\"a:b:c\"}");
    }

    #[test]
    fn test_rejects_malformed_headers() {
        for chunk in ["", "1", "1:0", "x:0:null", "1:x:null", "+1:0:null", "0:0:null", "-1:0:null"] {
            assert!(
                matches!(Frame::parse(chunk), Err(DecodeError::MalformedChunk { .. })),
                "chunk {chunk:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_status_wire_values_are_stable() {
        assert_eq!(FutureStatus::Ok.wire(), 0);
        assert_eq!(FutureStatus::Err.wire(), 1);
        assert_eq!(SequenceStatus::Yield.wire(), 0);
        assert_eq!(SequenceStatus::Error.wire(), 1);
        assert_eq!(SequenceStatus::Return.wire(), 2);
        assert_eq!(FutureStatus::from_wire(2), None);
        assert_eq!(SequenceStatus::from_wire(3), None);
    }

    #[test]
    fn test_id_allocation_is_dense_and_ordered() {
        let mut ids = IdAllocator::default();
        assert_eq!(ids.allocate().get(), 1);
        assert_eq!(ids.allocate().get(), 2);
        assert_eq!(ids.allocate().get(), 3);
    }
}
