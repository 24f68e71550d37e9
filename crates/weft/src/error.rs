//! Error taxonomy for the streaming codec.
//!
//! Errors are split by side: [`EncodeError`] covers failures while flattening
//! values into chunks, [`DecodeError`] covers transport, framing, and payload
//! failures while reconstructing. Failures that a consumer observes through a
//! decoded future or sequence travel as [`Failure`], so that one producer's
//! death never takes down its siblings.

use std::fmt;
use std::sync::Arc;

use crate::frame::ProducerId;
use crate::value::Value;

/// Failure while flattening a value tree into chunks.
///
/// Only root-level encoding failures surface here; a failure while encoding a
/// producer's frame is converted into that producer's error frame instead.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The value contains an opaque node no installed reducer applies to.
    #[error("value cannot be encoded: {reason}")]
    Unencodable { reason: String },

    /// The flattened value could not be rendered as wire text.
    #[error("wire text could not be produced: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure while reconstructing a value tree from chunks.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The chunk stream ended before the root chunk arrived.
    #[error("chunk stream ended before the root chunk")]
    MissingRoot,

    /// A producer chunk did not match the `<id>:<status>:<payload>` form.
    #[error("malformed chunk header: {chunk}")]
    MalformedChunk { chunk: String },

    /// A wire value did not match the expected shape.
    #[error("malformed wire value: {reason}")]
    MalformedValue { reason: String },

    /// A frame carried a status byte outside its producer's status set.
    #[error("unknown status {status} for producer {id}")]
    UnknownStatus { id: ProducerId, status: u8 },

    /// A reduced payload named a tag with no installed reviver.
    #[error("no reviver installed for tag `{tag}`")]
    UnknownTag { tag: String },

    /// A payload announced a producer id that is already live.
    #[error("producer {id} announced twice")]
    DuplicateProducer { id: ProducerId },

    /// A user reviver rejected its payload.
    #[error("reviver for tag `{tag}` failed: {reason}")]
    Reviver { tag: String, reason: String },

    /// The chunk stream ended or failed while producers were still pending.
    #[error("{0}")]
    Interrupted(Interrupted),

    /// The underlying byte transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A chunk did not contain valid JSON text.
    #[error("invalid JSON in chunk: {0}")]
    Json(#[from] serde_json::Error),
}

/// Marker delivered to every pending sink when the chunk stream ends or fails
/// before all producers reached their terminal frame.
#[derive(Debug, Clone, Default)]
pub struct Interrupted {
    /// The pump failure that cut the stream short, if there was one.
    /// `None` means the stream simply ended early.
    pub cause: Option<Arc<DecodeError>>,
}

impl Interrupted {
    /// Interruption caused by a pump failure.
    pub fn with_cause(cause: DecodeError) -> Self {
        Self {
            cause: Some(Arc::new(cause)),
        }
    }
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "chunk stream interrupted: {cause}"),
            None => f.write_str("chunk stream ended before every producer finished"),
        }
    }
}

/// Terminal failure observed through a future or sequence.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    /// The producing side supplied this cause.
    #[error("producer failed: {0:?}")]
    Cause(Value),

    /// The chunk stream ended or failed before this producer finished.
    #[error("{0}")]
    Interrupted(Interrupted),

    /// The frame destined for this producer could not be decoded.
    #[error("frame could not be decoded: {0}")]
    Decode(Arc<DecodeError>),
}

impl Failure {
    /// Failure with a source-supplied cause.
    pub fn cause(value: impl Into<Value>) -> Self {
        Failure::Cause(value.into())
    }

    /// Whether this failure came from stream interruption rather than the
    /// producer itself.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Failure::Interrupted(_))
    }
}
