//! Streaming value codec.
//!
//! Serializes an in-memory [`Value`] tree, which may transitively contain
//! deferred computations (futures) and lazy asynchronous sequences, into a
//! serial stream of textual chunks, and reconstructs on the receiving side an
//! equivalent tree whose embedded futures and sequences resolve as their
//! sources do.
//!
//! # Protocol
//!
//! The first chunk encodes the non-async skeleton of the tree with a
//! placeholder id for every embedded producer. Each subsequent chunk is one
//! frame `"<id>:<status>:<payload>"` from one producer; frames from distinct
//! producers interleave freely while order within a producer is preserved.
//! Producer completion, failure, and stream-level interruption each have
//! their own encoding, so one producer's death never takes down its siblings.
//!
//! # Example
//!
//! ```ignore
//! use weft::{decode_stream, encode_stream, transport, EncodeOptions, Revivers, Value};
//!
//! let tree = Value::record([("answer", Value::future(async { Ok(Value::from(42)) }))]);
//! let chunks = encode_stream(tree, EncodeOptions::new());
//!
//! let (client, server) = tokio::io::duplex(1024);
//! tokio::spawn(transport::write_chunks(chunks, client));
//! let root = decode_stream(transport::read_chunks(server), Revivers::new()).await?;
//! ```

pub mod codec;
pub mod decode;
pub mod encode;
pub mod error;
pub mod frame;
pub mod transport;
pub mod value;

pub use codec::{Reducer, Reviver, Revivers};
pub use decode::decode_stream;
pub use encode::{encode_stream, ChunkStream, CoerceError, EncodeOptions};
pub use error::{DecodeError, EncodeError, Failure, Interrupted};
pub use frame::{Frame, FutureStatus, ProducerId, SequenceStatus};
pub use value::{
    items_sequence, BoxValueFuture, BoxValueSequence, ErrorValue, SeqStep, Value, ValueSequence,
};
