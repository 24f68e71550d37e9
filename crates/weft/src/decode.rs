//! Decoder: reconstructs the root value from the head chunk and pumps
//! producer frames to their per-id sinks.
//!
//! The head chunk is decoded before anything else runs; decoding it registers
//! a sink for every producer id the root announces (depth-first, so a sink
//! always exists before any frame can name it). A background pump then reads
//! the remaining chunks and dispatches each frame to its sink. Frames whose
//! payload announces further producers register the nested sinks while the
//! payload is decoded, before the frame is delivered.
//!
//! Sinks are unbounded in-memory channels: the encoder's pacing bounds how
//! many frames can be in flight per producer, and an unbounded queue keeps
//! one unread sink from head-of-line-blocking every other consumer. A sink is
//! removed when its consumer saw the terminal frame, stopped early, or was
//! dropped; once the registry is empty nothing can ever be delivered again,
//! so the pump stops and releases the transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::codec::{self, OpenSink, Revivers};
use crate::error::{DecodeError, Failure, Interrupted};
use crate::frame::{Frame, FutureStatus, ProducerId, SequenceStatus};
use crate::value::{BoxValueFuture, BoxValueSequence, SeqStep, Value, ValueSequence};

/// One delivered frame: the raw status byte plus the decoded payload.
struct SinkFrame {
    status: u8,
    value: Value,
}

/// What a sink consumer receives: a frame, or the reason there will be none.
type SinkEvent = Result<SinkFrame, Failure>;

type SinkMap = Arc<Mutex<HashMap<ProducerId, mpsc::UnboundedSender<SinkEvent>>>>;

/// Reconstruct a value tree from a lazy sequence of chunks.
///
/// Resolves as soon as the head chunk has been decoded; futures and sequences
/// embedded in the returned tree resolve as the remaining chunks arrive. The
/// chunk stream is consumed by a background pump until every embedded
/// consumer is done (or the stream ends).
///
/// Must be called within a tokio runtime.
pub async fn decode_stream<S>(mut chunks: S, revivers: Revivers) -> Result<Value, DecodeError>
where
    S: Stream<Item = Result<String, DecodeError>> + Send + Unpin + 'static,
{
    let head = match chunks.next().await {
        Some(chunk) => chunk?,
        None => return Err(DecodeError::MissingRoot),
    };
    let json: Json = serde_json::from_str(&head)?;

    let sinks: SinkMap = Arc::new(Mutex::new(HashMap::new()));
    let mut scope = DecoderScope::new(sinks.clone());
    let root = codec::decode_value(json, &revivers, &mut scope)?;
    scope.commit();

    tokio::spawn(pump(chunks, sinks, revivers));
    Ok(root)
}

/// Read producer chunks and dispatch each frame to its sink.
async fn pump<S>(mut chunks: S, sinks: SinkMap, revivers: Revivers)
where
    S: Stream<Item = Result<String, DecodeError>> + Send + Unpin + 'static,
{
    let failure = loop {
        if sinks.lock().is_empty() {
            debug!("every sink closed, stopping pump");
            return;
        }
        let chunk = match chunks.next().await {
            // Normal end of stream.
            None => break None,
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => break Some(err),
        };
        let frame = match Frame::parse(&chunk) {
            Ok(frame) => frame,
            Err(err) => break Some(err),
        };
        let id = frame.id;

        // Payload decode may register nested sinks; a failure here is local
        // to the frame's own sink and the stream continues.
        let event: SinkEvent = match decode_payload(&frame, &sinks, &revivers) {
            Ok(value) => Ok(SinkFrame {
                status: frame.status,
                value,
            }),
            Err(err) => {
                warn!(%id, %err, "frame payload failed to decode");
                Err(Failure::Decode(Arc::new(err)))
            }
        };

        let sender = sinks.lock().get(&id).cloned();
        match sender {
            Some(sender) => {
                trace!(%id, status = frame.status, "dispatching frame");
                // A closed sink means its consumer went away mid-flight.
                let _ = sender.send(event);
            }
            None => trace!(%id, "dropping frame for unknown producer"),
        }
    };

    let remaining: Vec<_> = {
        let mut sinks = sinks.lock();
        sinks.drain().collect()
    };
    if let Some(err) = &failure {
        warn!(%err, sinks = remaining.len(), "pump failed");
    } else {
        debug!(sinks = remaining.len(), "chunk stream ended");
    }
    let interrupted = match failure {
        Some(err) => Interrupted::with_cause(err),
        None => Interrupted::default(),
    };
    for (id, sender) in remaining {
        trace!(%id, "interrupting pending sink");
        let _ = sender.send(Err(Failure::Interrupted(interrupted.clone())));
    }
}

fn decode_payload(frame: &Frame, sinks: &SinkMap, revivers: &Revivers) -> Result<Value, DecodeError> {
    let json: Json = serde_json::from_str(&frame.payload)?;
    let mut scope = DecoderScope::new(sinks.clone());
    let value = codec::decode_value(json, revivers, &mut scope)?;
    scope.commit();
    Ok(value)
}

/// Sink-opening scope handed to the synchronous codec.
///
/// New sinks are staged locally and published to the shared registry only
/// once the whole payload decoded; a payload that fails halfway (duplicate
/// id, malformed wrapper, reviver rejection) leaves no orphaned sink behind.
struct DecoderScope {
    sinks: SinkMap,
    staged: HashMap<ProducerId, mpsc::UnboundedSender<SinkEvent>>,
}

impl DecoderScope {
    fn new(sinks: SinkMap) -> Self {
        Self {
            sinks,
            staged: HashMap::new(),
        }
    }

    fn open(&mut self, id: ProducerId) -> Result<mpsc::UnboundedReceiver<SinkEvent>, DecodeError> {
        if self.staged.contains_key(&id) || self.sinks.lock().contains_key(&id) {
            return Err(DecodeError::DuplicateProducer { id });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.staged.insert(id, tx);
        debug!(%id, "sink registered");
        Ok(rx)
    }

    fn commit(mut self) {
        if self.staged.is_empty() {
            return;
        }
        let mut sinks = self.sinks.lock();
        for (id, sender) in self.staged.drain() {
            sinks.insert(id, sender);
        }
    }
}

impl OpenSink for DecoderScope {
    fn open_future(&mut self, id: ProducerId) -> Result<BoxValueFuture, DecodeError> {
        let mut rx = self.open(id)?;
        let mut guard = SinkGuard::new(id, self.sinks.clone());
        Ok(Box::pin(async move {
            let event = rx.recv().await;
            guard.release();
            match event {
                Some(Ok(frame)) => match FutureStatus::from_wire(frame.status) {
                    Some(FutureStatus::Ok) => Ok(frame.value),
                    Some(FutureStatus::Err) => Err(Failure::Cause(frame.value)),
                    None => Err(Failure::Decode(Arc::new(DecodeError::UnknownStatus {
                        id,
                        status: frame.status,
                    }))),
                },
                Some(Err(failure)) => Err(failure),
                None => Err(Failure::Interrupted(Interrupted::default())),
            }
        }))
    }

    fn open_sequence(&mut self, id: ProducerId) -> Result<BoxValueSequence, DecodeError> {
        let rx = self.open(id)?;
        Ok(Box::new(DecodedSequence {
            id,
            rx,
            guard: SinkGuard::new(id, self.sinks.clone()),
            finished: false,
        }))
    }
}

/// Removes a sink from the registry on whatever path its consumer exits.
struct SinkGuard {
    id: ProducerId,
    sinks: SinkMap,
    released: bool,
}

impl SinkGuard {
    fn new(id: ProducerId, sinks: SinkMap) -> Self {
        Self {
            id,
            sinks,
            released: false,
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.sinks.lock().remove(&self.id);
            trace!(id = %self.id, "sink removed");
        }
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Consumer side of a decoded sequence: one frame per step, dispatched on
/// status.
struct DecodedSequence {
    id: ProducerId,
    rx: mpsc::UnboundedReceiver<SinkEvent>,
    guard: SinkGuard,
    finished: bool,
}

impl DecodedSequence {
    fn finish(&mut self) {
        self.finished = true;
        self.guard.release();
    }
}

#[async_trait]
impl ValueSequence for DecodedSequence {
    async fn next(&mut self) -> SeqStep {
        if self.finished {
            return SeqStep::Done(Value::Null);
        }
        match self.rx.recv().await {
            Some(Ok(frame)) => match SequenceStatus::from_wire(frame.status) {
                Some(SequenceStatus::Yield) => SeqStep::Item(frame.value),
                Some(SequenceStatus::Return) => {
                    self.finish();
                    SeqStep::Done(frame.value)
                }
                Some(SequenceStatus::Error) => {
                    self.finish();
                    SeqStep::Failed(Failure::Cause(frame.value))
                }
                None => {
                    let status = frame.status;
                    self.finish();
                    SeqStep::Failed(Failure::Decode(Arc::new(DecodeError::UnknownStatus {
                        id: self.id,
                        status,
                    })))
                }
            },
            Some(Err(failure)) => {
                self.finish();
                SeqStep::Failed(failure)
            }
            None => {
                self.finish();
                SeqStep::Failed(Failure::Interrupted(Interrupted::default()))
            }
        }
    }

    async fn close(&mut self) {
        self.finish();
    }
}
