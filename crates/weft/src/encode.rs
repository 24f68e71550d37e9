//! Encoder: flattens the root value, registers every embedded producer, and
//! fairly multiplexes their frames into one serial chunk stream.
//!
//! The multiplexer keeps one armed next-frame request per live producer in a
//! [`FuturesUnordered`] race. Whichever producer has a frame ready wins the
//! race; its frame is emitted, any producers registered while encoding that
//! frame are armed, and the winner is re-armed unless the frame was terminal.
//! Ordering between distinct producers is unspecified; ordering within one
//! producer is preserved.
//!
//! Emission is paced by a capacity-1 channel: the next frame is pulled from
//! the race only after the consumer took the previous chunk, which bounds
//! memory to one pending frame per live producer. Dropping the [`ChunkStream`]
//! cancels every armed request, closes every remaining sequence concurrently,
//! and waits for all of them to settle.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{self, BoxFuture};
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::codec::{self, Reducer, RegisterProducer};
use crate::error::{EncodeError, Failure};
use crate::frame::{Frame, FutureStatus, IdAllocator, ProducerId, SequenceStatus};
use crate::value::{BoxValueFuture, BoxValueSequence, ErrorValue, SeqStep, Value};

/// Fallback applied to a failure cause that cannot be encoded as-is.
pub type CoerceError = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Encode-side options.
#[derive(Clone, Default)]
pub struct EncodeOptions {
    reducers: Vec<Reducer>,
    coerce_error: Option<CoerceError>,
}

impl EncodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an additional type-tagged reducer. Reducers are tried in
    /// installation order; the first that applies wins.
    pub fn with_reducer(mut self, reducer: Reducer) -> Self {
        self.reducers.push(reducer);
        self
    }

    /// Install the fallback for otherwise-unencodable failure causes.
    pub fn with_coerce_error<F>(mut self, coerce: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.coerce_error = Some(Arc::new(coerce));
        self
    }
}

/// Lazy chunk sequence produced by [`encode_stream`].
///
/// Yields the root chunk first, then producer chunks until every producer
/// reached its terminal frame. Dropping the stream triggers the encoder's
/// early-termination path.
pub struct ChunkStream {
    rx: mpsc::Receiver<Result<String, EncodeError>>,
}

impl Stream for ChunkStream {
    type Item = Result<String, EncodeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Serialize `value` into a lazy sequence of textual chunks.
///
/// A root chunk is emitted first; it encodes the non-async skeleton of the
/// tree with a placeholder id for every embedded future and sequence. Each
/// placeholder's frames follow as the producers make progress. An encoding
/// failure at the root terminates the stream with the error; a failure inside
/// a producer only kills that producer.
///
/// Must be called within a tokio runtime.
pub fn encode_stream(value: Value, options: EncodeOptions) -> ChunkStream {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(run_multiplexer(value, options, tx));
    ChunkStream { rx }
}

/// One live producer: the id plus the source the frames come from.
struct ProducerEntry {
    id: ProducerId,
    source: ProducerSource,
}

enum ProducerSource {
    Future(BoxValueFuture),
    Sequence(BoxValueSequence),
}

/// Outcome of one armed next-frame request.
struct Polled {
    id: ProducerId,
    /// The sequence handed back for re-arming or closing. `None` for futures.
    remainder: Option<BoxValueSequence>,
    event: ProducerEvent,
}

enum ProducerEvent {
    /// Future producer settled.
    Resolved(Result<Value, Failure>),
    /// Sequence producer stepped.
    Step(SeqStep),
    /// Shutdown signal won the race.
    Cancelled,
}

/// Registration scope handed to the synchronous codec. Producers registered
/// while encoding a payload accumulate here until the multiplexer arms them.
#[derive(Default)]
struct EncoderScope {
    ids: IdAllocator,
    registered: Vec<ProducerEntry>,
}

impl RegisterProducer for EncoderScope {
    fn register_future(&mut self, future: BoxValueFuture) -> ProducerId {
        let id = self.ids.allocate();
        debug!(%id, kind = "future", "producer registered");
        self.registered.push(ProducerEntry {
            id,
            source: ProducerSource::Future(future),
        });
        id
    }

    fn register_sequence(&mut self, sequence: BoxValueSequence) -> ProducerId {
        let id = self.ids.allocate();
        debug!(%id, kind = "sequence", "producer registered");
        self.registered.push(ProducerEntry {
            id,
            source: ProducerSource::Sequence(sequence),
        });
        id
    }
}

async fn run_multiplexer(
    value: Value,
    options: EncodeOptions,
    tx: mpsc::Sender<Result<String, EncodeError>>,
) {
    let EncodeOptions {
        reducers,
        coerce_error,
    } = options;
    let mut scope = EncoderScope::default();

    let root_chunk = match encode_payload(value, &reducers, &mut scope) {
        Ok(chunk) => chunk,
        Err(err) => {
            close_sequences(take_sequences(&mut scope)).await;
            let _ = tx.send(Err(err)).await;
            return;
        }
    };
    if tx.send(Ok(root_chunk)).await.is_err() {
        close_sequences(take_sequences(&mut scope)).await;
        return;
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut active: FuturesUnordered<BoxFuture<'static, Polled>> = FuturesUnordered::new();
    arm(&mut active, &mut scope, &cancel_rx);

    let mut abandoned = false;
    let mut leftover: Option<BoxValueSequence> = None;

    loop {
        let polled = tokio::select! {
            _ = tx.closed() => {
                abandoned = true;
                break;
            }
            next = active.next() => match next {
                Some(polled) => polled,
                // Every producer delivered its terminal frame.
                None => break,
            },
        };
        let Polled {
            id,
            remainder,
            event,
        } = polled;

        match event {
            ProducerEvent::Cancelled => {
                leftover = remainder;
                abandoned = true;
                break;
            }
            ProducerEvent::Resolved(result) => {
                let frame = match result {
                    Ok(value) => match encode_payload(value, &reducers, &mut scope) {
                        Ok(payload) => Frame {
                            id,
                            status: FutureStatus::Ok.wire(),
                            payload,
                        },
                        Err(err) => {
                            warn!(%id, %err, "future value failed to encode");
                            future_error_frame(id, &err, &reducers, &coerce_error, &mut scope)
                        }
                    },
                    Err(failure) => Frame {
                        id,
                        status: FutureStatus::Err.wire(),
                        payload: encode_cause(failure, &reducers, &coerce_error, &mut scope),
                    },
                };
                if !emit(&tx, frame).await {
                    abandoned = true;
                    break;
                }
                arm(&mut active, &mut scope, &cancel_rx);
            }
            ProducerEvent::Step(step) => {
                let mut sequence = match remainder {
                    Some(sequence) => sequence,
                    None => {
                        debug_assert!(false, "a sequence step always hands its source back");
                        continue;
                    }
                };
                match step {
                    SeqStep::Item(item) => match encode_payload(item, &reducers, &mut scope) {
                        Ok(payload) => {
                            let frame = Frame {
                                id,
                                status: SequenceStatus::Yield.wire(),
                                payload,
                            };
                            if !emit(&tx, frame).await {
                                leftover = Some(sequence);
                                abandoned = true;
                                break;
                            }
                            arm(&mut active, &mut scope, &cancel_rx);
                            let entry = ProducerEntry {
                                id,
                                source: ProducerSource::Sequence(sequence),
                            };
                            active.push(Box::pin(next_event(entry, cancel_rx.clone())));
                        }
                        Err(err) => {
                            warn!(%id, %err, "sequence item failed to encode");
                            let frame =
                                sequence_error_frame(id, &err, &reducers, &coerce_error, &mut scope);
                            let sent = emit(&tx, frame).await;
                            sequence.close().await;
                            if !sent {
                                abandoned = true;
                                break;
                            }
                            arm(&mut active, &mut scope, &cancel_rx);
                        }
                    },
                    SeqStep::Done(value) => {
                        let frame = match encode_payload(value, &reducers, &mut scope) {
                            Ok(payload) => Frame {
                                id,
                                status: SequenceStatus::Return.wire(),
                                payload,
                            },
                            Err(err) => {
                                warn!(%id, %err, "sequence return value failed to encode");
                                sequence_error_frame(id, &err, &reducers, &coerce_error, &mut scope)
                            }
                        };
                        let sent = emit(&tx, frame).await;
                        sequence.close().await;
                        if !sent {
                            abandoned = true;
                            break;
                        }
                        arm(&mut active, &mut scope, &cancel_rx);
                    }
                    SeqStep::Failed(failure) => {
                        let frame = Frame {
                            id,
                            status: SequenceStatus::Error.wire(),
                            payload: encode_cause(failure, &reducers, &coerce_error, &mut scope),
                        };
                        let sent = emit(&tx, frame).await;
                        sequence.close().await;
                        if !sent {
                            abandoned = true;
                            break;
                        }
                        arm(&mut active, &mut scope, &cancel_rx);
                    }
                }
            }
        }
    }

    if abandoned {
        shutdown(active, scope, leftover, cancel_tx).await;
    } else {
        debug!("all producers terminal, chunk stream complete");
    }
}

/// Wait for the next frame from one producer, or for the shutdown signal.
async fn next_event(entry: ProducerEntry, mut cancelled: watch::Receiver<bool>) -> Polled {
    let ProducerEntry { id, source } = entry;
    match source {
        ProducerSource::Future(fut) => {
            tokio::select! {
                _ = cancelled.wait_for(|stop| *stop) => Polled {
                    id,
                    remainder: None,
                    event: ProducerEvent::Cancelled,
                },
                result = fut => Polled {
                    id,
                    remainder: None,
                    event: ProducerEvent::Resolved(result),
                },
            }
        }
        ProducerSource::Sequence(mut sequence) => {
            let event = tokio::select! {
                _ = cancelled.wait_for(|stop| *stop) => ProducerEvent::Cancelled,
                step = sequence.next() => ProducerEvent::Step(step),
            };
            Polled {
                id,
                remainder: Some(sequence),
                event,
            }
        }
    }
}

/// Arm every newly registered producer into the race.
fn arm(
    active: &mut FuturesUnordered<BoxFuture<'static, Polled>>,
    scope: &mut EncoderScope,
    cancel: &watch::Receiver<bool>,
) {
    for entry in scope.registered.drain(..) {
        active.push(Box::pin(next_event(entry, cancel.clone())));
    }
}

async fn emit(tx: &mpsc::Sender<Result<String, EncodeError>>, frame: Frame) -> bool {
    trace!(id = %frame.id, status = frame.status, "emitting frame");
    tx.send(Ok(frame.to_chunk())).await.is_ok()
}

/// Cancel every armed request, collect every remaining sequence, and close
/// them concurrently, waiting for all hooks to settle.
async fn shutdown(
    mut active: FuturesUnordered<BoxFuture<'static, Polled>>,
    mut scope: EncoderScope,
    leftover: Option<BoxValueSequence>,
    cancel: watch::Sender<bool>,
) {
    let _ = cancel.send(true);
    let mut closing = take_sequences(&mut scope);
    closing.extend(leftover);
    while let Some(polled) = active.next().await {
        if let Some(sequence) = polled.remainder {
            closing.push(sequence);
        }
    }
    close_sequences(closing).await;
}

fn take_sequences(scope: &mut EncoderScope) -> Vec<BoxValueSequence> {
    scope
        .registered
        .drain(..)
        .filter_map(|entry| match entry.source {
            ProducerSource::Sequence(sequence) => Some(sequence),
            // Futures are one-shot and have no cancel hook; dropping them is
            // the whole teardown.
            ProducerSource::Future(_) => None,
        })
        .collect()
}

async fn close_sequences(mut sequences: Vec<BoxValueSequence>) {
    if sequences.is_empty() {
        return;
    }
    debug!(count = sequences.len(), "closing remaining sequence producers");
    let closing: Vec<_> = sequences.iter_mut().map(|sequence| sequence.close()).collect();
    future::join_all(closing).await;
}

fn encode_payload(
    value: Value,
    reducers: &[Reducer],
    scope: &mut EncoderScope,
) -> Result<String, EncodeError> {
    let json = codec::encode_value(value, reducers, scope)?;
    serde_json::to_string(&json).map_err(EncodeError::from)
}

/// Flatten a failure cause, offering `coerce_error` the original cause when
/// it is not encodable as-is. Never fails: a cause that still cannot be
/// flattened degrades to a generic error value carrying the failure text.
fn encode_cause(
    failure: Failure,
    reducers: &[Reducer],
    coerce_error: &Option<CoerceError>,
    scope: &mut EncoderScope,
) -> String {
    let cause = match failure {
        Failure::Cause(value) => value,
        other => Value::Error(ErrorValue::new("Interrupted", other.to_string())),
    };
    let cause = if codec::is_encodable(&cause, reducers) {
        cause
    } else if let Some(coerce) = coerce_error {
        coerce(cause)
    } else {
        Value::Error(ErrorValue::new(
            "EncodeError",
            "failure cause cannot be encoded",
        ))
    };
    match encode_payload(cause, reducers, scope) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%err, "coerced failure cause still failed to encode");
            fallback_payload(&err)
        }
    }
}

fn future_error_frame(
    id: ProducerId,
    err: &EncodeError,
    reducers: &[Reducer],
    coerce_error: &Option<CoerceError>,
    scope: &mut EncoderScope,
) -> Frame {
    Frame {
        id,
        status: FutureStatus::Err.wire(),
        payload: encode_cause(
            Failure::Cause(encode_failure_value(err)),
            reducers,
            coerce_error,
            scope,
        ),
    }
}

fn sequence_error_frame(
    id: ProducerId,
    err: &EncodeError,
    reducers: &[Reducer],
    coerce_error: &Option<CoerceError>,
    scope: &mut EncoderScope,
) -> Frame {
    Frame {
        id,
        status: SequenceStatus::Error.wire(),
        payload: encode_cause(
            Failure::Cause(encode_failure_value(err)),
            reducers,
            coerce_error,
            scope,
        ),
    }
}

fn encode_failure_value(err: &EncodeError) -> Value {
    Value::Error(ErrorValue::new("EncodeError", err.to_string()))
}

fn fallback_payload(err: &EncodeError) -> String {
    let error = ErrorValue::new("EncodeError", err.to_string());
    serde_json::to_string(&codec::wrap_error(&error)).unwrap_or_else(|_| "null".to_string())
}
