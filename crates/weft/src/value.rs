//! The value tree the codec moves.
//!
//! A [`Value`] is plain data (scalars, lists, records), an encodable failure
//! cause ([`ErrorValue`]), a deferred one-shot computation ([`Value::Future`]),
//! a lazy asynchronous sequence ([`Value::Sequence`]), or an opaque host value
//! that only an installed reducer knows how to flatten.
//!
//! Decoded trees use the same type: a future or sequence embedded in a decoded
//! value resolves as its remote source does, and can itself be re-encoded.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Failure;

/// Boxed one-shot computation embedded in a value tree.
pub type BoxValueFuture = Pin<Box<dyn Future<Output = Result<Value, Failure>> + Send + 'static>>;

/// Boxed lazy sequence embedded in a value tree.
pub type BoxValueSequence = Box<dyn ValueSequence + 'static>;

/// One step of a [`ValueSequence`].
#[derive(Debug)]
pub enum SeqStep {
    /// The next item.
    Item(Value),
    /// Normal termination, with a return value.
    Done(Value),
    /// Abnormal termination.
    Failed(Failure),
}

/// A lazy ordered stream of values, terminated by a return value or a failure.
///
/// `next` must not be called again after it produced [`SeqStep::Done`] or
/// [`SeqStep::Failed`]. `close` is the early-termination hook: the holder of a
/// sequence invokes it exactly once, on every exit path. Implementations that
/// release resources in `close` can rely on that single invocation.
#[async_trait]
pub trait ValueSequence: Send {
    /// Produce the next step.
    async fn next(&mut self) -> SeqStep;

    /// Early-termination hook. The default does nothing.
    async fn close(&mut self) {}
}

/// An in-memory value that may transitively contain deferred computations and
/// lazy sequences.
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Number, carried in JSON precision.
    Number(serde_json::Number),
    /// Text.
    Text(String),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed record.
    Record(BTreeMap<String, Value>),
    /// Encodable failure cause.
    Error(ErrorValue),
    /// Deferred one-shot computation.
    Future(BoxValueFuture),
    /// Lazy asynchronous sequence.
    Sequence(BoxValueSequence),
    /// Opaque host value; encodable only through an installed reducer.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Build a record from key/value pairs.
    pub fn record<K, I>(fields: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Record(
            fields
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    /// Build a list.
    pub fn list<I>(items: I) -> Value
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    /// Embed a one-shot computation.
    pub fn future<F>(future: F) -> Value
    where
        F: Future<Output = Result<Value, Failure>> + Send + 'static,
    {
        Value::Future(Box::pin(future))
    }

    /// Embed a lazy sequence.
    pub fn sequence(sequence: impl ValueSequence + 'static) -> Value {
        Value::Sequence(Box::new(sequence))
    }

    /// Embed an opaque host value for the installed reducers to flatten.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Value {
        Value::Opaque(Arc::new(value))
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl PartialEq for Value {
    /// Structural equality over plain data. Variants embedding futures,
    /// sequences, or opaque payloads never compare equal.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Value::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Value::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Record(fields) => f.debug_tuple("Record").field(fields).finish(),
            Value::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Value::Future(_) => f.write_str("Future(<deferred>)"),
            Value::Sequence(_) => f.write_str("Sequence(<lazy>)"),
            Value::Opaque(_) => f.write_str("Opaque(<host>)"),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Number(value.into())
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Number(value.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats have no JSON representation and map to `Null`.
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Record(value)
    }
}

impl From<ErrorValue> for Value {
    fn from(value: ErrorValue) -> Self {
        Value::Error(value)
    }
}

/// A failure cause in a form the wire can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    /// Error class name, e.g. `"Error"` or an application-specific name.
    pub name: String,
    /// Human-readable description.
    pub message: String,
}

impl ErrorValue {
    /// Error with an explicit class name.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Error with the generic `"Error"` class name.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorValue {}

/// Sequence over a fixed set of items followed by a return value.
///
/// Mostly useful for building sequences out of data already in memory; live
/// sources implement [`ValueSequence`] directly.
pub fn items_sequence<I>(items: I, done: Value) -> BoxValueSequence
where
    I: IntoIterator,
    I::Item: Into<Value>,
{
    let items: Vec<Value> = items.into_iter().map(Into::into).collect();
    Box::new(ItemsSequence {
        items: items.into_iter(),
        done: Some(done),
    })
}

struct ItemsSequence {
    items: std::vec::IntoIter<Value>,
    done: Option<Value>,
}

#[async_trait]
impl ValueSequence for ItemsSequence {
    async fn next(&mut self) -> SeqStep {
        match self.items.next() {
            Some(item) => SeqStep::Item(item),
            None => SeqStep::Done(self.done.take().unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_equality_is_structural() {
        let a = Value::record([("x", Value::from(1)), ("y", Value::list([2, 3]))]);
        let b = Value::record([("x", Value::from(1)), ("y", Value::list([2, 3]))]);
        assert_eq!(a, b);
        assert_ne!(Value::from(1), Value::from(2));
    }

    #[test]
    fn test_async_variants_never_compare_equal() {
        let a = Value::future(async { Ok(Value::Null) });
        let b = Value::future(async { Ok(Value::Null) });
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_items_sequence_yields_then_returns() {
        let mut seq = items_sequence([1, 2], Value::from("end"));
        assert!(matches!(seq.next().await, SeqStep::Item(v) if v == Value::from(1)));
        assert!(matches!(seq.next().await, SeqStep::Item(v) if v == Value::from(2)));
        assert!(matches!(seq.next().await, SeqStep::Done(v) if v == Value::from("end")));
    }
}
