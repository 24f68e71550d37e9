//! Synchronous value codec.
//!
//! Flattens a [`Value`] tree into JSON and back, parameterized by type-tagged
//! [`Reducer`]s/[`Reviver`]s and by the hooks the streaming layer supplies:
//! the encoder registers every future or sequence it meets and writes its
//! producer id as a placeholder; the decoder opens a sink for every
//! placeholder it meets and embeds a live handle in the reconstructed tree.
//!
//! Wire form: plain scalars, lists, and records map directly to JSON.
//! Everything else uses a reserved single-key wrapper `{"$weft": [kind, …]}`:
//!
//! - `["future", id]` / `["seq", id]`: producer placeholders
//! - `["error", {name, message}]`: failure cause
//! - `["tag", name, payload]`: reduced opaque value
//! - `["lit", record]`: escape for records containing the reserved key

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::error::{DecodeError, EncodeError};
use crate::frame::ProducerId;
use crate::value::{BoxValueFuture, BoxValueSequence, ErrorValue, Value};

/// Reserved wrapper key of the wire form.
pub(crate) const WRAPPER_KEY: &str = "$weft";

const KIND_FUTURE: &str = "future";
const KIND_SEQ: &str = "seq";
const KIND_ERROR: &str = "error";
const KIND_TAG: &str = "tag";
const KIND_LIT: &str = "lit";

/// Type-tagged encoder for opaque host values.
///
/// A reducer inspects an opaque payload and, when it recognizes the type,
/// returns the value tree to encode in its place. Reducers should be pure:
/// the codec may invoke one more than once for the same payload while probing
/// encodability.
#[derive(Clone)]
pub struct Reducer {
    tag: String,
    apply: Arc<dyn Fn(&(dyn std::any::Any + Send + Sync)) -> Option<Value> + Send + Sync>,
}

impl Reducer {
    /// Reducer for one tag. `apply` returns `None` when the payload is not
    /// the type this reducer handles.
    pub fn new<F>(tag: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&(dyn std::any::Any + Send + Sync)) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            tag: tag.into(),
            apply: Arc::new(apply),
        }
    }

    /// The tag written to the wire when this reducer applies.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn apply(&self, value: &(dyn std::any::Any + Send + Sync)) -> Option<Value> {
        (self.apply)(value)
    }
}

/// Type-tagged decoder for reduced payloads.
#[derive(Clone)]
pub struct Reviver {
    apply: Arc<dyn Fn(Value) -> Result<Value, DecodeError> + Send + Sync>,
}

impl Reviver {
    /// Reviver from the decoded payload tree to the final value.
    pub fn new<F>(apply: F) -> Self
    where
        F: Fn(Value) -> Result<Value, DecodeError> + Send + Sync + 'static,
    {
        Self {
            apply: Arc::new(apply),
        }
    }

    pub(crate) fn apply(&self, payload: Value) -> Result<Value, DecodeError> {
        (self.apply)(payload)
    }
}

/// Decode-side options: user revivers keyed by reducer tag.
#[derive(Clone, Default)]
pub struct Revivers {
    by_tag: HashMap<String, Reviver>,
}

impl Revivers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a reviver for `tag`, replacing any previous one.
    pub fn with_reviver(mut self, tag: impl Into<String>, reviver: Reviver) -> Self {
        self.by_tag.insert(tag.into(), reviver);
        self
    }

    pub(crate) fn get(&self, tag: &str) -> Option<&Reviver> {
        self.by_tag.get(tag)
    }
}

/// Registration hook the encoder supplies: a future or sequence encountered
/// mid-flatten is moved out of the tree and becomes a producer id.
pub(crate) trait RegisterProducer {
    fn register_future(&mut self, future: BoxValueFuture) -> ProducerId;
    fn register_sequence(&mut self, sequence: BoxValueSequence) -> ProducerId;
}

/// Sink hook the decoder supplies: a producer id met mid-parse becomes a live
/// future or sequence handle backed by that id's sink.
pub(crate) trait OpenSink {
    fn open_future(&mut self, id: ProducerId) -> Result<BoxValueFuture, DecodeError>;
    fn open_sequence(&mut self, id: ProducerId) -> Result<BoxValueSequence, DecodeError>;
}

/// Flatten a value tree into its wire JSON, registering every embedded
/// producer with `scope`.
pub(crate) fn encode_value(
    value: Value,
    reducers: &[Reducer],
    scope: &mut dyn RegisterProducer,
) -> Result<Json, EncodeError> {
    match value {
        Value::Null => Ok(Json::Null),
        Value::Bool(b) => Ok(Json::Bool(b)),
        Value::Number(n) => Ok(Json::Number(n)),
        Value::Text(s) => Ok(Json::String(s)),
        Value::List(items) => items
            .into_iter()
            .map(|item| encode_value(item, reducers, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Json::Array),
        Value::Record(fields) => {
            let escape = fields.contains_key(WRAPPER_KEY);
            let mut map = Map::with_capacity(fields.len());
            for (key, field) in fields {
                map.insert(key, encode_value(field, reducers, scope)?);
            }
            let record = Json::Object(map);
            Ok(if escape {
                wrap(vec![Json::String(KIND_LIT.into()), record])
            } else {
                record
            })
        }
        Value::Error(error) => Ok(wrap_error(&error)),
        Value::Future(future) => {
            let id = scope.register_future(future);
            Ok(wrap(vec![
                Json::String(KIND_FUTURE.into()),
                Json::from(id.get()),
            ]))
        }
        Value::Sequence(sequence) => {
            let id = scope.register_sequence(sequence);
            Ok(wrap(vec![
                Json::String(KIND_SEQ.into()),
                Json::from(id.get()),
            ]))
        }
        Value::Opaque(opaque) => {
            for reducer in reducers {
                if let Some(payload) = reducer.apply(opaque.as_ref()) {
                    let encoded = encode_value(payload, reducers, scope)?;
                    return Ok(wrap(vec![
                        Json::String(KIND_TAG.into()),
                        Json::String(reducer.tag().to_string()),
                        encoded,
                    ]));
                }
            }
            Err(EncodeError::Unencodable {
                reason: "no reducer applies to this opaque value".into(),
            })
        }
    }
}

/// Whether `value` would flatten without an error, without consuming it.
///
/// Used by the failure-cause path so `coerce_error` can be offered the
/// original cause before encoding destroys it.
pub(crate) fn is_encodable(value: &Value, reducers: &[Reducer]) -> bool {
    match value {
        Value::List(items) => items.iter().all(|item| is_encodable(item, reducers)),
        Value::Record(fields) => fields.values().all(|field| is_encodable(field, reducers)),
        Value::Opaque(opaque) => reducers.iter().any(|reducer| {
            reducer
                .apply(opaque.as_ref())
                .map(|payload| is_encodable(&payload, reducers))
                .unwrap_or(false)
        }),
        _ => true,
    }
}

/// Reconstruct a value tree from its wire JSON, opening a sink through
/// `scope` for every producer placeholder.
pub(crate) fn decode_value(
    json: Json,
    revivers: &Revivers,
    scope: &mut dyn OpenSink,
) -> Result<Value, DecodeError> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(b)),
        Json::Number(n) => Ok(Value::Number(n)),
        Json::String(s) => Ok(Value::Text(s)),
        Json::Array(items) => items
            .into_iter()
            .map(|item| decode_value(item, revivers, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Json::Object(map) => {
            if map.contains_key(WRAPPER_KEY) {
                if map.len() != 1 {
                    return Err(malformed("reserved key inside an unescaped record"));
                }
                let (_, inner) = map.into_iter().next().unwrap_or_default();
                match inner {
                    Json::Array(args) => decode_wrapper(args, revivers, scope),
                    _ => Err(malformed("wrapper is not an array")),
                }
            } else {
                decode_record(map, revivers, scope)
            }
        }
    }
}

fn decode_record(
    map: Map<String, Json>,
    revivers: &Revivers,
    scope: &mut dyn OpenSink,
) -> Result<Value, DecodeError> {
    map.into_iter()
        .map(|(key, field)| decode_value(field, revivers, scope).map(|field| (key, field)))
        .collect::<Result<_, _>>()
        .map(Value::Record)
}

fn decode_wrapper(
    args: Vec<Json>,
    revivers: &Revivers,
    scope: &mut dyn OpenSink,
) -> Result<Value, DecodeError> {
    let mut args = args.into_iter();
    let kind = match args.next() {
        Some(Json::String(kind)) => kind,
        _ => return Err(malformed("wrapper kind is not a string")),
    };
    match kind.as_str() {
        KIND_FUTURE => {
            let id = parse_id(args.next())?;
            scope.open_future(id).map(Value::Future)
        }
        KIND_SEQ => {
            let id = parse_id(args.next())?;
            scope.open_sequence(id).map(Value::Sequence)
        }
        KIND_ERROR => {
            let arg = args.next().ok_or_else(|| malformed("error without body"))?;
            let error: ErrorValue = serde_json::from_value(arg)?;
            Ok(Value::Error(error))
        }
        KIND_TAG => {
            let tag = match args.next() {
                Some(Json::String(tag)) => tag,
                _ => return Err(malformed("tag name is not a string")),
            };
            let payload = args.next().ok_or_else(|| malformed("tag without payload"))?;
            let payload = decode_value(payload, revivers, scope)?;
            let reviver = revivers
                .get(&tag)
                .ok_or(DecodeError::UnknownTag { tag: tag.clone() })?;
            reviver.apply(payload)
        }
        KIND_LIT => match args.next() {
            Some(Json::Object(map)) => decode_record(map, revivers, scope),
            _ => Err(malformed("lit escape without a record")),
        },
        other => Err(malformed(&format!("unknown wire kind `{other}`"))),
    }
}

fn parse_id(arg: Option<Json>) -> Result<ProducerId, DecodeError> {
    match arg.as_ref().and_then(Json::as_u64) {
        Some(raw) if raw > 0 => Ok(ProducerId::from_raw(raw)),
        _ => Err(malformed("producer id is not a positive integer")),
    }
}

fn malformed(reason: &str) -> DecodeError {
    DecodeError::MalformedValue {
        reason: reason.to_string(),
    }
}

pub(crate) fn wrap(entries: Vec<Json>) -> Json {
    let mut map = Map::with_capacity(1);
    map.insert(WRAPPER_KEY.to_string(), Json::Array(entries));
    Json::Object(map)
}

pub(crate) fn wrap_error(error: &ErrorValue) -> Json {
    let body = serde_json::to_value(error).unwrap_or(Json::Null);
    wrap(vec![Json::String(KIND_ERROR.into()), body])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SeqStep;
    use async_trait::async_trait;

    /// Scope stub: counts registrations, opens trivial handles.
    #[derive(Default)]
    struct StubScope {
        futures: u64,
        sequences: u64,
    }

    impl RegisterProducer for StubScope {
        fn register_future(&mut self, _future: BoxValueFuture) -> ProducerId {
            self.futures += 1;
            ProducerId::from_raw(self.futures + self.sequences)
        }

        fn register_sequence(&mut self, _sequence: BoxValueSequence) -> ProducerId {
            self.sequences += 1;
            ProducerId::from_raw(self.futures + self.sequences)
        }
    }

    struct EmptySequence;

    #[async_trait]
    impl crate::value::ValueSequence for EmptySequence {
        async fn next(&mut self) -> SeqStep {
            SeqStep::Done(Value::Null)
        }
    }

    impl OpenSink for StubScope {
        fn open_future(&mut self, _id: ProducerId) -> Result<BoxValueFuture, DecodeError> {
            Ok(Box::pin(async { Ok(Value::Null) }))
        }

        fn open_sequence(&mut self, _id: ProducerId) -> Result<BoxValueSequence, DecodeError> {
            Ok(Box::new(EmptySequence))
        }
    }

    fn roundtrip(value: Value) -> Value {
        let mut scope = StubScope::default();
        let json = encode_value(value, &[], &mut scope).expect("encode");
        decode_value(json, &Revivers::new(), &mut scope).expect("decode")
    }

    #[test]
    fn test_plain_roundtrip() {
        let value = Value::record([
            ("flag", Value::Bool(true)),
            ("items", Value::list([1, 2, 3])),
            ("name", Value::from("weft")),
            ("none", Value::Null),
        ]);
        let expected = Value::record([
            ("flag", Value::Bool(true)),
            ("items", Value::list([1, 2, 3])),
            ("name", Value::from("weft")),
            ("none", Value::Null),
        ]);
        assert_eq!(roundtrip(value), expected);
    }

    #[test]
    fn test_error_value_roundtrip() {
        let value = Value::Error(ErrorValue::new("Timeout", "took too long"));
        assert_eq!(
            roundtrip(value),
            Value::Error(ErrorValue::new("Timeout", "took too long"))
        );
    }

    #[test]
    fn test_reserved_key_is_escaped() {
        let value = Value::record([(WRAPPER_KEY, Value::from(1)), ("other", Value::from(2))]);
        let mut scope = StubScope::default();
        let json = encode_value(value, &[], &mut scope).expect("encode");
        let text = serde_json::to_string(&json).expect("stringify");
        assert_eq!(text, r#"{"$weft":["lit",{"$weft":1,"other":2}]}"#);

        let decoded = decode_value(json, &Revivers::new(), &mut scope).expect("decode");
        let expected = Value::record([(WRAPPER_KEY, Value::from(1)), ("other", Value::from(2))]);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_future_placeholder_wire_form() {
        let value = Value::record([("a", Value::future(async { Ok(Value::Null) }))]);
        let mut scope = StubScope::default();
        let json = encode_value(value, &[], &mut scope).expect("encode");
        let text = serde_json::to_string(&json).expect("stringify");
        assert_eq!(text, r#"{"a":{"$weft":["future",1]}}"#);
    }

    #[test]
    fn test_opaque_requires_a_reducer() {
        struct Point {
            x: i64,
            y: i64,
        }

        let err = encode_value(Value::opaque(Point { x: 1, y: 2 }), &[], &mut StubScope::default());
        assert!(matches!(err, Err(EncodeError::Unencodable { .. })));

        let reducer = Reducer::new("point", |any| {
            any.downcast_ref::<Point>()
                .map(|p| Value::list([p.x, p.y]))
        });
        let mut scope = StubScope::default();
        let json = encode_value(Value::opaque(Point { x: 1, y: 2 }), &[reducer], &mut scope)
            .expect("encode");
        let text = serde_json::to_string(&json).expect("stringify");
        assert_eq!(text, r#"{"$weft":["tag","point",[1,2]]}"#);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let json: Json = serde_json::from_str(r#"{"$weft":["tag","mystery",null]}"#).expect("json");
        let err = decode_value(json, &Revivers::new(), &mut StubScope::default());
        assert!(matches!(err, Err(DecodeError::UnknownTag { tag }) if tag == "mystery"));
    }

    #[test]
    fn test_reviver_is_applied() {
        let revivers = Revivers::new().with_reviver(
            "point",
            Reviver::new(|payload| match payload {
                Value::List(items) if items.len() == 2 => {
                    let mut items = items.into_iter();
                    let x = items.next().unwrap_or(Value::Null);
                    let y = items.next().unwrap_or(Value::Null);
                    Ok(Value::record([("x", x), ("y", y)]))
                }
                _ => Err(DecodeError::Reviver {
                    tag: "point".into(),
                    reason: "expected a pair".into(),
                }),
            }),
        );
        let json: Json = serde_json::from_str(r#"{"$weft":["tag","point",[1,2]]}"#).expect("json");
        let decoded = decode_value(json, &revivers, &mut StubScope::default()).expect("decode");
        assert_eq!(
            decoded,
            Value::record([("x", Value::from(1)), ("y", Value::from(2))])
        );
    }

    #[test]
    fn test_is_encodable_probes_opaque_nodes() {
        struct Token;

        let value = Value::list([Value::from(1), Value::opaque(Token)]);
        assert!(!is_encodable(&value, &[]));

        let reducer = Reducer::new("token", |any| {
            any.downcast_ref::<Token>().map(|_| Value::Null)
        });
        assert!(is_encodable(&value, &[reducer]));
        assert!(is_encodable(&Value::future(async { Ok(Value::Null) }), &[]));
    }

    #[test]
    fn test_malformed_wrappers_are_rejected() {
        for text in [
            r#"{"$weft":1}"#,
            r#"{"$weft":[]}"#,
            r#"{"$weft":["future",0]}"#,
            r#"{"$weft":["future","x"]}"#,
            r#"{"$weft":["wat"]}"#,
            r#"{"$weft":["lit",3]}"#,
            r#"{"$weft":[1],"extra":2}"#,
        ] {
            let json: Json = serde_json::from_str(text).expect("json");
            let err = decode_value(json, &Revivers::new(), &mut StubScope::default());
            assert!(
                matches!(err, Err(DecodeError::MalformedValue { .. })),
                "{text} should be rejected"
            );
        }
    }
}
