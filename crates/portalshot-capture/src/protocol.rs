//! Values exchanged with the screen-cast broker.
//!
//! Completion events arrive as nested, self-describing [`Variant`]s (D-Bus
//! `v`, `a{sv}`, `(ua{sv})`, ...). Before any key is inspected they are
//! flattened by [`normalize`] into plain [`Value`]s: nested variants are
//! unwrapped, structs and arrays become lists, dictionaries become maps.

use std::collections::BTreeMap;

use portalshot_core::CaptureError;

// ── Tagged wire values ────────────────────────────────────────────────────────

/// A tagged protocol value as delivered by the broker transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    /// A value boxed inside another variant (`v`).
    Variant(Box<Variant>),
    Array(Vec<Variant>),
    Dict(Vec<(Variant, Variant)>),
    Struct(Vec<Variant>),
}

impl Variant {
    /// Box `self` the way `a{sv}` dictionary values are carried.
    pub fn boxed(self) -> Self {
        Self::Variant(Box::new(self))
    }
}

// ── Normalized values ─────────────────────────────────────────────────────────

/// Key → value mapping of a normalized result.
pub type Results = BTreeMap<String, Value>;

/// Plain value with the wire tagging stripped.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(Results),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value if it is non-negative and fits in 32 bits.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::UInt(n) => u32::try_from(*n).ok(),
            Self::Int(n) => u32::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Any integer that fits in 64 signed bits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::UInt(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Results> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }
}

/// Recursively strip wire tagging from `variant`.
pub fn normalize(variant: &Variant) -> Value {
    match variant {
        Variant::Bool(b) => Value::Bool(*b),
        Variant::Byte(n) => Value::UInt(u64::from(*n)),
        Variant::UInt16(n) => Value::UInt(u64::from(*n)),
        Variant::UInt32(n) => Value::UInt(u64::from(*n)),
        Variant::UInt64(n) => Value::UInt(*n),
        Variant::Int16(n) => Value::Int(i64::from(*n)),
        Variant::Int32(n) => Value::Int(i64::from(*n)),
        Variant::Int64(n) => Value::Int(*n),
        Variant::Double(x) => Value::Float(*x),
        Variant::Str(s) | Variant::ObjectPath(s) | Variant::Signature(s) => Value::Str(s.clone()),
        Variant::Variant(inner) => normalize(inner),
        Variant::Array(items) | Variant::Struct(items) => {
            Value::List(items.iter().map(normalize).collect())
        }
        Variant::Dict(entries) => Value::Map(
            entries
                .iter()
                .filter_map(|(key, value)| Some((map_key(&normalize(key))?, normalize(value))))
                .collect(),
        ),
    }
}

fn map_key(key: &Value) -> Option<String> {
    match key {
        Value::Str(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        Value::UInt(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ── Handles ───────────────────────────────────────────────────────────────────

/// Correlation handle of one broker request (a request object path).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestHandle(String);

impl RequestHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle of a broker-side session, assigned by the CreateSession response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Request options ───────────────────────────────────────────────────────────

/// `CreateSession` options: `{session_handle_token: s}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionOptions {
    pub session_handle_token: String,
}

/// `SelectSources` options: `{multiple: b, types: u, handle_token: s}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectSourcesOptions {
    pub multiple:     bool,
    pub types:        u32,
    pub handle_token: String,
}

/// `Start` options: `{handle_token: s}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub handle_token: String,
}

// ── Completion events ─────────────────────────────────────────────────────────

/// One raw `Response` signal: the request it answers and its `(ua{sv})` body.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerResponse {
    pub handle: RequestHandle,
    pub body:   Variant,
}

impl BrokerResponse {
    /// Build a response from a code and `a{sv}` result entries.
    pub fn new(handle: RequestHandle, code: u32, results: Vec<(String, Variant)>) -> Self {
        let results = results
            .into_iter()
            .map(|(key, value)| (Variant::Str(key), value.boxed()))
            .collect();
        Self { handle, body: Variant::Struct(vec![Variant::UInt32(code), Variant::Dict(results)]) }
    }
}

/// Split a normalized `(code, results)` body.
pub fn unwrap_body(body: &Variant) -> Result<(i64, Results), CaptureError> {
    let violation = |reason: &str| CaptureError::ProtocolViolation { reason: reason.to_owned() };

    let Value::List(fields) = normalize(body) else {
        return Err(violation("Response body is not a (code, results) pair"));
    };
    let mut fields = fields.into_iter();
    let code = fields
        .next()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| violation("Response code missing or not an integer"))?;
    let results = match fields.next() {
        Some(Value::Map(map)) => map,
        None => Results::new(),
        Some(_) => return Err(violation("Response results are not a mapping")),
    };
    Ok((code, results))
}

// ── Stream descriptors ────────────────────────────────────────────────────────

/// A negotiated video stream as reported in the Start `streams` result.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub node_id:    u32,
    pub properties: Results,
}

impl StreamDescriptor {
    /// Parse the first entry of a `streams` list; later entries are ignored.
    ///
    /// Returns the descriptor and how many streams the broker reported.
    pub fn first_of(streams: &Value) -> Result<(Self, usize), CaptureError> {
        let invalid = |reason: String| CaptureError::InvalidStreamDescriptor { reason };

        let list = streams.as_list().ok_or_else(|| CaptureError::ProtocolViolation {
            reason: "`streams` result is not a list".into(),
        })?;
        let first = list.first().ok_or_else(|| invalid("broker reported no streams".into()))?;
        let fields = first
            .as_list()
            .ok_or_else(|| invalid(format!("stream entry {first:?} is not a (node id, properties) pair")))?;

        let node = fields.first().ok_or_else(|| invalid("stream entry is empty".into()))?;
        let node_id = node
            .as_u32()
            .ok_or_else(|| invalid(format!("node id {node:?} is not a non-negative 32-bit integer")))?;
        let properties = match fields.get(1) {
            Some(Value::Map(map)) => map.clone(),
            None => Results::new(),
            Some(other) => return Err(invalid(format!("stream properties {other:?} are not a mapping"))),
        };

        Ok((Self { node_id, properties }, list.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(node: Variant) -> Variant {
        Variant::Struct(vec![node, Variant::Dict(vec![])])
    }

    #[test]
    fn nested_variants_are_unwrapped() {
        let wrapped = Variant::UInt32(7).boxed().boxed();
        assert_eq!(normalize(&wrapped), Value::UInt(7));

        let path = Variant::ObjectPath("/s/1".into()).boxed();
        assert_eq!(normalize(&path), Value::Str("/s/1".into()));
    }

    #[test]
    fn dictionaries_and_structs_flatten() {
        let dict = Variant::Dict(vec![
            (Variant::Str("position".into()), Variant::Struct(vec![Variant::Int32(0), Variant::Int32(10)]).boxed()),
            (Variant::Str("size".into()), Variant::Array(vec![Variant::Int32(1920), Variant::Int32(1080)]).boxed()),
            (Variant::Struct(vec![]), Variant::Bool(true)),
        ]);

        let Value::Map(map) = normalize(&dict) else { panic!("expected map") };
        assert_eq!(map.len(), 2, "non-scalar keys are dropped");
        assert_eq!(map["position"], Value::List(vec![Value::Int(0), Value::Int(10)]));
        assert_eq!(map["size"].as_list().map(|l| l.len()), Some(2));
    }

    #[test]
    fn unwrap_body_splits_code_and_results() {
        let response = BrokerResponse::new(
            RequestHandle::new("/r/1"),
            0,
            vec![("session_handle".into(), Variant::ObjectPath("/s/1".into()))],
        );
        let (code, results) = unwrap_body(&response.body).expect("well-formed body");
        assert_eq!(code, 0);
        assert_eq!(results["session_handle"].as_str(), Some("/s/1"));
    }

    #[test]
    fn unwrap_body_rejects_malformed_bodies() {
        assert!(matches!(
            unwrap_body(&Variant::Str("nope".into())),
            Err(CaptureError::ProtocolViolation { .. })
        ));
        assert!(matches!(
            unwrap_body(&Variant::Struct(vec![Variant::Str("0".into())])),
            Err(CaptureError::ProtocolViolation { .. })
        ));
        let (code, results) = unwrap_body(&Variant::Struct(vec![Variant::UInt32(2)])).unwrap();
        assert_eq!((code, results.len()), (2, 0));
    }

    #[test]
    fn signed_codes_are_kept() {
        let body = Variant::Struct(vec![Variant::Int32(-1), Variant::Dict(vec![])]);
        let (code, _) = unwrap_body(&body).expect("signed code");
        assert_eq!(code, -1);
    }

    #[test]
    fn first_stream_wins() {
        let streams = normalize(&Variant::Array(vec![
            stream(Variant::UInt32(5)),
            stream(Variant::UInt32(6)),
        ]));
        let (descriptor, count) = StreamDescriptor::first_of(&streams).unwrap();
        assert_eq!(descriptor.node_id, 5);
        assert_eq!(count, 2);
    }

    #[test]
    fn negative_or_missing_node_ids_are_invalid() {
        let negative = normalize(&Variant::Array(vec![stream(Variant::Int32(-3))]));
        assert!(matches!(
            StreamDescriptor::first_of(&negative),
            Err(CaptureError::InvalidStreamDescriptor { .. })
        ));

        let textual = normalize(&Variant::Array(vec![stream(Variant::Str("42".into()))]));
        assert!(matches!(
            StreamDescriptor::first_of(&textual),
            Err(CaptureError::InvalidStreamDescriptor { .. })
        ));

        let empty = normalize(&Variant::Array(vec![]));
        assert!(matches!(
            StreamDescriptor::first_of(&empty),
            Err(CaptureError::InvalidStreamDescriptor { .. })
        ));

        assert!(matches!(
            StreamDescriptor::first_of(&Value::UInt(42)),
            Err(CaptureError::ProtocolViolation { .. })
        ));
    }
}
