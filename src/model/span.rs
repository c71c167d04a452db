//! In-memory span and batch representation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;

use super::value::AttrValue;

/// Map of attribute name to typed value.
///
/// Attribute maps are shared behind an [`Arc`] so that copying a batch is
/// cheap and mutation can be done copy-on-write via [`Arc::make_mut`].
pub type AttrMap = BTreeMap<String, AttrValue>;

/// A 16-byte trace identifier. The all-zero value is invalid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceId(pub [u8; 16]);

impl TraceId {
    /// Returns `true` if the id is not all zeroes.
    pub fn is_valid(&self) -> bool {
        self.0 != [0; 16]
    }

    /// Generates a random, valid trace id.
    pub fn random(rng: &mut impl Rng) -> Self {
        loop {
            let id = TraceId(rng.random());
            if id.is_valid() {
                return id;
            }
        }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// An 8-byte span identifier. The all-zero value is invalid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SpanId(pub [u8; 8]);

impl SpanId {
    /// The invalid (all-zero) span id.
    pub const INVALID: SpanId = SpanId([0; 8]);

    /// Returns `true` if the id is not all zeroes.
    pub fn is_valid(&self) -> bool {
        self.0 != [0; 8]
    }

    /// Generates a random, valid span id.
    pub fn random(rng: &mut impl Rng) -> Self {
        loop {
            let id = SpanId(rng.random());
            if id.is_valid() {
                return id;
            }
        }
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The role a span plays in an interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// An operation internal to a service.
    Internal,
    /// An outgoing request.
    Client,
    /// Handling of an incoming request.
    Server,
    /// Publishing a message.
    Producer,
    /// Consuming a message.
    Consumer,
}

impl SpanKind {
    /// All span kinds, in a fixed order.
    pub const ALL: [SpanKind; 5] = [
        SpanKind::Internal,
        SpanKind::Client,
        SpanKind::Server,
        SpanKind::Producer,
        SpanKind::Consumer,
    ];

    /// Returns the lowercase name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Internal => "internal",
            SpanKind::Client => "client",
            SpanKind::Server => "server",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
        }
    }
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Span status code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatusCode {
    /// No status recorded.
    #[default]
    Unset,
    /// The operation completed successfully.
    Ok,
    /// The operation failed.
    Error,
}

impl StatusCode {
    /// Returns the lowercase name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Unset => "unset",
            StatusCode::Ok => "ok",
            StatusCode::Error => "error",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A span status: code plus optional description.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpanStatus {
    /// The status code.
    pub code: StatusCode,
    /// Optional human-readable description, typically only set on errors.
    pub message: String,
}

impl SpanStatus {
    /// An `Ok` status with no message.
    pub fn ok() -> Self {
        SpanStatus {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    /// An `Error` status with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        SpanStatus {
            code: StatusCode::Error,
            message: message.into(),
        }
    }
}

/// A link from one span to another span's context.
///
/// Links model fan-in: an additional parent edge that is not part of the
/// structural span tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Link {
    /// Trace id of the linked span context.
    pub trace_id: TraceId,
    /// Span id of the linked span context.
    pub span_id: SpanId,
    /// Attributes attached to the link.
    pub attributes: Arc<AttrMap>,
}

/// A timestamped event recorded on a span.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Event name.
    pub name: String,
    /// When the event occurred.
    pub time: SystemTime,
    /// Attributes attached to the event.
    pub attributes: Arc<AttrMap>,
}

/// A single span.
#[derive(Clone, Debug, PartialEq)]
pub struct Span {
    /// Trace this span belongs to.
    pub trace_id: TraceId,
    /// Identity of this span.
    pub span_id: SpanId,
    /// Identity of the structural parent, or [`SpanId::INVALID`] for roots.
    pub parent_span_id: SpanId,

    /// Operation name.
    pub name: String,
    /// Role of the span.
    pub kind: SpanKind,
    /// Start timestamp, nanosecond resolution.
    pub start_time: SystemTime,
    /// End timestamp, nanosecond resolution.
    pub end_time: SystemTime,

    /// Attributes of the operation itself.
    pub attributes: Arc<AttrMap>,
    /// Attributes of the emitting service.
    pub resource_attributes: Arc<AttrMap>,

    /// Fan-in links to additional parent span contexts.
    pub links: Vec<Link>,
    /// Events recorded on the span.
    pub events: Vec<Event>,

    /// Span status.
    pub status: SpanStatus,
}

impl Span {
    /// Returns the span duration, or zero if the end precedes the start.
    pub fn duration(&self) -> Duration {
        self.end_time.duration_since(self.start_time).unwrap_or(Duration::ZERO)
    }

    /// Looks up an attribute, checking span attributes first and falling back
    /// to resource attributes.
    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name).or_else(|| self.resource_attributes.get(name))
    }
}

/// An ordered sequence of spans, exported in a single call.
pub type Batch = Vec<Span>;

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_ids_render_as_lowercase_hex() {
        let trace_id = TraceId([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0xff,
        ]);
        assert_eq!(trace_id.to_string(), "0102030405060708090a0b0c0d0e0fff");

        let span_id = SpanId([0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(span_id.to_string(), "deadbeef00000001");
    }

    #[test]
    fn test_zero_ids_are_invalid() {
        assert!(!TraceId::default().is_valid());
        assert!(!SpanId::INVALID.is_valid());
        assert!(TraceId([1; 16]).is_valid());
    }

    #[test]
    fn test_random_ids_are_valid() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(TraceId::random(&mut rng).is_valid());
            assert!(SpanId::random(&mut rng).is_valid());
        }
    }

    #[test]
    fn test_attribute_lookup_prefers_span_attributes() {
        let mut attrs = AttrMap::new();
        attrs.insert("service.name".to_string(), AttrValue::from("span-level"));
        let mut resource = AttrMap::new();
        resource.insert("service.name".to_string(), AttrValue::from("resource-level"));

        let span = Span {
            trace_id: TraceId([1; 16]),
            span_id: SpanId([2; 8]),
            parent_span_id: SpanId::INVALID,
            name: "op".to_string(),
            kind: SpanKind::Internal,
            start_time: SystemTime::UNIX_EPOCH,
            end_time: SystemTime::UNIX_EPOCH + Duration::from_millis(5),
            attributes: Arc::new(attrs),
            resource_attributes: Arc::new(resource),
            links: Vec::new(),
            events: Vec::new(),
            status: SpanStatus::ok(),
        };

        assert_eq!(span.attribute("service.name").and_then(AttrValue::as_str), Some("span-level"));
        assert_eq!(span.duration(), Duration::from_millis(5));
    }
}
