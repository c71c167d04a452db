//! Conversion from the in-memory span model to OTLP protobuf.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{span, status, ResourceSpans, ScopeSpans, Span as ProtoSpan, Status};

use crate::model::{AttrMap, AttrValue, Batch, Event, Link, Span, SpanId, SpanKind, SpanStatus, StatusCode};

/// Instrumentation scope name stamped on exported spans.
const SCOPE_NAME: &str = "tercios";

/// Builds a complete export request from a batch.
pub fn batch_to_request(batch: &Batch) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: batch_to_resource_spans(batch),
    }
}

/// Groups spans by resource, preserving first-seen order, and converts each
/// group into a `ResourceSpans` message.
pub fn batch_to_resource_spans(batch: &Batch) -> Vec<ResourceSpans> {
    if batch.is_empty() {
        return Vec::new();
    }

    let mut order: Vec<(&AttrMap, Vec<ProtoSpan>)> = Vec::new();
    let mut index_by_key: HashMap<String, usize> = HashMap::new();

    for span in batch {
        let key = resource_key(&span.resource_attributes);
        let index = *index_by_key.entry(key).or_insert_with(|| {
            order.push((&span.resource_attributes, Vec::new()));
            order.len() - 1
        });
        order[index].1.push(span_to_proto(span));
    }

    order
        .into_iter()
        .map(|(resource_attributes, spans)| ResourceSpans {
            resource: Some(Resource {
                attributes: attr_map_to_key_values(resource_attributes),
                ..Default::default()
            }),
            scope_spans: vec![ScopeSpans {
                scope: Some(InstrumentationScope {
                    name: SCOPE_NAME.to_string(),
                    ..Default::default()
                }),
                spans,
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        })
        .collect()
}

fn span_to_proto(span: &Span) -> ProtoSpan {
    ProtoSpan {
        trace_id: span.trace_id.0.to_vec(),
        span_id: span.span_id.0.to_vec(),
        parent_span_id: span_id_bytes(span.parent_span_id),
        name: span.name.clone(),
        kind: kind_to_proto(span.kind) as i32,
        start_time_unix_nano: time_to_unix_nanos(span.start_time),
        end_time_unix_nano: time_to_unix_nanos(span.end_time),
        attributes: attr_map_to_key_values(&span.attributes),
        events: events_to_proto(&span.events),
        links: links_to_proto(&span.links),
        status: status_to_proto(&span.status),
        ..Default::default()
    }
}

fn span_id_bytes(span_id: SpanId) -> Vec<u8> {
    if !span_id.is_valid() {
        return Vec::new();
    }
    span_id.0.to_vec()
}

fn kind_to_proto(kind: SpanKind) -> span::SpanKind {
    match kind {
        SpanKind::Internal => span::SpanKind::Internal,
        SpanKind::Client => span::SpanKind::Client,
        SpanKind::Server => span::SpanKind::Server,
        SpanKind::Producer => span::SpanKind::Producer,
        SpanKind::Consumer => span::SpanKind::Consumer,
    }
}

fn status_to_proto(span_status: &SpanStatus) -> Option<Status> {
    if span_status.code == StatusCode::Unset && span_status.message.is_empty() {
        return None;
    }
    let code = match span_status.code {
        StatusCode::Unset => status::StatusCode::Unset,
        StatusCode::Ok => status::StatusCode::Ok,
        StatusCode::Error => status::StatusCode::Error,
    };
    Some(Status {
        code: code as i32,
        message: span_status.message.clone(),
    })
}

fn links_to_proto(links: &[Link]) -> Vec<span::Link> {
    links
        .iter()
        .map(|link| span::Link {
            trace_id: link.trace_id.0.to_vec(),
            span_id: link.span_id.0.to_vec(),
            attributes: attr_map_to_key_values(&link.attributes),
            ..Default::default()
        })
        .collect()
}

fn events_to_proto(events: &[Event]) -> Vec<span::Event> {
    events
        .iter()
        .map(|event| span::Event {
            time_unix_nano: time_to_unix_nanos(event.time),
            name: event.name.clone(),
            attributes: attr_map_to_key_values(&event.attributes),
            ..Default::default()
        })
        .collect()
}

fn attr_map_to_key_values(attributes: &AttrMap) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: Some(attr_value_to_any(value)),
        })
        .collect()
}

fn attr_value_to_any(value: &AttrValue) -> AnyValue {
    let value = match value {
        AttrValue::String(s) => any_value::Value::StringValue(s.clone()),
        AttrValue::Int(i) => any_value::Value::IntValue(*i),
        AttrValue::Float(v) => any_value::Value::DoubleValue(*v),
        AttrValue::Bool(b) => any_value::Value::BoolValue(*b),
    };
    AnyValue { value: Some(value) }
}

fn time_to_unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

fn resource_key(attributes: &AttrMap) -> String {
    let mut key = String::new();
    for (name, value) in attributes {
        let type_tag = match value {
            AttrValue::String(_) => "s",
            AttrValue::Int(_) => "i",
            AttrValue::Float(_) => "f",
            AttrValue::Bool(_) => "b",
        };
        key.push_str(name);
        key.push('=');
        key.push_str(&value.to_string());
        key.push('|');
        key.push_str(type_tag);
        key.push(';');
    }
    key
}
