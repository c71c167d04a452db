//! Deterministic batch generation from a compiled scenario.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::model::{AttrMap, Batch, Span, SpanId, SpanKind, SpanStatus, TraceId};

use super::{Definition, Edge, EdgeKind, Node};

/// Generates one trace per invocation by walking the scenario graph.
///
/// Identity is fully deterministic: trace and span ids are derived from the
/// scenario seed and a monotonically increasing invocation counter, so two
/// runs of the same scenario produce the same id sequences.
pub struct ScenarioGenerator {
    definition: Definition,
    outgoing: BTreeMap<String, Vec<Edge>>,
    counter: AtomicU64,
}

impl ScenarioGenerator {
    /// Creates a generator for the given scenario definition.
    pub fn new(definition: Definition) -> Self {
        let mut outgoing: BTreeMap<String, Vec<Edge>> = BTreeMap::new();
        for edge in &definition.edges {
            outgoing.entry(edge.from.clone()).or_default().push(edge.clone());
        }
        ScenarioGenerator {
            definition,
            outgoing,
            counter: AtomicU64::new(0),
        }
    }

    /// Generates the next batch in the scenario's invocation sequence.
    pub fn generate_batch(&self) -> Batch {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let trace_id = trace_id_from_seed(self.definition.seed, sequence);
        let mut ids = SpanIdSequence::new(self.definition.seed, sequence);

        let estimated = self.estimate_duration(&self.definition.root);
        let base = SystemTime::now();

        let root_node = &self.definition.nodes[&self.definition.root];
        let root = self.new_span(
            trace_id,
            ids.next_id(),
            SpanId::INVALID,
            root_node,
            SpanKind::Internal,
            base,
            estimated,
            &AttrMap::new(),
        );
        let root_span_id = root.span_id;

        let mut spans = vec![root];
        let mut cursor = base + Duration::from_millis(1);
        self.emit_from_node(&mut spans, trace_id, root_span_id, &self.definition.root, &mut cursor, &mut ids);
        spans
    }

    fn emit_from_node(
        &self,
        spans: &mut Batch,
        trace_id: TraceId,
        parent_span_id: SpanId,
        node_id: &str,
        cursor: &mut SystemTime,
        ids: &mut SpanIdSequence,
    ) {
        let Some(edges) = self.outgoing.get(node_id) else {
            return;
        };

        for edge in edges {
            for _ in 0..edge.repeat {
                let source = &self.definition.nodes[&edge.from];
                let target = &self.definition.nodes[&edge.to];
                let start = *cursor;

                let (caller_kind, callee_kind) = match edge.kind {
                    EdgeKind::ClientServer | EdgeKind::ClientDatabase => (SpanKind::Client, SpanKind::Server),
                    EdgeKind::ProducerConsumer => (SpanKind::Producer, SpanKind::Consumer),
                    EdgeKind::Internal => {
                        let span = self.new_span(
                            trace_id,
                            ids.next_id(),
                            parent_span_id,
                            target,
                            SpanKind::Internal,
                            start,
                            edge.duration,
                            &edge.span_attributes,
                        );
                        let span_id = span.span_id;
                        *cursor = span.end_time + Duration::from_millis(1);
                        spans.push(span);
                        self.emit_from_node(spans, trace_id, span_id, &edge.to, cursor, ids);
                        continue;
                    }
                };

                let mut caller = self.new_span(
                    trace_id,
                    ids.next_id(),
                    parent_span_id,
                    source,
                    caller_kind,
                    start,
                    edge.duration,
                    &edge.span_attributes,
                );
                caller.name = edge_span_name(source, target);
                let caller_span_id = caller.span_id;
                spans.push(caller);

                let callee = self.new_span(
                    trace_id,
                    ids.next_id(),
                    caller_span_id,
                    target,
                    callee_kind,
                    start,
                    edge.duration,
                    &edge.span_attributes,
                );
                let callee_span_id = callee.span_id;
                *cursor = callee.end_time + Duration::from_millis(1);
                spans.push(callee);

                self.emit_from_node(spans, trace_id, callee_span_id, &edge.to, cursor, ids);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn new_span(
        &self,
        trace_id: TraceId,
        span_id: SpanId,
        parent_span_id: SpanId,
        node: &Node,
        kind: SpanKind,
        start: SystemTime,
        duration: Duration,
        edge_attributes: &AttrMap,
    ) -> Span {
        let service = &self.definition.services[&node.service];
        let resource_attributes = Arc::clone(&service.resource_attributes);

        let mut attributes = AttrMap::new();
        if let Some(service_name) = resource_attributes.get("service.name") {
            attributes.insert("service.name".to_string(), service_name.clone());
        }
        for (key, value) in edge_attributes {
            attributes.insert(key.clone(), value.clone());
        }

        let duration = duration.max(Duration::from_millis(1));

        Span {
            trace_id,
            span_id,
            parent_span_id,
            name: node.span_name.clone(),
            kind,
            start_time: start,
            end_time: start + duration,
            attributes: Arc::new(attributes),
            resource_attributes,
            links: Vec::new(),
            events: Vec::new(),
            status: SpanStatus::ok(),
        }
    }

    /// Walks the graph once to estimate how long a full trace takes, which
    /// becomes the root span's duration.
    fn estimate_duration(&self, node_id: &str) -> Duration {
        fn walk(
            node_id: &str,
            outgoing: &BTreeMap<String, Vec<Edge>>,
            memo: &mut BTreeMap<String, Duration>,
        ) -> Duration {
            if let Some(cached) = memo.get(node_id) {
                return *cached;
            }
            let mut total = Duration::ZERO;
            for edge in outgoing.get(node_id).into_iter().flatten() {
                let duration = edge.duration.max(Duration::from_millis(1));
                let subtree = walk(&edge.to, outgoing, memo);
                total += (duration + subtree + Duration::from_millis(1)) * edge.repeat;
            }
            memo.insert(node_id.to_string(), total);
            total
        }

        let mut memo = BTreeMap::new();
        walk(node_id, &self.outgoing, &mut memo).max(Duration::from_millis(1))
    }
}

fn edge_span_name(from: &Node, to: &Node) -> String {
    format!("{} -> {}", from.span_name, to.span_name)
}

struct SpanIdSequence {
    seed: u64,
    sequence: u64,
    next: u64,
}

impl SpanIdSequence {
    fn new(seed: i64, sequence: u64) -> Self {
        SpanIdSequence {
            seed: seed as u64,
            sequence,
            next: 0,
        }
    }

    fn next_id(&mut self) -> SpanId {
        self.next += 1;
        let mut value = splitmix64(self.seed ^ self.sequence ^ self.next);
        if value == 0 {
            value = 1;
        }
        SpanId(value.to_be_bytes())
    }
}

fn trace_id_from_seed(seed: i64, sequence: u64) -> TraceId {
    let high = splitmix64(seed as u64 ^ sequence);
    let low = splitmix64(high ^ 0x9e37_79b9_7f4a_7c15);

    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&high.to_be_bytes());
    bytes[8..].copy_from_slice(&low.to_be_bytes());

    let id = TraceId(bytes);
    if id.is_valid() {
        return id;
    }
    let mut bytes = id.0;
    bytes[15] = 1;
    TraceId(bytes)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}
