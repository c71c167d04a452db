//! Arena-based trace builder.
//!
//! Spans under construction live in a flat arena and refer to each other by
//! index, which keeps fan-in (multiple parent edges) representable without
//! cyclic ownership. The structural tree keeps a single parent per span;
//! additional parent edges are recorded as links on the child.

use std::sync::Arc;
use std::time::SystemTime;

use rand::Rng;

use crate::model::{AttrMap, Batch, Link, Span, SpanId, SpanKind, SpanStatus, TraceId};

/// Everything needed to create one span in the arena.
pub struct SpanSpec {
    /// Operation name.
    pub name: String,
    /// Span kind.
    pub kind: SpanKind,
    /// Start timestamp.
    pub start: SystemTime,
    /// End timestamp.
    pub end: SystemTime,
    /// Span attributes.
    pub attributes: AttrMap,
    /// Status.
    pub status: SpanStatus,
}

struct SpanNode {
    span: Span,
    depth: usize,
    parents: Vec<usize>,
    children: Vec<usize>,
}

/// Builds one trace as an arena of span nodes.
pub struct TraceBuilder {
    trace_id: TraceId,
    resource_attributes: Arc<AttrMap>,
    nodes: Vec<SpanNode>,
}

impl TraceBuilder {
    /// Creates a builder for a trace with the given id and shared resource
    /// attributes.
    pub fn new(trace_id: TraceId, resource_attributes: Arc<AttrMap>) -> Self {
        TraceBuilder {
            trace_id,
            resource_attributes,
            nodes: Vec::new(),
        }
    }

    /// Number of spans created so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` when no spans have been created.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth of the span at `index`, with the root at depth 1.
    pub fn depth(&self, index: usize) -> usize {
        self.nodes[index].depth
    }

    /// Start and end time of the span at `index`.
    pub fn window(&self, index: usize) -> (SystemTime, SystemTime) {
        let span = &self.nodes[index].span;
        (span.start_time, span.end_time)
    }

    /// Adds a root span and returns its index.
    pub fn add_root(&mut self, rng: &mut impl Rng, spec: SpanSpec) -> usize {
        self.new_span(rng, spec, None)
    }

    /// Adds a span under the given parent and returns its index.
    pub fn add_child(&mut self, rng: &mut impl Rng, parent: usize, spec: SpanSpec) -> usize {
        self.new_span(rng, spec, Some(parent))
    }

    /// Records an additional parent→child edge as a link on the child.
    ///
    /// Refused (returning `false`) when the edge would duplicate an existing
    /// one, target the parent itself, or close a cycle. On success the child
    /// carries a link to the new parent's span context and its depth is bumped
    /// to stay below the new parent.
    pub fn link_child(&mut self, parent: usize, child: usize) -> bool {
        if parent == child || self.is_ancestor(parent, child) || self.nodes[parent].children.contains(&child) {
            return false;
        }

        let parent_span_id = self.nodes[parent].span.span_id;
        let parent_depth = self.nodes[parent].depth;

        self.nodes[parent].children.push(child);
        self.nodes[child].parents.push(parent);
        self.nodes[child].span.links.push(Link {
            trace_id: self.trace_id,
            span_id: parent_span_id,
            attributes: Arc::new(AttrMap::new()),
        });

        if parent_depth + 1 > self.nodes[child].depth {
            self.bump_depth(child, parent_depth + 1);
        }
        true
    }

    /// Returns `true` when `candidate` is an ancestor of `node` along any
    /// parent edge.
    pub fn is_ancestor(&self, node: usize, candidate: usize) -> bool {
        let mut stack: Vec<usize> = self.nodes[node].parents.clone();
        while let Some(index) = stack.pop() {
            if index == candidate {
                return true;
            }
            stack.extend_from_slice(&self.nodes[index].parents);
        }
        false
    }

    /// Consumes the builder, returning the spans in creation order.
    pub fn into_batch(self) -> Batch {
        self.nodes.into_iter().map(|node| node.span).collect()
    }

    fn new_span(&mut self, rng: &mut impl Rng, spec: SpanSpec, parent: Option<usize>) -> usize {
        let parent_span_id = parent
            .map(|index| self.nodes[index].span.span_id)
            .unwrap_or(SpanId::INVALID);

        let index = self.nodes.len();
        self.nodes.push(SpanNode {
            span: Span {
                trace_id: self.trace_id,
                span_id: SpanId::random(rng),
                parent_span_id,
                name: spec.name,
                kind: spec.kind,
                start_time: spec.start,
                end_time: spec.end,
                attributes: Arc::new(spec.attributes),
                resource_attributes: Arc::clone(&self.resource_attributes),
                links: Vec::new(),
                events: Vec::new(),
                status: spec.status,
            },
            depth: 1,
            parents: Vec::new(),
            children: Vec::new(),
        });

        if let Some(parent) = parent {
            self.nodes[parent].children.push(index);
            self.nodes[index].parents.push(parent);
            self.nodes[index].depth = self.nodes[parent].depth + 1;
        }
        index
    }

    fn bump_depth(&mut self, index: usize, depth: usize) {
        let mut stack = vec![(index, depth)];
        while let Some((index, depth)) = stack.pop() {
            if depth <= self.nodes[index].depth {
                continue;
            }
            self.nodes[index].depth = depth;
            for &child in &self.nodes[index].children {
                stack.push((child, depth + 1));
            }
        }
    }
}
