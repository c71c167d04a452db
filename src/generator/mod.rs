//! Random trace generation.
//!
//! Each invocation produces one structurally valid span tree: depth and span
//! count stay within configured bounds, child spans are contained in their
//! parent's time window, and fan-in is expressed as links rather than second
//! structural parents.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::seq::SliceRandom as _;
use rand::Rng;

use crate::config::GeneratorConfig;
use crate::model::{AttrMap, AttrValue, Batch, SpanKind, SpanStatus, TraceId};

mod builder;
pub use self::builder::{SpanSpec, TraceBuilder};

/// Status message attached to spans rolled as errors.
const SIMULATED_FAILURE: &str = "simulated failure";

/// Resolution of the error-rate roll.
const ERROR_RATE_PRECISION: u64 = 1000;

/// Pool of service names used when no base name is configured.
const FRUIT_POOL: [&str; 25] = [
    "apple",
    "apricot",
    "banana",
    "blackberry",
    "blueberry",
    "cherry",
    "coconut",
    "fig",
    "grape",
    "kiwi",
    "lemon",
    "lime",
    "mango",
    "melon",
    "nectarine",
    "orange",
    "papaya",
    "peach",
    "pear",
    "pineapple",
    "plum",
    "pomegranate",
    "raspberry",
    "strawberry",
    "watermelon",
];

/// Generator for random, structurally valid trace batches.
#[derive(Clone, Debug)]
pub struct TraceGenerator {
    /// Base `service.name`; empty picks names from the fruit pool.
    pub service_name: String,
    /// Base span name; empty synthesizes a `span-<8 alnum>` label per batch.
    pub span_name: String,
    /// Number of distinct service names to emit.
    pub services: usize,
    /// Maximum span depth per trace, root at depth 1.
    pub max_depth: usize,
    /// Maximum spans per trace.
    pub max_spans: usize,
    /// Probability in `[0, 1]` of spans marked as error.
    pub error_rate: f64,
}

impl TraceGenerator {
    /// Creates a generator from the generator section of the run configuration.
    pub fn from_config(config: &GeneratorConfig) -> Self {
        TraceGenerator {
            service_name: config.service_name.clone(),
            span_name: config.span_name.clone(),
            services: config.services,
            max_depth: config.max_depth,
            max_spans: config.max_spans,
            error_rate: config.error_rate,
        }
    }

    /// Generates one batch containing a single trace.
    pub fn generate_batch(&self, rng: &mut impl Rng) -> Batch {
        let service_names = build_service_names(self.services, rng, &self.service_name);
        let resource_service = if self.service_name.is_empty() {
            service_names
                .first()
                .cloned()
                .unwrap_or_else(|| random_label(rng, "service"))
        } else {
            self.service_name.clone()
        };
        let span_name = if self.span_name.is_empty() {
            random_label(rng, "span")
        } else {
            self.span_name.clone()
        };

        let span_count = if self.max_spans <= 1 {
            1
        } else {
            rng.random_range(1..=self.max_spans)
        };

        let resource_attributes = Arc::new(AttrMap::from([(
            "service.name".to_string(),
            AttrValue::from(resource_service),
        )]));
        let mut builder = TraceBuilder::new(TraceId::random(rng), resource_attributes);

        // The root ends "now"; its start is pushed back by a random duration.
        let trace_end = SystemTime::now();
        let root_duration = random_span_duration(rng);
        let root_kind = random_span_kind(rng);
        let root_service = pick_service(&service_names, rng);
        let (status, http_status) = random_span_status(rng, self.error_rate);
        let mut attributes = AttrMap::from([("service.name".to_string(), AttrValue::from(root_service.clone()))]);
        append_http_status(&mut attributes, root_kind, http_status);
        builder.add_root(
            rng,
            SpanSpec {
                name: format!("{}:{}", root_service, span_name),
                kind: root_kind,
                start: trace_end - root_duration,
                end: trace_end,
                attributes,
                status,
            },
        );

        let mut remaining = span_count - 1;
        while remaining > 0 {
            let parent = pick_parent_index(&builder, self.max_depth, rng);
            if builder.depth(parent) >= self.max_depth {
                break;
            }

            match rng.random_range(0..4) {
                0 => {
                    // Client -> server pair. Needs two spans of budget and two
                    // levels of depth headroom.
                    if remaining < 2 || builder.depth(parent) + 2 > self.max_depth {
                        continue;
                    }
                    self.emit_paired_span(
                        &mut builder,
                        parent,
                        &service_names,
                        &span_name,
                        rng,
                        SpanKind::Client,
                        SpanKind::Server,
                    );
                    remaining -= 2;
                }
                1 => {
                    // Producer -> consumer pair, same budget rules as above.
                    if remaining < 2 || builder.depth(parent) + 2 > self.max_depth {
                        continue;
                    }
                    self.emit_paired_span(
                        &mut builder,
                        parent,
                        &service_names,
                        &span_name,
                        rng,
                        SpanKind::Producer,
                        SpanKind::Consumer,
                    );
                    remaining -= 2;
                }
                2 => {
                    // Database request: client span with db attributes.
                    let db_attrs = db_attributes(rng);
                    self.emit_child_span(&mut builder, parent, &service_names, &span_name, rng, SpanKind::Client, db_attrs);
                    remaining -= 1;
                }
                _ => {
                    // Fan-in: record an existing span as a child of another parent.
                    if let Some(child) = pick_link_candidate(&builder, parent, self.max_depth, rng) {
                        builder.link_child(parent, child);
                    }
                }
            }
        }

        builder.into_batch()
    }

    fn emit_child_span(
        &self,
        builder: &mut TraceBuilder,
        parent: usize,
        service_names: &[String],
        span_name: &str,
        rng: &mut impl Rng,
        kind: SpanKind,
        extra_attributes: AttrMap,
    ) -> usize {
        let (parent_start, parent_end) = builder.window(parent);
        let parent_window = parent_end.duration_since(parent_start).unwrap_or(Duration::ZERO);
        let duration = random_span_duration(rng).min(parent_window);
        let (start, end) = random_child_window(rng, parent_start, parent_end, duration);

        let service = pick_service(service_names, rng);
        let (status, http_status) = random_span_status(rng, self.error_rate);
        let mut attributes = extra_attributes;
        attributes.insert("service.name".to_string(), AttrValue::from(service.clone()));
        append_http_status(&mut attributes, kind, http_status);

        builder.add_child(
            rng,
            parent,
            SpanSpec {
                name: format!("{}:{}", service, span_name),
                kind,
                start,
                end,
                attributes,
                status,
            },
        )
    }

    fn emit_paired_span(
        &self,
        builder: &mut TraceBuilder,
        parent: usize,
        service_names: &[String],
        span_name: &str,
        rng: &mut impl Rng,
        parent_kind: SpanKind,
        child_kind: SpanKind,
    ) -> (usize, usize) {
        let first = self.emit_child_span(builder, parent, service_names, span_name, rng, parent_kind, AttrMap::new());
        let second = self.emit_child_span(builder, first, service_names, span_name, rng, child_kind, AttrMap::new());
        (first, second)
    }
}

/// Picks a parent index whose depth still has room under `max_depth`.
///
/// Tries up to ten random picks, then scans for the first suitable node, then
/// falls back to the root.
fn pick_parent_index(builder: &TraceBuilder, max_depth: usize, rng: &mut impl Rng) -> usize {
    if max_depth <= 1 {
        return 0;
    }
    for _ in 0..10 {
        let index = rng.random_range(0..builder.len());
        if builder.depth(index) < max_depth {
            return index;
        }
    }
    for index in 0..builder.len() {
        if builder.depth(index) < max_depth {
            return index;
        }
    }
    0
}

/// Picks an existing span that can become a fan-in child of `parent`.
///
/// Candidates must not be the parent itself or one of its ancestors, and must
/// already sit at least one level below the parent.
fn pick_link_candidate(builder: &TraceBuilder, parent: usize, max_depth: usize, rng: &mut impl Rng) -> Option<usize> {
    if builder.len() < 2 || builder.depth(parent) >= max_depth {
        return None;
    }
    for _ in 0..12 {
        let child = rng.random_range(0..builder.len());
        if child == parent || builder.is_ancestor(parent, child) {
            continue;
        }
        if builder.depth(parent) + 1 > builder.depth(child) {
            continue;
        }
        return Some(child);
    }
    None
}

fn pick_service(service_names: &[String], rng: &mut impl Rng) -> String {
    let index = rng.random_range(0..service_names.len());
    service_names[index].clone()
}

/// Builds the list of service names to draw from.
fn build_service_names(count: usize, rng: &mut impl Rng, base_name: &str) -> Vec<String> {
    if count == 0 {
        return Vec::new();
    }
    if !base_name.is_empty() {
        if count == 1 {
            return vec![base_name.to_string()];
        }
        return (1..=count).map(|i| format!("{}-{}", base_name, i)).collect();
    }

    let mut pool: Vec<String> = FRUIT_POOL.iter().map(|name| name.to_string()).collect();
    pool.shuffle(rng);
    if count <= pool.len() {
        pool.truncate(count);
        return pool;
    }
    for i in pool.len() + 1..=count {
        pool.push(format!("fruit-{}", i));
    }
    pool
}

fn random_label(rng: &mut impl Rng, prefix: &str) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    const LENGTH: usize = 8;

    let mut label = String::with_capacity(prefix.len() + 1 + LENGTH);
    label.push_str(prefix);
    label.push('-');
    for _ in 0..LENGTH {
        label.push(ALPHABET[rng.random_range(0..ALPHABET.len())] as char);
    }
    label
}

fn random_span_kind(rng: &mut impl Rng) -> SpanKind {
    SpanKind::ALL[rng.random_range(0..SpanKind::ALL.len())]
}

/// Rolls the error dice with 1/1000 precision.
///
/// Returns the span status and the HTTP status code to attach on client and
/// server spans.
fn random_span_status(rng: &mut impl Rng, error_rate: f64) -> (SpanStatus, i64) {
    if error_rate <= 0.0 {
        return (SpanStatus::ok(), 200);
    }
    if error_rate >= 1.0 {
        return (SpanStatus::error(SIMULATED_FAILURE), 500);
    }

    let threshold = (error_rate * ERROR_RATE_PRECISION as f64) as u64;
    if threshold == 0 {
        return (SpanStatus::ok(), 200);
    }
    if threshold >= ERROR_RATE_PRECISION {
        return (SpanStatus::error(SIMULATED_FAILURE), 500);
    }

    if rng.random_range(0..ERROR_RATE_PRECISION) < threshold {
        (SpanStatus::error(SIMULATED_FAILURE), 500)
    } else {
        (SpanStatus::ok(), 200)
    }
}

fn append_http_status(attributes: &mut AttrMap, kind: SpanKind, http_status: i64) {
    if kind != SpanKind::Server && kind != SpanKind::Client {
        return;
    }
    attributes.insert("http.response.status_code".to_string(), AttrValue::Int(http_status));
}

fn db_attributes(rng: &mut impl Rng) -> AttrMap {
    const SYSTEMS: [&str; 4] = ["postgresql", "mysql", "redis", "mongodb"];
    let system = SYSTEMS[rng.random_range(0..SYSTEMS.len())];
    AttrMap::from([
        ("db.system".to_string(), AttrValue::from(system)),
        ("db.name".to_string(), AttrValue::from("example")),
    ])
}

/// Draws a span duration from one of four buckets covering 1 ms to 2 minutes.
fn random_span_duration(rng: &mut impl Rng) -> Duration {
    const BUCKETS: [(Duration, Duration); 4] = [
        (Duration::from_millis(1), Duration::from_millis(80)),
        (Duration::from_millis(80), Duration::from_millis(900)),
        (Duration::from_millis(900), Duration::from_secs(8)),
        (Duration::from_secs(8), Duration::from_secs(120)),
    ];
    let (min, max) = BUCKETS[rng.random_range(0..BUCKETS.len())];
    random_duration_range(rng, min, max)
}

fn random_duration_range(rng: &mut impl Rng, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let delta = (max - min).as_nanos() as u64;
    min + Duration::from_nanos(rng.random_range(0..=delta))
}

/// Places a child of the given duration uniformly inside the parent window.
fn random_child_window(
    rng: &mut impl Rng,
    parent_start: SystemTime,
    parent_end: SystemTime,
    duration: Duration,
) -> (SystemTime, SystemTime) {
    if duration.is_zero() || parent_end <= parent_start {
        return (parent_start, parent_start + duration);
    }
    let latest_start = parent_end - duration;
    let offset_range = latest_start.duration_since(parent_start).unwrap_or(Duration::ZERO);
    let offset = random_duration_range(rng, Duration::ZERO, offset_range);
    let start = parent_start + offset;
    (start, start + duration)
}
