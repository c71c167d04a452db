//! Policy compilation and application.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use snafu::ResultExt as _;

use super::{
    Action, ChaosConfig, InvalidAttributeValue, InvalidMatchAttribute, InvalidScope, InvalidStatusCode, PolicyError,
    PolicyMode,
};
use crate::model::{AttrValue, Span, SpanStatus, StatusCode};

/// Decides whether a matched policy fires, given its probability.
///
/// A seeded decider is stateful and not safe for concurrent use; callers must
/// serialize access or create one per worker.
pub type Decider = Box<dyn FnMut(f64) -> bool + Send>;

/// Builds the production decider, backed by a seeded PRNG.
///
/// A zero seed falls back to the current time, making runs non-reproducible.
pub fn seeded_decider(seed: i64) -> Decider {
    let seed = if seed == 0 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        seed as u64
    };

    let mut rng = StdRng::seed_from_u64(seed);
    Box::new(move |probability| {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        rng.random::<f64>() < probability
    })
}

/// Which attribute map a `set_attribute` action touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    Span,
    Resource,
}

enum CompiledAction {
    SetAttribute {
        scope: Scope,
        name: String,
        value: AttrValue,
    },
    SetStatus {
        status: SpanStatus,
    },
    AddLatency {
        delta_ms: i64,
    },
}

struct CompiledMatch {
    service_name: String,
    span_name: String,
    span_kinds: HashSet<String>,
    attributes: BTreeMap<String, AttrValue>,
}

struct CompiledPolicy {
    probability: f64,
    matcher: CompiledMatch,
    actions: Vec<CompiledAction>,
}

/// A compiled, immutable policy set.
///
/// The engine itself is stateless and safe to share across workers; only the
/// decider carries state.
pub struct ChaosEngine {
    mode: PolicyMode,
    policies: Vec<CompiledPolicy>,
}

impl ChaosEngine {
    /// Validates and compiles a policy configuration.
    pub fn new(config: &ChaosConfig) -> Result<Self, PolicyError> {
        config.validate()?;

        let mut policies = Vec::with_capacity(config.policies.len());
        for policy in &config.policies {
            policies.push(CompiledPolicy {
                probability: policy.probability,
                matcher: compile_match(policy)?,
                actions: compile_actions(policy)?,
            });
        }

        Ok(ChaosEngine {
            mode: config.policy_mode,
            policies,
        })
    }

    /// Applies the policy set to a batch.
    ///
    /// The input is never mutated: if any policy fires, a copy of the batch is
    /// made lazily and only the affected spans' attribute maps are cloned.
    /// When nothing fires the input is returned as-is.
    pub fn apply<'a>(&self, batch: &'a [Span], decide: &mut dyn FnMut(f64) -> bool) -> Cow<'a, [Span]> {
        if batch.is_empty() || self.policies.is_empty() {
            return Cow::Borrowed(batch);
        }

        let mut out: Option<Vec<Span>> = None;
        for index in 0..batch.len() {
            for policy in &self.policies {
                {
                    let current = out.as_ref().map(|spans| &spans[index]).unwrap_or(&batch[index]);
                    if !policy.matcher.matches(current) {
                        continue;
                    }
                }
                if !should_apply(policy.probability, decide) {
                    continue;
                }

                let spans = out.get_or_insert_with(|| batch.to_vec());
                let target = &mut spans[index];
                for action in &policy.actions {
                    apply_action(target, action);
                }

                if self.mode == PolicyMode::FirstMatch {
                    break;
                }
            }
        }

        match out {
            Some(spans) => Cow::Owned(spans),
            None => Cow::Borrowed(batch),
        }
    }
}

fn compile_match(policy: &super::Policy) -> Result<CompiledMatch, PolicyError> {
    let matcher = &policy.matcher;

    let mut span_kinds = HashSet::with_capacity(matcher.span_kinds.len());
    for kind in &matcher.span_kinds {
        let normalized = kind.trim().to_ascii_lowercase();
        if !normalized.is_empty() {
            span_kinds.insert(normalized);
        }
    }

    let mut attributes = BTreeMap::new();
    for (key, value) in &matcher.attributes {
        let compiled = value.to_attr_value().context(InvalidMatchAttribute {
            policy: policy.name.as_str(),
            attribute: key.as_str(),
        })?;
        attributes.insert(key.clone(), compiled);
    }

    Ok(CompiledMatch {
        service_name: matcher.service_name.trim().to_string(),
        span_name: matcher.span_name.trim().to_string(),
        span_kinds,
        attributes,
    })
}

fn compile_actions(policy: &super::Policy) -> Result<Vec<CompiledAction>, PolicyError> {
    let mut out = Vec::with_capacity(policy.actions.len());
    for action in &policy.actions {
        out.push(compile_action(&policy.name, action)?);
    }
    Ok(out)
}

fn compile_action(policy: &str, action: &Action) -> Result<CompiledAction, PolicyError> {
    match action {
        Action::SetAttribute { scope, name, value } => {
            let scope = match scope.trim().to_ascii_lowercase().as_str() {
                "span" => Scope::Span,
                "resource" => Scope::Resource,
                _ => return InvalidScope { policy }.fail(),
            };
            let value = value.to_attr_value().context(InvalidAttributeValue {
                policy,
                attribute: name.as_str(),
            })?;
            Ok(CompiledAction::SetAttribute {
                scope,
                name: name.trim().to_string(),
                value,
            })
        }
        Action::SetStatus { code, message } => {
            let code = match code.trim().to_ascii_lowercase().as_str() {
                "ok" => StatusCode::Ok,
                "error" => StatusCode::Error,
                "unset" => StatusCode::Unset,
                _ => return InvalidStatusCode { policy }.fail(),
            };
            Ok(CompiledAction::SetStatus {
                status: SpanStatus {
                    code,
                    message: message.clone(),
                },
            })
        }
        Action::AddLatency { delta_ms } => Ok(CompiledAction::AddLatency { delta_ms: *delta_ms }),
    }
}

impl CompiledMatch {
    fn matches(&self, span: &Span) -> bool {
        if !self.span_name.is_empty() && span.name != self.span_name {
            return false;
        }
        if !self.span_kinds.is_empty() && !self.span_kinds.contains(span.kind.as_str()) {
            return false;
        }
        if !self.service_name.is_empty() && !has_service_name(span, &self.service_name) {
            return false;
        }
        for (key, want) in &self.attributes {
            match span.attribute(key) {
                Some(got) if got == want => {}
                _ => return false,
            }
        }
        true
    }
}

fn has_service_name(span: &Span, service_name: &str) -> bool {
    for attributes in [&span.attributes, &span.resource_attributes] {
        if let Some(AttrValue::String(got)) = attributes.get("service.name") {
            if got == service_name {
                return true;
            }
        }
    }
    false
}

fn should_apply(probability: f64, decide: &mut dyn FnMut(f64) -> bool) -> bool {
    if probability <= 0.0 {
        return false;
    }
    if probability >= 1.0 {
        return true;
    }
    decide(probability)
}

fn apply_action(span: &mut Span, action: &CompiledAction) {
    match action {
        CompiledAction::SetAttribute { scope, name, value } => {
            // Existing keys are overwritten; absent keys are never introduced.
            let attributes = match scope {
                Scope::Span => &mut span.attributes,
                Scope::Resource => &mut span.resource_attributes,
            };
            if attributes.contains_key(name) {
                Arc::make_mut(attributes).insert(name.clone(), value.clone());
            }
        }
        CompiledAction::SetStatus { status } => {
            span.status = status.clone();
        }
        CompiledAction::AddLatency { delta_ms } => {
            apply_latency(span, *delta_ms);
        }
    }
}

fn apply_latency(span: &mut Span, delta_ms: i64) {
    if delta_ms == 0 {
        return;
    }
    let delta = Duration::from_millis(delta_ms.unsigned_abs());
    let new_end = if delta_ms > 0 {
        span.end_time.checked_add(delta)
    } else {
        span.end_time.checked_sub(delta)
    };
    // Keep the span's duration strictly positive.
    let floor = span.start_time + Duration::from_millis(1);
    span.end_time = match new_end {
        Some(end) if end > span.start_time => end,
        _ => floor,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::{Match, Policy};
    use crate::model::{AttrMap, SpanId, SpanKind, TraceId};

    fn always() -> impl FnMut(f64) -> bool {
        |_| true
    }

    fn never() -> impl FnMut(f64) -> bool {
        |_| false
    }

    fn span_with(attributes: AttrMap, resource: AttrMap) -> Span {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        Span {
            trace_id: TraceId([1; 16]),
            span_id: SpanId([2; 8]),
            parent_span_id: SpanId::INVALID,
            name: "POST /posts".to_string(),
            kind: SpanKind::Server,
            start_time: start,
            end_time: start + Duration::from_millis(10),
            attributes: Arc::new(attributes),
            resource_attributes: Arc::new(resource),
            links: Vec::new(),
            events: Vec::new(),
            status: SpanStatus::ok(),
        }
    }

    fn post_service_span() -> Span {
        span_with(
            AttrMap::from([("service.name".to_string(), AttrValue::from("post-service"))]),
            AttrMap::from([("service.name".to_string(), AttrValue::from("post-service"))]),
        )
    }

    fn policy(actions: Vec<Action>) -> ChaosConfig {
        ChaosConfig {
            seed: 1,
            policy_mode: PolicyMode::All,
            policies: vec![Policy {
                name: "test-policy".to_string(),
                probability: 1.0,
                matcher: Match {
                    service_name: "post-service".to_string(),
                    ..Match::default()
                },
                actions,
            }],
        }
    }

    #[test]
    fn test_set_status_overwrites_code_and_message() {
        let engine = ChaosEngine::new(&policy(vec![Action::SetStatus {
            code: "error".to_string(),
            message: "simulated".to_string(),
        }]))
        .unwrap();

        let input = vec![post_service_span()];
        let out = engine.apply(&input, &mut always());

        assert_eq!(out[0].status.code, StatusCode::Error);
        assert_eq!(out[0].status.message, "simulated");
        // The input span is untouched.
        assert_eq!(input[0].status.code, StatusCode::Ok);
    }

    #[test]
    fn test_set_attribute_span_scope_only_when_key_exists() {
        let engine = ChaosEngine::new(&policy(vec![
            Action::SetAttribute {
                scope: "span".to_string(),
                name: "http.response.status_code".to_string(),
                value: crate::model::TypedValue {
                    value_type: "int".to_string(),
                    value: serde_json::json!(500),
                },
            },
            Action::SetAttribute {
                scope: "span".to_string(),
                name: "non.existing".to_string(),
                value: crate::model::TypedValue {
                    value_type: "string".to_string(),
                    value: serde_json::json!("x"),
                },
            },
        ]))
        .unwrap();

        let mut attributes = AttrMap::from([("service.name".to_string(), AttrValue::from("post-service"))]);
        attributes.insert("http.response.status_code".to_string(), AttrValue::Int(200));
        let input = vec![span_with(
            attributes,
            AttrMap::from([("service.name".to_string(), AttrValue::from("post-service"))]),
        )];

        let out = engine.apply(&input, &mut always());
        assert_eq!(out[0].attributes["http.response.status_code"], AttrValue::Int(500));
        assert!(!out[0].attributes.contains_key("non.existing"));
        // Input attribute map is untouched.
        assert_eq!(input[0].attributes["http.response.status_code"], AttrValue::Int(200));
    }

    #[test]
    fn test_set_attribute_resource_scope() {
        let engine = ChaosEngine::new(&policy(vec![Action::SetAttribute {
            scope: "resource".to_string(),
            name: "service.version".to_string(),
            value: crate::model::TypedValue {
                value_type: "string".to_string(),
                value: serde_json::json!("2.11.0"),
            },
        }]))
        .unwrap();

        let input = vec![span_with(
            AttrMap::from([("service.name".to_string(), AttrValue::from("post-service"))]),
            AttrMap::from([
                ("service.name".to_string(), AttrValue::from("post-service")),
                ("service.version".to_string(), AttrValue::from("2.10.0")),
            ]),
        )];

        let out = engine.apply(&input, &mut always());
        assert_eq!(out[0].resource_attributes["service.version"], AttrValue::from("2.11.0"));
        assert_eq!(input[0].resource_attributes["service.version"], AttrValue::from("2.10.0"));
    }

    #[test]
    fn test_first_match_stops_after_first_applied_policy() {
        let config = ChaosConfig {
            seed: 1,
            policy_mode: PolicyMode::FirstMatch,
            policies: vec![
                Policy {
                    name: "first".to_string(),
                    probability: 1.0,
                    matcher: Match {
                        service_name: "post-service".to_string(),
                        ..Match::default()
                    },
                    actions: vec![Action::SetStatus {
                        code: "error".to_string(),
                        message: "failed".to_string(),
                    }],
                },
                Policy {
                    name: "second".to_string(),
                    probability: 1.0,
                    matcher: Match {
                        service_name: "post-service".to_string(),
                        ..Match::default()
                    },
                    actions: vec![Action::SetStatus {
                        code: "ok".to_string(),
                        message: String::new(),
                    }],
                },
            ],
        };
        let engine = ChaosEngine::new(&config).unwrap();

        let spans = [post_service_span()];
        let out = engine.apply(&spans, &mut always());
        assert_eq!(out[0].status.code, StatusCode::Error);
        assert_eq!(out[0].status.message, "failed");
    }

    #[test]
    fn test_all_mode_applies_matching_policies_in_order() {
        let mut config = ChaosConfig {
            seed: 1,
            policy_mode: PolicyMode::All,
            policies: Vec::new(),
        };
        for (index, code) in ["error", "unset"].iter().enumerate() {
            config.policies.push(Policy {
                name: format!("policy-{}", index),
                probability: 1.0,
                matcher: Match {
                    service_name: "post-service".to_string(),
                    ..Match::default()
                },
                actions: vec![Action::SetStatus {
                    code: code.to_string(),
                    message: String::new(),
                }],
            });
        }
        let engine = ChaosEngine::new(&config).unwrap();

        let spans = [post_service_span()];
        let out = engine.apply(&spans, &mut always());
        // The last matching policy wins in `all` mode.
        assert_eq!(out[0].status.code, StatusCode::Unset);
    }

    #[test]
    fn test_match_attributes_are_typed() {
        let config = ChaosConfig {
            seed: 1,
            policy_mode: PolicyMode::All,
            policies: vec![Policy {
                name: "match-int".to_string(),
                probability: 1.0,
                matcher: Match {
                    attributes: BTreeMap::from([(
                        "http.response.status_code".to_string(),
                        crate::model::TypedValue {
                            value_type: "int".to_string(),
                            value: serde_json::json!(200),
                        },
                    )]),
                    ..Match::default()
                },
                actions: vec![Action::SetStatus {
                    code: "error".to_string(),
                    message: String::new(),
                }],
            }],
        };
        let engine = ChaosEngine::new(&config).unwrap();

        let matching = span_with(
            AttrMap::from([("http.response.status_code".to_string(), AttrValue::Int(200))]),
            AttrMap::new(),
        );
        let out = engine.apply(std::slice::from_ref(&matching), &mut always());
        assert_eq!(out[0].status.code, StatusCode::Error);

        // Same number as a float does not match an int matcher.
        let mismatched = span_with(
            AttrMap::from([("http.response.status_code".to_string(), AttrValue::Float(200.0))]),
            AttrMap::new(),
        );
        let out = engine.apply(std::slice::from_ref(&mismatched), &mut always());
        assert_eq!(out[0].status.code, StatusCode::Ok);
    }

    #[test]
    fn test_span_kind_matching() {
        let config = ChaosConfig {
            seed: 1,
            policy_mode: PolicyMode::All,
            policies: vec![Policy {
                name: "server-only".to_string(),
                probability: 1.0,
                matcher: Match {
                    span_kinds: vec![" Server ".to_string(), "client".to_string()],
                    ..Match::default()
                },
                actions: vec![Action::SetStatus {
                    code: "error".to_string(),
                    message: String::new(),
                }],
            }],
        };
        let engine = ChaosEngine::new(&config).unwrap();

        let server = post_service_span();
        let out = engine.apply(std::slice::from_ref(&server), &mut always());
        assert_eq!(out[0].status.code, StatusCode::Error);

        let mut internal = post_service_span();
        internal.kind = SpanKind::Internal;
        let out = engine.apply(std::slice::from_ref(&internal), &mut always());
        assert_eq!(out[0].status.code, StatusCode::Ok);
    }

    #[test]
    fn test_returns_borrowed_input_when_nothing_applies() {
        let engine = ChaosEngine::new(&policy(vec![Action::SetStatus {
            code: "error".to_string(),
            message: String::new(),
        }]))
        .unwrap();

        let input = vec![span_with(
            AttrMap::from([("service.name".to_string(), AttrValue::from("other-service"))]),
            AttrMap::new(),
        )];
        assert!(matches!(engine.apply(&input, &mut always()), Cow::Borrowed(_)));

        // A matching span gated off by the decider also leaves the input alone.
        let gated = vec![post_service_span()];
        assert!(matches!(engine.apply(&gated, &mut never()), Cow::Borrowed(_)));
    }

    #[test]
    fn test_input_batch_is_never_mutated() {
        let engine = ChaosEngine::new(&policy(vec![
            Action::SetStatus {
                code: "error".to_string(),
                message: "boom".to_string(),
            },
            Action::AddLatency { delta_ms: 500 },
        ]))
        .unwrap();

        let input = vec![post_service_span(), post_service_span()];
        let before = input.clone();
        let out = engine.apply(&input, &mut always());

        assert_eq!(input, before);
        assert_eq!(out[0].status.code, StatusCode::Error);
        assert_eq!(out[1].status.code, StatusCode::Error);
    }

    #[test]
    fn test_add_latency_extends_span() {
        let engine = ChaosEngine::new(&policy(vec![Action::AddLatency { delta_ms: 1500 }])).unwrap();

        let input = vec![post_service_span()];
        let out = engine.apply(&input, &mut always());
        assert_eq!(
            out[0].end_time,
            input[0].end_time + Duration::from_millis(1500),
        );
    }

    #[test]
    fn test_add_latency_clamps_to_one_millisecond() {
        let engine = ChaosEngine::new(&policy(vec![Action::AddLatency { delta_ms: -1_000_000 }])).unwrap();

        // 10ms span; a huge negative delta clamps to start + 1ms.
        let input = vec![post_service_span()];
        let out = engine.apply(&input, &mut always());
        assert_eq!(out[0].end_time, out[0].start_time + Duration::from_millis(1));
        assert_eq!(out[0].status.code, StatusCode::Ok);
    }

    #[test]
    fn test_probability_bounds_bypass_decider() {
        let mut config = policy(vec![Action::SetStatus {
            code: "error".to_string(),
            message: String::new(),
        }]);
        config.policies[0].probability = 0.0;
        let engine = ChaosEngine::new(&config).unwrap();
        let spans = [post_service_span()];
        let out = engine.apply(&spans, &mut always());
        assert_eq!(out[0].status.code, StatusCode::Ok);

        config.policies[0].probability = 1.0;
        let engine = ChaosEngine::new(&config).unwrap();
        let spans = [post_service_span()];
        let out = engine.apply(&spans, &mut never());
        assert_eq!(out[0].status.code, StatusCode::Error);
    }

    #[test]
    fn test_demo_policy_file_end_to_end() {
        let mut config = ChaosConfig::decode_json(include_str!("../../demos/chaos-policies.json")).unwrap();
        config.policies[0].probability = 1.0;
        config.seed = 42;
        let engine = ChaosEngine::new(&config).unwrap();

        let input = vec![span_with(
            AttrMap::from([
                ("service.name".to_string(), AttrValue::from("post-service")),
                ("http.route".to_string(), AttrValue::from("/posts")),
                ("http.response.status_code".to_string(), AttrValue::Int(200)),
            ]),
            AttrMap::from([
                ("service.name".to_string(), AttrValue::from("post-service")),
                ("service.version".to_string(), AttrValue::from("2.10.0")),
            ]),
        )];

        let mut decider = seeded_decider(config.seed);
        let out = engine.apply(&input, &mut *decider);

        assert_eq!(out[0].status.code, StatusCode::Error);
        assert_eq!(out[0].attributes["http.response.status_code"], AttrValue::Int(500));
        // Input stays pristine.
        assert_eq!(input[0].status.code, StatusCode::Ok);
        assert_eq!(input[0].attributes["http.response.status_code"], AttrValue::Int(200));
    }

    #[test]
    fn test_seeded_decider_is_deterministic() {
        let mut first = seeded_decider(42);
        let mut second = seeded_decider(42);
        for _ in 0..100 {
            assert_eq!(first(0.5), second(0.5));
        }

        assert!(!first(0.0));
        assert!(first(1.0));
    }

    #[test]
    fn test_engines_with_same_seed_make_identical_decisions() {
        let mut config = policy(vec![Action::SetStatus {
            code: "error".to_string(),
            message: String::new(),
        }]);
        config.policies[0].probability = 0.5;
        let engine = ChaosEngine::new(&config).unwrap();

        let input: Vec<Span> = (0..50).map(|_| post_service_span()).collect();
        let mut first_decider = seeded_decider(42);
        let mut second_decider = seeded_decider(42);
        let first = engine.apply(&input, &mut *first_decider);
        let second = engine.apply(&input, &mut *second_decider);

        let codes = |spans: &[Span]| spans.iter().map(|s| s.status.code).collect::<Vec<_>>();
        assert_eq!(codes(&first), codes(&second));
    }
}
