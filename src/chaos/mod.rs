//! Declarative chaos policies.
//!
//! Policies are loaded from JSON, validated up front, and compiled by the
//! [`engine`] into a form that can be applied to batches cheaply.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};

use crate::model::{TypedValue, ValueError};

mod engine;
pub use self::engine::{seeded_decider, ChaosEngine, Decider};

/// Errors produced while loading or validating chaos policies.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PolicyError {
    /// The policy file could not be read.
    #[snafu(display("failed to read chaos policy file: {}", source))]
    ReadFile {
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The policy file could not be parsed.
    #[snafu(display("failed to parse chaos policy file: {}", source))]
    ParseFile {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A policy had no name.
    #[snafu(display("policy {}: name is required", index))]
    MissingName {
        /// Position of the policy in the file.
        index: usize,
    },

    /// A policy probability was outside `[0, 1]`.
    #[snafu(display("policy {}: probability must be between 0 and 1", policy))]
    InvalidProbability {
        /// Name of the offending policy.
        policy: String,
    },

    /// A policy listed no actions.
    #[snafu(display("policy {}: at least one action is required", policy))]
    MissingActions {
        /// Name of the offending policy.
        policy: String,
    },

    /// A match attribute held an invalid typed value.
    #[snafu(display("policy {}: match attribute {:?}: {}", policy, attribute, source))]
    InvalidMatchAttribute {
        /// Name of the offending policy.
        policy: String,
        /// The attribute key.
        attribute: String,
        /// Underlying value error.
        source: ValueError,
    },

    /// A `set_attribute` action was missing its attribute name.
    #[snafu(display("policy {}: set_attribute requires name", policy))]
    MissingAttributeName {
        /// Name of the offending policy.
        policy: String,
    },

    /// A `set_attribute` action named an unknown scope.
    #[snafu(display("policy {}: set_attribute scope must be span or resource", policy))]
    InvalidScope {
        /// Name of the offending policy.
        policy: String,
    },

    /// A `set_attribute` action held an invalid typed value.
    #[snafu(display("policy {}: set_attribute {:?}: {}", policy, attribute, source))]
    InvalidAttributeValue {
        /// Name of the offending policy.
        policy: String,
        /// The attribute key.
        attribute: String,
        /// Underlying value error.
        source: ValueError,
    },

    /// A `set_status` action named an unknown status code.
    #[snafu(display("policy {}: set_status code must be ok, error, or unset", policy))]
    InvalidStatusCode {
        /// Name of the offending policy.
        policy: String,
    },
}

/// How matching policies combine per span.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Every matching policy applies, in file order.
    #[default]
    All,
    /// Only the first applied policy takes effect per span.
    FirstMatch,
}

/// Match predicate: the conjunction of all present fields.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Match {
    /// Equality on `service.name` (span attributes, then resource attributes).
    pub service_name: String,
    /// Equality on the span name.
    pub span_name: String,
    /// Membership of the span kind in this set; empty matches all kinds.
    pub span_kinds: Vec<String>,
    /// Typed equality per attribute (span attributes, then resource attributes).
    pub attributes: BTreeMap<String, TypedValue>,
}

/// A single policy action.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Overwrites an existing attribute on the span or its resource.
    SetAttribute {
        /// Which attribute map to touch: `span` or `resource`.
        scope: String,
        /// Attribute name.
        name: String,
        /// New value.
        value: TypedValue,
    },
    /// Overwrites the span status.
    SetStatus {
        /// New status code: `ok`, `error`, or `unset`.
        code: String,
        /// New status description.
        #[serde(default)]
        message: String,
    },
    /// Shifts the span end time.
    AddLatency {
        /// Signed delta in milliseconds.
        delta_ms: i64,
    },
}

/// A named chaos policy.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Policy name, used in diagnostics.
    pub name: String,
    /// Probability in `[0, 1]` that a matching span is actually mutated.
    pub probability: f64,
    /// Match predicate.
    #[serde(default, rename = "match")]
    pub matcher: Match,
    /// Actions applied, in order, when the policy fires.
    pub actions: Vec<Action>,
}

/// A set of chaos policies plus the seed and mode they run under.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChaosConfig {
    /// Seed for the probabilistic decider; zero means seed from the clock.
    pub seed: i64,
    /// How matching policies combine.
    pub policy_mode: PolicyMode,
    /// The policies, evaluated in file order.
    pub policies: Vec<Policy>,
}

impl ChaosConfig {
    /// Loads a policy set from a JSON file and validates it.
    ///
    /// Unknown fields are rejected.
    pub fn load_from_json<P: AsRef<Path>>(path: P) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path).context(ReadFile)?;
        Self::decode_json(&raw)
    }

    /// Decodes a policy set from a JSON string and validates it.
    pub fn decode_json(raw: &str) -> Result<Self, PolicyError> {
        let config: ChaosConfig = serde_json::from_str(raw).context(ParseFile)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every policy in the set.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (index, policy) in self.policies.iter().enumerate() {
            if policy.name.trim().is_empty() {
                return MissingName { index }.fail();
            }
            if !(0.0..=1.0).contains(&policy.probability) {
                return InvalidProbability {
                    policy: policy.name.as_str(),
                }
                .fail();
            }
            if policy.actions.is_empty() {
                return MissingActions {
                    policy: policy.name.as_str(),
                }
                .fail();
            }
            for (key, value) in &policy.matcher.attributes {
                value.validate().context(InvalidMatchAttribute {
                    policy: policy.name.as_str(),
                    attribute: key.as_str(),
                })?;
            }
            for action in &policy.actions {
                validate_action(&policy.name, action)?;
            }
        }
        Ok(())
    }
}

fn validate_action(policy: &str, action: &Action) -> Result<(), PolicyError> {
    match action {
        Action::SetAttribute { scope, name, value } => {
            let scope = scope.trim().to_ascii_lowercase();
            if scope != "span" && scope != "resource" {
                return InvalidScope { policy }.fail();
            }
            if name.trim().is_empty() {
                return MissingAttributeName { policy }.fail();
            }
            value.validate().context(InvalidAttributeValue {
                policy,
                attribute: name.as_str(),
            })?;
        }
        Action::SetStatus { code, .. } => {
            let code = code.trim().to_ascii_lowercase();
            if code != "ok" && code != "error" && code != "unset" {
                return InvalidStatusCode { policy }.fail();
            }
        }
        Action::AddLatency { .. } => {
            // Any delta is valid; zero is a no-op, negative shortens the span.
        }
    }
    Ok(())
}
