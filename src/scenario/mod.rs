//! Scenario-driven trace generation.
//!
//! A scenario is a JSON-defined DAG of services, nodes, and edges that is
//! replayed deterministically: every invocation walks the same graph and
//! derives trace and span ids from the scenario seed plus an invocation
//! counter.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};

use crate::model::{AttrMap, TypedValue, ValueError};

mod generator;
pub use self::generator::ScenarioGenerator;

/// Errors produced while loading or validating a scenario.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ScenarioError {
    /// The scenario file could not be read.
    #[snafu(display("failed to read scenario file: {}", source))]
    ReadFile {
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The scenario file could not be parsed.
    #[snafu(display("failed to parse scenario file: {}", source))]
    ParseFile {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A required field was empty.
    #[snafu(display("{} is required", field))]
    MissingField {
        /// The missing field.
        field: &'static str,
    },

    /// The root node was not defined.
    #[snafu(display("root node {:?} not found", root))]
    UnknownRoot {
        /// The configured root id.
        root: String,
    },

    /// A node referenced a service that was not defined.
    #[snafu(display("node {}: unknown service {:?}", node, service))]
    UnknownService {
        /// The referencing node.
        node: String,
        /// The missing service id.
        service: String,
    },

    /// An edge referenced a node that was not defined.
    #[snafu(display("edge {}: unknown {} node {:?}", index, end, node))]
    UnknownNode {
        /// Position of the edge in the file.
        index: usize,
        /// Which end of the edge was dangling: `from` or `to`.
        end: &'static str,
        /// The missing node id.
        node: String,
    },

    /// An edge had a non-positive repeat count or duration.
    #[snafu(display("edge {}: {} must be > 0", index, field))]
    InvalidEdgeNumber {
        /// Position of the edge in the file.
        index: usize,
        /// The offending field.
        field: &'static str,
    },

    /// A resource or span attribute held an invalid typed value.
    #[snafu(display("{}: attribute {:?}: {}", context, attribute, source))]
    InvalidAttribute {
        /// Where the attribute was defined.
        context: String,
        /// The attribute key.
        attribute: String,
        /// Underlying value error.
        source: ValueError,
    },

    /// The scenario graph contained a cycle.
    #[snafu(display("scenario must be a DAG (cycle detected)"))]
    CyclicGraph,
}

/// The kind of interaction an edge models.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// A synchronous request: client span on the caller, server span on the callee.
    ClientServer,
    /// A message hand-off: producer span on the caller, consumer span on the callee.
    ProducerConsumer,
    /// A database call: client span on the caller, server span on the database.
    ClientDatabase,
    /// An internal step on the target node.
    Internal,
}

/// A service taking part in the scenario.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Resource attributes stamped on every span the service emits.
    pub resource: BTreeMap<String, TypedValue>,
}

/// A point in the scenario graph where spans originate.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// The service this node belongs to.
    pub service: String,
    /// Span name; defaults to the node id when empty.
    #[serde(default)]
    pub span_name: String,
}

/// A directed interaction between two nodes.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeConfig {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Interaction kind.
    pub kind: EdgeKind,
    /// How many times the interaction repeats.
    pub repeat: u32,
    /// Duration of each interaction in milliseconds.
    pub duration_ms: u64,
    /// Extra attributes stamped on the spans of this edge.
    #[serde(default)]
    pub span_attributes: BTreeMap<String, TypedValue>,
}

/// A complete scenario file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Scenario name, used in diagnostics.
    pub name: String,
    /// Seed for deterministic id derivation.
    #[serde(default)]
    pub seed: i64,
    /// Services by id.
    pub services: BTreeMap<String, ServiceConfig>,
    /// Nodes by id.
    pub nodes: BTreeMap<String, NodeConfig>,
    /// Id of the node every trace starts from.
    pub root: String,
    /// The interactions, walked in file order.
    pub edges: Vec<EdgeConfig>,
}

impl ScenarioConfig {
    /// Loads a scenario from a JSON file and validates it.
    ///
    /// Unknown fields are rejected.
    pub fn load_from_json<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let raw = std::fs::read_to_string(path).context(ReadFile)?;
        Self::decode_json(&raw)
    }

    /// Decodes a scenario from a JSON string and validates it.
    pub fn decode_json(raw: &str) -> Result<Self, ScenarioError> {
        let config: ScenarioConfig = serde_json::from_str(raw).context(ParseFile)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates identifiers, references, numeric bounds, typed values, and
    /// acyclicity.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.name.trim().is_empty() {
            return MissingField { field: "name" }.fail();
        }
        if self.services.is_empty() {
            return MissingField { field: "services" }.fail();
        }
        if self.nodes.is_empty() {
            return MissingField { field: "nodes" }.fail();
        }
        if self.root.trim().is_empty() {
            return MissingField { field: "root" }.fail();
        }
        if !self.nodes.contains_key(&self.root) {
            return UnknownRoot {
                root: self.root.as_str(),
            }
            .fail();
        }
        if self.edges.is_empty() {
            return MissingField { field: "edges" }.fail();
        }

        for (service_id, service) in &self.services {
            for (key, value) in &service.resource {
                value.validate().context(InvalidAttribute {
                    context: format!("service {}", service_id),
                    attribute: key.as_str(),
                })?;
            }
        }

        for (node_id, node) in &self.nodes {
            if node.service.trim().is_empty() {
                return MissingField { field: "node service" }.fail();
            }
            if !self.services.contains_key(&node.service) {
                return UnknownService {
                    node: node_id.as_str(),
                    service: node.service.as_str(),
                }
                .fail();
            }
        }

        for (index, edge) in self.edges.iter().enumerate() {
            if !self.nodes.contains_key(&edge.from) {
                return UnknownNode {
                    index,
                    end: "from",
                    node: edge.from.as_str(),
                }
                .fail();
            }
            if !self.nodes.contains_key(&edge.to) {
                return UnknownNode {
                    index,
                    end: "to",
                    node: edge.to.as_str(),
                }
                .fail();
            }
            if edge.repeat == 0 {
                return InvalidEdgeNumber { index, field: "repeat" }.fail();
            }
            if edge.duration_ms == 0 {
                return InvalidEdgeNumber {
                    index,
                    field: "duration_ms",
                }
                .fail();
            }
            for (key, value) in &edge.span_attributes {
                value.validate().context(InvalidAttribute {
                    context: format!("edge {}", index),
                    attribute: key.as_str(),
                })?;
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm over the node graph; leftover nodes mean a cycle.
    fn check_acyclic(&self) -> Result<(), ScenarioError> {
        let mut indegree: BTreeMap<&str, usize> = self.nodes.keys().map(|id| (id.as_str(), 0)).collect();
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for edge in &self.edges {
            adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
            *indegree.entry(edge.to.as_str()).or_insert(0) += 1;
        }

        let mut queue: Vec<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut visited = 0;
        while let Some(node) = queue.pop() {
            visited += 1;
            for &child in adjacency.get(node).into_iter().flatten() {
                let degree = indegree.get_mut(child).expect("edge target validated above");
                *degree -= 1;
                if *degree == 0 {
                    queue.push(child);
                }
            }
        }

        if visited != self.nodes.len() {
            return CyclicGraph.fail();
        }
        Ok(())
    }
}

/// A service with its resource attributes compiled to model values.
#[derive(Clone, Debug)]
pub struct Service {
    /// Service id.
    pub id: String,
    /// Compiled resource attributes, shared by every span of the service.
    pub resource_attributes: Arc<AttrMap>,
}

/// A compiled node.
#[derive(Clone, Debug)]
pub struct Node {
    /// Node id.
    pub id: String,
    /// Owning service id.
    pub service: String,
    /// Span name; the node id when the config left it empty.
    pub span_name: String,
}

/// A compiled edge.
#[derive(Clone, Debug)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Interaction kind.
    pub kind: EdgeKind,
    /// Repeat count.
    pub repeat: u32,
    /// Interaction duration.
    pub duration: Duration,
    /// Compiled span attributes.
    pub span_attributes: AttrMap,
}

/// A validated, compiled scenario.
#[derive(Clone, Debug)]
pub struct Definition {
    /// Scenario name.
    pub name: String,
    /// Seed for deterministic id derivation.
    pub seed: i64,
    /// Root node id.
    pub root: String,
    /// Services by id.
    pub services: BTreeMap<String, Service>,
    /// Nodes by id.
    pub nodes: BTreeMap<String, Node>,
    /// Edges in file order.
    pub edges: Vec<Edge>,
}

impl ScenarioConfig {
    /// Validates the configuration and compiles it into a [`Definition`].
    pub fn build(&self) -> Result<Definition, ScenarioError> {
        self.validate()?;

        let mut services = BTreeMap::new();
        for (id, service) in &self.services {
            let attributes = compile_attributes(&service.resource, || format!("service {}", id))?;
            services.insert(
                id.clone(),
                Service {
                    id: id.clone(),
                    resource_attributes: Arc::new(attributes),
                },
            );
        }

        let mut nodes = BTreeMap::new();
        for (id, node) in &self.nodes {
            let span_name = if node.span_name.is_empty() {
                id.clone()
            } else {
                node.span_name.clone()
            };
            nodes.insert(
                id.clone(),
                Node {
                    id: id.clone(),
                    service: node.service.clone(),
                    span_name,
                },
            );
        }

        let mut edges = Vec::with_capacity(self.edges.len());
        for (index, edge) in self.edges.iter().enumerate() {
            let span_attributes = compile_attributes(&edge.span_attributes, || format!("edge {}", index))?;
            edges.push(Edge {
                from: edge.from.clone(),
                to: edge.to.clone(),
                kind: edge.kind,
                repeat: edge.repeat,
                duration: Duration::from_millis(edge.duration_ms),
                span_attributes,
            });
        }

        Ok(Definition {
            name: self.name.clone(),
            seed: self.seed,
            root: self.root.clone(),
            services,
            nodes,
            edges,
        })
    }
}

fn compile_attributes(
    values: &BTreeMap<String, TypedValue>,
    describe: impl Fn() -> String,
) -> Result<AttrMap, ScenarioError> {
    let mut out = AttrMap::new();
    for (key, value) in values {
        let compiled = value.to_attr_value().context(InvalidAttribute {
            context: describe(),
            attribute: key.as_str(),
        })?;
        out.insert(key.clone(), compiled);
    }
    Ok(out)
}
