//! Run configuration: endpoint, concurrency, request pacing, and generator
//! shape. Loadable from CLI flags or a JSON file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};

/// Errors produced while loading or validating configuration.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[snafu(display("failed to read configuration file: {}", source))]
    ReadFile {
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[snafu(display("failed to parse configuration file: {}", source))]
    ParseFile {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// No endpoint address was given.
    #[snafu(display("endpoint is required"))]
    MissingEndpoint,

    /// The protocol name was not `grpc` or `http`.
    #[snafu(display("unsupported protocol {:?}", protocol))]
    UnsupportedProtocol {
        /// The offending protocol name.
        protocol: String,
    },

    /// The exporter count was zero.
    #[snafu(display("exporters must be > 0"))]
    InvalidExporters,

    /// The service count was zero.
    #[snafu(display("services must be > 0"))]
    InvalidServices,

    /// The maximum span depth was zero.
    #[snafu(display("max depth must be > 0"))]
    InvalidMaxDepth,

    /// The maximum span count was zero.
    #[snafu(display("max spans must be > 0"))]
    InvalidMaxSpans,

    /// The error rate was outside `[0, 1]`.
    #[snafu(display("error rate must be between 0 and 1"))]
    InvalidErrorRate,

    /// A duration flag was negative or not finite.
    #[snafu(display("invalid duration for {}", flag))]
    InvalidDuration {
        /// The flag the duration was given for.
        flag: &'static str,
    },
}

/// OTLP transport protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// OTLP over gRPC.
    #[default]
    Grpc,
    /// OTLP over HTTP.
    Http,
}

impl Protocol {
    /// Returns the lowercase protocol name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Grpc => "grpc",
            Protocol::Http => "http",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grpc" => Ok(Protocol::Grpc),
            "http" => Ok(Protocol::Http),
            _ => UnsupportedProtocol { protocol: s }.fail(),
        }
    }
}

/// A duration that deserializes from either a `"500ms"`-style string or a
/// number of seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlexDuration(pub Duration);

impl<'de> Deserialize<'de> for FlexDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Seconds(f64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => parse_duration(&s).map(FlexDuration).map_err(serde::de::Error::custom),
            Raw::Seconds(v) => Duration::try_from_secs_f64(v)
                .map(FlexDuration)
                .map_err(|_| serde::de::Error::custom(format!("invalid duration {}", v))),
        }
    }
}

/// Parses a duration string like `500ms`, `1.5s`, `2m` or `1h`.
///
/// A bare number is interpreted as seconds; an empty string is zero.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Duration::ZERO);
    }

    let (num_str, unit) = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .map(|i| s.split_at(i))
        .unwrap_or((s, "s"));

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid duration number {:?}", num_str))?;

    let factor = match unit.trim() {
        "ms" => 0.001,
        "s" | "sec" | "secs" | "" => 1.0,
        "m" | "min" | "mins" => 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3600.0,
        _ => return Err(format!("invalid duration unit {:?}", unit)),
    };

    Duration::try_from_secs_f64(num * factor).map_err(|_| format!("invalid duration {:?}", s))
}

/// Where and how to export traces.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    /// Target address: `host:port` for gRPC, `http(s)://host:port/path` for HTTP.
    pub address: String,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Disables TLS when set.
    pub insecure: bool,
    /// Headers forwarded with every export request.
    pub headers: BTreeMap<String, String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            address: "localhost:4317".to_string(),
            protocol: Protocol::Grpc,
            insecure: true,
            headers: BTreeMap::new(),
        }
    }
}

/// Worker concurrency.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Number of concurrent exporters (workers).
    pub exporters: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        ConcurrencyConfig { exporters: 1 }
    }
}

/// Request pacing and bounds, applied per worker.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestConfig {
    /// Requests per worker; zero means unbounded.
    pub per_exporter: u64,
    /// Delay between consecutive requests; zero means no delay.
    pub interval: FlexDuration,
    /// Wall-clock cap on the run; zero means no cap.
    #[serde(rename = "for")]
    pub run_for: FlexDuration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            per_exporter: 1,
            interval: FlexDuration(Duration::ZERO),
            run_for: FlexDuration(Duration::ZERO),
        }
    }
}

/// Shape of generated traces.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneratorConfig {
    /// Number of distinct service names to emit.
    pub services: usize,
    /// Maximum span depth per trace.
    pub max_depth: usize,
    /// Maximum spans per trace.
    pub max_spans: usize,
    /// Probability in `[0, 1]` of spans marked as error.
    pub error_rate: f64,
    /// Base `service.name`; empty picks random names.
    pub service_name: String,
    /// Base span name; empty synthesizes one per batch.
    pub span_name: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            services: 3,
            max_depth: 3,
            max_spans: 10,
            error_rate: 0.2,
            service_name: String::new(),
            span_name: String::new(),
        }
    }
}

/// Complete run configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Export target.
    pub endpoint: EndpointConfig,
    /// Worker concurrency.
    pub concurrency: ConcurrencyConfig,
    /// Request pacing and bounds.
    pub requests: RequestConfig,
    /// Trace shape.
    pub generator: GeneratorConfig,
}

impl Config {
    /// Loads a configuration from a JSON file and validates it.
    ///
    /// Unknown fields are rejected.
    pub fn load_from_json<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).context(ReadFile)?;
        Self::decode_json(&raw)
    }

    /// Decodes a configuration from a JSON string and validates it.
    pub fn decode_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw).context(ParseFile)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.address.is_empty() {
            return MissingEndpoint.fail();
        }
        if self.concurrency.exporters == 0 {
            return InvalidExporters.fail();
        }
        if self.generator.services == 0 {
            return InvalidServices.fail();
        }
        if self.generator.max_depth == 0 {
            return InvalidMaxDepth.fail();
        }
        if self.generator.max_spans == 0 {
            return InvalidMaxSpans.fail();
        }
        if !(0.0..=1.0).contains(&self.generator.error_rate) {
            return InvalidErrorRate.fail();
        }
        Ok(())
    }
}
