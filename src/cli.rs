//! Command line surface.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::config::{Config, ConfigError, FlexDuration, Protocol};

/// Load generator for OTLP-compatible trace receivers.
#[derive(Clone, Debug, Parser)]
#[command(name = "tercios", version, about)]
pub struct Cli {
    /// Path to a JSON configuration file.
    ///
    /// When given, the endpoint, concurrency, request, and generator flags
    /// below are ignored in favor of the file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// OTLP endpoint (for HTTP, prefer http(s)://host:port/v1/traces).
    #[arg(long, default_value = "localhost:4317")]
    pub endpoint: String,

    /// OTLP protocol: grpc or http.
    #[arg(long, default_value = "grpc")]
    pub protocol: String,

    /// Disable TLS for OTLP exporters.
    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    pub insecure: bool,

    /// Header in `Key=Value` or `Key: Value` form; repeatable.
    #[arg(long = "header", value_name = "KEY=VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Number of concurrent exporters (connections).
    #[arg(long, default_value_t = 1)]
    pub exporters: usize,

    /// Requests per exporter (0 for no request limit).
    #[arg(long = "max-requests", default_value_t = 1)]
    pub max_requests: u64,

    /// Seconds between requests per exporter (0 for no delay).
    #[arg(long = "request-interval", default_value_t = 0.0)]
    pub request_interval: f64,

    /// Seconds to send traces per exporter (0 for no duration limit).
    #[arg(long = "for", default_value_t = 0.0)]
    pub run_for: f64,

    /// Number of distinct service names to emit.
    #[arg(long, default_value_t = 3)]
    pub services: usize,

    /// Maximum span depth per trace.
    #[arg(long = "max-depth", default_value_t = 3)]
    pub max_depth: usize,

    /// Maximum spans per trace.
    #[arg(long = "max-spans", default_value_t = 10)]
    pub max_spans: usize,

    /// Probability (0..1) of spans marked as error.
    #[arg(long = "error-rate", default_value_t = 0.2)]
    pub error_rate: f64,

    /// service.name attribute for spans; empty picks random names.
    #[arg(long = "service-name", default_value = "")]
    pub service_name: String,

    /// Span name to emit; empty synthesizes one per batch.
    #[arg(long = "span-name", default_value = "")]
    pub span_name: String,

    /// Path to a chaos policies JSON file; enables the chaos stage.
    #[arg(long = "chaos-policies-file")]
    pub chaos_policies_file: Option<PathBuf>,

    /// Override the chaos policy seed (0 uses the file's seed).
    #[arg(long = "chaos-seed", default_value_t = 0)]
    pub chaos_seed: i64,

    /// Path to a scenario JSON file; replaces the random generator.
    #[arg(long = "scenario-file")]
    pub scenario_file: Option<PathBuf>,

    /// Generate traces without exporting to OTLP.
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Output format: summary or json (json requires --dry-run).
    #[arg(long, short = 'o', default_value = "summary")]
    pub output: String,
}

impl Cli {
    /// Resolves the run configuration: the config file when given, otherwise
    /// the flags. The result is always validated.
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        if let Some(path) = &self.config {
            return Config::load_from_json(path);
        }

        let mut config = Config::default();
        config.endpoint.address = self.endpoint.clone();
        config.endpoint.protocol = self.protocol.parse::<Protocol>()?;
        config.endpoint.insecure = self.insecure;
        config.endpoint.headers = self.headers.iter().cloned().collect();
        config.concurrency.exporters = self.exporters;
        config.requests.per_exporter = self.max_requests;
        config.requests.interval = FlexDuration(seconds_to_duration(self.request_interval, "request-interval")?);
        config.requests.run_for = FlexDuration(seconds_to_duration(self.run_for, "for")?);
        config.generator.services = self.services;
        config.generator.max_depth = self.max_depth;
        config.generator.max_spans = self.max_spans;
        config.generator.error_rate = self.error_rate;
        config.generator.service_name = self.service_name.clone();
        config.generator.span_name = self.span_name.clone();

        config.validate()?;
        Ok(config)
    }
}

fn seconds_to_duration(seconds: f64, flag: &'static str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(seconds).map_err(|_| ConfigError::InvalidDuration { flag })
}

/// Parses a header flag in `Key=Value` or `Key: Value` form.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .or_else(|| raw.split_once(':'))
        .ok_or_else(|| "header must be in Key=Value or Key: Value form".to_string())?;

    let key = key.trim();
    let value = value.trim();
    if key.is_empty() || value.is_empty() {
        return Err("header must include non-empty key and value".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_forms() {
        assert_eq!(
            parse_header("x-api-key=secret").unwrap(),
            ("x-api-key".to_string(), "secret".to_string())
        );
        assert_eq!(
            parse_header("Authorization: Bearer abc").unwrap(),
            ("Authorization".to_string(), "Bearer abc".to_string())
        );
        assert!(parse_header("no-separator").is_err());
        assert!(parse_header("=value").is_err());
        assert!(parse_header("key=").is_err());
    }

    #[test]
    fn test_flags_build_validated_config() {
        let cli = Cli::parse_from([
            "tercios",
            "--endpoint",
            "collector:4318",
            "--protocol",
            "http",
            "--exporters",
            "4",
            "--max-requests",
            "0",
            "--request-interval",
            "0.5",
            "--header",
            "x-a=1",
            "--header",
            "x-b: 2",
        ]);

        let config = cli.load_config().unwrap();
        assert_eq!(config.endpoint.address, "collector:4318");
        assert_eq!(config.endpoint.protocol, Protocol::Http);
        assert_eq!(config.concurrency.exporters, 4);
        assert_eq!(config.requests.per_exporter, 0);
        assert_eq!(config.requests.interval.0, Duration::from_millis(500));
        assert_eq!(config.endpoint.headers.len(), 2);
        assert_eq!(config.endpoint.headers["x-b"], "2");
    }

    #[test]
    fn test_insecure_defaults_on_and_can_be_disabled() {
        let cli = Cli::parse_from(["tercios"]);
        assert!(cli.insecure);

        let cli = Cli::parse_from(["tercios", "--insecure=false"]);
        assert!(!cli.insecure);
    }

    #[test]
    fn test_invalid_protocol_is_rejected() {
        let cli = Cli::parse_from(["tercios", "--protocol", "quic"]);
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn test_negative_interval_is_rejected() {
        let cli = Cli::parse_from(["tercios", "--request-interval=-1"]);
        assert!(matches!(
            cli.load_config(),
            Err(ConfigError::InvalidDuration { flag: "request-interval" })
        ));
    }
}
