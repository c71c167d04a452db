//! Exporter implementations and the factory that builds them per worker.

use std::collections::BTreeMap;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use url::Url;

use crate::config::{EndpointConfig, Protocol};
use crate::error::GenericError;
use crate::model::{BatchExporter, ExporterFactory};

pub mod convert;

mod grpc;
pub use self::grpc::GrpcExporter;

mod http;
pub use self::http::HttpExporter;

mod dry_run;
pub use self::dry_run::{DryRunExporterFactory, DryRunOutput};

/// Headers forwarded with every export request.
pub type Headers = BTreeMap<String, String>;

/// Factory for OTLP exporters, one per worker.
#[derive(Clone, Debug)]
pub struct OtlpExporterFactory {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Raw endpoint as configured.
    pub endpoint: String,
    /// Disables TLS when set.
    pub insecure: bool,
    /// Headers forwarded with every request.
    pub headers: Headers,
}

impl OtlpExporterFactory {
    /// Creates a factory from the endpoint section of the run configuration.
    pub fn from_config(config: &EndpointConfig) -> Self {
        OtlpExporterFactory {
            protocol: config.protocol,
            endpoint: config.address.clone(),
            insecure: config.insecure,
            headers: config.headers.clone(),
        }
    }
}

#[async_trait]
impl ExporterFactory for OtlpExporterFactory {
    async fn new_exporter(&self) -> Result<Box<dyn BatchExporter>, GenericError> {
        let (authority, path) = parse_endpoint(&self.endpoint)?;
        match self.protocol {
            Protocol::Grpc => {
                let exporter = GrpcExporter::connect(&authority, self.insecure, &self.headers).await?;
                Ok(Box::new(exporter))
            }
            Protocol::Http => {
                let exporter = HttpExporter::new(&authority, &path, self.insecure, &self.headers)?;
                Ok(Box::new(exporter))
            }
        }
    }
}

/// Splits an endpoint into authority (`host:port`) and path.
///
/// A bare `host:port` passes through unchanged. URL forms accept the
/// `http(s)` and `grpc(s)` schemes; the scheme only drives parsing, security
/// stays explicit via the insecure flag.
pub fn parse_endpoint(raw: &str) -> Result<(String, String), GenericError> {
    if raw.is_empty() {
        bail!("endpoint is required");
    }
    if !raw.contains("://") {
        return Ok((raw.to_string(), String::new()));
    }

    let parsed = Url::parse(raw).with_context(|| format!("invalid endpoint {:?}", raw))?;
    match parsed.scheme() {
        "http" | "https" | "grpc" | "grpcs" => {}
        other => bail!("unsupported scheme {:?}", other),
    }

    let host = match parsed.host_str() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => bail!("endpoint host is required"),
    };
    let authority = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    };

    let path = match parsed.path().trim() {
        "/" => String::new(),
        path => path.to_string(),
    };

    Ok((authority, path))
}
