//! OTLP/gRPC exporter.

use anyhow::Context as _;
use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use tonic::metadata::{Ascii, MetadataKey, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig};
use tracing::debug;

use super::Headers;
use crate::error::GenericError;
use crate::model::{Batch, BatchExporter};

/// gRPC exporter: one HTTP/2 channel per worker, headers forwarded as
/// request metadata.
pub struct GrpcExporter {
    client: TraceServiceClient<Channel>,
    metadata: Vec<(MetadataKey<Ascii>, MetadataValue<Ascii>)>,
}

impl GrpcExporter {
    /// Connects to `authority` (`host:port`), with TLS unless `insecure`.
    pub async fn connect(authority: &str, insecure: bool, headers: &Headers) -> Result<Self, GenericError> {
        let scheme = if insecure { "http" } else { "https" };
        let uri = format!("{}://{}", scheme, authority);
        debug!(endpoint = %uri, "Connecting to OTLP gRPC endpoint.");

        let mut endpoint = Channel::from_shared(uri.clone()).with_context(|| format!("invalid endpoint {:?}", uri))?;
        if !insecure {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .context("failed to configure TLS")?;
        }

        let channel = endpoint
            .connect()
            .await
            .context("failed to connect to OTLP endpoint")?;

        let mut metadata = Vec::with_capacity(headers.len());
        for (key, value) in headers {
            let key: MetadataKey<Ascii> = key
                .parse()
                .with_context(|| format!("invalid header name {:?}", key))?;
            let value: MetadataValue<Ascii> = value
                .parse()
                .with_context(|| format!("invalid header value for {:?}", key))?;
            metadata.push((key, value));
        }

        Ok(GrpcExporter {
            client: TraceServiceClient::new(channel),
            metadata,
        })
    }
}

#[async_trait]
impl BatchExporter for GrpcExporter {
    async fn export(&mut self, batch: &Batch) -> Result<(), GenericError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut request = tonic::Request::new(super::convert::batch_to_request(batch));
        for (key, value) in &self.metadata {
            request.metadata_mut().insert(key.clone(), value.clone());
        }

        self.client
            .export(request)
            .await
            .context("failed to export traces")?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), GenericError> {
        // Dropping the channel tears the connection down.
        Ok(())
    }
}
