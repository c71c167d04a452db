//! OTLP/HTTP exporter.

use anyhow::Context as _;
use async_trait::async_trait;
use prost::Message as _;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tracing::debug;

use super::Headers;
use crate::error::GenericError;
use crate::model::{Batch, BatchExporter};

/// Default OTLP/HTTP traces path, used when the endpoint has none.
const DEFAULT_TRACES_PATH: &str = "/v1/traces";

/// HTTP exporter: protobuf-encoded export requests posted to the endpoint.
pub struct HttpExporter {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl HttpExporter {
    /// Builds an exporter for `authority` (`host:port`) and `path`, with TLS
    /// unless `insecure`.
    pub fn new(authority: &str, path: &str, insecure: bool, headers: &Headers) -> Result<Self, GenericError> {
        let scheme = if insecure { "http" } else { "https" };
        let path = if path.is_empty() { DEFAULT_TRACES_PATH } else { path };
        let url = format!("{}://{}{}", scheme, authority, path);
        debug!(endpoint = %url, "Using OTLP HTTP endpoint.");

        let mut header_map = HeaderMap::with_capacity(headers.len() + 1);
        header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));
        for (key, value) in headers {
            let name: HeaderName = key
                .parse()
                .with_context(|| format!("invalid header name {:?}", key))?;
            let value: HeaderValue = value
                .parse()
                .with_context(|| format!("invalid header value for {:?}", key))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;

        Ok(HttpExporter {
            client,
            url,
            headers: header_map,
        })
    }

    /// The full URL export requests are posted to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BatchExporter for HttpExporter {
    async fn export(&mut self, batch: &Batch) -> Result<(), GenericError> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = super::convert::batch_to_request(batch).encode_to_vec();
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .context("failed to export traces")?;

        response.error_for_status().context("OTLP receiver rejected traces")?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), GenericError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_url_construction() {
        let exporter = HttpExporter::new("collector:4318", "", true, &BTreeMap::new()).unwrap();
        assert_eq!(exporter.url(), "http://collector:4318/v1/traces");

        let exporter = HttpExporter::new("collector:4318", "/custom/traces", false, &BTreeMap::new()).unwrap();
        assert_eq!(exporter.url(), "https://collector:4318/custom/traces");
    }

    #[test]
    fn test_headers_are_validated() {
        let headers = BTreeMap::from([("x-api-key".to_string(), "secret".to_string())]);
        let exporter = HttpExporter::new("collector:4318", "", true, &headers).unwrap();
        assert_eq!(exporter.headers.get("x-api-key").unwrap(), "secret");

        let bad = BTreeMap::from([("bad header".to_string(), "v".to_string())]);
        assert!(HttpExporter::new("collector:4318", "", true, &bad).is_err());
    }
}
