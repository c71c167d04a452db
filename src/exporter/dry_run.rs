//! Dry-run exporters: inspect generated traffic without an OTLP receiver.

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::error::GenericError;
use crate::model::{AttrMap, Batch, BatchExporter, ExporterFactory, Span};

/// Dry-run output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DryRunOutput {
    /// Discard batches; only the final summary is printed.
    #[default]
    Summary,
    /// One JSON record per export call.
    Json,
}

impl DryRunOutput {
    /// Returns the lowercase format name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DryRunOutput::Summary => "summary",
            DryRunOutput::Json => "json",
        }
    }
}

impl fmt::Display for DryRunOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DryRunOutput {
    type Err = GenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "summary" => Ok(DryRunOutput::Summary),
            "json" => Ok(DryRunOutput::Json),
            other => Err(anyhow::anyhow!(
                "unsupported output format {:?} (supported: summary, json)",
                other
            )),
        }
    }
}

/// Shared, lock-guarded writer handed to every JSON exporter the factory
/// builds, so concurrent workers emit whole lines.
type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Factory for dry-run exporters.
pub struct DryRunExporterFactory {
    output: DryRunOutput,
    writer: SharedWriter,
}

impl DryRunExporterFactory {
    /// Creates a factory writing JSON records to the given writer.
    pub fn new(output: DryRunOutput, writer: Box<dyn Write + Send>) -> Self {
        DryRunExporterFactory {
            output,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Creates a factory writing JSON records to stdout.
    pub fn stdout(output: DryRunOutput) -> Self {
        Self::new(output, Box::new(std::io::stdout()))
    }
}

#[async_trait]
impl ExporterFactory for DryRunExporterFactory {
    async fn new_exporter(&self) -> Result<Box<dyn BatchExporter>, GenericError> {
        match self.output {
            DryRunOutput::Summary => Ok(Box::new(NoopExporter)),
            DryRunOutput::Json => Ok(Box::new(JsonExporter {
                writer: Arc::clone(&self.writer),
            })),
        }
    }
}

/// Exporter that discards every batch.
struct NoopExporter;

#[async_trait]
impl BatchExporter for NoopExporter {
    async fn export(&mut self, _batch: &Batch) -> Result<(), GenericError> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), GenericError> {
        Ok(())
    }
}

/// Exporter that serializes one JSON record per export call.
struct JsonExporter {
    writer: SharedWriter,
}

#[async_trait]
impl BatchExporter for JsonExporter {
    async fn export(&mut self, batch: &Batch) -> Result<(), GenericError> {
        if batch.is_empty() {
            return Ok(());
        }

        let payload = JsonBatch {
            spans: batch.iter().map(JsonSpan::from_span).collect(),
        };
        let mut line = serde_json::to_vec(&payload).context("failed to serialize batch")?;
        line.push(b'\n');

        let mut writer = self.writer.lock().unwrap();
        writer.write_all(&line).context("failed to write batch")?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), GenericError> {
        let mut writer = self.writer.lock().unwrap();
        writer.flush().context("failed to flush output")?;
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonBatch<'a> {
    spans: Vec<JsonSpan<'a>>,
}

#[derive(Serialize)]
struct JsonSpan<'a> {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: &'a str,
    kind: &'static str,
    start_time: String,
    end_time: String,
    duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    attributes: Option<&'a AttrMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource: Option<&'a AttrMap>,
    status: JsonStatus<'a>,
}

#[derive(Serialize)]
struct JsonStatus<'a> {
    code: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    message: &'a str,
}

impl<'a> JsonSpan<'a> {
    fn from_span(span: &'a Span) -> Self {
        JsonSpan {
            trace_id: span.trace_id.to_string(),
            span_id: span.span_id.to_string(),
            parent_span_id: span
                .parent_span_id
                .is_valid()
                .then(|| span.parent_span_id.to_string()),
            name: &span.name,
            kind: span.kind.as_str(),
            start_time: format_time(span.start_time),
            end_time: format_time(span.end_time),
            duration_ms: span.duration().as_millis() as i64,
            attributes: (!span.attributes.is_empty()).then_some(&*span.attributes),
            resource: (!span.resource_attributes.is_empty()).then_some(&*span.resource_attributes),
            status: JsonStatus {
                code: span.status.code.as_str(),
                message: &span.status.message,
            },
        }
    }
}

/// RFC 3339 with fixed nanosecond precision, UTC.
fn format_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::generator::TraceGenerator;
    use crate::model::{AttrValue, SpanId, SpanKind, SpanStatus, TraceId};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn fixed_span() -> Span {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        Span {
            trace_id: TraceId([0xab; 16]),
            span_id: SpanId([0xcd; 8]),
            parent_span_id: SpanId::INVALID,
            name: "GET /".to_string(),
            kind: SpanKind::Server,
            start_time: start,
            end_time: start + Duration::from_millis(42),
            attributes: Arc::new(AttrMap::from([(
                "http.response.status_code".to_string(),
                AttrValue::Int(200),
            )])),
            resource_attributes: Arc::new(AttrMap::from([(
                "service.name".to_string(),
                AttrValue::from("svc"),
            )])),
            links: Vec::new(),
            events: Vec::new(),
            status: SpanStatus::ok(),
        }
    }

    #[test]
    fn test_parse_output_format() {
        assert_eq!("summary".parse::<DryRunOutput>().unwrap(), DryRunOutput::Summary);
        assert_eq!("".parse::<DryRunOutput>().unwrap(), DryRunOutput::Summary);
        assert_eq!(" JSON ".parse::<DryRunOutput>().unwrap(), DryRunOutput::Json);
        assert!("yaml".parse::<DryRunOutput>().is_err());
    }

    #[tokio::test]
    async fn test_json_exporter_writes_one_record_per_export() {
        let buffer = SharedBuffer::default();
        let factory = DryRunExporterFactory::new(DryRunOutput::Json, Box::new(buffer.clone()));
        let mut exporter = factory.new_exporter().await.unwrap();

        exporter.export(&vec![fixed_span()]).await.unwrap();
        exporter.export(&vec![fixed_span(), fixed_span()]).await.unwrap();
        exporter.shutdown().await.unwrap();

        let contents = buffer.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        let spans = first["spans"].as_array().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0]["trace_id"], "abababababababababababababababab");
        assert_eq!(spans[0]["span_id"], "cdcdcdcdcdcdcdcd");
        assert_eq!(spans[0]["kind"], "server");
        assert_eq!(spans[0]["duration_ms"], 42);
        assert_eq!(spans[0]["status"]["code"], "ok");
        assert_eq!(spans[0]["attributes"]["http.response.status_code"], 200);
        assert_eq!(spans[0]["resource"]["service.name"], "svc");
        assert!(spans[0].get("parent_span_id").is_none());
        assert!(spans[0]["status"].get("message").is_none());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["spans"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_json_record_matches_generated_batch_shape() {
        let buffer = SharedBuffer::default();
        let factory = DryRunExporterFactory::new(DryRunOutput::Json, Box::new(buffer.clone()));
        let mut exporter = factory.new_exporter().await.unwrap();

        let generator = TraceGenerator {
            service_name: "svc".to_string(),
            span_name: "op".to_string(),
            services: 1,
            max_depth: 1,
            max_spans: 1,
            error_rate: 0.0,
        };
        let batch = generator.generate_batch(&mut rand::rng());
        exporter.export(&batch).await.unwrap();

        let contents = buffer.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);

        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        let spans = record["spans"].as_array().unwrap();
        assert_eq!(spans.len(), 1);
        let trace_id = spans[0]["trace_id"].as_str().unwrap();
        assert_eq!(trace_id.len(), 32);
        assert!(trace_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_timestamps_are_rfc3339_nanos_utc() {
        let buffer = SharedBuffer::default();
        let factory = DryRunExporterFactory::new(DryRunOutput::Json, Box::new(buffer.clone()));
        let mut exporter = factory.new_exporter().await.unwrap();
        exporter.export(&vec![fixed_span()]).await.unwrap();

        let contents = buffer.contents();
        let record: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        let start = record["spans"][0]["start_time"].as_str().unwrap();
        assert_eq!(start, "2023-11-14T22:13:20.000000000Z");
        let end = record["spans"][0]["end_time"].as_str().unwrap();
        assert_eq!(end, "2023-11-14T22:13:20.042000000Z");
    }

    #[tokio::test]
    async fn test_summary_mode_discards_batches() {
        let buffer = SharedBuffer::default();
        let factory = DryRunExporterFactory::new(DryRunOutput::Summary, Box::new(buffer.clone()));
        let mut exporter = factory.new_exporter().await.unwrap();
        exporter.export(&vec![fixed_span()]).await.unwrap();
        exporter.shutdown().await.unwrap();
        assert!(buffer.contents().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_writes_nothing() {
        let buffer = SharedBuffer::default();
        let factory = DryRunExporterFactory::new(DryRunOutput::Json, Box::new(buffer.clone()));
        let mut exporter = factory.new_exporter().await.unwrap();
        exporter.export(&Batch::new()).await.unwrap();
        assert!(buffer.contents().is_empty());
    }
}
