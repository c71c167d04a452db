//! Core data model: spans, batches, attribute values, and the exporter
//! contract the pipeline drives.

use async_trait::async_trait;

use crate::error::GenericError;

mod span;
pub use self::span::{AttrMap, Batch, Event, Link, Span, SpanId, SpanKind, SpanStatus, StatusCode, TraceId};

mod value;
pub use self::value::{AttrValue, TypedValue, ValueError};

/// A sink for span batches.
///
/// Implementations may hold network connections; each worker owns exactly one
/// exporter, created through an [`ExporterFactory`] when the worker starts and
/// shut down when it exits.
#[async_trait]
pub trait BatchExporter: Send {
    /// Exports one batch. An error ends the owning worker.
    async fn export(&mut self, batch: &Batch) -> Result<(), GenericError>;

    /// Releases any resources held by the exporter.
    async fn shutdown(&mut self) -> Result<(), GenericError>;
}

/// Builds per-worker batch exporters.
#[async_trait]
pub trait ExporterFactory: Send + Sync {
    /// Creates a new exporter instance.
    async fn new_exporter(&self) -> Result<Box<dyn BatchExporter>, GenericError>;
}
