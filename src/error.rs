//! Error handling primitives.

/// A generic, opaque error.
///
/// Used wherever a component only needs to surface a failure to its caller,
/// with context attached along the way. Validation paths that callers are
/// expected to inspect define their own typed errors instead.
pub type GenericError = anyhow::Error;
