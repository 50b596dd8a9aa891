use thiserror::Error;

/// Failures of the benchmark domain. Infrastructure failures (spawning,
/// writing files) are reported through `anyhow` instead.
#[derive(Debug, Error)]
pub enum BenchError {
  /// The build step exited non-zero or never reported an artifact.
  #[error("build of {name:?} failed: {reason}")]
  BuildFailed { name: String, reason: String },

  /// A single run iteration produced no usable sample.
  #[error("run iteration of {name:?} dropped: {reason}")]
  RunIterationDropped { name: String, reason: String },

  /// A timing sample names a phase outside the known set.
  #[error("unrecognized phase {0:?}")]
  UnrecognizedPhase(String),

  /// The results document is missing a field or a field has the wrong type.
  #[error("malformed results document: {0}")]
  MalformedDocument(String),

  /// No configuration name matches the requested pattern.
  #[error("no configuration matches {0:?}")]
  ConfigNotFound(String),

  #[error("invalid configuration pattern {pattern:?}")]
  InvalidPattern {
    pattern: String,
    #[source]
    source: regex::Error,
  },
}

impl BenchError {
  pub fn malformed(message: impl Into<String>) -> Self {
    Self::MalformedDocument(message.into())
  }
}
