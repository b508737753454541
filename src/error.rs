use std::time::Duration;
use thiserror::Error;

/// Type-erased error returned by caller-supplied fetchers, processors and
/// collaborator traits.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of [`stream_dataset`](crate::streaming::StreamingEngine::stream_dataset).
///
/// A timeout is kept distinct from a batch failure so callers can choose
/// between retrying with a larger budget and giving up.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The whole operation exceeded its wall-clock budget
    #[error("stream '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// Fetching or processing a batch failed; the stream was aborted
    #[error("stream '{operation}' failed at batch {batch}: {source}")]
    Batch {
        operation: String,
        batch: usize,
        #[source]
        source: BoxError,
    },
}

impl StreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Timeout { .. })
    }
}

/// Errors raised while assembling the performance service.
#[derive(Error, Debug)]
pub enum PerfError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
}
