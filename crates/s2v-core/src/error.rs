use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::resolution::Resolution;
use crate::session::OffloadMode;

/// Wire names of the four failure classes a job can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    ModelLoadError,
    GenerationError,
    EncodingError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "ValidationError",
            Self::ModelLoadError => "ModelLoadError",
            Self::GenerationError => "GenerationError",
            Self::EncodingError => "EncodingError",
        }
    }
}

/// Malformed, missing or out-of-range input. Never reaches the model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid request: {0}")]
    MalformedPayload(String),
    #[error("invalid request: 'input' must be a JSON object")]
    InputNotObject,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("field '{field}' must be {expected}")]
    WrongType { field: &'static str, expected: &'static str },
    #[error("field '{field}' is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
    #[error("invalid resolution '{0}': expected WIDTHxHEIGHT with two positive integers")]
    Resolution(String),
    #[error("only one of {0} may be supplied")]
    ConflictingFields(String),
    #[error("{0} input is empty")]
    EmptyMedia(&'static str),
    #[error("{field} input could not be decoded: {reason}")]
    UndecodableMedia { field: &'static str, reason: String },
    #[error("{field} input could not be fetched: {reason}")]
    Unreachable { field: &'static str, reason: String },
    #[error("output_format 'file' is not available on this worker")]
    StorageUnavailable,
}

/// Startup-time failure. Fatal: no job can be served.
#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("model directory not found: {0}")]
    MissingDirectory(PathBuf),
    #[error("missing model weights: {0}")]
    MissingWeights(PathBuf),
    #[error("corrupt model weights at {path}: {reason}")]
    CorruptWeights { path: PathBuf, reason: String },
    #[error("insufficient device memory for {mode} execution: {required_gib:.1} GiB required, {available_gib:.1} GiB available")]
    InsufficientMemory {
        mode: OffloadMode,
        required_gib: f64,
        available_gib: f64,
    },
    #[error("pipeline runtime unavailable: {0}")]
    Runtime(String),
}

/// Model invocation failure. The detail strings may carry pipeline output
/// and are only ever logged, see [`GenerationError::user_message`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("device out of memory: {0}")]
    OutOfMemory(String),
    #[error("unsupported resolution {0}")]
    UnsupportedResolution(Resolution),
    #[error("sampling diverged: {0}")]
    Diverged(String),
    #[error("device fault: {0}")]
    DeviceFault(String),
    #[error("pipeline failed: {0}")]
    Pipeline(String),
    #[error("pipeline produced no video")]
    NoOutput,
    #[error("model session is unhealthy and awaiting restart")]
    SessionUnhealthy,
}

impl GenerationError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::OutOfMemory(_) => "out_of_memory",
            Self::UnsupportedResolution(_) => "unsupported_resolution",
            Self::Diverged(_) => "numerical_divergence",
            Self::DeviceFault(_) => "device_fault",
            Self::Pipeline(_) => "pipeline_failure",
            Self::NoOutput => "no_output",
            Self::SessionUnhealthy => "session_unhealthy",
        }
    }

    /// A device fault leaves accelerator state undefined; the replica
    /// should be restarted rather than serve further jobs.
    pub fn is_device_fault(&self) -> bool {
        matches!(self, Self::DeviceFault(_))
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::OutOfMemory(_) => "generation failed (out_of_memory): device ran out of memory".into(),
            Self::UnsupportedResolution(res) => {
                format!("generation failed (unsupported_resolution): {} is not supported by the model", res)
            }
            Self::Diverged(_) => "generation failed (numerical_divergence): sampling produced invalid values".into(),
            Self::DeviceFault(_) => "generation failed (device_fault): accelerator error, worker will restart".into(),
            Self::Pipeline(_) => "generation failed (pipeline_failure): the model pipeline exited with an error".into(),
            Self::NoOutput => "generation failed (no_output): the model pipeline produced no video".into(),
            Self::SessionUnhealthy => "generation failed (session_unhealthy): worker is restarting".into(),
        }
    }
}

/// Post-generation serialization failure.
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("generated video is empty")]
    EmptyVideo,
    #[error("failed to store output video: {0}")]
    Storage(#[from] std::io::Error),
}

impl EncodingError {
    pub fn user_message(&self) -> String {
        match self {
            Self::EmptyVideo => "encoding failed: generated video is empty".into(),
            Self::Storage(_) => "encoding failed: could not store output video".into(),
        }
    }
}

/// Terminal failure of a single job.
#[derive(Error, Debug)]
pub enum JobFailure {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl JobFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::ModelLoad(_) => ErrorKind::ModelLoadError,
            Self::Generation(_) => ErrorKind::GenerationError,
            Self::Encoding(_) => ErrorKind::EncodingError,
        }
    }

    /// Message safe to return to the caller.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(e) => e.to_string(),
            Self::ModelLoad(_) => "model is not loaded on this worker".into(),
            Self::Generation(e) => e.user_message(),
            Self::Encoding(e) => e.user_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::ValidationError.as_str(), "ValidationError");
        assert_eq!(ErrorKind::EncodingError.as_str(), "EncodingError");
    }

    #[test]
    fn test_generation_message_hides_pipeline_output() {
        let err = JobFailure::from(GenerationError::Pipeline(
            "Traceback (most recent call last):\n  File \"generate.py\"".into(),
        ));
        assert_eq!(err.kind(), ErrorKind::GenerationError);
        let msg = err.user_message();
        assert!(msg.contains("pipeline_failure"));
        assert!(!msg.contains("Traceback"));
    }

    #[test]
    fn test_only_device_fault_is_fatal() {
        assert!(GenerationError::DeviceFault("illegal memory access".into()).is_device_fault());
        assert!(!GenerationError::OutOfMemory("CUDA out of memory".into()).is_device_fault());
    }

    #[test]
    fn test_encoding_message_hides_io_detail() {
        let io = std::io::Error::new(std::io::ErrorKind::StorageFull, "/mnt/out: no space left");
        let err = JobFailure::from(EncodingError::from(io));
        assert_eq!(err.kind(), ErrorKind::EncodingError);
        assert!(!err.user_message().contains("/mnt/out"));
    }
}
