use serde::{Deserialize, Serialize};
use crate::error::{ErrorKind, JobFailure};
use crate::generation::VideoContainer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Exactly one per job: either the encoded video or a structured error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResponse {
    Success {
        video: String,
        format: VideoContainer,
    },
    Failure {
        error: ErrorBody,
    },
}

impl JobResponse {
    pub fn success(video: String, format: VideoContainer) -> Self {
        Self::Success { video, format }
    }

    pub fn failure(failure: &JobFailure) -> Self {
        Self::Failure {
            error: ErrorBody {
                kind: failure.kind(),
                message: failure.user_message(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error } => Some(error.kind),
        }
    }
}

impl From<JobFailure> for JobResponse {
    fn from(failure: JobFailure) -> Self {
        Self::failure(&failure)
    }
}
