use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use s2v_core::JobFailure;

/// A job as routed by the platform: an id plus an untyped input mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub input: Value,
}

/// Platforms differ on whether job ids are strings or integers.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(Value::Number(id)) => Ok(Some(id.to_string())),
        Some(other) => Err(de::Error::custom(format!("job id must be a string or number, got {}", other))),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Received,
    Validating,
    Generating,
    Encoding,
    Completed,
    Rejected,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }

    /// Terminal state a failure ends the job in.
    pub fn for_failure(failure: &JobFailure) -> Self {
        match failure {
            JobFailure::Validation(_) => Self::Rejected,
            _ => Self::Failed,
        }
    }
}
