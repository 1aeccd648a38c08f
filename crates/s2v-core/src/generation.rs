use std::path::PathBuf;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::GenerationError;
use crate::resolution::Resolution;
use crate::session::SessionInfo;

/// Reference image plus audio track (and optional pose video) that steer
/// generation. Media are materialized on disk for the duration of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Conditioning {
    pub image: PathBuf,
    pub audio: PathBuf,
    pub pose_video: Option<PathBuf>,
    pub prompt: String,
    pub negative_prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub resolution: Resolution,
    pub steps: u32,
    pub guidance_scale: f32,
    /// `None` means nondeterministic sampling.
    pub seed: Option<u64>,
    pub offload: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoContainer {
    Mp4,
}

impl VideoContainer {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
        }
    }
}

/// Raw output of one generation. Lives only until it is encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// Complete container bytes (video frames muxed with the driving audio).
    pub video: Vec<u8>,
    pub container: VideoContainer,
    pub frames_per_second: u32,
    pub audio_sample_rate: Option<u32>,
    pub elapsed: Duration,
}

/// The black-box model capability.
///
/// Implementations may assume they are never entered concurrently;
/// [`crate::ModelSession`] enforces that.
#[async_trait]
pub trait VideoGenerator: Send + Sync {
    fn info(&self) -> SessionInfo;

    async fn generate(
        &self,
        conditioning: &Conditioning,
        params: &GenerationParams,
    ) -> Result<GenerationResult, GenerationError>;
}
