//! The per-job entry point.
//!
//! Received -> Validating -> Generating -> Encoding -> Completed, with
//! Rejected (bad input) and Failed (generation or encoding) as the other
//! terminal states. Every path yields exactly one [`JobResponse`].

use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;
use s2v_core::{
    Conditioning, GenerationError, GenerationParams, JobDefaults, JobFailure, JobRequest, JobResponse, MediaSlot,
    ModelSession, VideoGenerator,
};
use crate::encode::OutputEncoder;
use crate::job::{JobEnvelope, JobState};
use crate::media::MediaResolver;

pub struct JobHandler<G> {
    session: Arc<ModelSession<G>>,
    defaults: JobDefaults,
    media: MediaResolver,
    encoder: OutputEncoder,
}

impl<G: VideoGenerator> JobHandler<G> {
    pub fn new(session: Arc<ModelSession<G>>, defaults: JobDefaults, media: MediaResolver, encoder: OutputEncoder) -> Self {
        Self {
            session,
            defaults,
            media,
            encoder,
        }
    }

    pub fn session(&self) -> &Arc<ModelSession<G>> {
        &self.session
    }

    pub async fn handle(&self, job: JobEnvelope) -> JobResponse {
        let id = job.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!("job", id = %id);

        async {
            info!(state = ?JobState::Received, "Job received");
            match self.run(&id, &job.input).await {
                Ok(response) => {
                    info!(state = ?JobState::Completed, "Job completed");
                    response
                }
                Err(failure) => {
                    let state = JobState::for_failure(&failure);
                    debug_assert!(state.is_terminal());
                    match &failure {
                        JobFailure::Validation(e) => warn!(state = ?state, "Job rejected: {}", e),
                        other => error!(state = ?state, kind = other.kind().as_str(), "Job failed: {}", other),
                    }
                    JobResponse::from(failure)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, id: &str, input: &serde_json::Value) -> Result<JobResponse, JobFailure> {
        info!(state = ?JobState::Validating, "Validating input");
        let request = JobRequest::from_input(input, &self.defaults)?;

        // Removed when the job ends, whichever way it ends.
        let job_dir = tempfile::Builder::new()
            .prefix("s2v-job-")
            .tempdir()
            .map_err(|e| GenerationError::Pipeline(format!("cannot create job directory: {}", e)))?;

        let conditioning = self.stage(&request, job_dir.path()).await?;
        let params = GenerationParams {
            resolution: request.resolution,
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            seed: request.seed,
            offload: request.offload,
        };

        info!(
            state = ?JobState::Generating,
            resolution = %params.resolution,
            steps = params.steps,
            seed = ?params.seed,
            "Generating"
        );
        let result = self.session.generate(&conditioning, &params).await?;

        info!(
            state = ?JobState::Encoding,
            bytes = result.video.len(),
            fps = result.frames_per_second,
            audio_sample_rate = ?result.audio_sample_rate,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Encoding output"
        );
        let video = self.encoder.encode(id, &result, request.output).await?;

        Ok(JobResponse::success(video, result.container))
    }

    async fn stage(&self, request: &JobRequest, job_dir: &std::path::Path) -> Result<Conditioning, JobFailure> {
        let image = self.media.resolve(MediaSlot::Image, &request.image, job_dir).await?;
        let audio = self.media.resolve(MediaSlot::Audio, &request.audio, job_dir).await?;
        let pose_video = match &request.pose_video {
            Some(source) => Some(self.media.resolve(MediaSlot::PoseVideo, source, job_dir).await?),
            None => None,
        };

        Ok(Conditioning {
            image,
            audio,
            pose_video,
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
        })
    }
}
