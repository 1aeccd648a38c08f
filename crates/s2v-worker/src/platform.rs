//! Serverless platform worker loop.
//!
//! Pulls one job at a time from the platform's job endpoint, runs it and
//! posts the response back. Jobs are therefore processed strictly in the
//! order the platform hands them out.

use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tracing::{error, info, warn};
use s2v_core::{JobResponse, VideoGenerator};
use crate::config::PlatformConfig;
use crate::error::WorkerError;
use crate::handler::JobHandler;
use crate::job::JobEnvelope;

const POST_ATTEMPTS: u32 = 3;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct OutputBody<'a> {
    output: &'a JobResponse,
}

pub struct PlatformClient {
    http: reqwest::Client,
    config: PlatformConfig,
}

impl PlatformClient {
    pub fn new(config: PlatformConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn job_url(&self) -> String {
        self.config.job_url.replace("$ID", &self.config.pod_id)
    }

    fn output_url(&self, job_id: &str) -> String {
        self.config.output_url.replace("$ID", job_id)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header(reqwest::header::AUTHORIZATION, key),
            None => request,
        }
    }

    /// `None` when the queue is empty.
    pub async fn next_job(&self) -> Result<Option<JobEnvelope>, WorkerError> {
        let response = self.authorized(self.http.get(self.job_url())).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::PlatformStatus { status: status.as_u16(), body });
        }

        let body = response.bytes().await?;
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }
        match serde_json::from_slice::<JobEnvelope>(&body) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                warn!("Discarding malformed job payload: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn post_output(&self, job_id: &str, response: &JobResponse) -> Result<(), WorkerError> {
        let request = self
            .http
            .post(self.output_url(job_id))
            .json(&OutputBody { output: response });
        let reply = self.authorized(request).send().await?;

        let status = reply.status();
        if !status.is_success() {
            let body = reply.text().await.unwrap_or_default();
            return Err(WorkerError::PlatformStatus { status: status.as_u16(), body });
        }
        Ok(())
    }
}

/// Run until shutdown is requested or the session needs a restart.
pub async fn run<G: VideoGenerator>(handler: Arc<JobHandler<G>>, config: PlatformConfig) -> anyhow::Result<()> {
    let poll_interval = config.poll_interval;
    let client = PlatformClient::new(config);
    let mut backoff = poll_interval;

    info!("Polling {} for jobs", client.job_url());

    loop {
        let next = tokio::select! {
            next = client.next_job() => next,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, leaving job loop");
                return Ok(());
            }
        };

        let job = match next {
            Ok(Some(job)) => {
                backoff = poll_interval;
                job
            }
            Ok(None) => {
                tokio::time::sleep(poll_interval).await;
                continue;
            }
            Err(e) => {
                warn!("Failed to fetch job: {} (retrying in {:?})", e, backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        let Some(job_id) = job.id.clone() else {
            warn!("Platform delivered a job without an id, skipping");
            continue;
        };

        let response = handler.handle(job).await;
        deliver(&client, &job_id, &response).await;

        if !handler.session().is_healthy() {
            error!("Device state is no longer trusted, exiting for restart");
            return Err(WorkerError::RestartRequired.into());
        }
    }
}

async fn deliver(client: &PlatformClient, job_id: &str, response: &JobResponse) {
    for attempt in 1..=POST_ATTEMPTS {
        match client.post_output(job_id, response).await {
            Ok(()) => return,
            Err(e) if attempt < POST_ATTEMPTS => {
                warn!("Posting output for {} failed (attempt {}): {}", job_id, attempt, e);
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
            Err(e) => error!("Giving up on output for {}: {}", job_id, e),
        }
    }
}
