// crates/s2v-wan/src/lib.rs

//! Wan2.2-S2V-14B backend.
//!
//! The diffusion model is an external program: this crate checks that its
//! checkpoint and device budget can support it, then runs one `generate.py`
//! process per generation and turns the outcome into a
//! [`GenerationResult`] or a classified [`GenerationError`].

pub mod memory;
pub mod pipeline;
pub mod weights;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;
use s2v_core::{
    Conditioning, GenerationError, GenerationParams, GenerationResult, ModelLoadError, OffloadMode, SessionInfo,
    VideoContainer, VideoGenerator,
};

pub const MODEL_NAME: &str = "Wan2.2-S2V-14B";

#[derive(Debug, Clone)]
pub struct WanConfig {
    /// Checkpoint directory (`--ckpt_dir`).
    pub model_dir: PathBuf,
    /// Default placement policy for the session.
    pub offload: bool,
    /// Checkout of the Wan2.2 repository containing `generate.py`.
    pub repo_dir: PathBuf,
    pub python: PathBuf,
    /// Overrides the `nvidia-smi` probe.
    pub device_memory_gib: Option<f64>,
    pub device: String,
}

pub struct WanS2v {
    config: WanConfig,
    device_memory_gib: Option<f64>,
}

impl WanS2v {
    /// Verify weights, runtime and device budget. Any failure here is fatal
    /// for the process.
    pub fn initialize(config: WanConfig) -> Result<Self, ModelLoadError> {
        info!("Loading {} from {}", MODEL_NAME, config.model_dir.display());

        let manifest = weights::verify(&config.model_dir)?;

        let script = config.repo_dir.join(pipeline::SCRIPT);
        if !script.is_file() {
            return Err(ModelLoadError::Runtime(format!("{} not found", script.display())));
        }

        let device_memory_gib = config.device_memory_gib.or_else(memory::probe_device_memory_gib);
        let mode = OffloadMode::from(config.offload);
        memory::check_budget(mode, device_memory_gib)?;

        info!(
            "{} ready on {} ({} weights, {} shards, {:.1} GiB on disk, device {})",
            MODEL_NAME,
            config.device,
            mode,
            manifest.shards.len(),
            manifest.total_gib(),
            match device_memory_gib {
                Some(gib) => format!("{:.1} GiB", gib),
                None => "memory unknown".to_string(),
            }
        );

        Ok(Self {
            config,
            device_memory_gib,
        })
    }
}

#[async_trait]
impl VideoGenerator for WanS2v {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            model: MODEL_NAME.to_string(),
            device: self.config.device.clone(),
            offload: OffloadMode::from(self.config.offload),
            device_memory_gib: self.device_memory_gib,
        }
    }

    async fn generate(
        &self,
        conditioning: &Conditioning,
        params: &GenerationParams,
    ) -> Result<GenerationResult, GenerationError> {
        if !pipeline::is_supported(params.resolution) {
            return Err(GenerationError::UnsupportedResolution(params.resolution));
        }

        // Offload disabled on a device too small for resident weights is
        // refused outright rather than silently falling back.
        if !params.offload {
            memory::check_budget(OffloadMode::Resident, self.device_memory_gib)
                .map_err(|e| GenerationError::OutOfMemory(e.to_string()))?;
        }

        let output_dir = tempfile::Builder::new()
            .prefix("s2v-out-")
            .tempdir()
            .map_err(|e| GenerationError::Pipeline(format!("cannot create output directory: {}", e)))?;

        let args = pipeline::command_args(&self.config.model_dir, output_dir.path(), conditioning, params);
        info!(
            "Running {} at {} for {} steps (seed {:?}, offload {})",
            pipeline::TASK, params.resolution, params.steps, params.seed, params.offload
        );

        let started = Instant::now();
        let output = Command::new(&self.config.python)
            .args(&args)
            .current_dir(&self.config.repo_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| GenerationError::Pipeline(format!("failed to launch {}: {}", self.config.python.display(), e)))?;
        let elapsed = started.elapsed();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let error = pipeline::classify_failure(output.status.code(), exit_signal(&output.status), &stderr, params.resolution);
            warn!("{} failed after {:.1}s: {}", pipeline::TASK, elapsed.as_secs_f64(), error);
            return Err(error);
        }
        debug!("{} stdout:\n{}", pipeline::TASK, String::from_utf8_lossy(&output.stdout));

        let video = pipeline::read_output(output_dir.path()).await?;
        let audio_sample_rate = read_header(&conditioning.audio).await.and_then(|h| pipeline::wav_sample_rate(&h));

        info!("Generated {} bytes of video in {:.1}s", video.len(), elapsed.as_secs_f64());

        Ok(GenerationResult {
            video,
            container: VideoContainer::Mp4,
            frames_per_second: pipeline::FRAMES_PER_SECOND,
            audio_sample_rate,
            elapsed,
        })
    }
}

async fn read_header(path: &std::path::Path) -> Option<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let file = tokio::fs::File::open(path).await.ok()?;
    let mut header = Vec::with_capacity(64);
    file.take(64).read_to_end(&mut header).await.ok()?;
    Some(header)
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
