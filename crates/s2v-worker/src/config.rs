use std::env;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context, bail};
use s2v_core::request::{DEFAULT_GUIDANCE_SCALE, DEFAULT_NEGATIVE_PROMPT, MAX_STEPS};
use s2v_core::{JobDefaults, Resolution};
use s2v_wan::WanConfig;

const MEGABYTE: u64 = 1 << 20;

/// Endpoints of the serverless platform's job queue.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// `$ID` is replaced by the pod id.
    pub job_url: String,
    /// `$ID` is replaced by the job id.
    pub output_url: String,
    pub pod_id: String,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub model_dir: PathBuf,
    pub defaults: JobDefaults,
    pub cache_dir: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub repo_dir: PathBuf,
    pub python: PathBuf,
    pub device: String,
    pub device_memory_gib: Option<f64>,
    pub port: u16,
    /// Largest `/runsync` request body.
    pub max_body_bytes: usize,
    /// Largest media download accepted from a URL.
    pub max_download_bytes: u64,
    /// The URL cache is pruned, oldest first, above this size.
    pub cache_max_bytes: u64,
    pub platform: Option<PlatformConfig>,
}

impl WorkerConfig {
    /// Read the process environment, after loading `.env` if one exists.
    pub fn load() -> anyhow::Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(e).context("failed to read .env");
            }
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let resolution: Resolution = var("DEFAULT_SIZE", "832*480")
            .parse()
            .context("DEFAULT_SIZE must look like 832*480")?;
        if !s2v_wan::pipeline::is_supported(resolution) {
            bail!("DEFAULT_SIZE {} is not a size the model supports", resolution);
        }

        let steps: u32 = var("DEFAULT_STEPS", "30")
            .trim()
            .parse()
            .context("DEFAULT_STEPS must be a number")?;
        if steps == 0 || steps > MAX_STEPS {
            bail!("DEFAULT_STEPS must be between 1 and {}, got {}", MAX_STEPS, steps);
        }

        let offload = parse_bool("OFFLOAD_MODEL", &var("OFFLOAD_MODEL", "true"))?;

        let guidance_scale = match lookup("DEFAULT_CFG") {
            Some(raw) => {
                let g: f32 = raw.trim().parse().context("DEFAULT_CFG must be a number")?;
                if !g.is_finite() || g <= 0.0 {
                    bail!("DEFAULT_CFG must be positive, got {}", g);
                }
                g
            }
            None => DEFAULT_GUIDANCE_SCALE,
        };

        let output_dir = lookup("OUTPUT_DIR").filter(|s| !s.trim().is_empty()).map(PathBuf::from);

        let device_memory_gib = match lookup("DEVICE_MEMORY_GB") {
            Some(raw) => Some(raw.trim().parse::<f64>().context("DEVICE_MEMORY_GB must be a number")?),
            None => None,
        };

        let port: u16 = var("PORT", "8000").trim().parse().context("PORT must be a number")?;

        let megabytes = |key: &str, default: &str| -> anyhow::Result<u64> {
            let mb: u64 = var(key, default)
                .trim()
                .parse()
                .with_context(|| format!("{} must be a whole number of megabytes", key))?;
            if mb == 0 {
                bail!("{} must be at least 1", key);
            }
            mb.checked_mul(MEGABYTE).with_context(|| format!("{} is too large", key))
        };
        let max_body_bytes = usize::try_from(megabytes("MAX_BODY_MB", "256")?).context("MAX_BODY_MB is too large")?;
        let max_download_bytes = megabytes("MAX_DOWNLOAD_MB", "512")?;
        let cache_max_bytes = megabytes("CACHE_MAX_MB", "4096")?;

        let platform = match (lookup("RUNPOD_WEBHOOK_GET_JOB"), lookup("RUNPOD_WEBHOOK_POST_OUTPUT")) {
            (Some(job_url), Some(output_url)) => Some(PlatformConfig {
                job_url,
                output_url,
                pod_id: var("RUNPOD_POD_ID", "local"),
                api_key: lookup("RUNPOD_AI_API_KEY"),
                poll_interval: Duration::from_millis(
                    var("POLL_INTERVAL_MS", "1000").trim().parse().context("POLL_INTERVAL_MS must be a number")?,
                ),
            }),
            (None, None) => None,
            _ => bail!("RUNPOD_WEBHOOK_GET_JOB and RUNPOD_WEBHOOK_POST_OUTPUT must be set together"),
        };

        Ok(Self {
            model_dir: PathBuf::from(var("MODEL_DIR", "/models/Wan2.2-S2V-14B")),
            defaults: JobDefaults {
                resolution,
                steps,
                offload,
                guidance_scale,
                negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
                file_output: output_dir.is_some(),
            },
            cache_dir: PathBuf::from(var("CACHE_DIR", "/tmp/s2v-cache")),
            output_dir,
            repo_dir: PathBuf::from(var("WAN_REPO_DIR", "/app")),
            python: PathBuf::from(var("PYTHON_BIN", "python3")),
            device: var("DEVICE", "cuda:0"),
            device_memory_gib,
            port,
            max_body_bytes,
            max_download_bytes,
            cache_max_bytes,
            platform,
        })
    }

    pub fn wan(&self) -> WanConfig {
        WanConfig {
            model_dir: self.model_dir.clone(),
            offload: self.defaults.offload,
            repo_dir: self.repo_dir.clone(),
            python: self.python.clone(),
            device_memory_gib: self.device_memory_gib,
            device: self.device.clone(),
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("{} must be true or false, got '{}'", key, other),
    }
}
