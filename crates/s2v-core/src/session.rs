use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use crate::error::GenerationError;
use crate::generation::{Conditioning, GenerationParams, GenerationResult, VideoGenerator};

/// How weights are placed on the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadMode {
    /// All weights stay on the device for the whole generation.
    Resident,
    /// Weight and activation blocks are staged between host and device.
    Offloaded,
}

impl From<bool> for OffloadMode {
    fn from(offload: bool) -> Self {
        if offload { Self::Offloaded } else { Self::Resident }
    }
}

impl fmt::Display for OffloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resident => f.write_str("resident"),
            Self::Offloaded => f.write_str("offloaded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub model: String,
    pub device: String,
    pub offload: OffloadMode,
    pub device_memory_gib: Option<f64>,
}

/// Process-wide handle to the loaded model.
///
/// Created once at startup and passed to the job handler. `generate` is the
/// sole mutator of device state, so calls are serialized behind a fair lock:
/// concurrent callers are admitted one at a time in arrival order.
pub struct ModelSession<G> {
    generator: G,
    info: SessionInfo,
    gate: Mutex<()>,
    healthy: AtomicBool,
    generations: AtomicU64,
}

impl<G: VideoGenerator> ModelSession<G> {
    pub fn new(generator: G) -> Self {
        let info = generator.info();
        Self {
            generator,
            info,
            gate: Mutex::new(()),
            healthy: AtomicBool::new(true),
            generations: AtomicU64::new(0),
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// False once a generation has reported a device fault.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Number of generations that returned a result.
    pub fn generations(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }

    pub async fn generate(
        &self,
        conditioning: &Conditioning,
        params: &GenerationParams,
    ) -> Result<GenerationResult, GenerationError> {
        let _exclusive = self.gate.lock().await;

        if !self.is_healthy() {
            return Err(GenerationError::SessionUnhealthy);
        }

        match self.generator.generate(conditioning, params).await {
            Ok(result) => {
                self.generations.fetch_add(1, Ordering::SeqCst);
                Ok(result)
            }
            Err(e) => {
                if e.is_device_fault() {
                    self.healthy.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }
}
