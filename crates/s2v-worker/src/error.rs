use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("platform request failed: {0}")]
    Platform(#[from] reqwest::Error),
    #[error("platform returned HTTP {status}: {body}")]
    PlatformStatus { status: u16, body: String },
    #[error("model session reported a device fault, restart required")]
    RestartRequired,
}
