pub mod error;
pub mod generation;
pub mod request;
pub mod resolution;
pub mod response;
pub mod session;

pub use error::{EncodingError, ErrorKind, GenerationError, JobFailure, ModelLoadError, ValidationError};
pub use generation::{Conditioning, GenerationParams, GenerationResult, VideoContainer, VideoGenerator};
pub use request::{JobDefaults, JobRequest, MediaSlot, MediaSource, OutputFormat};
pub use resolution::Resolution;
pub use response::JobResponse;
pub use session::{ModelSession, OffloadMode, SessionInfo};
