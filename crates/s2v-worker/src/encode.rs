use std::path::PathBuf;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use tracing::info;
use s2v_core::{EncodingError, GenerationResult, OutputFormat};

/// Serializes a generation result into the response transport.
pub struct OutputEncoder {
    output_dir: Option<PathBuf>,
}

impl OutputEncoder {
    pub fn new(output_dir: Option<PathBuf>) -> Self {
        Self { output_dir }
    }

    pub async fn encode(
        &self,
        job_id: &str,
        result: &GenerationResult,
        format: OutputFormat,
    ) -> Result<String, EncodingError> {
        if result.video.is_empty() {
            return Err(EncodingError::EmptyVideo);
        }

        match format {
            OutputFormat::Base64 => Ok(STANDARD.encode(&result.video)),
            OutputFormat::File => {
                let root = self.output_dir.as_ref().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no output directory configured")
                })?;

                let dir = root.join(Utc::now().format("%Y%m%d").to_string());
                tokio::fs::create_dir_all(&dir).await?;

                let path = dir.join(format!("{}.{}", file_stem(job_id), result.container.extension()));
                tokio::fs::write(&path, &result.video).await?;

                info!("Stored {} bytes at {}", result.video.len(), path.display());
                Ok(path.display().to_string())
            }
        }
    }
}

/// Job ids come from the platform; keep them from escaping the directory.
fn file_stem(job_id: &str) -> String {
    let stem: String = job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() { "job".to_string() } else { stem }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use s2v_core::VideoContainer;

    fn result(video: Vec<u8>) -> GenerationResult {
        GenerationResult {
            video,
            container: VideoContainer::Mp4,
            frames_per_second: 16,
            audio_sample_rate: Some(16_000),
            elapsed: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_base64() {
        let encoder = OutputEncoder::new(None);
        let encoded = encoder.encode("job-1", &result(b"mp4!".to_vec()), OutputFormat::Base64).await.unwrap();
        assert_eq!(encoded, "bXA0IQ==");
    }

    #[tokio::test]
    async fn test_empty_video() {
        let encoder = OutputEncoder::new(None);
        let err = encoder.encode("job-1", &result(Vec::new()), OutputFormat::Base64).await.unwrap_err();
        assert!(matches!(err, EncodingError::EmptyVideo));
    }

    #[tokio::test]
    async fn test_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = OutputEncoder::new(Some(dir.path().to_path_buf()));
        let stored = encoder.encode("../../etc/x", &result(b"mp4!".to_vec()), OutputFormat::File).await.unwrap();

        let path = PathBuf::from(&stored);
        assert!(path.starts_with(dir.path()));
        assert_eq!(path.file_name().unwrap(), "______etc_x.mp4");
        assert_eq!(std::fs::read(path).unwrap(), b"mp4!");
    }

    #[tokio::test]
    async fn test_file_output_without_directory() {
        let encoder = OutputEncoder::new(None);
        let err = encoder.encode("job-1", &result(b"mp4!".to_vec()), OutputFormat::File).await.unwrap_err();
        assert!(matches!(err, EncodingError::Storage(_)));
    }
}
