//! Resolution of conditioning media into files the pipeline can open.

use std::path::{Path, PathBuf};
use anyhow::Context;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use image::ImageFormat;
use tracing::{debug, warn};
use uuid::Uuid;
use s2v_core::{GenerationError, JobFailure, MediaSlot, MediaSource, ValidationError};

/// Standard alphabet, padding optional.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 512 << 20;
const DEFAULT_CACHE_MAX_BYTES: u64 = 4 << 30;
const PARTIAL_EXTENSION: &str = "part";

pub struct MediaResolver {
    client: reqwest::Client,
    cache_dir: PathBuf,
    max_download_bytes: u64,
    cache_max_bytes: u64,
}

impl MediaResolver {
    pub fn new(cache_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("failed to create cache directory {}", cache_dir.display()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            cache_dir,
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
        })
    }

    pub fn with_limits(mut self, max_download_bytes: u64, cache_max_bytes: u64) -> Self {
        self.max_download_bytes = max_download_bytes;
        self.cache_max_bytes = cache_max_bytes;
        self
    }

    /// Load, check and write one piece of media into `job_dir`.
    pub async fn resolve(&self, slot: MediaSlot, source: &MediaSource, job_dir: &Path) -> Result<PathBuf, JobFailure> {
        let bytes = self.load(slot, source).await?;
        if bytes.is_empty() {
            return Err(ValidationError::EmptyMedia(slot.label()).into());
        }

        let extension = check_decodable(slot, &bytes)?;
        let path = job_dir.join(format!("{}.{}", stem(slot), extension));

        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| GenerationError::Pipeline(format!("cannot stage {} input: {}", slot.label(), e)))?;

        debug!("Staged {} input ({} bytes) at {}", slot.label(), bytes.len(), path.display());
        Ok(path)
    }

    async fn load(&self, slot: MediaSlot, source: &MediaSource) -> Result<Vec<u8>, ValidationError> {
        match source {
            MediaSource::Inline(data) => decode_inline(slot, data),
            MediaSource::Path(path) => tokio::fs::read(path).await.map_err(|e| ValidationError::Unreachable {
                field: slot.label(),
                reason: format!("{}: {}", path.display(), e),
            }),
            MediaSource::Url(url) => self.fetch(slot, url).await,
        }
    }

    async fn fetch(&self, slot: MediaSlot, url: &str) -> Result<Vec<u8>, ValidationError> {
        let cached = self.cache_path(url);
        if let Ok(bytes) = tokio::fs::read(&cached).await {
            if !bytes.is_empty() {
                debug!("Using cached {} for {}", cached.display(), url);
                return Ok(bytes);
            }
        }

        let unreachable = |reason: String| ValidationError::Unreachable {
            field: slot.label(),
            reason,
        };

        let too_large = || ValidationError::OutOfRange {
            field: slot.label(),
            reason: format!("download exceeds the {} byte limit", self.max_download_bytes),
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| unreachable(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unreachable(format!("HTTP {}", status)));
        }
        if response.content_length().is_some_and(|len| len > self.max_download_bytes) {
            return Err(too_large());
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| unreachable(e.without_url().to_string()))?
        {
            if (bytes.len() + chunk.len()) as u64 > self.max_download_bytes {
                return Err(too_large());
            }
            bytes.extend_from_slice(&chunk);
        }

        if !bytes.is_empty() {
            if let Err(e) = self.store(&cached, &bytes).await {
                warn!("Failed to cache {}: {}", url, e);
            }
        }
        Ok(bytes)
    }

    /// Readers only ever see a complete entry: it is written aside and
    /// renamed into place.
    async fn store(&self, cached: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let partial = cached.with_extension(format!("{}.{}", Uuid::new_v4().simple(), PARTIAL_EXTENSION));
        if let Err(e) = tokio::fs::write(&partial, bytes).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&partial, cached).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        self.prune().await
    }

    /// Drop the oldest entries until the cache fits its budget.
    async fn prune(&self) -> std::io::Result<()> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == PARTIAL_EXTENSION) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                entries.push((meta.modified()?, meta.len(), path));
            }
        }

        let mut total: u64 = entries.iter().map(|(_, len, _)| len).sum();
        if total <= self.cache_max_bytes {
            return Ok(());
        }

        entries.sort_by_key(|(modified, _, _)| *modified);
        for (_, len, path) in entries {
            if total <= self.cache_max_bytes {
                break;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Evicted {} from the media cache", path.display());
                    total -= len;
                }
                Err(e) => warn!("Failed to evict {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    fn cache_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes()).to_string())
    }
}

fn stem(slot: MediaSlot) -> &'static str {
    match slot {
        MediaSlot::Image => "input_image",
        MediaSlot::Audio => "input_audio",
        MediaSlot::PoseVideo => "pose",
    }
}

/// Strip an optional `data:<mime>;base64,` header and decode.
fn decode_inline(slot: MediaSlot, data: &str) -> Result<Vec<u8>, ValidationError> {
    let payload = match data.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, p)| p).unwrap_or(""),
        None => data,
    };
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();

    LENIENT.decode(compact).map_err(|e| ValidationError::UndecodableMedia {
        field: slot.label(),
        reason: format!("invalid base64: {}", e),
    })
}

/// Verify the bytes are media of the expected kind and pick a file extension.
fn check_decodable(slot: MediaSlot, bytes: &[u8]) -> Result<&'static str, ValidationError> {
    let undecodable = |reason: String| ValidationError::UndecodableMedia {
        field: slot.label(),
        reason,
    };

    match slot {
        MediaSlot::Image => {
            let format = image::guess_format(bytes).map_err(|e| undecodable(e.to_string()))?;
            image::load_from_memory_with_format(bytes, format).map_err(|e| undecodable(e.to_string()))?;
            Ok(image_extension(format))
        }
        MediaSlot::Audio => {
            audio_extension(bytes).ok_or_else(|| undecodable("unrecognized audio container".into()))
        }
        MediaSlot::PoseVideo => {
            if is_iso_bmff(bytes) {
                Ok("mp4")
            } else {
                Err(undecodable("expected an MP4 container".into()))
            }
        }
    }
}

fn image_extension(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpg",
        ImageFormat::WebP => "webp",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Gif => "gif",
        ImageFormat::Tiff => "tiff",
        other => other.extensions_str().first().copied().unwrap_or("img"),
    }
}

fn audio_extension(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => Some("wav"),
        [b'I', b'D', b'3', ..] => Some("mp3"),
        [0xFF, second, ..] if second & 0xE0 == 0xE0 => Some("mp3"),
        [b'f', b'L', b'a', b'C', ..] => Some("flac"),
        [b'O', b'g', b'g', b'S', ..] => Some("ogg"),
        _ if is_iso_bmff(bytes) => Some("m4a"),
        _ => None,
    }
}

fn is_iso_bmff(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[4..8] == b"ftyp"
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;
    use axum::Router;
    use axum::routing::get;
    use base64::engine::general_purpose::STANDARD;
    use tokio::net::TcpListener;

    /// Serve `body` at `/speech.wav` on a local port.
    async fn serve_media(body: Vec<u8>) -> String {
        let router = Router::new().route("/speech.wav", get(move || async move { body }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{}/speech.wav", addr)
    }

    fn cache_entries(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect()
    }

    pub(crate) fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([200, 120, 40]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    pub(crate) fn wav_bytes() -> Vec<u8> {
        wav_with_samples(32)
    }

    /// 16-bit mono PCM at 16 kHz.
    pub(crate) fn wav_with_samples(count: usize) -> Vec<u8> {
        let samples = vec![0u8; count * 2];
        let mut out = Vec::with_capacity(44 + samples.len());
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + samples.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&16_000u32.to_le_bytes());
        out.extend_from_slice(&32_000u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(samples.len() as u32).to_le_bytes());
        out.extend_from_slice(&samples);
        out
    }

    #[test]
    fn test_decode_inline_variants() {
        let raw = b"hello media";
        let plain = STANDARD.encode(raw);
        assert_eq!(decode_inline(MediaSlot::Audio, &plain).unwrap(), raw);

        let data_uri = format!("data:audio/wav;base64,{}", plain);
        assert_eq!(decode_inline(MediaSlot::Audio, &data_uri).unwrap(), raw);

        let unpadded = plain.trim_end_matches('=');
        assert_eq!(decode_inline(MediaSlot::Audio, unpadded).unwrap(), raw);

        let wrapped = format!("{}\n{}", &plain[..8], &plain[8..]);
        assert_eq!(decode_inline(MediaSlot::Audio, &wrapped).unwrap(), raw);

        assert!(matches!(
            decode_inline(MediaSlot::Image, "not*base64!"),
            Err(ValidationError::UndecodableMedia { field: "image", .. })
        ));
    }

    #[test]
    fn test_sniff_audio() {
        assert_eq!(audio_extension(&wav_bytes()), Some("wav"));
        assert_eq!(audio_extension(b"ID3\x04\0\0\0\0"), Some("mp3"));
        assert_eq!(audio_extension(&[0xFF, 0xFB, 0x90, 0x00]), Some("mp3"));
        assert_eq!(audio_extension(b"fLaC\0\0\0\x22"), Some("flac"));
        assert_eq!(audio_extension(b"\0\0\0\x20ftypM4A "), Some("m4a"));
        assert_eq!(audio_extension(b"plain text"), None);
    }

    #[test]
    fn test_check_image() {
        assert_eq!(check_decodable(MediaSlot::Image, &png_bytes()).unwrap(), "png");

        let mut truncated = png_bytes();
        truncated.truncate(20);
        assert!(check_decodable(MediaSlot::Image, &truncated).is_err());
        assert!(check_decodable(MediaSlot::Image, &wav_bytes()).is_err());
    }

    #[test]
    fn test_check_pose_video() {
        assert_eq!(check_decodable(MediaSlot::PoseVideo, b"\0\0\0\x18ftypmp42\0\0").unwrap(), "mp4");
        assert!(check_decodable(MediaSlot::PoseVideo, b"GIF89a").is_err());
    }

    #[tokio::test]
    async fn test_resolve_writes_into_job_dir() {
        let cache = tempfile::tempdir().unwrap();
        let job = tempfile::tempdir().unwrap();
        let resolver = MediaResolver::new(cache.path()).unwrap();

        let source = MediaSource::Inline(STANDARD.encode(png_bytes()));
        let path = resolver.resolve(MediaSlot::Image, &source, job.path()).await.unwrap();
        assert_eq!(path, job.path().join("input_image.png"));
        assert_eq!(std::fs::read(&path).unwrap(), png_bytes());
    }

    #[tokio::test]
    async fn test_resolve_rejects_empty_and_missing() {
        let cache = tempfile::tempdir().unwrap();
        let job = tempfile::tempdir().unwrap();
        let resolver = MediaResolver::new(cache.path()).unwrap();

        let empty = resolver
            .resolve(MediaSlot::Audio, &MediaSource::Inline("data:audio/wav;base64,".into()), job.path())
            .await;
        assert!(matches!(empty, Err(JobFailure::Validation(ValidationError::EmptyMedia("audio")))));

        let missing = resolver
            .resolve(MediaSlot::Audio, &MediaSource::Path(job.path().join("nope.wav")), job.path())
            .await;
        assert!(matches!(missing, Err(JobFailure::Validation(ValidationError::Unreachable { .. }))));
    }

    #[tokio::test]
    async fn test_cached_url_is_not_refetched() {
        let cache = tempfile::tempdir().unwrap();
        let job = tempfile::tempdir().unwrap();
        let resolver = MediaResolver::new(cache.path()).unwrap();

        // An unroutable host: only the cache can satisfy this.
        let url = "http://invalid.invalid/speech.wav";
        std::fs::write(resolver.cache_path(url), wav_bytes()).unwrap();

        let path = resolver
            .resolve(MediaSlot::Audio, &MediaSource::Url(url.into()), job.path())
            .await
            .unwrap();
        assert_eq!(path.extension().unwrap(), "wav");
    }

    #[tokio::test]
    async fn test_download_is_cached_whole() {
        let cache = tempfile::tempdir().unwrap();
        let job = tempfile::tempdir().unwrap();
        let resolver = MediaResolver::new(cache.path()).unwrap();
        let url = serve_media(wav_bytes()).await;

        let path = resolver
            .resolve(MediaSlot::Audio, &MediaSource::Url(url.clone()), job.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), wav_bytes());

        assert_eq!(cache_entries(cache.path()), vec![resolver.cache_path(&url)]);
        assert_eq!(std::fs::read(resolver.cache_path(&url)).unwrap(), wav_bytes());
    }

    #[tokio::test]
    async fn test_download_limit() {
        let cache = tempfile::tempdir().unwrap();
        let job = tempfile::tempdir().unwrap();
        let resolver = MediaResolver::new(cache.path()).unwrap().with_limits(1024, 1 << 20);
        let url = serve_media(wav_with_samples(4096)).await;

        let result = resolver.resolve(MediaSlot::Audio, &MediaSource::Url(url), job.path()).await;
        assert!(matches!(
            result,
            Err(JobFailure::Validation(ValidationError::OutOfRange { field: "audio", .. }))
        ));
        assert!(cache_entries(cache.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cache_is_pruned_to_budget() {
        let cache = tempfile::tempdir().unwrap();
        let resolver = MediaResolver::new(cache.path()).unwrap().with_limits(1 << 20, 2500);
        for i in 0..4 {
            std::fs::write(cache.path().join(format!("entry-{}", i)), [0u8; 1000]).unwrap();
        }

        resolver.prune().await.unwrap();
        let remaining = cache_entries(cache.path());
        assert_eq!(remaining.len(), 2);
    }
}
