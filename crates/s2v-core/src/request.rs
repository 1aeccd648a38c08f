//! Job payload normalization.
//!
//! The platform hands over an untyped JSON mapping. [`JobRequest::from_input`]
//! resolves every recognized key against its constraint and fills the gaps
//! from the process-wide [`JobDefaults`]; unrecognized keys are ignored.

use std::fmt;
use std::path::PathBuf;
use serde_json::{Map, Value};
use crate::error::ValidationError;
use crate::resolution::Resolution;

pub const MAX_STEPS: u32 = 100;
pub const DEFAULT_GUIDANCE_SCALE: f32 = 5.0;
pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, low quality, distorted";

/// Legacy "pick a random seed" value accepted for compatibility.
const RANDOM_SEED_SENTINEL: i128 = -1;

/// Defaults established once at startup from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefaults {
    pub resolution: Resolution,
    pub steps: u32,
    pub offload: bool,
    pub guidance_scale: f32,
    pub negative_prompt: String,
    /// Whether `output_format: "file"` can be honoured.
    pub file_output: bool,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            resolution: Resolution::new(832, 480),
            steps: 30,
            offload: true,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            file_output: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSlot {
    Image,
    Audio,
    PoseVideo,
}

impl MediaSlot {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::PoseVideo => "pose video",
        }
    }

    /// Inline, URL and path keys, in that order.
    fn keys(&self) -> [&'static str; 3] {
        match self {
            Self::Image => ["image_base64", "image_url", "image_path"],
            Self::Audio => ["audio_base64", "audio_url", "audio_path"],
            Self::PoseVideo => ["pose_video_base64", "pose_video_url", "pose_video_path"],
        }
    }
}

/// Where a piece of conditioning media comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// Base64 text, optionally prefixed with a `data:` URI header.
    Inline(String),
    Url(String),
    Path(PathBuf),
}

// Inline payloads run to megabytes; keep them out of logs.
impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(data) => write!(f, "Inline({} chars)", data.len()),
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Base64,
    File,
}

/// A fully normalized job: every field the generation entry point needs is
/// present and within range.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub image: MediaSource,
    pub audio: MediaSource,
    pub pose_video: Option<MediaSource>,
    pub prompt: String,
    pub negative_prompt: String,
    pub resolution: Resolution,
    pub steps: u32,
    pub guidance_scale: f32,
    pub seed: Option<u64>,
    pub offload: bool,
    pub output: OutputFormat,
}

impl JobRequest {
    pub fn from_input(input: &Value, defaults: &JobDefaults) -> Result<Self, ValidationError> {
        let map = input.as_object().ok_or(ValidationError::InputNotObject)?;

        let image = media(map, MediaSlot::Image)?.ok_or(ValidationError::MissingField("image_base64"))?;
        let audio = media(map, MediaSlot::Audio)?.ok_or(ValidationError::MissingField("audio_base64"))?;
        let pose_video = media(map, MediaSlot::PoseVideo)?;

        let prompt = string(map, &["prompt"])?.unwrap_or_default();
        let negative_prompt = string(map, &["negative_prompt"])?
            .unwrap_or_else(|| defaults.negative_prompt.clone());

        let resolution = match lookup(map, &["size", "resolution"]) {
            Some((_, Value::String(s))) => s.parse::<Resolution>()?,
            Some((field, _)) => return Err(ValidationError::WrongType { field, expected: "a \"WIDTHxHEIGHT\" string" }),
            None => defaults.resolution,
        };

        let steps = match integer(map, &["steps"])? {
            Some((field, n)) if n < 1 => {
                return Err(ValidationError::OutOfRange { field, reason: format!("{} is not a positive step count", n) })
            }
            Some((field, n)) if n > MAX_STEPS as i128 => {
                return Err(ValidationError::OutOfRange { field, reason: format!("{} exceeds the limit of {}", n, MAX_STEPS) })
            }
            Some((_, n)) => n as u32,
            None => defaults.steps,
        };

        // Checked after narrowing: the pipeline receives the f32.
        let guidance_scale = match float(map, &["cfg", "guidance_scale"])? {
            Some((field, g)) => {
                let scale = g as f32;
                if !scale.is_finite() || scale <= 0.0 {
                    return Err(ValidationError::OutOfRange { field, reason: format!("{} is not a positive number", g) });
                }
                scale
            }
            None => defaults.guidance_scale,
        };

        // Presence, not truthiness: 0 is a real seed.
        let seed = match integer(map, &["seed"])? {
            Some((_, RANDOM_SEED_SENTINEL)) | None => None,
            Some((field, n)) if n < 0 || n > u64::MAX as i128 => {
                return Err(ValidationError::OutOfRange { field, reason: format!("{} is not a valid seed", n) })
            }
            Some((_, n)) => Some(n as u64),
        };

        let offload = boolean(map, &["offload_model", "offload"])?.unwrap_or(defaults.offload);

        let output = match string(map, &["output_format"])? {
            None => OutputFormat::Base64,
            Some(s) if s.eq_ignore_ascii_case("base64") => OutputFormat::Base64,
            Some(s) if s.eq_ignore_ascii_case("file") => {
                if !defaults.file_output {
                    return Err(ValidationError::StorageUnavailable);
                }
                OutputFormat::File
            }
            Some(_) => {
                return Err(ValidationError::WrongType { field: "output_format", expected: "\"base64\" or \"file\"" })
            }
        };

        Ok(Self {
            image,
            audio,
            pose_video,
            prompt,
            negative_prompt,
            resolution,
            steps,
            guidance_scale,
            seed,
            offload,
            output,
        })
    }
}

/// First present, non-null key among `keys`.
fn lookup<'a>(map: &'a Map<String, Value>, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    keys.iter()
        .find_map(|key| map.get(*key).filter(|v| !v.is_null()).map(|v| (*key, v)))
}

fn string(map: &Map<String, Value>, keys: &[&'static str]) -> Result<Option<String>, ValidationError> {
    match lookup(map, keys) {
        None => Ok(None),
        Some((_, Value::String(s))) => Ok(Some(s.clone())),
        Some((field, _)) => Err(ValidationError::WrongType { field, expected: "a string" }),
    }
}

fn integer(map: &Map<String, Value>, keys: &[&'static str]) -> Result<Option<(&'static str, i128)>, ValidationError> {
    let Some((field, value)) = lookup(map, keys) else {
        return Ok(None);
    };
    let wrong = ValidationError::WrongType { field, expected: "an integer" };

    let n = match value {
        Value::Number(n) => match (n.as_u64(), n.as_i64()) {
            (Some(u), _) => u as i128,
            (None, Some(i)) => i as i128,
            _ => return Err(wrong),
        },
        Value::String(s) => s.trim().parse::<i128>().map_err(|_| wrong)?,
        _ => return Err(wrong),
    };
    Ok(Some((field, n)))
}

fn float(map: &Map<String, Value>, keys: &[&'static str]) -> Result<Option<(&'static str, f64)>, ValidationError> {
    let Some((field, value)) = lookup(map, keys) else {
        return Ok(None);
    };
    let wrong = ValidationError::WrongType { field, expected: "a number" };

    let n = match value {
        Value::Number(n) => n.as_f64().ok_or(wrong)?,
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| wrong)?,
        _ => return Err(wrong),
    };
    Ok(Some((field, n)))
}

fn boolean(map: &Map<String, Value>, keys: &[&'static str]) -> Result<Option<bool>, ValidationError> {
    match lookup(map, keys) {
        None => Ok(None),
        Some((_, Value::Bool(b))) => Ok(Some(*b)),
        Some((_, Value::String(s))) if s.eq_ignore_ascii_case("true") => Ok(Some(true)),
        Some((_, Value::String(s))) if s.eq_ignore_ascii_case("false") => Ok(Some(false)),
        Some((field, _)) => Err(ValidationError::WrongType { field, expected: "a boolean" }),
    }
}

fn media(map: &Map<String, Value>, slot: MediaSlot) -> Result<Option<MediaSource>, ValidationError> {
    let keys = slot.keys();
    let present: Vec<(&'static str, &Value)> = keys
        .iter()
        .filter_map(|key| map.get(*key).filter(|v| !v.is_null()).map(|v| (*key, v)))
        .collect();

    let (field, value) = match present.as_slice() {
        [] => return Ok(None),
        [one] => *one,
        _ => return Err(ValidationError::ConflictingFields(keys.join(", "))),
    };

    let text = value
        .as_str()
        .ok_or(ValidationError::WrongType { field, expected: "a string" })?
        .trim();

    if text.is_empty() {
        return Err(ValidationError::EmptyMedia(slot.label()));
    }

    let source = if field == keys[0] {
        MediaSource::Inline(text.to_string())
    } else if field == keys[1] {
        if !(text.starts_with("http://") || text.starts_with("https://")) {
            return Err(ValidationError::WrongType { field, expected: "an http(s) URL" });
        }
        MediaSource::Url(text.to_string())
    } else {
        MediaSource::Path(PathBuf::from(text))
    };

    Ok(Some(source))
}
