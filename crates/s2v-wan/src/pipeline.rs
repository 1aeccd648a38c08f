//! Invocation of the external `generate.py` entry point and interpretation
//! of what it leaves behind.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use s2v_core::{Conditioning, GenerationError, GenerationParams, Resolution};

pub const TASK: &str = "s2v-14B";
pub const SCRIPT: &str = "generate.py";
pub const FRAMES_PER_SECOND: u32 = 16;

/// Output sizes the S2V task accepts, width by height.
pub const SUPPORTED_SIZES: &[(u32, u32)] = &[
    (720, 1280),
    (1280, 720),
    (480, 832),
    (832, 480),
    (1024, 704),
    (704, 1024),
    (704, 1280),
    (1280, 704),
];

/// Lines of stderr kept for logs when the pipeline fails.
const STDERR_TAIL_LINES: usize = 20;

pub fn is_supported(resolution: Resolution) -> bool {
    SUPPORTED_SIZES.contains(&(resolution.width, resolution.height))
}

pub fn command_args(
    model_dir: &Path,
    output_dir: &Path,
    conditioning: &Conditioning,
    params: &GenerationParams,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        SCRIPT.into(),
        "--task".into(),
        TASK.into(),
        "--size".into(),
        params.resolution.to_string().into(),
        "--ckpt_dir".into(),
        model_dir.into(),
        "--image".into(),
        conditioning.image.clone().into(),
        "--audio".into(),
        conditioning.audio.clone().into(),
        "--output_dir".into(),
        output_dir.into(),
        "--sample_steps".into(),
        params.steps.to_string().into(),
        "--cfg_scale".into(),
        params.guidance_scale.to_string().into(),
    ];

    if !conditioning.prompt.is_empty() {
        args.extend(["--prompt".into(), conditioning.prompt.clone().into()]);
    }
    if !conditioning.negative_prompt.is_empty() {
        args.extend(["--negative_prompt".into(), conditioning.negative_prompt.clone().into()]);
    }
    if let Some(seed) = params.seed {
        args.extend(["--seed".into(), seed.to_string().into()]);
    }
    if params.offload {
        args.extend(["--offload_model".into(), "True".into()]);
    }
    if let Some(pose) = &conditioning.pose_video {
        args.extend(["--pose_video".into(), pose.clone().into()]);
    }

    args
}

/// Map a failed run onto the generation error taxonomy.
pub fn classify_failure(
    code: Option<i32>,
    signal: Option<i32>,
    stderr: &str,
    resolution: Resolution,
) -> GenerationError {
    let detail = stderr_tail(stderr);
    let lower = stderr.to_lowercase();

    const DEVICE_FAULTS: &[&str] = &[
        "illegal memory access",
        "device-side assert",
        "unspecified launch failure",
        "uncorrectable ecc error",
        "cuda error: misaligned address",
        "cudnn_status_internal_error",
    ];
    const OUT_OF_MEMORY: &[&str] = &["out of memory", "outofmemoryerror", "cuda_error_out_of_memory"];
    const DIVERGENCE: &[&str] = &["contains nan", "nan detected", "nan values", "non-finite", "inf or nan"];

    if DEVICE_FAULTS.iter().any(|p| lower.contains(p)) {
        return GenerationError::DeviceFault(detail);
    }
    if OUT_OF_MEMORY.iter().any(|p| lower.contains(p)) {
        return GenerationError::OutOfMemory(detail);
    }
    if lower.contains("unsupport size") || lower.contains("unsupported size") {
        return GenerationError::UnsupportedResolution(resolution);
    }
    if DIVERGENCE.iter().any(|p| lower.contains(p)) {
        return GenerationError::Diverged(detail);
    }
    // SIGKILL without a Python traceback is the host OOM killer.
    if signal == Some(9) {
        return GenerationError::OutOfMemory(format!("pipeline killed by signal 9\n{}", detail));
    }

    let status = match (code, signal) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "unknown status".to_string(),
    };
    GenerationError::Pipeline(format!("{}\n{}", status, detail))
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// The pipeline names its output itself; take the first `.mp4` it wrote.
pub async fn read_output(output_dir: &Path) -> Result<Vec<u8>, GenerationError> {
    let mut entries = tokio::fs::read_dir(output_dir)
        .await
        .map_err(|e| GenerationError::Pipeline(format!("cannot list output directory: {}", e)))?;

    let mut videos: Vec<PathBuf> = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("mp4")) {
            videos.push(path);
        }
    }
    videos.sort();

    let first = videos.into_iter().next().ok_or(GenerationError::NoOutput)?;
    let bytes = tokio::fs::read(&first)
        .await
        .map_err(|e| GenerationError::Pipeline(format!("cannot read {}: {}", first.display(), e)))?;

    if bytes.is_empty() {
        return Err(GenerationError::NoOutput);
    }
    Ok(bytes)
}

/// Sample rate from a canonical RIFF/WAVE header.
pub fn wav_sample_rate(header: &[u8]) -> Option<u32> {
    if header.len() < 28 || &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" || &header[12..16] != b"fmt " {
        return None;
    }
    Some(u32::from_le_bytes([header[24], header[25], header[26], header[27]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditioning() -> Conditioning {
        Conditioning {
            image: PathBuf::from("/job/input.png"),
            audio: PathBuf::from("/job/input.wav"),
            pose_video: None,
            prompt: "a person talking".into(),
            negative_prompt: String::new(),
        }
    }

    fn params(seed: Option<u64>, offload: bool) -> GenerationParams {
        GenerationParams {
            resolution: Resolution::new(832, 480),
            steps: 30,
            guidance_scale: 5.0,
            seed,
            offload,
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_command_args() {
        let args = strings(command_args(
            Path::new("/models/wan"),
            Path::new("/job/out"),
            &conditioning(),
            &params(Some(0), true),
        ));
        assert_eq!(&args[..3], ["generate.py", "--task", "s2v-14B"]);
        let joined = args.join(" ");
        assert!(joined.contains("--size 832*480"));
        assert!(joined.contains("--sample_steps 30"));
        assert!(joined.contains("--cfg_scale 5"));
        assert!(joined.contains("--seed 0"));
        assert!(joined.contains("--offload_model True"));
        assert!(joined.contains("--prompt a person talking"));
        assert!(!joined.contains("--negative_prompt"));
        assert!(!joined.contains("--pose_video"));
    }

    #[test]
    fn test_no_seed_no_offload() {
        let args = strings(command_args(Path::new("/m"), Path::new("/o"), &conditioning(), &params(None, false)));
        assert!(!args.contains(&"--seed".to_string()));
        assert!(!args.contains(&"--offload_model".to_string()));
    }

    #[test]
    fn test_supported_sizes() {
        assert!(is_supported(Resolution::new(832, 480)));
        assert!(!is_supported(Resolution::new(640, 640)));
    }

    #[test]
    fn test_classify_failure() {
        let res = Resolution::new(832, 480);
        let oom = "Traceback...\ntorch.OutOfMemoryError: CUDA out of memory. Tried to allocate 2.00 GiB";
        assert_eq!(classify_failure(Some(1), None, oom, res).category(), "out_of_memory");

        let fault = "RuntimeError: CUDA error: an illegal memory access was encountered";
        assert!(classify_failure(Some(1), None, fault, res).is_device_fault());

        let size = "AssertionError: Unsupport size 640*640 for task s2v-14B";
        assert_eq!(classify_failure(Some(1), None, size, res), GenerationError::UnsupportedResolution(res));

        let nan = "ValueError: latents contains NaN after step 12";
        assert_eq!(classify_failure(Some(1), None, nan, res).category(), "numerical_divergence");

        assert_eq!(classify_failure(None, Some(9), "", res).category(), "out_of_memory");
        assert_eq!(classify_failure(Some(2), None, "boom", res).category(), "pipeline_failure");
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let stderr: String = (0..100).map(|i| format!("line {}\n", i)).collect();
        let tail = stderr_tail(&stderr);
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
        assert!(tail.ends_with("line 99"));
    }

    #[tokio::test]
    async fn test_read_output() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_output(dir.path()).await, Err(GenerationError::NoOutput));

        std::fs::write(dir.path().join("log.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("s2v-14B_832*480_result.mp4"), b"\0\0\0\x18ftypmp42").unwrap();
        assert_eq!(read_output(dir.path()).await.unwrap(), b"\0\0\0\x18ftypmp42".to_vec());
    }

    #[test]
    fn test_wav_sample_rate() {
        let mut header = Vec::new();
        header.extend_from_slice(b"RIFF");
        header.extend_from_slice(&36u32.to_le_bytes());
        header.extend_from_slice(b"WAVEfmt ");
        header.extend_from_slice(&16u32.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&16_000u32.to_le_bytes());
        assert_eq!(wav_sample_rate(&header), Some(16_000));
        assert_eq!(wav_sample_rate(b"ID3\x03"), None);
    }
}
