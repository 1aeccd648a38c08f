// crates/s2v-wan/src/weights.rs

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use log::debug;
use serde::Deserialize;
use s2v_core::ModelLoadError;

pub const CONFIG_FILE: &str = "config.json";
pub const DIT_INDEX: &str = "diffusion_pytorch_model.safetensors.index.json";
pub const T5_CHECKPOINT: &str = "models_t5_umt5-xxl-enc-bf16.pth";
pub const VAE_CHECKPOINT: &str = "Wan2.1_VAE.pth";
pub const AUDIO_ENCODER_DIR: &str = "wav2vec2-large-xlsr-53-english";

/// Verified layout of a Wan2.2-S2V-14B checkpoint directory.
#[derive(Debug, Clone)]
pub struct WeightManifest {
    pub shards: Vec<PathBuf>,
    pub total_bytes: u64,
}

impl WeightManifest {
    pub fn total_gib(&self) -> f64 {
        self.total_bytes as f64 / (1u64 << 30) as f64
    }
}

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// Check that every file the pipeline will open is present and plausible.
pub fn verify(model_dir: &Path) -> Result<WeightManifest, ModelLoadError> {
    if !model_dir.is_dir() {
        return Err(ModelLoadError::MissingDirectory(model_dir.to_path_buf()));
    }

    for name in [CONFIG_FILE, T5_CHECKPOINT, VAE_CHECKPOINT] {
        non_empty_file(&model_dir.join(name))?;
    }

    let audio_encoder = model_dir.join(AUDIO_ENCODER_DIR);
    if !audio_encoder.is_dir() {
        return Err(ModelLoadError::MissingWeights(audio_encoder));
    }

    let index_path = model_dir.join(DIT_INDEX);
    let raw = std::fs::read_to_string(&index_path)
        .map_err(|_| ModelLoadError::MissingWeights(index_path.clone()))?;
    let index: ShardIndex = serde_json::from_str(&raw).map_err(|e| ModelLoadError::CorruptWeights {
        path: index_path.clone(),
        reason: e.to_string(),
    })?;

    let names: BTreeSet<&String> = index.weight_map.values().collect();
    if names.is_empty() {
        return Err(ModelLoadError::CorruptWeights {
            path: index_path,
            reason: "shard index lists no tensors".into(),
        });
    }

    let mut shards = Vec::with_capacity(names.len());
    let mut total_bytes = 0;
    for name in names {
        if !is_plain_file_name(name) {
            return Err(ModelLoadError::CorruptWeights {
                path: index_path,
                reason: format!("shard name '{}' is not a file in the checkpoint directory", name),
            });
        }
        let shard = model_dir.join(name);
        let len = non_empty_file(&shard)?;
        check_safetensors_header(&shard, len)?;
        debug!("Verified shard {} ({} bytes)", shard.display(), len);
        total_bytes += len;
        shards.push(shard);
    }

    debug!("Verified {} diffusion shards in {}", shards.len(), model_dir.display());

    Ok(WeightManifest {
        shards,
        total_bytes,
    })
}

/// A single normal path component, so joining it stays inside the directory.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

fn non_empty_file(path: &Path) -> Result<u64, ModelLoadError> {
    let meta = std::fs::metadata(path).map_err(|_| ModelLoadError::MissingWeights(path.to_path_buf()))?;
    if !meta.is_file() {
        return Err(ModelLoadError::MissingWeights(path.to_path_buf()));
    }
    if meta.len() == 0 {
        return Err(ModelLoadError::CorruptWeights {
            path: path.to_path_buf(),
            reason: "file is empty".into(),
        });
    }
    Ok(meta.len())
}

/// A safetensors file starts with a little-endian u64 header length that
/// must fit inside the file.
fn check_safetensors_header(path: &Path, len: u64) -> Result<(), ModelLoadError> {
    let corrupt = |reason: String| ModelLoadError::CorruptWeights {
        path: path.to_path_buf(),
        reason,
    };

    let mut prefix = [0u8; 8];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut prefix))
        .map_err(|e| corrupt(format!("unreadable header: {}", e)))?;

    let header_len = u64::from_le_bytes(prefix);
    if header_len == 0 || header_len > len.saturating_sub(8) {
        return Err(corrupt(format!("header length {} does not fit in {} bytes", header_len, len)));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    /// Lay out a minimal checkpoint directory with `shards` diffusion shards.
    pub(crate) fn fake_checkpoint(dir: &Path, shards: usize) {
        fs::write(dir.join(CONFIG_FILE), b"{\"dim\": 5120}").unwrap();
        fs::write(dir.join(T5_CHECKPOINT), b"t5").unwrap();
        fs::write(dir.join(VAE_CHECKPOINT), b"vae").unwrap();
        fs::create_dir(dir.join(AUDIO_ENCODER_DIR)).unwrap();

        let mut weight_map = serde_json::Map::new();
        for i in 0..shards {
            let name = format!("diffusion_pytorch_model-{:05}-of-{:05}.safetensors", i + 1, shards);
            let header = b"{}";
            let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
            bytes.extend_from_slice(header);
            bytes.extend_from_slice(&[0u8; 16]);
            fs::write(dir.join(&name), bytes).unwrap();
            weight_map.insert(format!("blocks.{}.weight", i), name.into());
        }
        let index = serde_json::json!({ "metadata": { "total_size": 0 }, "weight_map": weight_map });
        fs::write(dir.join(DIT_INDEX), index.to_string()).unwrap();
    }

    #[test]
    fn test_verify_complete_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        fake_checkpoint(dir.path(), 3);
        let manifest = verify(dir.path()).unwrap();
        assert_eq!(manifest.shards.len(), 3);
        assert!(manifest.total_bytes > 0);
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(verify(&missing), Err(ModelLoadError::MissingDirectory(_))));
    }

    #[test]
    fn test_missing_shard() {
        let dir = tempfile::tempdir().unwrap();
        fake_checkpoint(dir.path(), 2);
        fs::remove_file(dir.path().join("diffusion_pytorch_model-00002-of-00002.safetensors")).unwrap();
        assert!(matches!(verify(dir.path()), Err(ModelLoadError::MissingWeights(p)) if p.ends_with("diffusion_pytorch_model-00002-of-00002.safetensors")));
    }

    #[test]
    fn test_truncated_shard_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fake_checkpoint(dir.path(), 1);
        fs::write(dir.path().join("diffusion_pytorch_model-00001-of-00001.safetensors"), u64::MAX.to_le_bytes()).unwrap();
        assert!(matches!(verify(dir.path()), Err(ModelLoadError::CorruptWeights { .. })));
    }

    #[test]
    fn test_unparseable_index_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fake_checkpoint(dir.path(), 1);
        fs::write(dir.path().join(DIT_INDEX), b"{ not json").unwrap();
        assert!(matches!(verify(dir.path()), Err(ModelLoadError::CorruptWeights { .. })));
    }

    #[test]
    fn test_shard_names_stay_inside_checkpoint() {
        for name in ["../outside.safetensors", "/etc/passwd", "sub/dir.safetensors", "..", ""] {
            let dir = tempfile::tempdir().unwrap();
            fake_checkpoint(dir.path(), 1);
            let index = serde_json::json!({ "weight_map": { "blocks.0.weight": name } });
            fs::write(dir.path().join(DIT_INDEX), index.to_string()).unwrap();
            assert!(
                matches!(verify(dir.path()), Err(ModelLoadError::CorruptWeights { ref path, .. }) if path.ends_with(DIT_INDEX)),
                "shard name {:?} should be refused",
                name
            );
        }
    }

    #[test]
    fn test_missing_audio_encoder() {
        let dir = tempfile::tempdir().unwrap();
        fake_checkpoint(dir.path(), 1);
        fs::remove_dir(dir.path().join(AUDIO_ENCODER_DIR)).unwrap();
        assert!(matches!(verify(dir.path()), Err(ModelLoadError::MissingWeights(_))));
    }
}
