use std::process::Command;
use log::{debug, warn};
use s2v_core::{ModelLoadError, OffloadMode};

/// Peak device memory of a 14B S2V generation with every block resident.
pub const RESIDENT_PEAK_GIB: f64 = 80.0;
/// Peak with blocks staged through host memory between stages.
pub const OFFLOADED_PEAK_GIB: f64 = 40.0;

pub fn required_gib(mode: OffloadMode) -> f64 {
    match mode {
        OffloadMode::Resident => RESIDENT_PEAK_GIB,
        OffloadMode::Offloaded => OFFLOADED_PEAK_GIB,
    }
}

/// An unknown budget passes; the pipeline itself will report OOM.
pub fn check_budget(mode: OffloadMode, available_gib: Option<f64>) -> Result<(), ModelLoadError> {
    let Some(available_gib) = available_gib else {
        warn!("Device memory budget unknown, skipping {} footprint check", mode);
        return Ok(());
    };

    let required_gib = required_gib(mode);
    if available_gib < required_gib {
        return Err(ModelLoadError::InsufficientMemory {
            mode,
            required_gib,
            available_gib,
        });
    }
    Ok(())
}

/// Total memory of the first visible GPU, via `nvidia-smi`.
pub fn probe_device_memory_gib() -> Option<f64> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .map_err(|e| debug!("nvidia-smi unavailable: {}", e))
        .ok()?;

    if !output.status.success() {
        debug!("nvidia-smi exited with {}", output.status);
        return None;
    }
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

fn parse_nvidia_smi(stdout: &str) -> Option<f64> {
    let mib: f64 = stdout.lines().next()?.trim().parse().ok()?;
    Some(mib / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offload_lowers_requirement() {
        assert!(required_gib(OffloadMode::Offloaded) < required_gib(OffloadMode::Resident));
    }

    #[test]
    fn test_budget_check() {
        assert!(check_budget(OffloadMode::Offloaded, Some(48.0)).is_ok());
        assert!(matches!(
            check_budget(OffloadMode::Resident, Some(48.0)),
            Err(ModelLoadError::InsufficientMemory { mode: OffloadMode::Resident, .. })
        ));
        assert!(check_budget(OffloadMode::Offloaded, Some(24.0)).is_err());
        assert!(check_budget(OffloadMode::Resident, None).is_ok());
    }

    #[test]
    fn test_parse_nvidia_smi() {
        assert_eq!(parse_nvidia_smi("81920\n81920\n"), Some(80.0));
        assert_eq!(parse_nvidia_smi("[N/A]\n"), None);
        assert_eq!(parse_nvidia_smi(""), None);
    }
}
