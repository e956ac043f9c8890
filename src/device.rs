//! # Compute Device Selection
//!
//! Picks the device the in-process speech model runs on. GPU backends are
//! tried only when asked for (or in `auto` mode) and always fall back to CPU.

use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Cached auto-detected device
static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

/// Device preference from `backend.device`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Best available device
    #[default]
    Auto,
    Cpu,
    /// CUDA GPU, CPU if unavailable
    Cuda,
    /// Metal GPU, CPU if unavailable
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(anyhow::anyhow!("Unknown device preference: {}", s)),
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    /// Resolve a preference to a concrete device.
    pub fn get_device(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => BEST_DEVICE.get_or_init(Self::detect_best_device).clone(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::cuda().unwrap_or(Device::Cpu),
            DevicePreference::Metal => Self::metal().unwrap_or(Device::Cpu),
        }
    }

    /// Resolve a configured device string, falling back to `auto`.
    pub fn from_config(device: &str) -> Device {
        match device.parse::<DevicePreference>() {
            Ok(preference) => Self::get_device(preference),
            Err(_) => {
                warn!("Invalid device preference '{}', using auto", device);
                Self::get_device(DevicePreference::Auto)
            }
        }
    }

    fn detect_best_device() -> Device {
        if let Some(device) = Self::cuda() {
            info!("Selected CUDA GPU for speech model");
            return device;
        }
        if let Some(device) = Self::metal() {
            info!("Selected Metal GPU for speech model");
            return device;
        }
        info!("Using CPU for speech model (no GPU acceleration available)");
        Device::Cpu
    }

    fn cuda() -> Option<Device> {
        Device::new_cuda(0)
            .map_err(|e| debug!("CUDA not available: {}", e))
            .ok()
    }

    fn metal() -> Option<Device> {
        Device::new_metal(0)
            .map_err(|e| debug!("Metal not available: {}", e))
            .ok()
    }

    /// Label for logs and the health endpoint.
    pub fn describe(device: &Device) -> &'static str {
        match device {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
            Device::Metal(_) => "metal",
        }
    }
}
