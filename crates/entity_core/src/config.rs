//! Context configuration
//!
//! [`ContextSettings`] is the plain-data half and can be loaded from a TOML
//! file; [`ContextCreateInfo`] adds the fields that cannot be serialized
//! (window handles, feature chains, callbacks).

use std::path::{Path, PathBuf};

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use serde::{Deserialize, Serialize};

use crate::context::features::FeatureSet;
use crate::context::queues::QueueRequirement;
use crate::logging::{LogLevel, LogRedirect};

/// Threshold below which `chunk_size` is read as MiB rather than bytes.
pub const CHUNK_SIZE_BYTE_THRESHOLD: u64 = 256 * 1024;

/// Serializable subset of the context configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Application name passed to instance creation
    pub application_name: String,
    /// Application version passed to instance creation
    pub application_version: u32,
    /// Minimum Vulkan API version as (major, minor); lower devices are rejected
    pub vulkan_version: (u32, u32),
    /// Initial surface width
    pub width: i32,
    /// Initial surface height; negative flips the viewport Y axis
    pub height: i32,
    /// Queues wanted per role
    pub queue_request: QueueRequirement,
    /// Directory holding `pipelineCache.dat`; none disables persistence
    pub cache_path: Option<PathBuf>,
    /// Directory holding the text log; none disables the file sink
    pub log_path: Option<PathBuf>,
    /// Allocator chunk size; values below 256 KiB are MiB, larger are bytes
    pub chunk_size: u64,
    /// Number of independent allocator batches; 0 keeps a single batch
    pub memory_batch_count: u32,
    /// 0 selects min+1 swap-chain images, anything else forces the exact count
    pub force_swapchain_count: u32,
    /// Enable the validation layer and debug messenger
    pub enable_debug_layers: bool,
    /// Print log entries to the console sink
    pub draw_logs: bool,
    /// Persist log entries to `{log_path}/EntityCore-logs.txt`
    pub save_logs: bool,
    /// Prefer an integrated GPU over a discrete one
    pub prefer_integrated: bool,
    /// Pick an sRGB swap-chain format instead of a linear one
    pub color_space_srgb: bool,
    /// Minimum severity printed to the console
    pub min_log_print_level: LogLevel,
    /// Minimum severity written to the log file
    pub min_log_write_level: LogLevel,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            application_name: String::new(),
            application_version: 1,
            vulkan_version: (1, 1),
            width: 600,
            height: 600,
            queue_request: QueueRequirement::default(),
            cache_path: None,
            log_path: None,
            chunk_size: 64,
            memory_batch_count: 0,
            force_swapchain_count: 0,
            enable_debug_layers: true,
            draw_logs: true,
            save_logs: false,
            prefer_integrated: false,
            color_space_srgb: false,
            min_log_print_level: LogLevel::Info,
            min_log_write_level: LogLevel::Info,
        }
    }
}

impl ContextSettings {
    /// Load the settings from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse {}: {e}", path.display()))
    }

    /// Allocator chunk size in bytes, applying the MiB/bytes rule.
    pub fn chunk_size_bytes(&self) -> u64 {
        if self.chunk_size < CHUNK_SIZE_BYTE_THRESHOLD {
            self.chunk_size * 1024 * 1024
        } else {
            self.chunk_size
        }
    }

    /// Encoded Vulkan API version for instance creation.
    pub fn api_version(&self) -> u32 {
        vk::make_api_version(0, self.vulkan_version.0, self.vulkan_version.1, 0)
    }
}

/// Display/window handle pair of an externally managed window.
#[derive(Clone, Copy)]
pub struct WindowHandles {
    /// Display side of the window
    pub display: RawDisplayHandle,
    /// Window side
    pub window: RawWindowHandle,
}

/// Complete context configuration.
pub struct ContextCreateInfo {
    /// Plain-data settings
    pub settings: ContextSettings,
    /// Window to present to; `None` runs headless and adds `TRANSFER_SRC`
    /// to the swap-chain usage
    pub window: Option<WindowHandles>,
    /// Features whose absence aborts initialization
    pub required_features: FeatureSet,
    /// Features enabled when supported, skipped otherwise
    pub preferred_features: FeatureSet,
    /// Device extensions whose absence disqualifies a physical device
    pub required_extensions: Vec<std::ffi::CString>,
    /// Usage flags OR'd with `COLOR_ATTACHMENT` for the swap-chain images
    pub swapchain_usage: vk::ImageUsageFlags,
    /// Present mode used when the surface supports it; FIFO otherwise
    pub preferred_present_mode: vk::PresentModeKHR,
    /// Diverts all log output to the application
    pub redirect_log: Option<LogRedirect>,
    /// Invoked when the allocator detects the device heap running low
    pub custom_release_memory: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Default for ContextCreateInfo {
    fn default() -> Self {
        Self {
            settings: ContextSettings::default(),
            window: None,
            required_features: FeatureSet::default(),
            preferred_features: FeatureSet::default(),
            required_extensions: Vec::new(),
            swapchain_usage: vk::ImageUsageFlags::empty(),
            preferred_present_mode: vk::PresentModeKHR::FIFO,
            redirect_log: None,
            custom_release_memory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_mib_rule() {
        let mut settings = ContextSettings::default();
        settings.chunk_size = 64;
        assert_eq!(settings.chunk_size_bytes(), 64 * 1024 * 1024);
        settings.chunk_size = 4;
        assert_eq!(settings.chunk_size_bytes(), 4 * 1024 * 1024);
        // At or above 256 KiB the value is taken as bytes
        settings.chunk_size = 256 * 1024;
        assert_eq!(settings.chunk_size_bytes(), 256 * 1024);
        settings.chunk_size = 8 * 1024 * 1024;
        assert_eq!(settings.chunk_size_bytes(), 8 * 1024 * 1024);
    }

    #[test]
    fn test_settings_toml_round_trip() {
        let mut settings = ContextSettings::default();
        settings.application_name = "demo".into();
        settings.queue_request.dedicated_compute = 2;
        settings.save_logs = true;
        settings.min_log_write_level = LogLevel::Debug;
        let text = toml::to_string(&settings).unwrap();
        let back: ContextSettings = toml::from_str(&text).unwrap();
        assert_eq!(back.application_name, "demo");
        assert_eq!(back.queue_request.dedicated_compute, 2);
        assert!(back.save_logs);
        assert_eq!(back.min_log_write_level, LogLevel::Debug);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let back: ContextSettings = toml::from_str("width = 1920\nheight = -1080\n").unwrap();
        assert_eq!(back.width, 1920);
        assert_eq!(back.height, -1080);
        assert_eq!(back.chunk_size, 64);
        assert!(back.enable_debug_layers);
    }
}
