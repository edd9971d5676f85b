//! Pipeline-cache persistence
//!
//! The cache blob lives in `{cache_path}/pipelineCache.dat`. It seeds the
//! `VkPipelineCache` at construction and is written back at teardown only
//! when its content actually changed.

use std::path::Path;

use ash::vk;

use crate::error::{VulkanError, VulkanResult};
use crate::logging::{LogLevel, LogSink};

const CACHE_FILE: &str = "pipelineCache.dat";

/// Read the stored blob; missing or unreadable files yield an empty seed.
pub(crate) fn load_cache_data(cache_path: &Path) -> Vec<u8> {
    std::fs::read(cache_path.join(CACHE_FILE)).unwrap_or_default()
}

/// Write `data` only when it differs from the stored blob. Returns whether a
/// write happened.
pub(crate) fn save_if_changed(cache_path: &Path, data: &[u8]) -> bool {
    let file = cache_path.join(CACHE_FILE);
    if let Ok(previous) = std::fs::read(&file) {
        if previous == data {
            return false;
        }
    }
    std::fs::write(&file, data).is_ok()
}

/// Create the pipeline cache, seeded from disk when a cache path is set.
pub(crate) fn create_pipeline_cache(
    device: &ash::Device,
    cache_path: Option<&Path>,
) -> VulkanResult<vk::PipelineCache> {
    let seed = cache_path.map(load_cache_data).unwrap_or_default();
    let info = vk::PipelineCacheCreateInfo::builder().initial_data(&seed);
    unsafe {
        device
            .create_pipeline_cache(&info, None)
            .map_err(VulkanError::Api)
    }
}

/// Fetch the current blob and persist it with rewrite-on-change semantics.
pub(crate) fn persist_pipeline_cache(
    device: &ash::Device,
    cache: vk::PipelineCache,
    cache_path: &Path,
    sink: &LogSink,
) {
    let data = match unsafe { device.get_pipeline_cache_data(cache) } {
        Ok(data) => data,
        Err(_) => {
            sink.put("Failed to fetch the pipelineCache content", LogLevel::Warning);
            return;
        }
    };
    if save_if_changed(cache_path, &data) {
        sink.put("Changes detected in the pipelineCache, store them", LogLevel::Debug);
    } else {
        sink.put("No changes in the pipelineCache", LogLevel::Debug);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("entity_core_cache_{tag}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_missing_cache_loads_empty() {
        let dir = temp_dir("missing");
        std::fs::remove_file(dir.join(CACHE_FILE)).ok();
        assert!(load_cache_data(&dir).is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_rewrite_only_on_change() {
        let dir = temp_dir("rewrite");
        std::fs::remove_file(dir.join(CACHE_FILE)).ok();
        assert!(save_if_changed(&dir, b"blob-v1"));
        assert_eq!(load_cache_data(&dir), b"blob-v1");
        // Identical content: no write
        assert!(!save_if_changed(&dir, b"blob-v1"));
        // Changed content: rewritten
        assert!(save_if_changed(&dir, b"blob-v2"));
        assert_eq!(load_cache_data(&dir), b"blob-v2");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let dir = temp_dir("roundtrip");
        std::fs::remove_file(dir.join(CACHE_FILE)).ok();
        let blob: Vec<u8> = (0..=255).collect();
        save_if_changed(&dir, &blob);
        assert_eq!(load_cache_data(&dir), blob);
        assert!(!save_if_changed(&dir, &blob));
        std::fs::remove_dir_all(&dir).ok();
    }
}
