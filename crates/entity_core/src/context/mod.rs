//! Device context
//!
//! [`VulkanContext`] is the process-wide root every other object borrows
//! from: instance, physical device, logical device, carved queue families,
//! optional swap-chain, persistent pipeline cache, sampler cache, memory
//! allocator and log sink. It is created once at start-up and must outlive
//! every resource built on top of it, which holding it behind an `Arc`
//! enforces naturally.

pub mod features;
pub mod instance;
pub mod pipeline_cache;
pub mod queues;
pub mod swapchain;

use std::ffi::CString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ash::extensions::khr;
use ash::vk;

use crate::config::ContextCreateInfo;
use crate::error::{fatal, VulkanError, VulkanResult};
use crate::logging::{LogLevel, LogSink};
use crate::memory::{MemoryAllocator, SubMemory, NO_BATCH};

use features::FeatureSet;
use instance::{DebugFn, InstanceCore};
use queues::{FamilyCapability, QueueFamily, QueueType};
use swapchain::{AcquireOutcome, SwapchainCore, ViewportState, ALL_IMAGE_VIEW_USAGE};

static CONTEXT_LIVE: AtomicBool = AtomicBool::new(false);

/// Comparable subset of `VkSamplerCreateInfo` used as the sampler-cache key;
/// the byte-wise comparison of the original create info minus the chain
/// pointer the cache never populates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SamplerKey {
    flags: vk::SamplerCreateFlags,
    mag_filter: vk::Filter,
    min_filter: vk::Filter,
    mipmap_mode: vk::SamplerMipmapMode,
    address_mode_u: vk::SamplerAddressMode,
    address_mode_v: vk::SamplerAddressMode,
    address_mode_w: vk::SamplerAddressMode,
    mip_lod_bias: f32,
    anisotropy_enable: vk::Bool32,
    max_anisotropy: f32,
    compare_enable: vk::Bool32,
    compare_op: vk::CompareOp,
    min_lod: f32,
    max_lod: f32,
    border_color: vk::BorderColor,
    unnormalized_coordinates: vk::Bool32,
}

impl From<&vk::SamplerCreateInfo> for SamplerKey {
    fn from(info: &vk::SamplerCreateInfo) -> Self {
        Self {
            flags: info.flags,
            mag_filter: info.mag_filter,
            min_filter: info.min_filter,
            mipmap_mode: info.mipmap_mode,
            address_mode_u: info.address_mode_u,
            address_mode_v: info.address_mode_v,
            address_mode_w: info.address_mode_w,
            mip_lod_bias: info.mip_lod_bias,
            anisotropy_enable: info.anisotropy_enable,
            max_anisotropy: info.max_anisotropy,
            compare_enable: info.compare_enable,
            compare_op: info.compare_op,
            min_lod: info.min_lod,
            max_lod: info.max_lod,
            border_color: info.border_color,
            unnormalized_coordinates: info.unnormalized_coordinates,
        }
    }
}

struct ScreenState {
    core: Option<SwapchainCore>,
    extent: vk::Extent2D,
    viewport: ViewportState,
    with_views: bool,
}

/// Process-wide Vulkan root object.
pub struct VulkanContext {
    sink: Arc<LogSink>,
    physical_device: vk::PhysicalDevice,
    device_properties: vk::PhysicalDeviceProperties,
    device: ash::Device,
    surface: vk::SurfaceKHR,
    surface_loader: Option<khr::Surface>,
    sync2: Option<khr::Synchronization2>,
    push_descriptor: Option<khr::PushDescriptor>,
    enabled_features: FeatureSet,
    queues: Mutex<Vec<QueueFamily>>,
    screen: Mutex<ScreenState>,
    samplers: Mutex<Vec<(SamplerKey, vk::Sampler)>>,
    allocator: Option<MemoryAllocator>,
    pipeline_cache: vk::PipelineCache,
    cache_path: Option<PathBuf>,
    // Dropped after the explicit teardown in `Drop::drop`
    instance_core: InstanceCore,
}

impl VulkanContext {
    /// Build the context. Unrecoverable problems (no suitable GPU, missing
    /// required feature, device creation failure) log at ERROR and terminate
    /// the process after letting the sink flush.
    pub fn new(mut create_info: ContextCreateInfo) -> Arc<Self> {
        assert!(
            !CONTEXT_LIVE.swap(true, Ordering::AcqRel),
            "only one VulkanContext may live per process"
        );
        let settings = &create_info.settings;
        if let Some(path) = &settings.cache_path {
            let _ = std::fs::create_dir_all(path);
        }
        if let Some(path) = &settings.log_path {
            let _ = std::fs::create_dir_all(path);
        }
        let sink = Arc::new(LogSink::new(
            settings.draw_logs,
            settings.save_logs,
            settings
                .log_path
                .as_deref()
                .unwrap_or_else(|| std::path::Path::new(".")),
            settings.min_log_print_level,
            settings.min_log_write_level,
            create_info.redirect_log.take(),
        ));

        let presenting = create_info.window.is_some();
        let instance_core = match InstanceCore::new(settings, create_info.window.as_ref(), &sink) {
            Ok(core) => core,
            Err(e) => {
                sink.put(&format!("Instance creation failed: {e}"), LogLevel::Error);
                fatal("Failed to initialize Vulkan");
            }
        };
        let instance = &instance_core.instance;

        let (surface, surface_loader) = if let Some(window) = &create_info.window {
            let loader = khr::Surface::new(&instance_core.entry, instance);
            let surface = match unsafe {
                ash_window::create_surface(
                    &instance_core.entry,
                    instance,
                    window.display,
                    window.window,
                    None,
                )
            } {
                Ok(surface) => surface,
                Err(e) => {
                    sink.put(&format!("Surface creation failed: {e:?}"), LogLevel::Error);
                    fatal("Failed to create window surface");
                }
            };
            (surface, Some(loader))
        } else {
            (vk::SurfaceKHR::null(), None)
        };

        // Swap-chain support is mandatory only when presenting
        let mut device_extensions: Vec<CString> = create_info.required_extensions.clone();
        if presenting {
            device_extensions.push(khr::Swapchain::name().to_owned());
        }

        sink.put("Reading GPU(s) properties", LogLevel::Info);
        let physical_device = match instance::select_physical_device(
            instance,
            surface_loader.as_ref().map(|l| (l, surface)),
            &device_extensions,
            settings.prefer_integrated,
            settings.api_version(),
        ) {
            Some(device) => device,
            None => {
                sink.put("No valid GPU detected", LogLevel::Error);
                fatal("No GPU match requirements");
            }
        };
        sink.put("GPU selected", LogLevel::Info);
        let device_properties = unsafe { instance.get_physical_device_properties(physical_device) };
        instance::log_physical_device_info(&sink, &device_properties);
        let probe = instance::probe_device_extensions(instance, physical_device);

        // Queue carving
        let family_props =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let capabilities: Vec<FamilyCapability> = family_props
            .iter()
            .enumerate()
            .map(|(i, props)| {
                let present = surface_loader.as_ref().map_or(false, |loader| unsafe {
                    loader
                        .get_physical_device_surface_support(physical_device, i as u32, surface)
                        .unwrap_or(false)
                });
                FamilyCapability::from_properties(props, present)
            })
            .collect();
        let families = queues::carve_families(&capabilities, &settings.queue_request);
        let priorities = [0.0f32; 16];
        let queue_infos = queues::queue_create_infos(&families, &priorities);

        // Feature negotiation
        let supported = features::query_supported(
            instance,
            physical_device,
            &{
                let mut requested = create_info.preferred_features;
                requested.merge(&create_info.required_features);
                requested
            },
        );
        let (enabled_features, requirement_met) = features::negotiate(
            &create_info.preferred_features,
            &create_info.required_features,
            &supported,
        );
        {
            let mut requested = create_info.preferred_features;
            requested.merge(&create_info.required_features);
            features::log_feature_report(
                &sink,
                &enabled_features,
                &requested,
                &create_info.required_features,
            );
        }
        if !requirement_met {
            sink.put("One or more mandatory feature is not available", LogLevel::Error);
            fatal("Required device feature unavailable");
        }

        // Synchronization2 rides its own feature struct
        let mut sync2_features = vk::PhysicalDeviceSynchronization2Features::default();
        let can_sync2 = if probe.synchronization2 {
            let mut query = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut sync2_features)
                .build();
            unsafe { instance.get_physical_device_features2(physical_device, &mut query) };
            sync2_features.p_next = std::ptr::null_mut();
            sync2_features.synchronization2 == vk::TRUE
        } else {
            false
        };
        if can_sync2 {
            device_extensions.push(khr::Synchronization2::name().to_owned());
        }

        // Device creation
        let extension_ptrs: Vec<*const i8> = device_extensions.iter().map(|e| e.as_ptr()).collect();
        let mut enabled = enabled_features;
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().features(enabled.core);
        if let Some(v11) = enabled.vulkan11.as_mut() {
            features2 = features2.push_next(v11);
        }
        if let Some(v12) = enabled.vulkan12.as_mut() {
            features2 = features2.push_next(v12);
        }
        if let Some(v13) = enabled.vulkan13.as_mut() {
            features2 = features2.push_next(v13);
        }
        if can_sync2 {
            features2 = features2.push_next(&mut sync2_features);
        }
        let mut features2 = features2.build();
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features2);
        let device = match unsafe { instance.create_device(physical_device, &device_info, None) } {
            Ok(device) => device,
            Err(e) => {
                sink.put(&format!("Device creation failed: {e:?}"), LogLevel::Error);
                fatal("Failed to create logical device");
            }
        };

        let sync2 = can_sync2.then(|| khr::Synchronization2::new(instance, &device));
        let push_descriptor = (probe.push_descriptor
            && create_info
                .required_extensions
                .iter()
                .any(|e| e.as_c_str() == khr::PushDescriptor::name()))
        .then(|| khr::PushDescriptor::new(instance, &device));

        // Swap-chain (or bare extent when headless)
        let mut swapchain_usage = create_info.swapchain_usage | vk::ImageUsageFlags::COLOR_ATTACHMENT;
        if !presenting {
            swapchain_usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        let width = settings.width.max(1) as u32;
        let height = settings.height.unsigned_abs();
        let with_views = swapchain_usage.intersects(ALL_IMAGE_VIEW_USAGE);
        let screen = if presenting {
            let loader = khr::Swapchain::new(instance, &device);
            let mut core = match SwapchainCore::new(
                device.clone(),
                loader,
                surface_loader
                    .clone()
                    .expect("presenting contexts own a surface loader"),
                physical_device,
                surface,
                width,
                height,
                swapchain_usage,
                create_info.preferred_present_mode,
                !settings.color_space_srgb,
                settings.force_swapchain_count,
            ) {
                Ok(core) => core,
                Err(e) => {
                    sink.put(&format!("Swapchain creation failed: {e}"), LogLevel::Error);
                    fatal("Failed to create the swapchain");
                }
            };
            if with_views {
                if let Err(e) = core.create_image_views() {
                    sink.put(&format!("Image view creation failed: {e}"), LogLevel::Error);
                    fatal("Failed to create the swapchain image views");
                }
            }
            let extent = core.extent();
            ScreenState {
                core: Some(core),
                extent,
                viewport: swapchain::derive_viewport(extent, settings.width, settings.height),
                with_views,
            }
        } else {
            let extent = vk::Extent2D { width, height };
            ScreenState {
                core: None,
                extent,
                viewport: swapchain::derive_viewport(extent, settings.width, settings.height),
                with_views,
            }
        };

        let allocator = MemoryAllocator::new(
            instance.clone(),
            device.clone(),
            physical_device,
            settings.chunk_size_bytes(),
            settings.memory_batch_count,
            probe.memory_budget,
            Arc::clone(&sink),
            create_info.custom_release_memory.take(),
        );

        let pipeline_cache =
            match pipeline_cache::create_pipeline_cache(&device, settings.cache_path.as_deref()) {
                Ok(cache) => cache,
                Err(e) => {
                    sink.put(&format!("Failed to create pipeline cache: {e}"), LogLevel::Warning);
                    vk::PipelineCache::null()
                }
            };

        Arc::new(Self {
            sink,
            physical_device,
            device_properties,
            device,
            surface,
            surface_loader,
            sync2,
            push_descriptor,
            enabled_features,
            queues: Mutex::new(families),
            screen: Mutex::new(screen),
            samplers: Mutex::new(Vec::new()),
            allocator: Some(allocator),
            pipeline_cache,
            cache_path: create_info.settings.cache_path.clone(),
            instance_core,
        })
    }

    /// Logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Instance handle, for extension loaders.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance_core.instance
    }

    /// Physical device the logical device was built on.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Properties of the selected physical device.
    pub fn device_properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.device_properties
    }

    /// Features that ended up enabled after negotiation.
    pub fn enabled_features(&self) -> &FeatureSet {
        &self.enabled_features
    }

    /// Device-memory allocator.
    pub fn allocator(&self) -> &MemoryAllocator {
        self.allocator
            .as_ref()
            .expect("the allocator lives as long as the context")
    }

    /// Synchronization2 entry points, when the device supports them.
    pub fn sync2(&self) -> Option<&khr::Synchronization2> {
        self.sync2.as_ref()
    }

    /// Push-descriptor entry points, when the extension was requested and is
    /// available.
    pub fn push_descriptor(&self) -> Option<&khr::PushDescriptor> {
        self.push_descriptor.as_ref()
    }

    /// Persistent pipeline cache.
    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    /// Minimum uniform-buffer-offset alignment of the device.
    pub fn uniform_offset_alignment(&self) -> u32 {
        self.device_properties
            .limits
            .min_uniform_buffer_offset_alignment as u32
    }

    /// Record one entry through the context's log sink.
    pub fn put_log(&self, msg: &str, level: LogLevel) {
        self.sink.put(msg, level);
    }

    /// Shared log sink.
    pub fn sink(&self) -> &Arc<LogSink> {
        &self.sink
    }

    /// Block until the device is idle.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }

    /// Attach a human-readable name to a Vulkan handle for validation
    /// output; a no-op when the validation layer is off.
    pub fn set_object_name<H: vk::Handle>(&self, handle: H, object_type: vk::ObjectType, name: &str) {
        if let Some(debug_utils) = &self.instance_core.debug_utils {
            let Ok(name) = CString::new(name) else { return };
            let info = vk::DebugUtilsObjectNameInfoEXT::builder()
                .object_type(object_type)
                .object_handle(handle.as_raw())
                .object_name(&name);
            unsafe {
                let _ = debug_utils.set_debug_utils_object_name(self.device.handle(), &info);
            }
        }
    }

    /// Register a pretty-printer for the `" at "` debug-name convention.
    pub fn set_debug_function(&self, identifier: char, func: DebugFn) {
        self.instance_core.debug_state.set_debug_function(identifier, func);
    }

    /// Acquire one queue of the given role, or `None` when the role's pool
    /// is exhausted. Queues are never returned.
    pub fn acquire_queue(&self, role: QueueType, name: &str) -> Option<(vk::Queue, QueueFamily)> {
        let mut families = self.queues.lock().unwrap();
        let (idx, queue_index) = queues::take_queue(&mut families, role)?;
        let family = families[idx];
        drop(families);
        let queue = unsafe { self.device.get_device_queue(family.id, queue_index) };
        if !name.is_empty() {
            self.set_object_name(queue, vk::ObjectType::QUEUE, name);
        }
        Some((queue, family))
    }

    /// Family that would serve the next acquisition of the given role.
    pub fn preview_queue_family(&self, role: QueueType) -> Option<QueueFamily> {
        queues::preview_family(&self.queues.lock().unwrap(), role).copied()
    }

    /// Carved queue requirement actually applied, for diagnostics.
    pub fn queue_families(&self) -> Vec<QueueFamily> {
        self.queues.lock().unwrap().clone()
    }

    /// Create a buffer bound to freshly allocated memory, honouring the
    /// driver's dedicated-allocation preference. [`NO_BATCH`] as the batch
    /// forces a dedicated allocation. The buffer is destroyed on failure.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
        batch: u32,
    ) -> VulkanResult<(vk::Buffer, SubMemory)> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            self.device
                .create_buffer(&info, None)
                .map_err(VulkanError::Api)?
        };
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::builder()
            .push_next(&mut dedicated)
            .build();
        let buffer_info = vk::BufferMemoryRequirementsInfo2::builder().buffer(buffer);
        unsafe {
            self.device
                .get_buffer_memory_requirements2(&buffer_info, &mut requirements);
        }
        let allocation = if dedicated.prefers_dedicated_allocation == vk::TRUE || batch == NO_BATCH {
            let dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().buffer(buffer).build();
            self.allocator().allocate_dedicated(
                &requirements.memory_requirements,
                &dedicated_info,
                properties,
                preferred,
            )
        } else {
            self.allocator()
                .allocate(&requirements.memory_requirements, properties, preferred, batch)
        };
        let memory = match allocation {
            Ok(memory) if !memory.is_null() => memory,
            Ok(_) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(VulkanError::OutOfMemory { requested: size });
            }
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, memory.memory, memory.offset)
        } {
            self.sink
                .put(&format!("Failed to bind buffer memory: {e:?}"), LogLevel::Error);
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.allocator().free(memory);
            return Err(VulkanError::Api(e));
        }
        Ok((buffer, memory))
    }

    /// Release a sub-range through the allocator.
    pub fn free(&self, memory: SubMemory) {
        self.allocator().free(memory);
    }

    /// Map a sub-range and return the host pointer at its offset.
    pub fn map_memory(&self, memory: &SubMemory) -> VulkanResult<*mut u8> {
        self.allocator().map(memory)
    }

    /// Drop one mapping reference of a sub-range.
    pub fn unmap_memory(&self, memory: &SubMemory) {
        self.allocator().unmap(memory)
    }

    /// Unused-chunk sweep plus the application's release hook; called by the
    /// allocator when the device heap runs low.
    pub fn release_unused_memory(&self) {
        self.allocator().release_unused_memory();
    }

    /// Per-frame housekeeping: rearms the once-per-frame release guard.
    pub fn update(&self) {
        self.allocator().end_of_frame();
    }

    /// Get or create a cached sampler; the full create info is compared
    /// against previously created samplers.
    pub fn get_sampler(&self, info: &vk::SamplerCreateInfo) -> VulkanResult<vk::Sampler> {
        let key = SamplerKey::from(info);
        let mut samplers = self.samplers.lock().unwrap();
        if let Some((_, sampler)) = samplers.iter().find(|(k, _)| *k == key) {
            return Ok(*sampler);
        }
        let sampler = unsafe {
            self.device
                .create_sampler(info, None)
                .map_err(VulkanError::Api)?
        };
        samplers.push((key, sampler));
        Ok(sampler)
    }

    /// Current surface extent (swap-chain extent when presenting).
    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.screen.lock().unwrap().extent
    }

    /// Viewport and scissor covering the configured render area.
    pub fn viewport_state(&self) -> ViewportState {
        self.screen.lock().unwrap().viewport
    }

    /// Scissor of the configured render area.
    pub fn screen_rect(&self) -> vk::Rect2D {
        self.screen.lock().unwrap().viewport.scissor
    }

    /// Swap-chain handle; `None` when headless.
    pub fn swapchain(&self) -> Option<vk::SwapchainKHR> {
        self.screen.lock().unwrap().core.as_ref().map(SwapchainCore::handle)
    }

    /// Swap-chain images; empty when headless.
    pub fn swapchain_images(&self) -> Vec<vk::Image> {
        self.screen
            .lock()
            .unwrap()
            .core
            .as_ref()
            .map(|c| c.images().to_vec())
            .unwrap_or_default()
    }

    /// Swap-chain image views; empty when headless or when the usage did not
    /// require views.
    pub fn swapchain_views(&self) -> Vec<vk::ImageView> {
        self.screen
            .lock()
            .unwrap()
            .core
            .as_ref()
            .map(|c| c.views().to_vec())
            .unwrap_or_default()
    }

    /// Swap-chain image format; `None` when headless.
    pub fn swapchain_format(&self) -> Option<vk::Format> {
        self.screen.lock().unwrap().core.as_ref().map(SwapchainCore::format)
    }

    /// Acquire the next swap-chain image, folding transient results into
    /// [`AcquireOutcome`].
    pub fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VulkanResult<AcquireOutcome> {
        let screen = self.screen.lock().unwrap();
        let core = screen.core.as_ref().ok_or(VulkanError::InvalidOperation {
            reason: "acquire_next_image on a headless context".into(),
        })?;
        let outcome = core.acquire_next_image(timeout_ns, semaphore, fence)?;
        if let AcquireOutcome::Image { suboptimal: true, .. } = outcome {
            self.sink
                .put("Suboptimal swapchain image acquired", LogLevel::Warning);
        }
        Ok(outcome)
    }

    /// Rebuild the swap-chain for a new surface size. Returns `Ok(false)`
    /// when the surface has zero area (e.g. a minimized window), in which
    /// case the old swap-chain stays in place.
    pub fn regenerate_swapchain(&self, width: i32, height: i32) -> VulkanResult<bool> {
        let mut screen = self.screen.lock().unwrap();
        let with_views = screen.with_views;
        let Some(core) = screen.core.as_mut() else {
            return Ok(false);
        };
        let regenerated = core.regenerate(width.max(1) as u32, height.unsigned_abs(), with_views)?;
        if regenerated {
            let image_count = core.images().len();
            let extent = core.extent();
            screen.extent = extent;
            screen.viewport = swapchain::derive_viewport(extent, width, height);
            self.sink.put(
                &format!(
                    "Swapchain regenerated: {}x{} with {image_count} images",
                    extent.width, extent.height
                ),
                LogLevel::Debug,
            );
        }
        Ok(regenerated)
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        self.wait_idle();
        self.sink.put("Release resources", LogLevel::Info);
        unsafe {
            for (_, sampler) in self.samplers.lock().unwrap().drain(..) {
                self.device.destroy_sampler(sampler, None);
            }
            // The swap-chain must go before the surface and device
            self.screen.lock().unwrap().core = None;
            if let Some(loader) = &self.surface_loader {
                loader.destroy_surface(self.surface, None);
            }
            if self.pipeline_cache != vk::PipelineCache::null() {
                if let Some(path) = &self.cache_path {
                    pipeline_cache::persist_pipeline_cache(
                        &self.device,
                        self.pipeline_cache,
                        path,
                        &self.sink,
                    );
                }
                self.device.destroy_pipeline_cache(self.pipeline_cache, None);
            }
            // Frees the remaining chunks against the live device
            self.allocator = None;
            self.device.destroy_device(None);
        }
        CONTEXT_LIVE.store(false, Ordering::Release);
        // `instance_core` drops last, tearing down messenger and instance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_key_matches_equivalent_infos() {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .max_anisotropy(8.0)
            .build();
        let same = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .max_anisotropy(8.0)
            .build();
        assert_eq!(SamplerKey::from(&info), SamplerKey::from(&same));
    }

    #[test]
    fn test_sampler_key_distinguishes_fields() {
        let linear = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .build();
        let nearest = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::NEAREST)
            .build();
        assert_ne!(SamplerKey::from(&linear), SamplerKey::from(&nearest));
    }
}
