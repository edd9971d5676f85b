//! Swap-chain lifecycle
//!
//! Creation, regeneration on resize (reusing the old swap-chain and keeping
//! its image views in a pending-destroy list until the next regeneration),
//! and the pure choosers for surface format, present mode and extent.

use ash::extensions::khr;
use ash::vk;

use crate::error::{VulkanError, VulkanResult};

/// Swap-chain usages that need image views.
pub const ALL_IMAGE_VIEW_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::SAMPLED.as_raw()
        | vk::ImageUsageFlags::STORAGE.as_raw()
        | vk::ImageUsageFlags::INPUT_ATTACHMENT.as_raw(),
);

/// Viewport and scissor pair derived from a surface extent.
#[derive(Debug, Clone, Copy)]
pub struct ViewportState {
    /// Viewport, possibly with a negative height to flip Y
    pub viewport: vk::Viewport,
    /// Scissor covering the rendered area
    pub scissor: vk::Rect2D,
}

/// Derive a centered viewport of `width`×`height` inside `extent`. A
/// negative height flips the viewport Y axis while the scissor keeps
/// covering the same pixels. Zero width and height cover the whole extent.
pub fn derive_viewport(extent: vk::Extent2D, width: i32, height: i32) -> ViewportState {
    if width == 0 && height == 0 {
        return ViewportState {
            viewport: vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            scissor: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
        };
    }
    let x = (extent.width as f32 - width as f32) / 2.0;
    let y = (extent.height as f32 - height as f32) / 2.0;
    let scissor = if height > 0 {
        vk::Rect2D {
            offset: vk::Offset2D {
                x: (x + 0.001) as i32,
                y: (y + 0.001) as i32,
            },
            extent: vk::Extent2D {
                width: width as u32,
                height: height as u32,
            },
        }
    } else {
        vk::Rect2D {
            offset: vk::Offset2D {
                x: (x + 0.001) as i32,
                y: (y + height as f32 + 0.001) as i32,
            },
            extent: vk::Extent2D {
                width: width as u32,
                height: (-height) as u32,
            },
        }
    };
    ViewportState {
        viewport: vk::Viewport {
            x,
            y,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        },
        scissor,
    }
}

/// Prefer `B8G8R8A8_UNORM` for linear output, `B8G8R8A8_SRGB` with the
/// non-linear sRGB color space otherwise; fall back to whatever comes first.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    expect_linear: bool,
) -> vk::SurfaceFormatKHR {
    for format in formats {
        if expect_linear {
            if format.format == vk::Format::B8G8R8A8_UNORM {
                return *format;
            }
        } else if format.format == vk::Format::B8G8R8A8_SRGB
            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        {
            return *format;
        }
    }
    formats[0]
}

/// The preferred mode when the surface offers it, otherwise FIFO, the only
/// mode always available.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Clamp the requested extent to what the surface supports; a fixed current
/// extent wins outright.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Outcome of a swap-chain image acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image index is ready; `suboptimal` is logged but treated as success
    Image {
        /// Index into the swap-chain images
        index: u32,
        /// The swap-chain no longer matches the surface exactly
        suboptimal: bool,
    },
    /// The timeout elapsed; skip the frame and retry later
    Timeout,
    /// The swap-chain must be regenerated before presenting again
    OutOfDate,
}

/// Fixed parameters the swap-chain is rebuilt with on regeneration.
struct SwapchainParams {
    min_image_count: u32,
    format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    usage: vk::ImageUsageFlags,
    present_mode: vk::PresentModeKHR,
    composite_alpha: vk::CompositeAlphaFlagsKHR,
}

/// The live swap-chain with its images and views.
pub struct SwapchainCore {
    device: ash::Device,
    loader: khr::Swapchain,
    surface_loader: khr::Surface,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    params: SwapchainParams,
    swapchain: vk::SwapchainKHR,
    old_swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    pending_destroy_views: Vec<vk::ImageView>,
    extent: vk::Extent2D,
}

impl SwapchainCore {
    /// Create the initial swap-chain.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: ash::Device,
        loader: khr::Swapchain,
        surface_loader: khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        usage: vk::ImageUsageFlags,
        preferred_present_mode: vk::PresentModeKHR,
        expect_linear: bool,
        force_image_count: u32,
    ) -> VulkanResult<Self> {
        let (capabilities, formats, modes) = unsafe {
            (
                surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .map_err(VulkanError::Api)?,
                surface_loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .map_err(VulkanError::Api)?,
                surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .map_err(VulkanError::Api)?,
            )
        };
        let surface_format = choose_surface_format(&formats, expect_linear);
        let present_mode = choose_present_mode(&modes, preferred_present_mode);
        let extent = choose_extent(&capabilities, width, height);
        let mut image_count = if force_image_count > 0 {
            force_image_count
        } else {
            capabilities.min_image_count + 1
        };
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }
        let mut core = Self {
            device,
            loader,
            surface_loader,
            physical_device,
            surface,
            params: SwapchainParams {
                min_image_count: image_count,
                format: surface_format.format,
                color_space: surface_format.color_space,
                usage,
                present_mode,
                composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            },
            swapchain: vk::SwapchainKHR::null(),
            old_swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            pending_destroy_views: Vec::new(),
            extent,
        };
        core.create(capabilities.current_transform)?;
        Ok(core)
    }

    fn create(&mut self, transform: vk::SurfaceTransformFlagsKHR) -> VulkanResult<()> {
        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(self.params.min_image_count)
            .image_format(self.params.format)
            .image_color_space(self.params.color_space)
            .image_extent(self.extent)
            .image_array_layers(1)
            .image_usage(self.params.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(self.params.composite_alpha)
            .present_mode(self.params.present_mode)
            .clipped(false)
            .old_swapchain(self.old_swapchain);
        self.swapchain = unsafe {
            self.loader
                .create_swapchain(&info, None)
                .map_err(VulkanError::Api)?
        };
        self.images = unsafe {
            self.loader
                .get_swapchain_images(self.swapchain)
                .map_err(VulkanError::Api)?
        };
        Ok(())
    }

    /// Tear down the previous swap-chain and its retained image views.
    pub fn cleanup_old(&mut self) {
        if self.old_swapchain != vk::SwapchainKHR::null() {
            unsafe {
                for view in self.pending_destroy_views.drain(..) {
                    self.device.destroy_image_view(view, None);
                }
                self.loader.destroy_swapchain(self.old_swapchain, None);
            }
            self.old_swapchain = vk::SwapchainKHR::null();
        }
    }

    /// Rebuild the swap-chain for a new surface extent, using the previous
    /// one as `oldSwapchain`. Returns `Ok(false)` when the surface currently
    /// has a zero-area extent (for instance a minimized window).
    pub fn regenerate(&mut self, width: u32, height: u32, with_views: bool) -> VulkanResult<bool> {
        self.cleanup_old();
        let capabilities = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(VulkanError::Api)?
        };
        let extent = choose_extent(&capabilities, width, height);
        if extent.width == 0 || extent.height == 0 {
            return Ok(false);
        }
        self.extent = extent;
        self.old_swapchain = self.swapchain;
        self.create(capabilities.current_transform)?;
        if self.images.is_empty() {
            // This swap-chain cannot be used; fall back to the previous one
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
            self.swapchain = self.old_swapchain;
            self.old_swapchain = vk::SwapchainKHR::null();
            return Ok(false);
        }
        // The old views may still be referenced by in-flight frames; they
        // are destroyed when the next regeneration completes.
        self.pending_destroy_views = std::mem::take(&mut self.views);
        if with_views {
            self.create_image_views()?;
        }
        Ok(true)
    }

    /// Create one 2D color view per swap-chain image.
    pub fn create_image_views(&mut self) -> VulkanResult<()> {
        self.views = self
            .images
            .iter()
            .map(|image| {
                let info = vk::ImageViewCreateInfo::builder()
                    .image(*image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(self.params.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe {
                    self.device
                        .create_image_view(&info, None)
                        .map_err(VulkanError::Api)
                }
            })
            .collect::<VulkanResult<_>>()?;
        Ok(())
    }

    /// Acquire the next image, folding the transient error codes into
    /// [`AcquireOutcome`].
    pub fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VulkanResult<AcquireOutcome> {
        match unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, semaphore, fence)
        } {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Image { index, suboptimal }),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(AcquireOutcome::Timeout),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    /// Current swap-chain handle.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Swap-chain images.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Image views, when the usage required them.
    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    /// Current extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Image format of the swap-chain.
    pub fn format(&self) -> vk::Format {
        self.params.format
    }
}

impl Drop for SwapchainCore {
    fn drop(&mut self) {
        self.cleanup_old();
        unsafe {
            for view in self.views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose_format_linear_and_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats, true).format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(choose_surface_format(&formats, false).format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn test_choose_format_falls_back_to_first() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        }];
        assert_eq!(
            choose_surface_format(&formats, false).format,
            vk::Format::R16G16B16A16_SFLOAT
        );
    }

    #[test]
    fn test_choose_present_mode_prefers_then_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_choose_extent_clamps_when_flexible() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 64, height: 64 },
            max_image_extent: vk::Extent2D {
                width: 2048,
                height: 2048,
            },
            ..Default::default()
        };
        let extent = choose_extent(&capabilities, 4096, 32);
        assert_eq!((extent.width, extent.height), (2048, 64));
    }

    #[test]
    fn test_choose_extent_uses_fixed_current() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = choose_extent(&capabilities, 1024, 1024);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_viewport_centers_sub_extent() {
        let state = derive_viewport(vk::Extent2D { width: 800, height: 600 }, 400, 300);
        assert_eq!(state.viewport.x, 200.0);
        assert_eq!(state.viewport.y, 150.0);
        assert_eq!(state.scissor.offset.x, 200);
        assert_eq!(state.scissor.extent.width, 400);
    }

    #[test]
    fn test_negative_height_flips_viewport_not_scissor() {
        let state = derive_viewport(vk::Extent2D { width: 800, height: 600 }, 800, -600);
        assert_eq!(state.viewport.height, -600.0);
        // The scissor still covers the same physical pixels
        assert_eq!(state.scissor.offset.y, 0);
        assert_eq!(state.scissor.extent.height, 600);
    }

    #[test]
    fn test_zero_size_covers_whole_extent() {
        let extent = vk::Extent2D { width: 640, height: 480 };
        let state = derive_viewport(extent, 0, 0);
        assert_eq!(state.viewport.width, 640.0);
        assert_eq!(state.scissor.extent.height, 480);
    }
}
