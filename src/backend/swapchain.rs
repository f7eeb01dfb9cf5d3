// Swapchain - the presentable image chain
//
// Owns the swapchain handle, its per-image views, framebuffers and depth
// buffers, and rebuilds all of them in place when the chain is invalidated
// by a resize. The selection policies are plain functions so they can be
// exercised without a device.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;

use super::image::Image;
use super::pipeline;
use super::sync::FrameError;
use super::VulkanContext;

/// Depth attachments are created per swapchain image in this format.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT_S8_UINT;

const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Prefer 8-bit BGRA with the sRGB-nonlinear color space; otherwise fall
/// back to the first format the device reports. The fallback works but is
/// not guaranteed ideal.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    for format in formats {
        if format.format == PREFERRED_FORMAT.format
            && format.color_space == PREFERRED_FORMAT.color_space
        {
            return *format;
        }
    }

    match formats.first() {
        Some(format) => {
            log::warn!(
                "Preferred surface format unavailable, using {:?}/{:?}",
                format.format,
                format.color_space
            );
            *format
        }
        None => PREFERRED_FORMAT,
    }
}

/// Both extent fields at `u32::MAX` is the sentinel for "the surface extent
/// is defined by the swapchain"; use the largest supported extent then.
/// Anything else is taken verbatim.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    if caps.current_extent.width == u32::MAX && caps.current_extent.height == u32::MAX {
        return caps.max_image_extent;
    }
    caps.current_extent
}

/// One image more than the minimum, so a free image is always available to
/// the CPU while the others are in flight or on screen. A maximum of zero
/// means the device imposes no upper bound.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        return caps.min_image_count + 1;
    }
    (caps.min_image_count + 1).min(caps.max_image_count)
}

/// The requested mode when the device advertises it; FIFO (always
/// available) otherwise.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        requested
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The active presentable image chain. Every field flips together on
/// rebuild; no partially updated state is ever observable.
pub struct SwapchainState {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub valid: bool,
}

impl SwapchainState {
    fn empty() -> Self {
        Self {
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            format: PREFERRED_FORMAT,
            extent: vk::Extent2D::default(),
            image_count: 0,
            valid: false,
        }
    }

    pub fn is_consistent(&self) -> bool {
        let count = self.image_count as usize;
        self.images.len() == count
            && self.image_views.len() == count
            && self.framebuffers.len() == count
    }
}

pub struct SwapchainManager {
    ctx: Arc<VulkanContext>,
    loader: khr::Swapchain,
    render_pass: vk::RenderPass,
    present_mode: vk::PresentModeKHR,
    state: SwapchainState,
    // Rebuilt in lockstep with the color images: same count, same extent
    depth_buffers: Vec<Image>,
}

impl SwapchainManager {
    pub fn new(
        ctx: &Arc<VulkanContext>,
        render_pass: vk::RenderPass,
        present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let loader = khr::Swapchain::new(&ctx.instance, &ctx.device);

        let mut manager = Self {
            ctx: ctx.clone(),
            loader,
            render_pass,
            present_mode,
            state: SwapchainState::empty(),
            depth_buffers: Vec::new(),
        };

        manager.build()?;
        anyhow::ensure!(
            manager.state.valid,
            "Cannot create a swapchain for a zero-area surface"
        );

        Ok(manager)
    }

    /// Rebuild the chain in place after invalidation. The caller must have
    /// drained the device first. Returns false (leaving the state invalid)
    /// while the surface has zero area.
    pub fn rebuild(&mut self) -> Result<bool> {
        self.build()
    }

    fn build(&mut self) -> Result<bool> {
        // The current extent tracks the window, so capabilities are
        // re-queried on every build
        let caps = self.ctx.query_surface_caps()?;

        let format = choose_surface_format(&self.ctx.gpu.surface_formats);
        let extent = choose_extent(&caps);
        let image_count = choose_image_count(&caps);

        if extent.width == 0 || extent.height == 0 {
            return Ok(false);
        }

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            image_count,
            self.present_mode
        );

        // The new chain references the outgoing one so the driver can hand
        // resources over; the old objects are destroyed only afterwards
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.ctx.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(self.state.swapchain);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = unsafe { self.loader.get_swapchain_images(swapchain) }
            .context("Failed to query swapchain images")?;

        let image_views = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe { self.ctx.device.create_image_view(&view_info, None) }
                    .context("Failed to create swapchain image view")
            })
            .collect::<Result<Vec<_>>>()?;

        let depth_buffers = images
            .iter()
            .map(|_| Image::new_depth(&self.ctx, extent, DEPTH_FORMAT))
            .collect::<Result<Vec<_>>>()?;
        let depth_views: Vec<_> = depth_buffers.iter().map(|depth| depth.view()).collect();

        let framebuffers = pipeline::create_framebuffers(
            &self.ctx,
            self.render_pass,
            &image_views,
            &depth_views,
            extent,
        )?;

        // The complete replacement exists; retire the old chain
        self.destroy_state();
        self.depth_buffers = depth_buffers;

        let image_count = images.len() as u32;
        self.state = SwapchainState {
            swapchain,
            images,
            image_views,
            framebuffers,
            format,
            extent,
            image_count,
            valid: true,
        };
        debug_assert!(self.state.is_consistent());

        Ok(true)
    }

    fn destroy_state(&mut self) {
        unsafe {
            for &framebuffer in &self.state.framebuffers {
                self.ctx.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.state.image_views {
                self.ctx.device.destroy_image_view(view, None);
            }
            if self.state.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.state.swapchain, None);
            }
        }
        self.depth_buffers.clear();
        self.state = SwapchainState::empty();
    }

    /// Queue the rendered image for presentation.
    ///
    /// An out-of-date or suboptimal result reports `SwapchainStale`; the
    /// loop invalidates and rebuilds instead of treating it as a failure.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<(), FrameError> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.state.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(FrameError::SwapchainStale),
            Err(e) => Err(FrameError::Device(e)),
        }
    }

    pub fn invalidate(&mut self) {
        self.state.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.state.valid
    }

    pub fn state(&self) -> &SwapchainState {
        &self.state
    }

    pub fn loader(&self) -> &khr::Swapchain {
        &self.loader
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.state.swapchain
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        self.destroy_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32, current: (u32, u32), largest: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            max_image_extent: vk::Extent2D {
                width: largest.0,
                height: largest.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn format_prefers_bgra_srgb_nonlinear() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn format_falls_back_to_first_reported() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R16G16B16A16_SFLOAT,
                color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn extent_uses_max_when_both_fields_are_sentinel() {
        let caps = caps(2, 0, (u32::MAX, u32::MAX), (2560, 1440));
        let extent = choose_extent(&caps);
        assert_eq!((extent.width, extent.height), (2560, 1440));
    }

    #[test]
    fn extent_with_one_sentinel_field_is_taken_verbatim() {
        // Only a full sentinel means "undefined"; a single MAX field is a
        // (degenerate) real extent
        let caps = caps(2, 0, (u32::MAX, 1080), (2560, 1440));
        let extent = choose_extent(&caps);
        assert_eq!((extent.width, extent.height), (u32::MAX, 1080));
    }

    #[test]
    fn extent_uses_current_when_defined() {
        let caps = caps(2, 0, (1920, 1080), (2560, 1440));
        let extent = choose_extent(&caps);
        assert_eq!((extent.width, extent.height), (1920, 1080));
    }

    #[test]
    fn image_count_is_min_plus_one_when_unbounded() {
        assert_eq!(choose_image_count(&caps(2, 0, (1, 1), (1, 1))), 3);
        assert_eq!(choose_image_count(&caps(3, 0, (1, 1), (1, 1))), 4);
    }

    #[test]
    fn image_count_is_clamped_by_maximum() {
        assert_eq!(choose_image_count(&caps(2, 2, (1, 1), (1, 1))), 2);
        assert_eq!(choose_image_count(&caps(2, 5, (1, 1), (1, 1))), 3);
        assert_eq!(choose_image_count(&caps(3, 3, (1, 1), (1, 1))), 3);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn state_consistency_requires_matching_lengths() {
        let consistent = SwapchainState {
            swapchain: vk::SwapchainKHR::null(),
            images: vec![vk::Image::null(); 3],
            image_views: vec![vk::ImageView::null(); 3],
            framebuffers: vec![vk::Framebuffer::null(); 3],
            format: PREFERRED_FORMAT,
            extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            image_count: 3,
            valid: true,
        };
        assert!(consistent.is_consistent());

        let mut mismatched = consistent;
        mismatched.framebuffers.pop();
        assert!(!mismatched.is_consistent());

        let empty = SwapchainState::empty();
        assert!(empty.is_consistent());
    }
}
