// Owning image wrappers: depth attachments and sampled textures
//
// An Image pairs the Vulkan image, its memory allocation, and its view.
// Texture adds a sampler and the one-time staging upload.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::commands::CommandRecorder;
use super::{Buffer, VulkanContext};

pub struct Image {
    ctx: Arc<VulkanContext>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<gpu_allocator::vulkan::Allocation>,
}

impl Image {
    fn new(
        ctx: &Arc<VulkanContext>,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { ctx.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;

        let requirements = unsafe { ctx.device.get_image_memory_requirements(image) };

        let allocation = ctx
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for image '{}'", name))?;

        unsafe {
            ctx.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context("Failed to bind image memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { ctx.device.create_image_view(&view_info, None) }
            .context("Failed to create image view")?;

        Ok(Self {
            ctx: ctx.clone(),
            image,
            view,
            allocation: Some(allocation),
        })
    }

    /// Depth/stencil attachment sized to one swapchain image.
    pub fn new_depth(ctx: &Arc<VulkanContext>, extent: vk::Extent2D, format: vk::Format) -> Result<Self> {
        Self::new(
            ctx,
            "depth",
            extent,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        )
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_image_view(self.view, None);
            self.ctx.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.ctx.allocator().free(allocation) {
                log::error!("Failed to free image memory: {}", e);
            }
        }
    }
}

/// A sampled 2D texture uploaded once at startup.
pub struct Texture {
    // Sampler is destroyed in Drop before the image it samples
    image: Image,
    sampler: vk::Sampler,
}

impl Texture {
    /// Upload raw RGBA8 pixels through a staging buffer, transitioning the
    /// image to shader-read layout. Blocks until the copy completes.
    pub fn from_rgba8(
        ctx: &Arc<VulkanContext>,
        recorder: &CommandRecorder,
        pixels: &[u8],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let expected = extent.width as usize * extent.height as usize * 4;
        anyhow::ensure!(
            pixels.len() == expected,
            "Texture data is {} bytes, expected {} for {}x{} RGBA8",
            pixels.len(),
            expected,
            extent.width,
            extent.height
        );

        let staging = Buffer::from_data(
            ctx,
            "texture staging",
            vk::BufferUsageFlags::TRANSFER_SRC,
            pixels,
        )?;

        let image = Image::new(
            ctx,
            "texture",
            extent,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;

        recorder.submit_one_time(|device, cmd| {
            let subresource_range = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            };

            let to_transfer = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.handle())
                .subresource_range(subresource_range)
                .build();

            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_transfer],
                );
            }

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            };

            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle(),
                    image.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            let to_shader = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.handle())
                .subresource_range(subresource_range)
                .build();

            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_shader],
                );
            }
        })?;

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

        let sampler = unsafe { ctx.device.create_sampler(&sampler_info, None) }
            .context("Failed to create texture sampler")?;

        Ok(Self { image, sampler })
    }

    pub fn view(&self) -> vk::ImageView {
        self.image.view()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.image.ctx.device.destroy_sampler(self.sampler, None);
        }
    }
}
