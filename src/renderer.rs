// Top-level renderer - owns every GPU resource and drives the frame loop
//
// Frame protocol: acquire -> wait on the image's fence -> record + submit
// -> present -> advance the semaphore slot. A stale swapchain at acquire
// or present abandons the frame and triggers a full rebuild at the top of
// the next iteration; that rebuild is the only place the loop waits for
// total GPU idleness.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use winit::window::Window;

use crate::backend::commands::FramePass;
use crate::backend::swapchain::{choose_present_mode, choose_surface_format};
use crate::backend::{
    pipeline, shader, Buffer, CommandRecorder, FrameError, FrameSynchronizer, SwapchainManager,
    Texture, VulkanContext,
};
use crate::camera::Camera;
use crate::config::Config;
use crate::model::Model;

pub struct Renderer {
    // Declaration order is teardown order: sync objects and commands first,
    // the context last. Raw handles are destroyed in Drop before any field.
    frames: FrameSynchronizer,
    recorder: CommandRecorder,
    models: Vec<Model>,
    texture: Texture,
    uniform: Buffer,
    swapchain: SwapchainManager,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    descriptor_set_layout: vk::DescriptorSetLayout,
    render_pass: vk::RenderPass,
    clear_color: [f32; 4],
    ctx: Arc<VulkanContext>,
}

impl Renderer {
    pub fn new(window: &Window, config: &Config) -> Result<Self> {
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let ctx = VulkanContext::new(window, &config.window.title, enable_validation)?;

        let surface_format = choose_surface_format(&ctx.gpu.surface_formats);
        let render_pass = pipeline::create_render_pass(&ctx, surface_format.format)?;

        let present_mode = choose_present_mode(&ctx.gpu.present_modes, config.present_mode());
        let swapchain = SwapchainManager::new(&ctx, render_pass, present_mode)?;

        let descriptor_set_layout = pipeline::create_descriptor_set_layout(&ctx)?;

        let vert = shader::load(&ctx, &config.assets.vertex_shader)?;
        let frag = shader::load(&ctx, &config.assets.fragment_shader)?;
        let (pipe, pipeline_layout) = pipeline::create_pipeline(
            &ctx,
            render_pass,
            swapchain.state().extent,
            descriptor_set_layout,
            vert,
            frag,
        )?;
        shader::destroy(&ctx, vert);
        shader::destroy(&ctx, frag);

        let image_count = swapchain.state().image_count;
        let recorder = CommandRecorder::new(&ctx, image_count)?;

        let uniform = Buffer::new(
            &ctx,
            "scene uniform",
            std::mem::size_of::<Mat4>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            gpu_allocator::MemoryLocation::CpuToGpu,
        )?;

        let decoded = image::open(&config.assets.texture)
            .with_context(|| format!("Failed to load texture {:?}", config.assets.texture))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        let texture = Texture::from_rgba8(
            &ctx,
            &recorder,
            decoded.as_raw(),
            vk::Extent2D { width, height },
        )?;

        let (descriptor_pool, descriptor_set) =
            create_descriptor_set(&ctx, descriptor_set_layout, &uniform, &texture)?;

        let frames = FrameSynchronizer::new(&ctx, image_count)?;

        log::info!("Renderer initialized");

        Ok(Self {
            frames,
            recorder,
            models: Vec::new(),
            texture,
            uniform,
            swapchain,
            descriptor_pool,
            descriptor_set,
            pipeline: pipe,
            pipeline_layout,
            descriptor_set_layout,
            render_pass,
            clear_color: config.graphics.clear_color,
            ctx,
        })
    }

    /// Upload a model's buffers and add it to the draw list. Models are
    /// drawn every frame in insertion order.
    pub fn add_model(&mut self, mut model: Model) -> Result<()> {
        model.build_buffers(&self.ctx)?;
        self.models.push(model);
        Ok(())
    }

    /// Mark the presentable chain as stale; polled at the top of the next
    /// frame. Safe to call from the resize notification path.
    pub fn invalidate_swapchain(&mut self) {
        self.swapchain.invalidate();
    }

    /// Drive one loop iteration. Returns false when no frame was drawn
    /// (stale swapchain being rebuilt, or a zero-area surface).
    pub fn draw_frame(&mut self, camera: &Camera) -> Result<bool> {
        if !self.swapchain.is_valid() {
            self.ctx.wait_idle()?;

            if !self.swapchain.rebuild()? {
                // Zero-area surface (minimized); keep skipping frames
                return Ok(false);
            }

            // The image count may have changed: command buffers and frame
            // slots are sized by it
            let image_count = self.swapchain.state().image_count;
            self.recorder.realloc(image_count)?;
            self.frames = FrameSynchronizer::new(&self.ctx, image_count)?;

            // The rebuild iteration draws nothing; normal frames resume on
            // the next one
            return Ok(false);
        }

        let render_finished = self.frames.current().render_finished;

        let (image_index, image_available) = match self.frames.acquire_next(&self.swapchain) {
            Ok(acquired) => acquired,
            Err(FrameError::SwapchainStale) => {
                self.swapchain.invalidate();
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        // Blocks until the previous use of this image completes; after this
        // its command buffer and the uniform block are safe to overwrite
        let fence = self.frames.wait_and_reset(image_index)?;

        let state = self.swapchain.state();
        let pass = FramePass {
            render_pass: self.render_pass,
            framebuffer: state.framebuffers[image_index as usize],
            extent: state.extent,
            clear_color: self.clear_color,
            pipeline: self.pipeline,
            pipeline_layout: self.pipeline_layout,
            descriptor_set: self.descriptor_set,
        };

        self.recorder.record_frame(
            image_index,
            &pass,
            camera.view_projection(),
            &mut self.uniform,
            &self.models,
        )?;
        self.recorder
            .submit(image_index, image_available, render_finished, fence)?;

        match self.swapchain.present(self.ctx.queue, image_index, render_finished) {
            Ok(()) => self.frames.advance(),
            Err(FrameError::SwapchainStale) => self.swapchain.invalidate(),
            Err(e) => return Err(e.into()),
        }

        Ok(true)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Shutting down renderer");

        let _ = self.ctx.wait_idle();

        unsafe {
            let device = &self.ctx.device;
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            device.destroy_render_pass(self.render_pass, None);
        }
        // Remaining members drop in declaration order; the context goes last
    }
}

#[cfg(test)]
mod tests {
    /// What one `draw_frame` call did.
    #[derive(Debug, PartialEq)]
    enum Iteration {
        Rebuilt,
        Drawn,
        Skipped,
    }

    /// CPU-side model of the draw_frame entry: a stale swapchain is rebuilt
    /// (draw-free) on the next iteration, a zero-area surface keeps being
    /// skipped, and normal frames resume afterwards.
    struct LoopModel {
        valid: bool,
        rebuilds: u32,
        draws: u32,
    }

    impl LoopModel {
        fn new() -> Self {
            Self {
                valid: true,
                rebuilds: 0,
                draws: 0,
            }
        }

        fn invalidate(&mut self) {
            self.valid = false;
        }

        fn iterate(&mut self, surface_has_area: bool) -> Iteration {
            if !self.valid {
                if !surface_has_area {
                    return Iteration::Skipped;
                }
                self.rebuilds += 1;
                self.valid = true;
                return Iteration::Rebuilt;
            }
            self.draws += 1;
            Iteration::Drawn
        }
    }

    #[test]
    fn resize_triggers_one_rebuild_and_zero_draws_before_frames_resume() {
        let mut model = LoopModel::new();
        assert_eq!(model.iterate(true), Iteration::Drawn);

        model.invalidate();
        assert_eq!(model.iterate(true), Iteration::Rebuilt);
        assert_eq!(model.iterate(true), Iteration::Drawn);
        assert_eq!(model.iterate(true), Iteration::Drawn);

        assert_eq!(model.rebuilds, 1);
        assert_eq!(model.draws, 3);
    }

    #[test]
    fn minimized_surface_skips_without_rebuilding() {
        let mut model = LoopModel::new();
        model.invalidate();

        assert_eq!(model.iterate(false), Iteration::Skipped);
        assert_eq!(model.iterate(false), Iteration::Skipped);
        assert_eq!(model.rebuilds, 0);
        assert_eq!(model.draws, 0);

        // The window regains area; one rebuild, then frames
        assert_eq!(model.iterate(true), Iteration::Rebuilt);
        assert_eq!(model.iterate(true), Iteration::Drawn);
    }
}

fn create_descriptor_set(
    ctx: &Arc<VulkanContext>,
    layout: vk::DescriptorSetLayout,
    uniform: &Buffer,
    texture: &Texture,
) -> Result<(vk::DescriptorPool, vk::DescriptorSet)> {
    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
        },
    ];

    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .max_sets(1)
        .pool_sizes(&pool_sizes);

    let pool = unsafe { ctx.device.create_descriptor_pool(&pool_info, None) }
        .context("Failed to create descriptor pool")?;

    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);

    let set = unsafe { ctx.device.allocate_descriptor_sets(&alloc_info) }
        .context("Failed to allocate descriptor set")?[0];

    let buffer_infos = [vk::DescriptorBufferInfo {
        buffer: uniform.handle(),
        offset: 0,
        range: vk::WHOLE_SIZE,
    }];

    let image_infos = [vk::DescriptorImageInfo {
        sampler: texture.sampler(),
        image_view: texture.view(),
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }];

    let writes = [
        vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_infos)
            .build(),
        vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(1)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_infos)
            .build(),
    ];

    unsafe {
        ctx.device.update_descriptor_sets(&writes, &[]);
    }

    Ok((pool, set))
}
