// Command recording and submission
//
// One primary command buffer per swapchain image, re-recorded every frame.
// The pool uses RESET_COMMAND_BUFFER so beginning a buffer implicitly
// resets it; the caller guarantees (via the fence wait) that the GPU is
// done with a buffer before it is begun again.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;

use crate::model::Model;

use super::{Buffer, VulkanContext};

/// Everything a frame recording needs besides the models, all plain
/// handles owned by the renderer.
pub struct FramePass {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
}

pub struct CommandRecorder {
    ctx: Arc<VulkanContext>,
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
}

impl CommandRecorder {
    pub fn new(ctx: &Arc<VulkanContext>, image_count: u32) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(ctx.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { ctx.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let mut recorder = Self {
            ctx: ctx.clone(),
            pool,
            buffers: Vec::new(),
        };
        recorder.realloc(image_count)?;

        Ok(recorder)
    }

    /// Resize the per-image buffer set after a swapchain rebuild. The
    /// caller must have drained the device first.
    pub fn realloc(&mut self, image_count: u32) -> Result<()> {
        if !self.buffers.is_empty() {
            unsafe {
                self.ctx.device.free_command_buffers(self.pool, &self.buffers);
            }
        }

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(image_count);

        self.buffers = unsafe { self.ctx.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        Ok(())
    }

    /// Record one frame's draw commands into the buffer for `image_index`.
    ///
    /// The camera matrix is written to the mapped uniform block before the
    /// render pass is recorded; the fence wait that preceded this call is
    /// what orders the write against the GPU's previous read of the block.
    pub fn record_frame(
        &self,
        image_index: u32,
        pass: &FramePass,
        view_projection: Mat4,
        uniform: &mut Buffer,
        models: &[Model],
    ) -> Result<()> {
        let cmd = self.buffers[image_index as usize];
        let device = &self.ctx.device;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device.begin_command_buffer(cmd, &begin_info)?;
        }

        uniform.write(std::slice::from_ref(&view_projection))?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: pass.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(pass.render_pass)
            .framebuffer(pass.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: pass.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_begin, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pass.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pass.pipeline_layout,
                0,
                &[pass.descriptor_set],
                &[],
            );

            for model in models {
                model.record_draw(device, cmd);
            }

            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd)?;
        }

        Ok(())
    }

    /// Submit the frame for `image_index`: wait for the image at the
    /// color-attachment-output stage, signal `render_finished` for the
    /// presentation engine and `fence` for the CPU.
    pub fn submit(
        &self,
        image_index: u32,
        image_available: vk::Semaphore,
        render_finished: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.buffers[image_index as usize]];
        let signal_semaphores = [render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.queue, &[submit_info.build()], fence)
                .context("Failed to submit frame commands")?;
        }

        Ok(())
    }

    /// Record and submit a one-off batch (resource uploads), blocking until
    /// the queue drains. Reuses the first frame buffer, so this must only
    /// run while no frames are in flight.
    pub fn submit_one_time(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<()> {
        let cmd = self.buffers[0];
        let device = &self.ctx.device;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device.begin_command_buffer(cmd, &begin_info)?;
        }

        record(device, cmd);

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            device.end_command_buffer(cmd)?;
            device
                .queue_submit(self.ctx.queue, &[submit_info.build()], vk::Fence::null())
                .context("Failed to submit one-time commands")?;
            device.queue_wait_idle(self.ctx.queue)?;
        }

        Ok(())
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        unsafe {
            // Destroying the pool frees its buffers
            self.ctx.device.destroy_command_pool(self.pool, None);
        }
    }
}
