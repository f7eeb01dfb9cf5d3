// Owning buffer wrapper: Vulkan buffer + its memory allocation
//
// Host-visible buffers stay persistently mapped for their whole lifetime;
// writes go straight through the mapped slice.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::VulkanContext;

pub struct Buffer {
    ctx: Arc<VulkanContext>,
    buffer: vk::Buffer,
    allocation: Option<gpu_allocator::vulkan::Allocation>,
}

impl Buffer {
    pub fn new(
        ctx: &Arc<VulkanContext>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { ctx.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };

        let allocation = ctx
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for buffer '{}'", name))?;

        unsafe {
            ctx.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .context("Failed to bind buffer memory")?;
        }

        Ok(Self {
            ctx: ctx.clone(),
            buffer,
            allocation: Some(allocation),
        })
    }

    /// Create a host-visible buffer and fill it with `data`.
    pub fn from_data<T: Pod>(
        ctx: &Arc<VulkanContext>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let mut buffer = Self::new(ctx, name, size, usage, MemoryLocation::CpuToGpu)?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Overwrite the buffer contents through the persistent mapping.
    ///
    /// The memory is host-coherent; the caller is responsible for ordering
    /// the write against GPU reads (in the frame loop that ordering is the
    /// fence wait preceding the write).
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer is not host-visible")?;
        anyhow::ensure!(
            bytes.len() <= mapped.len(),
            "Write of {} bytes exceeds buffer size {}",
            bytes.len(),
            mapped.len()
        );
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_buffer(self.buffer, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.ctx.allocator().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
    }
}
