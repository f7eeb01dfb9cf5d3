// Per-frame CPU/GPU synchronization
//
// One FrameSlot per swapchain image: a CPU-waitable fence plus the
// image-available / render-finished semaphore pair. Two indices rotate
// independently: the acquired image index (whatever the driver hands back)
// selects the fence and command buffer, while the FrameCursor selects the
// semaphore pair and only advances when a frame is actually presented.
// Conflating the two reuses a semaphore that may still be pending.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use thiserror::Error;

use super::swapchain::SwapchainManager;
use super::VulkanContext;

/// Outcome of a per-frame device operation.
///
/// `SwapchainStale` is not a failure: the presentation loop answers it with
/// a full swapchain rebuild and carries on.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("swapchain no longer matches the surface")]
    SwapchainStale,
    #[error("device failure: {0}")]
    Device(#[from] vk::Result),
}

/// Synchronization state for one swapchain image index.
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Created signaled so the first wait on each slot passes immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_available: device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.create_semaphore(&semaphore_info, None)?,
                in_flight: device.create_fence(&fence_info, None)?,
            })
        }
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}

/// The rotating semaphore-slot index. Advances once per presented frame,
/// wrapping at the image count; never driven by the acquired image index.
#[derive(Debug, Clone, Copy)]
pub struct FrameCursor {
    slot: usize,
    count: usize,
}

impl FrameCursor {
    pub fn new(count: usize) -> Self {
        debug_assert!(count > 0);
        Self { slot: 0, count }
    }

    pub fn index(&self) -> usize {
        self.slot
    }

    pub fn advance(&mut self) {
        self.slot = (self.slot + 1) % self.count;
    }
}

/// Owns the per-image frame slots and the cursor pairing submissions with
/// their completion signals. Recreated whenever the swapchain is rebuilt,
/// since the image count may change.
pub struct FrameSynchronizer {
    ctx: Arc<VulkanContext>,
    slots: Vec<FrameSlot>,
    cursor: FrameCursor,
}

impl FrameSynchronizer {
    pub fn new(ctx: &Arc<VulkanContext>, image_count: u32) -> Result<Self> {
        let slots = (0..image_count)
            .map(|_| FrameSlot::new(&ctx.device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            ctx: ctx.clone(),
            slots,
            cursor: FrameCursor::new(image_count as usize),
        })
    }

    /// The slot the current iteration's semaphore pair comes from.
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.cursor.index()]
    }

    /// Acquire the next presentable image, signaling the current slot's
    /// image-available semaphore when it is ready.
    ///
    /// An out-of-date or suboptimal swapchain reports `SwapchainStale`; the
    /// caller abandons the frame and rebuilds.
    pub fn acquire_next(
        &self,
        swapchain: &SwapchainManager,
    ) -> Result<(u32, vk::Semaphore), FrameError> {
        let semaphore = self.current().image_available;

        let result = unsafe {
            swapchain.loader().acquire_next_image(
                swapchain.handle(),
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                Err(FrameError::SwapchainStale)
            }
            Ok((image_index, false)) => Ok((image_index, semaphore)),
            Err(e) => Err(FrameError::Device(e)),
        }
    }

    /// Block until the fence for `image_index` signals, then reset it for
    /// this frame's submission.
    ///
    /// Every resource tied to that image (command buffer, attachments, the
    /// uniform block about to be overwritten) is free for reuse once this
    /// returns.
    pub fn wait_and_reset(&self, image_index: u32) -> Result<vk::Fence, FrameError> {
        let fence = self.slots[image_index as usize].in_flight;

        unsafe {
            self.ctx.device.wait_for_fences(&[fence], true, u64::MAX)?;
            self.ctx.device.reset_fences(&[fence])?;
        }

        Ok(fence)
    }

    /// Rotate to the next semaphore slot. Called exactly once per presented
    /// frame.
    pub fn advance(&mut self) {
        self.cursor.advance();
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        for slot in &self.slots {
            slot.destroy(&self.ctx.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FrameCursor;

    #[test]
    fn cursor_wraps_at_image_count() {
        let mut cursor = FrameCursor::new(3);
        let seen: Vec<usize> = (0..7)
            .map(|_| {
                let index = cursor.index();
                cursor.advance();
                index
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn cursor_is_independent_of_acquired_image_order() {
        // The driver may hand back images in any order; the cursor must
        // still step 0,1,2,0,... regardless.
        let acquired_order = [0u32, 0, 1, 2, 1, 0, 2];
        let mut cursor = FrameCursor::new(3);
        for (frame, _image) in acquired_order.iter().enumerate() {
            assert_eq!(cursor.index(), frame % 3);
            cursor.advance();
        }
    }

    /// Which fence the loop waits on before re-recording an image's command
    /// buffer. Pairing by acquired image is what `wait_and_reset` does;
    /// pairing by cursor slot is the conflation this module exists to
    /// prevent.
    #[derive(Clone, Copy)]
    enum FencePairing {
        ByAcquiredImage,
        ByCursorSlot,
    }

    /// CPU-side model of one acquire → wait → record → submit → present
    /// iteration per acquired image, with fences as booleans under the
    /// adversarial schedule where GPU work only completes when the CPU
    /// waits for it. `pending[i]` means image `i` was submitted and its
    /// completion has not been awaited.
    fn simulate(pairing: FencePairing, acquired_order: &[usize]) -> Result<(), String> {
        const IMAGE_COUNT: usize = 3;

        let mut pending = [false; IMAGE_COUNT];
        let mut cursor = FrameCursor::new(IMAGE_COUNT);

        for &image in acquired_order {
            let acquire_slot = cursor.index();

            // wait_and_reset blocks until the chosen fence signals
            let fence_index = match pairing {
                FencePairing::ByAcquiredImage => image,
                FencePairing::ByCursorSlot => cursor.index(),
            };
            pending[fence_index] = false;

            // re-record + submit
            if pending[image] {
                return Err(format!("image {image} re-recorded while still in flight"));
            }
            pending[image] = true;

            // present must wait on the same slot's render-finished semaphore
            let present_slot = cursor.index();
            if acquire_slot != present_slot {
                return Err("semaphore slot changed mid-frame".into());
            }

            cursor.advance();
        }

        Ok(())
    }

    // Non-sequential acquisition pattern with repeats, as a driver may
    // legally produce
    const ACQUIRED_ORDER: [usize; 12] = [0, 1, 0, 2, 1, 1, 0, 2, 2, 0, 1, 2];

    #[test]
    fn fence_paired_with_acquired_image_is_race_free() {
        assert_eq!(simulate(FencePairing::ByAcquiredImage, &ACQUIRED_ORDER), Ok(()));
    }

    #[test]
    fn fence_paired_with_cursor_slot_races_on_repeated_images() {
        assert!(simulate(FencePairing::ByCursorSlot, &ACQUIRED_ORDER).is_err());
    }
}
