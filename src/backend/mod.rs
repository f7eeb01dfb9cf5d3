// Backend module - Vulkan abstraction layer

pub mod buffer;
pub mod commands;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::Buffer;
pub use commands::CommandRecorder;
pub use device::VulkanContext;
pub use image::Texture;
pub use swapchain::SwapchainManager;
pub use sync::{FrameError, FrameSynchronizer};
