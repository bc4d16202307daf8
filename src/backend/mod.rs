// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Frame ring and swapchain are generic over the device traits so they can be
// driven by a simulated GPU in tests.

pub mod buffer;
pub mod deletion;
pub mod device;
pub mod frame;
pub mod frame_loop;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub mod mock;

pub use buffer::GpuBuffer;
pub use deletion::DeletionQueue;
pub use device::{DeviceIdle, VulkanDevice};
pub use frame_loop::{FrameLoop, FrameTarget};
pub use swapchain::{SurfacePreferences, Swapchain};
pub use sync::SyncError;
