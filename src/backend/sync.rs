// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync, grouped per frame slot.
// Device access goes through `FrameDevice` so the frame ring can run against
// any backend that can hand out these handles.

use anyhow::Result;
use ash::vk;
use std::time::Duration;
use thiserror::Error;

use super::DeviceIdle;

/// Errors surfaced by the frame ring.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The slot's fence did not signal in time. Usually means a hung GPU or a
    /// lost device; the fence is left untouched.
    #[error("timed out after {timeout:?} waiting for frame slot {slot}")]
    FenceTimeout { slot: usize, timeout: Duration },

    /// Renderer-side misuse of a frame slot.
    #[error("frame slot {slot}: {reason}")]
    SlotMisuse { slot: usize, reason: &'static str },

    #[error(transparent)]
    Device(#[from] anyhow::Error),
}

/// One queue submission of a recorded frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameSubmission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

/// Device operations the frame ring needs.
pub trait FrameDevice: DeviceIdle {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Returns `false` if the timeout expired before the fence signaled.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn create_command_pool(&self) -> Result<vk::CommandPool>;
    /// Also frees every command buffer allocated from the pool.
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;

    /// Reset the buffer and begin a one-time-submit recording.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    /// Submit to the graphics queue.
    fn submit(&self, submission: &FrameSubmission) -> Result<()>;
}

/// Where a slot is in its claim/record/submit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// The fence may still be outstanding; wait before touching the slot.
    Pending,
    /// Fence observed signaled and reset; nothing in flight.
    Claimed,
    Recording,
    Recorded,
}

impl SlotState {
    /// Whether the GPU can still be using this slot's command buffer.
    pub fn in_flight(self) -> bool {
        self == SlotState::Pending
    }
}

/// Frame synchronization - one per frame in flight
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    /// Signaled by image acquisition, waited on by the submission
    pub image_available: vk::Semaphore,
    /// Signaled by the submission, waited on by the CPU. Created signaled.
    pub in_flight_fence: vk::Fence,
    pub state: SlotState,
}

impl FrameSlot {
    pub fn new<D: FrameDevice>(device: &D, command_buffer: vk::CommandBuffer) -> Result<Self> {
        let image_available = device.create_semaphore()?;
        // Start signaled so the first wait doesn't block forever
        let in_flight_fence = match device.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_available);
                return Err(e);
            }
        };

        Ok(Self {
            command_buffer,
            image_available,
            in_flight_fence,
            state: SlotState::Pending,
        })
    }

    /// Replace both primitives with fresh ones: fence signaled, semaphore
    /// unsignaled. The device must be idle.
    pub fn recreate_primitives<D: FrameDevice>(&mut self, device: &D) -> Result<()> {
        let image_available = device.create_semaphore()?;
        let in_flight_fence = match device.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_available);
                return Err(e);
            }
        };

        device.destroy_semaphore(self.image_available);
        device.destroy_fence(self.in_flight_fence);
        self.image_available = image_available;
        self.in_flight_fence = in_flight_fence;
        self.state = SlotState::Pending;
        Ok(())
    }

    pub fn destroy<D: FrameDevice>(&self, device: &D) {
        device.destroy_semaphore(self.image_available);
        device.destroy_fence(self.in_flight_fence);
    }
}

/// Convert a timeout to Vulkan nanoseconds. `Duration::MAX` waits forever.
pub fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}
