// Buffers with deferred destruction
//
// A GpuBuffer never destroys itself directly: dropping it (or the last Arc to
// it) queues the destruction on the DeletionQueue, so any frame still reading
// it finishes first.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::deletion::DeletionQueue;
use super::VulkanDevice;

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
    deletion_queue: Arc<DeletionQueue>,
}

impl GpuBuffer {
    /// Create a host-visible buffer the CPU can write and the GPU can read
    pub fn new_host_visible(
        device: &Arc<VulkanDevice>,
        deletion_queue: &Arc<DeletionQueue>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .device
                .create_buffer(&buffer_info, None)
                .context("Failed to create buffer")?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        if let Err(e) = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            if let Err(free_err) = device.allocator.lock().free(allocation) {
                log::error!("Failed to free buffer allocation: {}", free_err);
            }
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).context("Failed to bind buffer memory");
        }

        log::debug!("Created buffer '{}' ({} bytes)", name, size);

        Ok(Self {
            buffer,
            size,
            allocation: Some(allocation),
            device: device.clone(),
            deletion_queue: deletion_queue.clone(),
        })
    }

    /// Copy `data` to the start of the buffer
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer is not host visible")?;

        anyhow::ensure!(
            data.len() as vk::DeviceSize <= self.size,
            "Write of {} bytes overflows buffer of {} bytes",
            data.len(),
            self.size
        );
        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        let device = self.device.clone();
        let buffer = self.buffer;
        let allocation = self.allocation.take();

        self.deletion_queue.push(move || {
            if let Some(allocation) = allocation {
                if let Err(e) = device.allocator.lock().free(allocation) {
                    log::error!("Failed to free buffer allocation: {}", e);
                }
            }
            unsafe { device.device.destroy_buffer(buffer, None) };
        });
    }
}
