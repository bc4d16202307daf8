// =============================================================================
// RENDERER - Frame loop on top of the backend
// =============================================================================
//
// FRAME FLOW:
// 1. Wait for the GPU to retire the frame slot we're about to reuse
// 2. Release resources retired long enough ago (deletion queue)
// 3. Acquire swapchain image
// 4. Record: fill the image from the staging buffer (or clear it)
// 5. Submit, present, advance to the next slot
//
// The swapchain is rebuilt lazily at the start of a frame once it's flagged,
// never in the middle of one.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::{
    DeletionQueue, DeviceIdle, FrameLoop, FrameTarget, GpuBuffer, Swapchain, VulkanDevice,
};
use crate::config::Config;

/// Whole-image color subresource
const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Field order matters for Drop: everything that borrows the device goes
/// before it, and the window goes last because the surface points into it.
pub struct Renderer {
    /// Image-sized copy source; `None` when the format can't be filled byte-wise
    staging: Option<GpuBuffer>,
    frame_loop: FrameLoop<VulkanDevice>,
    deletion_queue: Arc<DeletionQueue>,
    device: Arc<VulkanDevice>,
    _window: Arc<Window>,

    clear_color: [f32; 4],
    size: (u32, u32),
    minimized: bool,
}

impl Renderer {
    pub fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // Validation only in debug builds, and only if the config asks for it
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(
            &config.window.title,
            enable_validation,
            display,
            window_handle,
        )?;

        let deletion_queue = Arc::new(DeletionQueue::new(config.frames.reclamation_delay));

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            config.surface_preferences(),
            size.width.max(1),
            size.height.max(1),
        )?;

        let frame_loop = FrameLoop::new(
            device.clone(),
            swapchain,
            deletion_queue.clone(),
            config.frames.frames_in_flight,
            device.present_queue,
            config.frames.fence_timeout(),
        )?;

        let mut renderer = Self {
            staging: None,
            frame_loop,
            deletion_queue,
            device,
            _window: window,
            clear_color: config.graphics.clear_color,
            size: (size.width, size.height),
            minimized: size.width == 0 || size.height == 0,
        };
        renderer.staging = renderer.create_staging()?;

        log::info!(
            "Vulkan initialized: {:?} {:?}, {} images, {} frames in flight, reclamation delay {}",
            renderer.frame_loop.swapchain().format().format,
            renderer.frame_loop.swapchain().present_mode(),
            renderer.frame_loop.frames().image_count(),
            renderer.frame_loop.frames().slot_count(),
            renderer.deletion_queue.delay()
        );
        Ok(renderer)
    }

    /// Track the window size. A zero size pauses rendering.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.size = (width, height);
        if width == 0 || height == 0 {
            self.minimized = true;
            return;
        }
        self.minimized = false;
        self.frame_loop.mark_needs_recreation();
    }

    /// Render a single frame. Returns whether an image was presented.
    ///
    /// Any error leaves the GPU state unknown and should end the loop.
    pub fn render_frame(&mut self) -> Result<bool> {
        if self.minimized {
            return Ok(false);
        }

        if self.frame_loop.needs_recreation() {
            self.recreate_swapchain()
                .context("Failed to recreate swapchain")?;
            if self.minimized {
                return Ok(false);
            }
        }

        let device = &self.device.device;
        let staging = self.staging.as_ref().map(|staging| staging.buffer);
        let clear_color = self.clear_color;
        self.frame_loop.run_frame(|target| {
            record_fill(device, target, staging, clear_color);
            Ok(())
        })
    }

    /// Rebuild the swapchain and everything sized by it.
    fn recreate_swapchain(&mut self) -> Result<()> {
        let (width, height) = self.size;
        if width == 0 || height == 0 {
            self.minimized = true;
            return Ok(());
        }

        self.frame_loop.recreate(width, height)?;

        // The old buffer is retired through the deletion queue when replaced
        self.staging = self.create_staging()?;
        log::debug!(
            "{} resources awaiting reclamation at frame {}",
            self.deletion_queue.pending_count(),
            self.deletion_queue.current_frame()
        );
        Ok(())
    }

    /// Host-visible buffer holding one full image of the clear color.
    fn create_staging(&self) -> Result<Option<GpuBuffer>> {
        let swapchain = self.frame_loop.swapchain();
        let format = swapchain.format().format;
        let Some(pixel) = pixel_bytes(format, self.clear_color) else {
            log::info!("{:?} can't be filled byte-wise, clearing instead", format);
            return Ok(None);
        };

        let extent = swapchain.extent();
        let pixels = extent.width as usize * extent.height as usize;
        let data = pixel.repeat(pixels);

        let mut staging = GpuBuffer::new_host_visible(
            &self.device,
            &self.deletion_queue,
            "staging",
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        staging.write(&data)?;
        Ok(Some(staging))
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Err(e) = self.device.wait_idle() {
            log::error!("{:?}", e);
        }

        // Dropping the buffer only queues it; the device is idle, so drain now
        self.staging = None;
        let released = self.deletion_queue.flush_all();
        log::debug!("Released {} deferred resources on shutdown", released);

        // Frame ring, swapchain and device follow in field order
    }
}

fn record_fill(
    device: &ash::Device,
    target: &FrameTarget,
    staging: Option<vk::Buffer>,
    clear_color: [f32; 4],
) {
    let cmd = target.command_buffer;
    let image = target.image;
    let extent = target.extent;
    log::trace!(
        "Filling image {} (view {:?})",
        target.image_index,
        target.image_view
    );

    unsafe {
        // UNDEFINED -> TRANSFER_DST. Source stage matches the acquire
        // semaphore's wait stage so the transition happens after it
        let barrier_to_transfer = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED) // Don't care about old contents
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_RANGE)
            .build();

        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier_to_transfer],
        );

        match staging {
            Some(staging) => {
                let region = vk::BufferImageCopy::builder()
                    .buffer_offset(0)
                    .buffer_row_length(0) // Tightly packed
                    .buffer_image_height(0)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_offset(vk::Offset3D::default())
                    .image_extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    })
                    .build();

                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            None => {
                let clear_color = vk::ClearColorValue {
                    float32: clear_color,
                };
                device.cmd_clear_color_image(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &clear_color,
                    &[COLOR_RANGE],
                );
            }
        }

        // TRANSFER_DST -> PRESENT_SRC
        let barrier_to_present = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_RANGE)
            .build();

        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier_to_present],
        );
    }
}

/// One pixel of `color` as stored in `format`, for the 8-bit RGBA/BGRA family.
fn pixel_bytes(format: vk::Format, color: [f32; 4]) -> Option<[u8; 4]> {
    let [r, g, b, a] = color;
    let (srgb, bgra) = match format {
        vk::Format::B8G8R8A8_SRGB => (true, true),
        vk::Format::B8G8R8A8_UNORM => (false, true),
        vk::Format::R8G8B8A8_SRGB => (true, false),
        vk::Format::R8G8B8A8_UNORM => (false, false),
        _ => return None,
    };

    // Clears take linear values and let the hardware encode; a copy doesn't
    let encode = |c: f32| {
        let c = c.clamp(0.0, 1.0);
        let c = if srgb { linear_to_srgb(c) } else { c };
        (c * 255.0).round() as u8
    };
    let alpha = (a.clamp(0.0, 1.0) * 255.0).round() as u8;

    Some(if bgra {
        [encode(b), encode(g), encode(r), alpha]
    } else {
        [encode(r), encode(g), encode(b), alpha]
    })
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unorm_pixels_follow_channel_order() {
        let color = [1.0, 0.0, 0.2, 1.0];
        assert_eq!(
            pixel_bytes(vk::Format::R8G8B8A8_UNORM, color),
            Some([255, 0, 51, 255])
        );
        assert_eq!(
            pixel_bytes(vk::Format::B8G8R8A8_UNORM, color),
            Some([51, 0, 255, 255])
        );
    }

    #[test]
    fn srgb_pixels_are_encoded() {
        // Linear 0.5 encodes to ~0.7354, i.e. 188
        let bytes = pixel_bytes(vk::Format::B8G8R8A8_SRGB, [0.5, 0.5, 0.5, 0.5]).unwrap();
        assert_eq!(bytes, [188, 188, 188, 128]);
    }

    #[test]
    fn out_of_range_channels_clamp() {
        let bytes = pixel_bytes(vk::Format::R8G8B8A8_UNORM, [-1.0, 2.0, 0.0, 1.0]).unwrap();
        assert_eq!(bytes, [0, 255, 0, 255]);
    }

    #[test]
    fn other_formats_fall_back_to_clear() {
        assert_eq!(
            pixel_bytes(vk::Format::A2B10G10R10_UNORM_PACK32, [0.0; 4]),
            None
        );
        assert_eq!(pixel_bytes(vk::Format::R16G16B16A16_SFLOAT, [0.0; 4]), None);
    }

    #[test]
    fn srgb_curve_endpoints() {
        assert_eq!(linear_to_srgb(0.0), 0.0);
        assert!((linear_to_srgb(1.0) - 1.0).abs() < 1e-6);
        assert!((linear_to_srgb(0.002) - 0.002 * 12.92).abs() < 1e-7);
    }
}
