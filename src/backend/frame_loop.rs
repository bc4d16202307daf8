// Frame loop - one iteration of wait / reclaim / acquire / record / submit /
// present, and the rebuild that follows a lost surface.
//
// Generic over the device so the whole protocol runs against the simulated
// GPU in tests. What gets recorded is up to the caller.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::deletion::DeletionQueue;
use super::frame::FrameCoordinator;
use super::swapchain::{PresentDevice, Swapchain};
use super::sync::FrameDevice;

/// The image being rendered this iteration
#[derive(Debug, Clone, Copy)]
pub struct FrameTarget {
    pub command_buffer: vk::CommandBuffer,
    pub image_index: u32,
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    pub extent: vk::Extent2D,
}

pub struct FrameLoop<D: FrameDevice + PresentDevice> {
    frames: FrameCoordinator<D>,
    swapchain: Swapchain<D>,
    deletion_queue: Arc<DeletionQueue>,
    present_queue: vk::Queue,
    fence_timeout: Duration,
}

impl<D: FrameDevice + PresentDevice> FrameLoop<D> {
    pub fn new(
        device: Arc<D>,
        swapchain: Swapchain<D>,
        deletion_queue: Arc<DeletionQueue>,
        frames_in_flight: usize,
        present_queue: vk::Queue,
        fence_timeout: Duration,
    ) -> Result<Self> {
        let frames = FrameCoordinator::new(device, frames_in_flight, swapchain.image_count())?;
        Ok(Self {
            frames,
            swapchain,
            deletion_queue,
            present_queue,
            fence_timeout,
        })
    }

    /// Run one iteration. Returns whether an image was presented.
    ///
    /// The slot ring advances whatever the outcome, so an iteration aborted
    /// by an out-of-date surface or an error still counts as a frame.
    pub fn run_frame<F>(&mut self, record: F) -> Result<bool>
    where
        F: FnOnce(&FrameTarget) -> Result<()>,
    {
        let result = self.draw(record);
        self.frames.next_frame();
        result
    }

    fn draw<F>(&mut self, record: F) -> Result<bool>
    where
        F: FnOnce(&FrameTarget) -> Result<()>,
    {
        // STEP 1: Wait until the GPU is done with this slot
        self.frames.wait_for_frame(self.fence_timeout)?;

        // STEP 2: Anything retired `delay` frames ago is no longer referenced
        let frame_number = self.frames.frame_number();
        self.deletion_queue.flush(frame_number);

        // STEP 3: Acquire next swapchain image
        let frame = self.frames.current_frame();
        log::trace!(
            "Frame {} on slot {} (fence {:?})",
            frame_number,
            frame.slot,
            frame.in_flight_fence
        );
        let Some(image_index) = self
            .swapchain
            .acquire_next_image(frame.image_available, self.fence_timeout)?
        else {
            // Out of date; the caller rebuilds before the next frame
            return Ok(false);
        };

        // STEP 4: Record
        let command_buffer = self.frames.begin_recording()?;
        debug_assert_eq!(command_buffer, frame.command_buffer);
        let target = FrameTarget {
            command_buffer,
            image_index,
            image: self
                .swapchain
                .image(image_index)
                .context("Acquired image index out of range")?,
            image_view: self
                .swapchain
                .image_view(image_index)
                .context("Acquired image has no view")?,
            extent: self.swapchain.extent(),
        };
        record(&target)?;
        self.frames.end_recording()?;

        // STEP 5: Submit and present
        self.frames.submit(image_index)?;
        let render_finished = self
            .frames
            .render_finished_semaphore(image_index)
            .context("No render-finished semaphore for image")?;
        let presented = self
            .swapchain
            .present(self.present_queue, image_index, render_finished)?;

        Ok(presented)
    }

    /// Rebuild the swapchain and the sync state tied to it.
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<()> {
        self.swapchain.recreate(width, height)?;

        // A lost image may have left acquire semaphores signaled and never
        // waited on, or present semaphores waited on and never signaled
        self.frames.reset_sync_primitives()?;
        self.frames
            .resize_image_semaphores(self.swapchain.image_count())?;
        Ok(())
    }

    pub fn needs_recreation(&self) -> bool {
        self.swapchain.needs_recreation()
    }

    pub fn mark_needs_recreation(&mut self) {
        self.swapchain.mark_needs_recreation();
    }

    pub fn swapchain(&self) -> &Swapchain<D> {
        &self.swapchain
    }

    pub fn frames(&self) -> &FrameCoordinator<D> {
        &self.frames
    }
}
