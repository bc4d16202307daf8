// Frame ring - bounds how many frames the CPU may run ahead of the GPU
//
// Each slot owns a command buffer, an acquire semaphore and a fence. The
// per-image render-finished semaphores are indexed by swapchain image, not by
// slot: the image presented in an iteration is picked by acquisition.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::sync::{timeout_ns, FrameDevice, FrameSlot, FrameSubmission, SlotState, SyncError};

/// Handles of the current slot, valid until `next_frame`.
#[derive(Debug, Clone, Copy)]
pub struct FrameAccessors {
    pub slot: usize,
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

pub struct FrameCoordinator<D: FrameDevice> {
    device: Arc<D>,
    command_pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    render_finished: Vec<vk::Semaphore>,
    current: usize,
    frame_number: u64,
}

impl<D: FrameDevice> FrameCoordinator<D> {
    /// Allocate `slot_count` frame slots and one render-finished semaphore per
    /// swapchain image. Fails as a whole; nothing partial is handed back.
    pub fn new(device: Arc<D>, slot_count: usize, image_count: usize) -> Result<Self> {
        anyhow::ensure!(slot_count > 0, "frame ring needs at least one slot");
        log::info!(
            "Creating frame ring: {} slots, {} swapchain images",
            slot_count,
            image_count
        );

        let command_pool = device.create_command_pool()?;

        // Anything created below is released by Drop if a later step fails
        let mut frames = Self {
            device,
            command_pool,
            slots: Vec::with_capacity(slot_count),
            render_finished: Vec::new(),
            current: 0,
            frame_number: 0,
        };

        let command_buffers = frames
            .device
            .allocate_command_buffers(command_pool, slot_count as u32)?;
        for command_buffer in command_buffers {
            let slot = FrameSlot::new(frames.device.as_ref(), command_buffer)?;
            frames.slots.push(slot);
        }
        frames.create_image_semaphores(image_count)?;

        Ok(frames)
    }

    /// Block until the GPU has retired the previous submission from the
    /// current slot, then reset its fence.
    ///
    /// On timeout the fence is left as is and `SyncError::FenceTimeout` is
    /// returned; retrying or aborting is up to the caller.
    pub fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SyncError> {
        let slot_index = self.current;
        let slot = &mut self.slots[slot_index];

        if !slot.state.in_flight() {
            // Left over from an aborted iteration: claimed but never
            // submitted, so the fence is already reset and nothing is queued
            log::debug!("Frame slot {} was never submitted, reclaiming", slot_index);
            slot.state = SlotState::Claimed;
            return Ok(());
        }

        let signaled = self
            .device
            .wait_for_fence(slot.in_flight_fence, timeout_ns(timeout))?;
        if !signaled {
            log::error!(
                "GPU did not retire frame slot {} within {:?} (frame {})",
                slot_index,
                timeout,
                self.frame_number
            );
            return Err(SyncError::FenceTimeout {
                slot: slot_index,
                timeout,
            });
        }

        self.device.reset_fence(slot.in_flight_fence)?;
        slot.state = SlotState::Claimed;
        Ok(())
    }

    /// Reset and begin the current slot's command buffer.
    pub fn begin_recording(&mut self) -> Result<vk::CommandBuffer, SyncError> {
        let slot_index = self.current;
        let state = self.slots[slot_index].state;
        if state.in_flight() {
            return Err(misuse(
                slot_index,
                "recording into a command buffer that may still be in flight",
            ));
        }

        let slot = &mut self.slots[slot_index];
        self.device.begin_command_buffer(slot.command_buffer)?;
        slot.state = SlotState::Recording;
        Ok(slot.command_buffer)
    }

    pub fn end_recording(&mut self) -> Result<(), SyncError> {
        let slot_index = self.current;
        let slot = &mut self.slots[slot_index];
        if slot.state != SlotState::Recording {
            return Err(misuse(slot_index, "ending a recording that was never begun"));
        }

        self.device.end_command_buffer(slot.command_buffer)?;
        slot.state = SlotState::Recorded;
        Ok(())
    }

    /// Submit the recorded command buffer for `image_index`.
    ///
    /// Waits on the slot's acquire semaphore, signals the image's
    /// render-finished semaphore and the slot fence.
    pub fn submit(&mut self, image_index: u32) -> Result<(), SyncError> {
        let slot_index = self.current;
        let Some(&signal_semaphore) = self.render_finished.get(image_index as usize) else {
            return Err(misuse(slot_index, "submitting for an unknown swapchain image"));
        };

        let slot = &mut self.slots[slot_index];
        if slot.state != SlotState::Recorded {
            return Err(misuse(slot_index, "submitting a command buffer that is not recorded"));
        }

        self.device.submit(&FrameSubmission {
            command_buffer: slot.command_buffer,
            wait_semaphore: slot.image_available,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::TRANSFER,
            signal_semaphore,
            fence: slot.in_flight_fence,
        })?;
        slot.state = SlotState::Pending;

        log::trace!(
            "Frame {} submitted on slot {} for image {}",
            self.frame_number,
            slot_index,
            image_index
        );
        Ok(())
    }

    /// Advance to the next slot. Call exactly once per loop iteration, also
    /// when the iteration was aborted.
    pub fn next_frame(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
        self.frame_number = self.frame_number.wrapping_add(1);
    }

    /// Recreate every fence (signaled) and acquire semaphore (unsignaled).
    ///
    /// Clears any signal that was never waited on, and any wait that will
    /// never be signaled, after the surface was lost mid-frame.
    pub fn reset_sync_primitives(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        for slot in &mut self.slots {
            slot.recreate_primitives(self.device.as_ref())?;
        }
        log::debug!("Reset sync primitives for {} frame slots", self.slots.len());
        Ok(())
    }

    /// Rebuild the per-image semaphores after the swapchain image count changed.
    pub fn resize_image_semaphores(&mut self, image_count: usize) -> Result<()> {
        self.device.wait_idle()?;
        self.destroy_image_semaphores();
        self.create_image_semaphores(image_count)
    }

    pub fn current_frame(&self) -> FrameAccessors {
        let slot = &self.slots[self.current];
        FrameAccessors {
            slot: self.current,
            command_buffer: slot.command_buffer,
            image_available: slot.image_available,
            in_flight_fence: slot.in_flight_fence,
        }
    }

    pub fn render_finished_semaphore(&self, image_index: u32) -> Option<vk::Semaphore> {
        self.render_finished.get(image_index as usize).copied()
    }

    #[cfg(test)]
    pub fn slot_state(&self) -> SlotState {
        self.slots[self.current].state
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[cfg(test)]
    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn image_count(&self) -> usize {
        self.render_finished.len()
    }

    fn create_image_semaphores(&mut self, image_count: usize) -> Result<()> {
        for _ in 0..image_count {
            let semaphore = self.device.create_semaphore()?;
            self.render_finished.push(semaphore);
        }
        Ok(())
    }

    fn destroy_image_semaphores(&mut self) {
        for semaphore in self.render_finished.drain(..) {
            self.device.destroy_semaphore(semaphore);
        }
    }
}

impl<D: FrameDevice> Drop for FrameCoordinator<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle failed while destroying frame ring: {:?}", e);
        }

        self.destroy_image_semaphores();
        for slot in &self.slots {
            slot.destroy(self.device.as_ref());
        }
        // Also frees the command buffers
        self.device.destroy_command_pool(self.command_pool);
    }
}

fn misuse(slot: usize, reason: &'static str) -> SyncError {
    log::error!("Frame slot {}: {}", slot, reason);
    debug_assert!(false, "frame slot {slot}: {reason}");
    SyncError::SlotMisuse { slot, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Event, MockDevice};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn run_frame(frames: &mut FrameCoordinator<MockDevice>, image_index: u32) {
        frames.wait_for_frame(TIMEOUT).unwrap();
        let accessors = frames.current_frame();
        frames.device.signal_semaphore(accessors.image_available);
        frames.begin_recording().unwrap();
        frames.end_recording().unwrap();
        frames.submit(image_index).unwrap();
        // Present would wait on the image's render-finished semaphore
        let render_finished = frames.render_finished_semaphore(image_index).unwrap();
        frames.device.wait_semaphore(render_finished);
        frames.next_frame();
    }

    #[test]
    fn ten_frames_never_record_in_flight_buffer() {
        let device = MockDevice::new();
        let mut frames = FrameCoordinator::new(device.clone(), 3, 3).unwrap();

        for frame in 0..10u32 {
            run_frame(&mut frames, frame % 3);
        }
        assert_eq!(frames.frame_number(), 10);

        // Every submission of a command buffer after the first must be
        // preceded by a wait and a reset of the fence it last signaled
        let events = device.events();
        let mut last_fence: std::collections::HashMap<vk::CommandBuffer, vk::Fence> =
            Default::default();
        let mut waited = std::collections::HashSet::new();
        let mut reset = std::collections::HashSet::new();
        for event in events {
            match event {
                Event::WaitFence(fence) => {
                    waited.insert(fence);
                }
                Event::ResetFence(fence) => {
                    assert!(waited.contains(&fence), "fence reset before it was waited on");
                    reset.insert(fence);
                }
                Event::BeginCommandBuffer(cmd) => {
                    if let Some(fence) = last_fence.get(&cmd) {
                        assert!(reset.contains(fence), "command buffer re-recorded while in flight");
                    }
                }
                Event::Submit { command_buffer, fence } => {
                    last_fence.insert(command_buffer, fence);
                    waited.remove(&fence);
                    reset.remove(&fence);
                }
                _ => {}
            }
        }
        assert_eq!(device.submission_count(), 10);
    }

    #[test]
    fn fence_is_reset_between_claims() {
        let device = MockDevice::new();
        let mut frames = FrameCoordinator::new(device.clone(), 1, 1).unwrap();
        let fence = frames.current_frame().in_flight_fence;

        run_frame(&mut frames, 0);
        assert!(!device.fence_signaled(fence));

        frames.wait_for_frame(TIMEOUT).unwrap();
        let tail: Vec<Event> = device.events().into_iter().rev().take(2).collect();
        assert_eq!(tail, vec![Event::ResetFence(fence), Event::WaitFence(fence)]);
        assert_eq!(frames.slot_state(), SlotState::Claimed);
    }

    #[test]
    fn timeout_leaves_fence_untouched() {
        let device = MockDevice::new();
        let mut frames = FrameCoordinator::new(device.clone(), 1, 1).unwrap();
        run_frame(&mut frames, 0);

        let fence = frames.current_frame().in_flight_fence;
        let resets = |device: &MockDevice| {
            device
                .events()
                .into_iter()
                .filter(|event| *event == Event::ResetFence(fence))
                .count()
        };
        let resets_before = resets(&device);

        device.set_hung(true);
        let err = frames.wait_for_frame(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, SyncError::FenceTimeout { slot: 0, .. }));
        assert_eq!(frames.slot_state(), SlotState::Pending);
        assert_eq!(resets(&device), resets_before);

        device.set_hung(false);
        frames.wait_for_frame(TIMEOUT).unwrap();
        assert_eq!(frames.slot_state(), SlotState::Claimed);
    }

    #[test]
    fn aborted_iteration_reclaims_without_waiting() {
        let device = MockDevice::new();
        let mut frames = FrameCoordinator::new(device.clone(), 2, 2).unwrap();

        // Claim slot 0 then abort before submitting
        frames.wait_for_frame(TIMEOUT).unwrap();
        frames.next_frame();
        run_frame(&mut frames, 1);

        // Back on slot 0: its fence is reset and unsignaled, must not wait
        assert_eq!(frames.current_slot(), 0);
        device.set_hung(true);
        frames.wait_for_frame(TIMEOUT).unwrap();
        assert_eq!(frames.slot_state(), SlotState::Claimed);
        device.set_hung(false);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "in flight")]
    fn recording_unclaimed_slot_aborts_in_debug() {
        let device = MockDevice::new();
        let mut frames = FrameCoordinator::new(device, 2, 2).unwrap();
        let _ = frames.begin_recording();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "unknown swapchain image")]
    fn submitting_unknown_image_aborts_in_debug() {
        let device = MockDevice::new();
        let mut frames = FrameCoordinator::new(device, 2, 2).unwrap();
        frames.wait_for_frame(TIMEOUT).unwrap();
        frames.begin_recording().unwrap();
        frames.end_recording().unwrap();
        let _ = frames.submit(7);
    }

    #[test]
    fn next_frame_wraps_slot_index() {
        let device = MockDevice::new();
        let mut frames = FrameCoordinator::new(device, 3, 3).unwrap();
        let slots: Vec<usize> = (0..7)
            .map(|_| {
                let slot = frames.current_slot();
                frames.next_frame();
                slot
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(frames.frame_number(), 7);
    }

    #[test]
    fn reset_sync_primitives_clears_pending_state() {
        let device = MockDevice::new();
        let mut frames = FrameCoordinator::new(device.clone(), 3, 3).unwrap();

        run_frame(&mut frames, 0);
        // Slot 1 acquired an image but the frame was abandoned
        frames.wait_for_frame(TIMEOUT).unwrap();
        device.signal_semaphore(frames.current_frame().image_available);
        frames.next_frame();

        let old: Vec<FrameAccessors> = (0..3)
            .map(|_| {
                let accessors = frames.current_frame();
                frames.next_frame();
                accessors
            })
            .collect();

        frames.reset_sync_primitives().unwrap();

        for _ in 0..3 {
            let accessors = frames.current_frame();
            assert!(device.fence_signaled(accessors.in_flight_fence));
            assert!(!device.semaphore_signaled(accessors.image_available));
            assert_eq!(device.semaphore_pending_ops(accessors.image_available), 0);
            assert_eq!(frames.slot_state(), SlotState::Pending);
            frames.next_frame();
        }
        for accessors in old {
            assert!(!device.is_alive(accessors.in_flight_fence));
            assert!(!device.is_alive(accessors.image_available));
        }
    }

    #[test]
    fn image_semaphores_follow_image_count() {
        let device = MockDevice::new();
        let mut frames = FrameCoordinator::new(device.clone(), 2, 3).unwrap();
        assert_eq!(frames.image_count(), 3);
        assert!(frames.render_finished_semaphore(2).is_some());
        assert!(frames.render_finished_semaphore(3).is_none());

        frames.resize_image_semaphores(5).unwrap();
        assert_eq!(frames.image_count(), 5);
        assert!(frames.render_finished_semaphore(4).is_some());
    }

    #[test]
    fn failed_construction_releases_everything() {
        let device = MockDevice::new();
        // Pool, then slot 0 (semaphore + fence), then slot 1 fails
        device.fail_creation_after(3);
        assert!(FrameCoordinator::new(device.clone(), 2, 2).is_err());
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn drop_releases_everything() {
        let device = MockDevice::new();
        {
            let mut frames = FrameCoordinator::new(device.clone(), 3, 4).unwrap();
            run_frame(&mut frames, 0);
        }
        assert_eq!(device.live_objects(), 0);
    }
}
