// Simulated GPU for tests
//
// Hands out fake handles, queues submissions and retires them lazily (on a
// fence wait or idle wait), and panics on the misuse a validation layer would
// report: resetting an in-flight fence, re-recording an in-flight command
// buffer, double-signaling or waiting on an unsignaled semaphore.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::swapchain::{PresentDevice, QueueFamilies, SurfaceSupport, SwapchainDesc};
use super::sync::{FrameDevice, FrameSubmission};
use super::DeviceIdle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    Submit {
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    },
    WaitIdle,
    CreateSwapchain {
        old: vk::SwapchainKHR,
    },
    DestroySwapchain(vk::SwapchainKHR),
    CreateImageView(vk::ImageView),
    DestroyImageView(vk::ImageView),
    Acquire(u32),
    Present(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Fence,
    Semaphore,
    CommandPool,
    Swapchain,
    ImageView,
}

#[derive(Default)]
struct SemaphoreState {
    signaled: bool,
    pending_signals: u32,
}

struct MockState {
    next_handle: u64,
    live: HashMap<u64, Kind>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, SemaphoreState>,
    queue: VecDeque<FrameSubmission>,
    in_flight_commands: HashSet<u64>,
    events: Vec<Event>,
    submissions: usize,
    hung: bool,
    fail_after: Option<usize>,
    support: SurfaceSupport,
    families: QueueFamilies,
    swapchains: HashMap<u64, Vec<vk::Image>>,
    last_desc: Option<SwapchainDesc>,
    next_image: u32,
    out_of_date: bool,
    suboptimal: bool,
}

pub struct MockDevice {
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        };

        Arc::new(Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                live: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                queue: VecDeque::new(),
                in_flight_commands: HashSet::new(),
                events: Vec::new(),
                submissions: 0,
                hung: false,
                fail_after: None,
                support: SurfaceSupport {
                    capabilities,
                    formats: vec![vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_SRGB,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    }],
                    present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                },
                families: QueueFamilies {
                    graphics: 0,
                    present: 0,
                },
                swapchains: HashMap::new(),
                last_desc: None,
                next_image: 0,
                out_of_date: false,
                suboptimal: false,
            }),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions
    }

    /// While hung, queued submissions never complete
    pub fn set_hung(&self, hung: bool) {
        self.state.lock().hung = hung;
    }

    /// Allow `count` more object creations, then fail every one after
    pub fn fail_creation_after(&self, count: usize) {
        self.state.lock().fail_after = Some(count);
    }

    pub fn set_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.lock().support.formats = formats;
    }

    pub fn set_present_modes(&self, modes: Vec<vk::PresentModeKHR>) {
        self.state.lock().support.present_modes = modes;
    }

    pub fn set_min_image_count(&self, count: u32) {
        self.state.lock().support.capabilities.min_image_count = count;
    }

    pub fn set_supported_usage(&self, usage: vk::ImageUsageFlags) {
        self.state.lock().support.capabilities.supported_usage_flags = usage;
    }

    pub fn set_queue_families(&self, families: QueueFamilies) {
        self.state.lock().families = families;
    }

    pub fn set_out_of_date(&self, out_of_date: bool) {
        self.state.lock().out_of_date = out_of_date;
    }

    pub fn set_suboptimal(&self, suboptimal: bool) {
        self.state.lock().suboptimal = suboptimal;
    }

    pub fn last_swapchain_desc(&self) -> Option<SwapchainDesc> {
        self.state.lock().last_desc
    }

    pub fn create_test_semaphore(&self) -> vk::Semaphore {
        let mut state = self.state.lock();
        let raw = state.alloc(Kind::Semaphore);
        state.semaphores.insert(raw, SemaphoreState::default());
        vk::Semaphore::from_raw(raw)
    }

    /// Stand-in for the presentation engine signaling an acquire semaphore
    pub fn signal_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.signal(semaphore);
    }

    /// Stand-in for a queue operation waiting on `semaphore`
    pub fn wait_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().consume(semaphore);
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence.as_raw()).copied().unwrap_or(false)
    }

    pub fn semaphore_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.state
            .lock()
            .semaphores
            .get(&semaphore.as_raw())
            .map_or(false, |s| s.signaled)
    }

    pub fn semaphore_pending_ops(&self, semaphore: vk::Semaphore) -> u32 {
        self.state
            .lock()
            .semaphores
            .get(&semaphore.as_raw())
            .map_or(0, |s| s.pending_signals)
    }

    pub fn is_alive<H: Handle>(&self, handle: H) -> bool {
        self.state.lock().live.contains_key(&handle.as_raw())
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live_image_views(&self) -> usize {
        self.count_live(Kind::ImageView)
    }

    pub fn live_swapchains(&self) -> usize {
        self.count_live(Kind::Swapchain)
    }

    fn count_live(&self, kind: Kind) -> usize {
        self.state.lock().live.values().filter(|&&k| k == kind).count()
    }
}

impl MockState {
    fn alloc(&mut self, kind: Kind) -> u64 {
        let raw = self.next_handle;
        self.next_handle += 1;
        self.live.insert(raw, kind);
        raw
    }

    fn create(&mut self, kind: Kind) -> Result<u64> {
        if let Some(left) = self.fail_after.as_mut() {
            if *left == 0 {
                anyhow::bail!("simulated {:?} creation failure", kind);
            }
            *left -= 1;
        }
        Ok(self.alloc(kind))
    }

    fn release(&mut self, raw: u64, kind: Kind) {
        match self.live.remove(&raw) {
            Some(found) => assert_eq!(found, kind, "destroyed handle {raw} as the wrong type"),
            None => panic!("double destroy of {kind:?} {raw}"),
        }
    }

    fn signal(&mut self, semaphore: vk::Semaphore) {
        let sem = self
            .semaphores
            .get_mut(&semaphore.as_raw())
            .expect("signal of unknown semaphore");
        assert!(!sem.signaled, "semaphore {semaphore:?} is already signaled");
        sem.signaled = true;
    }

    fn consume(&mut self, semaphore: vk::Semaphore) {
        let sem = self
            .semaphores
            .get_mut(&semaphore.as_raw())
            .expect("wait on unknown semaphore");
        assert!(
            sem.signaled || sem.pending_signals > 0,
            "wait on semaphore {semaphore:?} that will never be signaled"
        );
        if sem.signaled {
            sem.signaled = false;
        } else {
            sem.pending_signals -= 1;
        }
    }

    /// Retire queued submissions in order, up to and including `until`
    fn retire(&mut self, until: Option<vk::Fence>) {
        while let Some(submission) = self.queue.pop_front() {
            self.in_flight_commands
                .remove(&submission.command_buffer.as_raw());
            if let Some(sem) = self.semaphores.get_mut(&submission.signal_semaphore.as_raw()) {
                if sem.pending_signals > 0 {
                    sem.pending_signals -= 1;
                    sem.signaled = true;
                }
            }
            self.fences.insert(submission.fence.as_raw(), true);
            if Some(submission.fence) == until {
                break;
            }
        }
    }
}

impl DeviceIdle for MockDevice {
    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.hung {
            state.retire(None);
        }
        state.events.push(Event::WaitIdle);
        Ok(())
    }
}

impl FrameDevice for MockDevice {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.create(Kind::Fence)?;
        state.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        assert!(
            !state.queue.iter().any(|s| s.fence == fence),
            "destroying fence {fence:?} still in use by a submission"
        );
        state.release(fence.as_raw(), Kind::Fence);
        state.fences.remove(&fence.as_raw());
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let raw = state.create(Kind::Semaphore)?;
        state.semaphores.insert(raw, SemaphoreState::default());
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.release(semaphore.as_raw(), Kind::Semaphore);
        state.semaphores.remove(&semaphore.as_raw());
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<bool> {
        let mut state = self.state.lock();
        state.events.push(Event::WaitFence(fence));

        if state.fences.get(&fence.as_raw()).copied().unwrap_or(false) {
            return Ok(true);
        }
        let queued = state.queue.iter().any(|s| s.fence == fence);
        if queued && !state.hung {
            state.retire(Some(fence));
            return Ok(true);
        }
        Ok(false)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        assert!(
            !state.queue.iter().any(|s| s.fence == fence),
            "resetting fence {fence:?} while its submission is in flight"
        );
        state.fences.insert(fence.as_raw(), false);
        state.events.push(Event::ResetFence(fence));
        Ok(())
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let raw = self.state.lock().create(Kind::CommandPool)?;
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        assert!(state.queue.is_empty(), "destroying command pool with work in flight");
        state.release(pool.as_raw(), Kind::CommandPool);
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        Ok((0..count)
            .map(|_| {
                // Freed with the pool, so not tracked as live objects
                let raw = state.next_handle;
                state.next_handle += 1;
                vk::CommandBuffer::from_raw(raw)
            })
            .collect())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        assert!(
            !state.in_flight_commands.contains(&command_buffer.as_raw()),
            "recording command buffer {command_buffer:?} while it is in flight"
        );
        state.events.push(Event::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.state
            .lock()
            .events
            .push(Event::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn submit(&self, submission: &FrameSubmission) -> Result<()> {
        let mut state = self.state.lock();
        assert!(
            !state.fences.get(&submission.fence.as_raw()).copied().unwrap_or(true),
            "submitting with a signaled or unknown fence"
        );
        state.consume(submission.wait_semaphore);

        let signal = state
            .semaphores
            .get_mut(&submission.signal_semaphore.as_raw())
            .expect("signal of unknown semaphore");
        assert!(
            !signal.signaled && signal.pending_signals == 0,
            "semaphore {:?} already has a signal pending",
            submission.signal_semaphore
        );
        signal.pending_signals += 1;

        state
            .in_flight_commands
            .insert(submission.command_buffer.as_raw());
        state.queue.push_back(*submission);
        state.submissions += 1;
        state.events.push(Event::Submit {
            command_buffer: submission.command_buffer,
            fence: submission.fence,
        });
        Ok(())
    }
}

impl PresentDevice for MockDevice {
    fn query_support(&self) -> Result<SurfaceSupport> {
        Ok(self.state.lock().support.clone())
    }

    fn queue_families(&self) -> QueueFamilies {
        self.state.lock().families
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        let raw = state.create(Kind::Swapchain)?;
        let images = (0..desc.image_count)
            .map(|_| {
                let image = vk::Image::from_raw(state.next_handle);
                state.next_handle += 1;
                image
            })
            .collect();
        state.swapchains.insert(raw, images);
        state.last_desc = Some(*desc);
        state.next_image = 0;
        state.events.push(Event::CreateSwapchain { old: old_swapchain });
        Ok(vk::SwapchainKHR::from_raw(raw))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.release(swapchain.as_raw(), Kind::Swapchain);
        state.swapchains.remove(&swapchain.as_raw());
        state.events.push(Event::DestroySwapchain(swapchain));
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain.as_raw())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown swapchain"))
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        let view = vk::ImageView::from_raw(state.create(Kind::ImageView)?);
        state.events.push(Event::CreateImageView(view));
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        state.release(view.as_raw(), Kind::ImageView);
        state.events.push(Event::DestroyImageView(view));
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        if state.out_of_date {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        let image_count = state
            .swapchains
            .get(&swapchain.as_raw())
            .map_or(0, |images| images.len() as u32);
        if image_count == 0 {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }

        state.signal(semaphore);
        let index = state.next_image % image_count;
        state.next_image += 1;
        state.events.push(Event::Acquire(index));
        Ok((index, state.suboptimal))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.consume(wait_semaphore);
        if state.out_of_date {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        state.events.push(Event::Present(image_index));
        Ok(state.suboptimal)
    }
}
