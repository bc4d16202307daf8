// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen, and the
// acquire/present/recreate protocol around it. Out-of-date and suboptimal
// results never throw: they flip the swapchain into `NeedsRecreation` and the
// render loop rebuilds it when convenient.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::sync::timeout_ns;
use super::DeviceIdle;

/// Swapchain images are rendered to and filled by transfer commands
pub const REQUIRED_IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
);

/// Formats tried when the configured one is unavailable, best first
const HIGH_FIDELITY_FORMATS: [vk::Format; 5] = [
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
];

/// What the surface supports on a given GPU
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// A surface is usable with at least one format and one present mode
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Query surface capabilities, formats and present modes for a GPU
pub fn query_surface_support(
    surface_loader: &ash::extensions::khr::Surface,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<SurfaceSupport> {
    unsafe {
        Ok(SurfaceSupport {
            capabilities: surface_loader
                .get_physical_device_surface_capabilities(physical_device, surface)
                .context("Failed to query surface capabilities")?,
            formats: surface_loader
                .get_physical_device_surface_formats(physical_device, surface)
                .context("Failed to query surface formats")?,
            present_modes: surface_loader
                .get_physical_device_surface_present_modes(physical_device, surface)
                .context("Failed to query present modes")?,
        })
    }
}

/// Queue families involved in rendering and presenting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSharing {
    /// One family owns the images
    Exclusive,
    /// Graphics and present families share them
    Concurrent([u32; 2]),
}

/// User preferences applied during negotiation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfacePreferences {
    pub format: Option<vk::SurfaceFormatKHR>,
    pub present_mode: Option<vk::PresentModeKHR>,
    /// Forces FIFO regardless of `present_mode`
    pub vsync: bool,
}

/// Everything needed to build a swapchain, negotiated from `SurfaceSupport`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub image_count: u32,
    pub image_usage: vk::ImageUsageFlags,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub sharing: ImageSharing,
}

impl SwapchainDesc {
    pub fn negotiate(
        support: &SurfaceSupport,
        preferences: &SurfacePreferences,
        families: QueueFamilies,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        if !support.is_adequate() {
            anyhow::bail!(
                "Surface is not usable: {} formats, {} present modes",
                support.formats.len(),
                support.present_modes.len()
            );
        }

        let caps = &support.capabilities;
        if !caps.supported_usage_flags.contains(REQUIRED_IMAGE_USAGE) {
            anyhow::bail!(
                "Surface images support {:?}, need {:?}",
                caps.supported_usage_flags,
                REQUIRED_IMAGE_USAGE
            );
        }

        Ok(Self {
            image_count: choose_image_count(caps),
            image_usage: REQUIRED_IMAGE_USAGE,
            format: choose_surface_format(&support.formats, preferences.format)
                .context("No suitable surface format")?,
            extent: choose_extent(caps, width, height),
            present_mode: choose_present_mode(&support.present_modes, preferences),
            pre_transform: caps.current_transform,
            composite_alpha: choose_composite_alpha(caps.supported_composite_alpha),
            sharing: choose_sharing(families),
        })
    }
}

/// Configured pair, else a high-fidelity format, else the first reported
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: Option<vk::SurfaceFormatKHR>,
) -> Option<vk::SurfaceFormatKHR> {
    // A lone UNDEFINED entry means the surface takes anything
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(preferred.unwrap_or(vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }));
        }
    }

    if let Some(preferred) = preferred {
        if formats.contains(&preferred) {
            return Some(preferred);
        }
    }

    HIGH_FIDELITY_FORMATS
        .iter()
        .find_map(|&wanted| {
            formats.iter().copied().find(|f| {
                f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first().copied())
}

/// vsync forces FIFO; otherwise configured mode, else MAILBOX, else FIFO
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferences: &SurfacePreferences,
) -> vk::PresentModeKHR {
    if preferences.vsync {
        return vk::PresentModeKHR::FIFO;
    }

    preferences
        .present_mode
        .filter(|mode| present_modes.contains(mode))
        .or_else(|| {
            present_modes
                .iter()
                .copied()
                .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        })
        .unwrap_or(vk::PresentModeKHR::FIFO) // FIFO is always supported
}

/// One more than the minimum for triple buffering, within the device limit
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = caps.min_image_count + 1;
    // max_image_count == 0 means no upper limit
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        caps.max_image_count
    } else {
        image_count
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub fn choose_sharing(families: QueueFamilies) -> ImageSharing {
    if families.graphics == families.present {
        ImageSharing::Exclusive
    } else {
        ImageSharing::Concurrent([families.graphics, families.present])
    }
}

fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&alpha| supported.contains(alpha))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Device operations the swapchain needs
pub trait PresentDevice: DeviceIdle {
    fn query_support(&self) -> Result<SurfaceSupport>;
    fn queue_families(&self) -> QueueFamilies;

    /// Creating a swapchain also creates its images.
    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    /// Returns the image index and whether the swapchain is suboptimal
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;

    /// Returns whether the swapchain is suboptimal
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Ready,
    /// Out of date or suboptimal; rebuild with `recreate`
    NeedsRecreation,
    Destroyed,
}

pub struct Swapchain<D: PresentDevice> {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    state: SurfaceState,
    preferences: SurfacePreferences,
    device: Arc<D>,
}

/// Swapchain handle with its images and views, before it's installed
struct Built {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    desc: SwapchainDesc,
}

impl<D: PresentDevice> Swapchain<D> {
    pub fn new(
        device: Arc<D>,
        preferences: SurfacePreferences,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let built = Self::build(&device, &preferences, width, height, vk::SwapchainKHR::null())?;

        Ok(Self {
            swapchain: built.swapchain,
            images: built.images,
            image_views: built.image_views,
            format: built.desc.format,
            extent: built.desc.extent,
            present_mode: built.desc.present_mode,
            state: SurfaceState::Ready,
            preferences,
            device,
        })
    }

    /// Rebuild for a new window size.
    ///
    /// Waits for the device to go idle, builds the new swapchain while the old
    /// one is still alive so the driver can hand resources over, then destroys
    /// the old views and handle. On failure the old swapchain stays in place.
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<()> {
        if self.state == SurfaceState::Destroyed {
            anyhow::bail!("Cannot recreate a destroyed swapchain");
        }
        log::info!("Recreating swapchain: {}x{}", width, height);

        self.device.wait_idle()?;

        let built = Self::build(&self.device, &self.preferences, width, height, self.swapchain)?;

        self.destroy_views();
        self.device.destroy_swapchain(self.swapchain);

        self.swapchain = built.swapchain;
        self.images = built.images;
        self.image_views = built.image_views;
        self.format = built.desc.format;
        self.extent = built.desc.extent;
        self.present_mode = built.desc.present_mode;
        self.state = SurfaceState::Ready;
        Ok(())
    }

    fn build(
        device: &Arc<D>,
        preferences: &SurfacePreferences,
        width: u32,
        height: u32,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Built> {
        let support = device.query_support()?;
        let desc = SwapchainDesc::negotiate(
            &support,
            preferences,
            device.queue_families(),
            width,
            height,
        )?;

        log::info!(
            "Swapchain: {:?} {:?}, {:?}, {}x{}, {} images, {:?}",
            desc.format.format,
            desc.format.color_space,
            desc.present_mode,
            desc.extent.width,
            desc.extent.height,
            desc.image_count,
            desc.sharing
        );

        let swapchain = device
            .create_swapchain(&desc, old_swapchain)
            .context("Failed to create swapchain")?;

        let images = match device.swapchain_images(swapchain) {
            Ok(images) => images,
            Err(e) => {
                device.destroy_swapchain(swapchain);
                return Err(e.context("Failed to get swapchain images"));
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            match device.create_image_view(image, desc.format.format) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for view in image_views {
                        device.destroy_image_view(view);
                    }
                    device.destroy_swapchain(swapchain);
                    return Err(e.context("Failed to create image view"));
                }
            }
        }

        log::info!("Created swapchain with {} images", images.len());

        Ok(Built {
            swapchain,
            images,
            image_views,
            desc,
        })
    }

    /// Acquire next image for rendering
    ///
    /// `semaphore` is signaled once the image is actually available. Returns
    /// `None` when the swapchain is out of date; a suboptimal swapchain still
    /// yields an index but is flagged for recreation.
    pub fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        timeout: Duration,
    ) -> Result<Option<u32>> {
        if self.state == SurfaceState::Destroyed {
            anyhow::bail!("Cannot acquire from a destroyed swapchain");
        }

        let result = self
            .device
            .acquire_next_image(self.swapchain, timeout_ns(timeout), semaphore);

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain suboptimal on acquire");
                    self.state = SurfaceState::NeedsRecreation;
                }
                Ok(Some(index))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date on acquire");
                self.state = SurfaceState::NeedsRecreation;
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present rendered image to screen
    ///
    /// Returns whether the image was queued for display. Suboptimal counts as
    /// presented but flags the swapchain for recreation.
    pub fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool> {
        if self.state == SurfaceState::Destroyed {
            anyhow::bail!("Cannot present to a destroyed swapchain");
        }

        let result = self
            .device
            .queue_present(queue, self.swapchain, image_index, wait_semaphore);

        match result {
            Ok(suboptimal) => {
                if suboptimal {
                    log::debug!("Swapchain suboptimal on present");
                    self.state = SurfaceState::NeedsRecreation;
                }
                Ok(true)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date on present");
                self.state = SurfaceState::NeedsRecreation;
                Ok(false)
            }
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    /// Flag for rebuild, e.g. after the window was resized
    pub fn mark_needs_recreation(&mut self) {
        if self.state == SurfaceState::Ready {
            self.state = SurfaceState::NeedsRecreation;
        }
    }

    /// Destroy views and swapchain. The device must be idle.
    pub fn destroy(&mut self) {
        if self.state == SurfaceState::Destroyed {
            return;
        }
        self.destroy_views();
        self.device.destroy_swapchain(self.swapchain);
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
        self.state = SurfaceState::Destroyed;
    }

    fn destroy_views(&mut self) {
        for view in self.image_views.drain(..) {
            self.device.destroy_image_view(view);
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn needs_recreation(&self) -> bool {
        self.state == SurfaceState::NeedsRecreation
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.images.get(index as usize).copied()
    }

    pub fn image_view(&self, index: u32) -> Option<vk::ImageView> {
        self.image_views.get(index as usize).copied()
    }
}

impl<D: PresentDevice> Drop for Swapchain<D> {
    fn drop(&mut self) {
        if self.state != SurfaceState::Destroyed {
            if let Err(e) = self.device.wait_idle() {
                log::error!("wait_idle failed while destroying swapchain: {:?}", e);
            }
            self.destroy();
        }
    }
}
