// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::backend::SurfacePreferences;

/// Upper bound on frames in flight; more only adds latency
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub frames: FrameConfig,
    pub surface: SurfaceConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Pacer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.1, 0.2, 0.8, 1.0],
        }
    }
}

/// Frame pacing and resource reclamation
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub frames_in_flight: usize,
    /// Frames a retired resource is kept alive; never below frames_in_flight
    pub reclamation_delay: u64,
    /// 0 waits forever
    pub fence_timeout_ms: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            reclamation_delay: 3,
            fence_timeout_ms: 2000,
        }
    }
}

impl FrameConfig {
    pub fn fence_timeout(&self) -> Duration {
        if self.fence_timeout_ms == 0 {
            Duration::MAX
        } else {
            Duration::from_millis(self.fence_timeout_ms)
        }
    }
}

/// Swapchain preferences
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub format: String,
    pub color_space: String,
    pub present_mode: String,
    pub vsync: bool,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            format: "b8g8r8a8_srgb".to_string(),
            color_space: "srgb_nonlinear".to_string(),
            present_mode: "mailbox".to_string(),
            vsync: false,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.validate();
        Ok(config)
    }

    /// Clamp values that would break frame pacing
    pub fn validate(&mut self) {
        let frames = &mut self.frames;

        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&frames.frames_in_flight) {
            let clamped = frames.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);
            log::warn!(
                "frames_in_flight = {} is out of range, using {}",
                frames.frames_in_flight,
                clamped
            );
            frames.frames_in_flight = clamped;
        }

        // A shorter delay could free resources a queued frame still reads
        let min_delay = frames.frames_in_flight as u64;
        if frames.reclamation_delay < min_delay {
            log::warn!(
                "reclamation_delay = {} is below frames_in_flight, using {}",
                frames.reclamation_delay,
                min_delay
            );
            frames.reclamation_delay = min_delay;
        }
    }

    /// Surface preferences as Vulkan enums; unknown names are ignored
    pub fn surface_preferences(&self) -> SurfacePreferences {
        let format = match (
            parse_format(&self.surface.format),
            parse_color_space(&self.surface.color_space),
        ) {
            (Some(format), Some(color_space)) => Some(vk::SurfaceFormatKHR {
                format,
                color_space,
            }),
            _ => {
                log::warn!(
                    "Unknown surface format '{}'/'{}', negotiating a default",
                    self.surface.format,
                    self.surface.color_space
                );
                None
            }
        };

        let present_mode = parse_present_mode(&self.surface.present_mode);
        if present_mode.is_none() {
            log::warn!(
                "Unknown present mode '{}', negotiating a default",
                self.surface.present_mode
            );
        }

        SurfacePreferences {
            format,
            present_mode,
            vsync: self.surface.vsync,
        }
    }
}

fn parse_format(name: &str) -> Option<vk::Format> {
    match name.to_lowercase().as_str() {
        "b8g8r8a8_srgb" => Some(vk::Format::B8G8R8A8_SRGB),
        "r8g8b8a8_srgb" => Some(vk::Format::R8G8B8A8_SRGB),
        "b8g8r8a8_unorm" => Some(vk::Format::B8G8R8A8_UNORM),
        "r8g8b8a8_unorm" => Some(vk::Format::R8G8B8A8_UNORM),
        "a2b10g10r10_unorm" => Some(vk::Format::A2B10G10R10_UNORM_PACK32),
        "r16g16b16a16_sfloat" => Some(vk::Format::R16G16B16A16_SFLOAT),
        _ => None,
    }
}

fn parse_color_space(name: &str) -> Option<vk::ColorSpaceKHR> {
    match name.to_lowercase().as_str() {
        "srgb_nonlinear" => Some(vk::ColorSpaceKHR::SRGB_NONLINEAR),
        "extended_srgb_linear" => Some(vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        "hdr10_st2084" => Some(vk::ColorSpaceKHR::HDR10_ST2084_EXT),
        _ => None,
    }
}

fn parse_present_mode(name: &str) -> Option<vk::PresentModeKHR> {
    match name.to_lowercase().as_str() {
        "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
        "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
        "fifo" => Some(vk::PresentModeKHR::FIFO),
        "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
        _ => None,
    }
}
