//! Platform collaborators for vkh programs.
//!
//! Provides window creation via winit, a millisecond clock with frame
//! timing, and whole-file loading.

pub mod files;
pub mod timing;

use thiserror::Error;
use winit::dpi::PhysicalSize;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowAttributes};

pub use files::load_binary_file;
pub use timing::{Clock, FrameTimer, FRAME_HISTORY};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Event loop error: {0}")]
    EventLoop(String),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Platform configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            title: "vkh".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

impl PlatformConfig {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_resizable(mut self, resizable: bool) -> Self {
        self.resizable = resizable;
        self
    }

    /// Window attributes for this configuration.
    pub fn window_attributes(&self) -> WindowAttributes {
        Window::default_attributes()
            .with_title(&self.title)
            .with_inner_size(PhysicalSize::new(self.width, self.height))
            .with_resizable(self.resizable)
    }
}

/// Create the event loop, polling continuously for a render loop.
pub fn create_event_loop() -> Result<EventLoop<()>> {
    let event_loop = EventLoop::new().map_err(|e| PlatformError::EventLoop(e.to_string()))?;
    event_loop.set_control_flow(ControlFlow::Poll);
    Ok(event_loop)
}

/// Open a window on a running event loop.
pub fn create_window(event_loop: &ActiveEventLoop, config: &PlatformConfig) -> Result<Window> {
    let window = event_loop
        .create_window(config.window_attributes())
        .map_err(|e| PlatformError::WindowCreation(e.to_string()))?;

    tracing::info!(
        "Opened window \"{}\" ({}x{})",
        config.title,
        config.width,
        config.height
    );
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_override_defaults() {
        let config = PlatformConfig::new("demo")
            .with_size(640, 480)
            .with_resizable(false);
        assert_eq!(
            config,
            PlatformConfig {
                title: "demo".into(),
                width: 640,
                height: 480,
                resizable: false,
            }
        );
    }

    #[test]
    fn io_error_names_the_path() {
        let err = PlatformError::Io {
            path: "shaders/quad.spv".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("shaders/quad.spv"));
    }
}
