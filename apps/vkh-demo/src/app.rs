//! Window event handling and the frame loop.

use crate::config::{DemoConfig, TEXTURE_ARRAY_SIZE};
use crate::scene::DemoScene;
use ash::vk;
use tracing::{error, info};
use vkh::{DescriptorPoolSizing, DeviceContext, DeviceContextBuilder, GpuError};
use vkh_platform::FrameTimer;
use winit::application::ApplicationHandler;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

pub struct DemoApp {
    config: DemoConfig,
    state: Option<DemoState>,
    failed: Option<anyhow::Error>,
}

/// Fields drop in declaration order: the scene is released in `Drop`,
/// then the context, then the window its surface was created from.
struct DemoState {
    scene: Option<DemoScene>,
    ctx: DeviceContext,
    window: Window,
    timer: FrameTimer,
    needs_rebuild: bool,
}

impl DemoApp {
    pub fn new(config: DemoConfig) -> Self {
        Self {
            config,
            state: None,
            failed: None,
        }
    }

    /// The error that stopped the event loop, if any.
    pub fn into_result(self) -> anyhow::Result<()> {
        match self.failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<DemoState> {
        let window = vkh_platform::create_window(event_loop, &self.config.platform())?;
        let size = window.inner_size();

        let ctx = DeviceContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .extent(size.width, size.height)
            .descriptor_pool(
                DescriptorPoolSizing::new()
                    .with(vk::DescriptorType::SAMPLED_IMAGE, TEXTURE_ARRAY_SIZE)
                    .with(vk::DescriptorType::SAMPLER, 1),
            )
            .build(&window)?;

        info!("GPU: {}", ctx.capabilities().summary());

        let scene = DemoScene::new(&ctx, &self.config)?;

        Ok(DemoState {
            scene: Some(scene),
            ctx,
            window,
            timer: FrameTimer::default(),
            needs_rebuild: false,
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.state = None;
        self.failed = Some(e);
        event_loop.exit();
    }
}

impl ApplicationHandler for DemoApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Demo ready");
            }
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.state = None;
                event_loop.exit();
            }
            WindowEvent::KeyboardInput { event, .. }
                if event.state == ElementState::Pressed
                    && event.logical_key == Key::Named(NamedKey::Escape) =>
            {
                info!("Escape pressed");
                self.state = None;
                event_loop.exit();
            }
            WindowEvent::Resized(_) => {
                if let Some(state) = &mut self.state {
                    state.needs_rebuild = true;
                }
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.render_frame() {
                    self.fail(event_loop, e);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl DemoState {
    fn render_frame(&mut self) -> anyhow::Result<()> {
        if self.needs_rebuild && !self.rebuild_swapchain()? {
            return Ok(());
        }

        self.timer.begin_frame();

        let Some(scene) = &mut self.scene else {
            return Ok(());
        };
        scene.advance();

        let extent = self.ctx.swapchain_extent();
        let device = self.ctx.device();
        let result = self.ctx.draw_frame(|frame| scene.record(device, frame, extent));

        match result {
            Ok(status) => self.needs_rebuild |= status.suboptimal,
            Err(GpuError::SwapchainOutOfDate) => self.needs_rebuild = true,
            Err(e) => return Err(e.into()),
        }

        let (_, average) = self.timer.end_frame();
        if let Some(average_ms) = average {
            info!(
                "Average frame time over {} frames: {average_ms:.3} ms",
                vkh_platform::FRAME_HISTORY
            );
        }
        Ok(())
    }

    /// Recreate the swapchain at the window's size. Returns `false` while
    /// the window is minimized.
    fn rebuild_swapchain(&mut self) -> anyhow::Result<bool> {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(false);
        }

        self.ctx.recreate_swapchain(size.width, size.height)?;
        if let Some(scene) = &mut self.scene {
            scene.rebuild_framebuffers(&self.ctx)?;
        }
        self.needs_rebuild = false;
        Ok(true)
    }
}

impl Drop for DemoState {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            error!("Wait idle failed during shutdown: {e}");
        }
        if let Some(scene) = self.scene.take() {
            if let Err(e) = scene.destroy(&self.ctx) {
                error!("Failed to release demo resources: {e:#}");
            }
        }
    }
}
