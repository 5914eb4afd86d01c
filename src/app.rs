// src/app.rs
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::*,
    event_loop::ActiveEventLoop,
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

use crate::demo::DemoScene;
use crate::gpu::WgpuContext;
use crate::renderer::SceneRasterizer;
use crate::settings::RasterSettings;
use crate::time::SystemTicks;

const SKY_RADIANCE_PATH: &str = "assets/sky.hdr";
const STATS_INTERVAL_SECS: f32 = 5.0;

/// Everything that only exists once the window does.
struct Running {
    window: Arc<Window>,
    context: WgpuContext,
    raster: SceneRasterizer,
    scene: DemoScene,
}

pub struct App {
    settings: RasterSettings,
    running: Option<Running>,
    last_frame: Instant,
    since_stats: f32,
}

impl App {
    pub fn new(settings: RasterSettings) -> Self {
        Self {
            settings,
            running: None,
            last_frame: Instant::now(),
            since_stats: 0.0,
        }
    }

    fn start(&self, event_loop: &ActiveEventLoop) -> Result<Running, String> {
        let resolution = &self.settings.resolution;
        let attributes = Window::default_attributes()
            .with_title("scene-raster")
            .with_inner_size(PhysicalSize::new(resolution.width, resolution.height));
        let window = Arc::new(
            event_loop
                .create_window(attributes)
                .map_err(|err| format!("create window: {err}"))?,
        );

        let mut context = pollster::block_on(WgpuContext::new(window.clone(), &self.settings))
            .map_err(|err| err.to_string())?;
        let mut raster = SceneRasterizer::new(self.settings.clone(), Box::new(SystemTicks::new()));
        raster
            .initialize(&mut context)
            .map_err(|err| format!("rasterizer init: {err}"))?;

        let scene = DemoScene::new(&mut context, &mut raster, Some(Path::new(SKY_RADIANCE_PATH)), 7);
        Ok(Running {
            window,
            context,
            raster,
            scene,
        })
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.running.is_some() {
            return;
        }
        match self.start(event_loop) {
            Ok(running) => {
                running.window.request_redraw();
                self.last_frame = Instant::now();
                self.running = Some(running);
            }
            Err(err) => {
                log::error!("Failed to start: {}", err);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if running.window.id() != id {
            return;
        }

        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                running.context.resize(size);
                running
                    .scene
                    .resize(&mut running.context, &mut running.raster, size.width, size.height);
            }
            WindowEvent::ScaleFactorChanged { .. } => {
                let size = running.window.inner_size();
                running.context.resize(size);
                running
                    .scene
                    .resize(&mut running.context, &mut running.raster, size.width, size.height);
            }
            WindowEvent::RedrawRequested => {
                let now = Instant::now();
                let dt = (now - self.last_frame).as_secs_f32();
                self.last_frame = now;

                running.scene.update(&mut running.raster, dt);
                let stats = running.scene.render(&mut running.context, &mut running.raster);
                if let Err(err) = running.context.present() {
                    log::error!("Present failed: {}", err);
                }

                self.since_stats += dt;
                if self.since_stats >= STATS_INTERVAL_SECS {
                    self.since_stats = 0.0;
                    log::info!(
                        "{} draws, {} program binds, {} shadow passes, {} dropped",
                        stats.draw_calls,
                        stats.program_binds,
                        stats.shadow_passes,
                        stats.dropped_elements
                    );
                }

                running.window.request_redraw();
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: Key::Named(NamedKey::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                event_loop.exit();
            }
            _ => {}
        }
    }
}
