pub mod app;
pub mod demo;
pub mod environment;
pub mod error;
pub mod gpu;
pub mod renderer;
pub mod scene;
pub mod settings;
pub mod time;

use app::App;
use settings::RasterSettings;
use winit::event_loop::EventLoop;

pub use environment::Environment;
pub use error::{RasterError, RasterResult};
pub use renderer::{RenderStats, SceneRasterizer};
pub use settings::Resolution;

/// Installs the env_logger backend. `RUST_LOG` overrides the default `info`
/// level; calling this twice is harmless.
pub fn init_logging() {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}

pub fn run() -> Result<(), winit::error::EventLoopError> {
    init_logging();

    let settings = RasterSettings::load();
    log::info!(
        "Starting scene rasterizer demo at {}x{}",
        settings.resolution.width,
        settings.resolution.height
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(settings);

    let result = event_loop.run_app(&mut app);

    if let Err(ref err) = result {
        log::error!("Application error: {}", err);
    }

    log::info!("Application shutdown complete");

    result
}
