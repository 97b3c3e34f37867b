//! Texture array demo.
//!
//! Draws a quad that cycles through eight textures, one every 60 frames,
//! over a clear color that follows the same rotation. Press Escape or close
//! the window to exit.

mod app;
mod config;
mod cycle;
mod pipeline;
mod scene;

use anyhow::Context as _;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::DemoApp;
use crate::config::DemoConfig;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let config = DemoConfig::from_args(std::env::args().skip(1));
    info!("{} starting...", config.title);

    let event_loop = vkh_platform::create_event_loop()?;

    let mut app = DemoApp::new(config);
    event_loop.run_app(&mut app).context("event loop")?;

    app.into_result()
}

fn print_help() {
    eprintln!(
        "vkh texture array demo

USAGE:
    cargo run -p vkh-demo -- [OPTIONS]

OPTIONS:
    --textures <DIR>         Directory with 0.png..7.png (default: textures)
    --shaders <DIR>          Directory with vanilla_vertex.spv and texture_array.spv
                             (default: shaders; without them only the clear is drawn)
    --frames-per-image <N>   Frames each texture stays on screen (default: 60)
    --size <W>x<H>           Window size (default: 800x600)
    --validation             Require Vulkan validation layers (default in debug builds)
    --no-validation          Run without Vulkan validation layers
    --verify-uploads         Read the quad's indices back after upload and compare
    -h, --help               Print this help message

ENVIRONMENT:
    RUST_LOG                 Log filter (e.g. info, debug, vkh=trace)"
    );
}
