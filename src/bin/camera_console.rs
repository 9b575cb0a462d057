// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use tokio::net::TcpListener;

use camera_console::camera_controller::{CameraController, ControllerConfig};
use camera_console::capture_device::ConfigurationRequest;
use camera_console::control_server::{self, ControlState};
use camera_console::preview::{self, PreviewLayout, SharedPreview};
use camera_console::simulated_camera::{SimulatedCamera, SimulatedCameraConfig};

/// Camera console: keeps a rolling window of recent frames, renders a focus
/// preview and serves an HTTP control surface for exposure settings and
/// captures.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Port for the HTTP control surface.
    #[arg(long, default_value = "4500")]
    port: u16,

    /// Directory captures are written to. Created if missing.
    #[arg(long, default_value = "gallery")]
    gallery: PathBuf,

    /// Seconds of recent frames retained.
    #[arg(long, default_value = "2.0")]
    window_secs: f64,

    #[arg(long, default_value = "2028")]
    width: u32,

    #[arg(long, default_value = "1520")]
    height: u32,

    /// Image the simulated camera shows. A test pattern if omitted.
    #[arg(long)]
    source_image: Option<PathBuf>,

    #[arg(long, default_value = "100")]
    preview_interval_ms: u64,

    /// Give up on a reconfiguration that cannot start within this long.
    #[arg(long)]
    reconfigure_timeout_ms: Option<u64>,
}

fn make_camera(args: &Args) -> Result<SimulatedCamera, Box<dyn Error>> {
    let config = SimulatedCameraConfig::default();
    Ok(match &args.source_image {
        Some(path) => {
            let image = image::open(path)?.to_rgb8();
            info!("Simulating from {} ({}x{})", path.display(),
                  image.width(), image.height());
            SimulatedCamera::with_image(config, image)
        },
        None => SimulatedCamera::new(config),
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(1);
    }));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.gallery)?;
    let camera = make_camera(&args)?;
    let config = ControllerConfig{
        window: Duration::from_secs_f64(args.window_secs),
        reconfigure_timeout: args.reconfigure_timeout_ms.map(Duration::from_millis),
        initial: ConfigurationRequest{resolution: (args.width, args.height),
                                      ..Default::default()},
        ..Default::default()};
    let controller = Arc::new(
        tokio::task::spawn_blocking(move || {
            CameraController::new(Box::new(camera), config)
        }).await??);
    info!("Camera: {} limits {:?}", controller.model(), controller.control_limits());

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    let address = listener.local_addr()?.to_string();
    let shared_preview = Arc::new(SharedPreview::new());

    let stop = Arc::new(AtomicBool::new(false));
    let preview_thread = {
        let controller = controller.clone();
        let sink = shared_preview.clone();
        let stop = stop.clone();
        let address = address.clone();
        let interval = Duration::from_millis(args.preview_interval_ms);
        thread::Builder::new().name("preview".to_string()).spawn(move || {
            preview::run_preview_loop(&controller, &*sink, &PreviewLayout::default(),
                                      &address, interval, &stop);
        })?
    };

    let state = ControlState::new(controller.clone(), args.gallery.clone(),
                                  shared_preview);
    control_server::serve(listener, state, shutdown_signal()).await?;

    stop.store(true, Ordering::Relaxed);
    if preview_thread.join().is_err() {
        warn!("Preview thread panicked");
    }
    Ok(())
}
