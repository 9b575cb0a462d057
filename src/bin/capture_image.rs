// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use chrono::offset::Local;
use chrono::DateTime;
use clap::Parser;
use log::info;

use camera_console::camera_controller::{CameraController, CaptureWhen, ControllerConfig};
use camera_console::capture_device::ConfigurationRequest;
use camera_console::simulated_camera::{SimulatedCamera, SimulatedCameraConfig};

/// Applies the given settings, lets the buffer fill, and saves one frame.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Directory the PNG is written to.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Save the frame captured this long ago; -1 waits for the next frame.
    #[arg(long, default_value = "-1.0", allow_hyphen_values = true)]
    seconds_ago: f64,

    #[arg(long, default_value = "7.0")]
    gain: f32,

    #[arg(long, default_value = "15625")]
    exposure_us: u32,

    /// Use automatic exposure and white balance instead.
    #[arg(long)]
    auto: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let request = ConfigurationRequest{analogue_gain: args.gain,
                                       exposure_time_us: args.exposure_us,
                                       auto_exposure: args.auto,
                                       auto_white_balance: args.auto,
                                       ..Default::default()};
    let config = ControllerConfig{initial: request, ..Default::default()};
    let camera = SimulatedCamera::new(SimulatedCameraConfig::default());
    let controller = CameraController::new(Box::new(camera), config)?;

    let when = CaptureWhen::from(args.seconds_ago);
    if let CaptureWhen::SecondsAgo(seconds_ago) = when {
        // Give the buffer time to hold a frame that old.
        thread::sleep(Duration::from_secs_f64(seconds_ago.max(0.0))
                      + Duration::from_millis(100));
    }
    let path = controller.capture_and_save(&args.output, when)?;

    let latest = controller.buffer().latest()?;
    let now: DateTime<Local> = Local::now();
    info!("Wrote {} at {}; gain {:.2} exposure {}us lux {:.0}",
          path.display(), now.format("%d/%m/%Y %T"),
          latest.exposure.analogue_gain, latest.exposure.exposure_time_us,
          latest.environment.lux);
    Ok(())
}
