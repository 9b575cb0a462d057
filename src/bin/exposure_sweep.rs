// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::error::Error;
use std::path::Path;

use clap::Parser;
use image::RgbImage;
use log::info;

use camera_console::camera_controller::{self, CameraController, CaptureWhen,
                                        ControllerConfig};
use camera_console::capture_device::ConfigurationRequest;
use camera_console::simulated_camera::{SimulatedCamera, SimulatedCameraConfig};

/// Utility program for capturing a series of images from the camera over a
/// range of gain values and exposure times.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Base name of the output file. We add the gain and exposure values to the
    /// filename and a .png extension.
    #[arg(short, long)]
    output: String,
}

fn mean_brightness(image: &RgbImage) -> f64 {
    let total: u64 = image.as_raw().iter().map(|v| *v as u64).sum();
    total as f64 / image.as_raw().len().max(1) as f64
}

fn main() -> Result<(), Box<dyn Error>> {
    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(1);
    }));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let camera = SimulatedCamera::new(SimulatedCameraConfig::default());
    let controller = CameraController::new(Box::new(camera), ControllerConfig::default())?;
    info!("camera: {}", controller.model());
    info!("limits: {:?}", controller.control_limits());

    let base = controller.pending_requested();
    for gain in [1.0_f32, 2.0, 4.0, 8.0, 16.0] {
        for exp_ms in [1_u32, 2, 5, 10, 20] {
            controller.reconfigure(ConfigurationRequest{analogue_gain: gain,
                                                        exposure_time_us: exp_ms * 1000,
                                                        ..base.clone()})?;
            // Frames produced under the new settings only.
            let frame = loop {
                let frame = controller.capture(CaptureWhen::NextFrame)?;
                if frame.exposure.analogue_gain == gain &&
                    frame.exposure.exposure_time_us == exp_ms * 1000 {
                    break frame;
                }
            };
            info!("params {:?}; mean brightness {:.2}",
                  frame.exposure, mean_brightness(&frame.image));

            let filename = format!("{}_g{}_e{}ms.png", args.output, gain, exp_ms);
            camera_controller::save_png(&frame.image, Path::new(&filename))?;
        }
    }
    Ok(())
}
