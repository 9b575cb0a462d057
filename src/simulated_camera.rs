// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Software camera that yields frames from a fixed image (or a generated test
// pattern) on its own producer thread. For testing, and for running the
// console without camera hardware.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error, invalid_argument_error};
use image::RgbImage;
use image::imageops::{self, FilterType};
use log::{debug, error, warn};

use crate::capture_device::{CaptureDevice, ControlLimits, ControlMap,
                            EnvironmentMetadata, ExposureMetadata, FrameCallback,
                            RawCapture, StreamHandle};

// Gain times exposure that renders the source image at its native brightness;
// the default manual settings (gain 7, 1/64s) land close to it.
const REFERENCE_GAIN_EXPOSURE: f32 = 7.0 * 15625.0;

// What the simulated auto exposure/white balance settles on.
const AUTO_GAIN: f32 = 4.0;
const AUTO_EXPOSURE_US: u32 = 25_000;
const AUTO_COLOUR_GAINS: (f32, f32) = (2.0, 1.8);

#[derive(Clone, Debug)]
pub struct SimulatedCameraConfig {
    /// Largest configurable (width, height).
    pub sensor_size: (u32, u32),
    pub limits: ControlLimits,
    /// Reported exposure times are rounded to a multiple of this.
    pub exposure_step_us: u32,
    /// Frames are produced every max(exposure, min_frame_interval).
    pub min_frame_interval: Duration,
    pub scene_lux: f32,
}

impl Default for SimulatedCameraConfig {
    fn default() -> Self {
        SimulatedCameraConfig{
            sensor_size: (4056, 3040),
            limits: ControlLimits{min_gain: 1.0, max_gain: 22.26,
                                  min_exposure_us: 31, max_exposure_us: 1_000_000,
                                  max_colour_gain: 32.0},
            exposure_step_us: 1,
            min_frame_interval: Duration::from_millis(25),
            scene_lux: 400.0,
        }
    }
}

// The settings the producer thread renders with. Copied into the thread at
// start().
#[derive(Copy, Clone, Debug)]
struct Settings {
    auto: bool,
    analogue_gain: f32,
    exposure_time_us: u32,
    colour_gains: (f32, f32),
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct SimulatedCamera {
    config: SimulatedCameraConfig,
    source: Option<Arc<RgbImage>>,
    callback: Option<FrameCallback>,
    resolution: (u32, u32),
    settings: Settings,
    worker: Option<Worker>,
    frames_produced: Arc<AtomicU64>,
}

impl SimulatedCamera {
    /// Frames show a generated colour gradient.
    pub fn new(config: SimulatedCameraConfig) -> Self {
        SimulatedCamera{resolution: config.sensor_size,
                        config,
                        source: None,
                        callback: None,
                        settings: Settings{auto: false,
                                           analogue_gain: 1.0,
                                           exposure_time_us: 10_000,
                                           colour_gains: (2.0, 2.0)},
                        worker: None,
                        frames_produced: Arc::new(AtomicU64::new(0))}
    }

    /// Frames show `image`, rescaled to the configured resolution.
    pub fn with_image(config: SimulatedCameraConfig, image: RgbImage) -> Self {
        let mut camera = Self::new(config);
        camera.source = Some(Arc::new(image));
        camera
    }

    /// Total frames handed to the callback since creation.
    pub fn frames_produced(&self) -> u64 {
        self.frames_produced.load(Ordering::Relaxed)
    }

    fn round_exposure(&self, exposure_us: u32) -> u32 {
        let step = self.config.exposure_step_us.max(1);
        let rounded = (exposure_us + step / 2) / step * step;
        rounded.max(step)
    }

    // Builds the scene once per start() so that the producer loop only
    // scales brightness.
    fn render_base(&self) -> RgbImage {
        let (width, height) = self.resolution;
        match &self.source {
            Some(source) if source.dimensions() == self.resolution => (**source).clone(),
            Some(source) => imageops::resize(&**source, width, height, FilterType::Triangle),
            None => RgbImage::from_fn(width, height, |x, y| {
                image::Rgb([(x * 255 / width.max(1)) as u8,
                            (y * 255 / height.max(1)) as u8,
                            128])
            }),
        }
    }

    fn worker_loop(base: RgbImage, settings: Settings, frame_interval: Duration,
                   scene_lux: f32, callback: FrameCallback,
                   frames_produced: Arc<AtomicU64>,
                   stop_rx: mpsc::Receiver<()>) {
        let (width, height) = base.dimensions();
        let brightness =
            settings.analogue_gain * settings.exposure_time_us as f32 / REFERENCE_GAIN_EXPOSURE;
        let red_scale = brightness * settings.colour_gains.0 / 2.0;
        let blue_scale = brightness * settings.colour_gains.1 / 2.0;
        let scale = |v: u8, s: f32| (v as f32 * s).min(255.0) as u8;
        let exposure = ExposureMetadata{analogue_gain: settings.analogue_gain,
                                        colour_gains: settings.colour_gains,
                                        exposure_time_us: settings.exposure_time_us,
                                        resolution: (width, height)};
        let environment = EnvironmentMetadata{
            lux: scene_lux,
            colour_temperature_k:
                4500.0 + 500.0 * (settings.colour_gains.1 - settings.colour_gains.0),
        };
        loop {
            match stop_rx.recv_timeout(frame_interval) {
                Err(RecvTimeoutError::Timeout) => (),
                // Stop requested, or the camera was dropped.
                _ => break,
            }
            let mut pixels = Vec::with_capacity((width * height * 3) as usize);
            for p in base.pixels() {
                // The main stream is BGR.
                pixels.push(scale(p.0[2], blue_scale));
                pixels.push(scale(p.0[1], brightness));
                pixels.push(scale(p.0[0], red_scale));
            }
            let raw = RawCapture{pixels, width, height, exposure, environment};
            // A failing callback must not end frame production.
            if panic::catch_unwind(AssertUnwindSafe(|| callback(raw))).is_err() {
                error!("Frame callback panicked; frame dropped");
            }
            frames_produced.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl CaptureDevice for SimulatedCamera {
    fn model(&self) -> String {
        "SimulatedCamera".to_string()
    }

    fn control_limits(&self) -> ControlLimits {
        self.config.limits
    }

    fn set_frame_callback(&mut self, callback: FrameCallback) {
        self.callback = Some(callback);
    }

    fn configure(&mut self, resolution: (u32, u32), raw_enabled: bool)
                 -> Result<StreamHandle, CanonicalError> {
        if self.is_running() {
            return Err(failed_precondition_error("Cannot configure while running"));
        }
        let (width, height) = resolution;
        let (max_width, max_height) = self.config.sensor_size;
        if width == 0 || height == 0 || width > max_width || height > max_height {
            return Err(invalid_argument_error(
                format!("Resolution {}x{} not supported (sensor is {}x{})",
                        width, height, max_width, max_height).as_str()));
        }
        self.resolution = resolution;
        Ok(StreamHandle{resolution, stride: width * 3, raw_enabled})
    }

    fn apply_controls(&mut self, controls: &ControlMap) -> Result<(), CanonicalError> {
        if self.is_running() {
            return Err(failed_precondition_error("Cannot apply controls while running"));
        }
        let limits = self.config.limits;
        let mut settings = self.settings;
        if let Some(ae) = controls.ae_enable {
            settings.auto = ae;
        }
        if let Some(gain) = controls.analogue_gain {
            if !limits.gain_in_range(gain) {
                return Err(invalid_argument_error(
                    format!("AnalogueGain {} outside [{}, {}]",
                            gain, limits.min_gain, limits.max_gain).as_str()));
            }
            settings.analogue_gain = gain;
        }
        if let Some(exposure_us) = controls.exposure_time_us {
            if !limits.exposure_in_range(exposure_us) {
                return Err(invalid_argument_error(
                    format!("ExposureTime {} outside [{}, {}]", exposure_us,
                            limits.min_exposure_us, limits.max_exposure_us).as_str()));
            }
            settings.exposure_time_us = self.round_exposure(exposure_us);
        }
        if let Some(gains) = controls.colour_gains {
            if !limits.colour_gains_in_range(gains) {
                return Err(invalid_argument_error(
                    format!("ColourGains {:?} out of range", gains).as_str()));
            }
            settings.colour_gains = gains;
        }
        if settings.auto {
            settings.analogue_gain = AUTO_GAIN.clamp(limits.min_gain, limits.max_gain);
            settings.exposure_time_us = self.round_exposure(
                AUTO_EXPOSURE_US.clamp(limits.min_exposure_us, limits.max_exposure_us));
            settings.colour_gains = AUTO_COLOUR_GAINS;
        }
        self.settings = settings;
        debug!("Applied controls {:?}; now {:?}", controls, self.settings);
        Ok(())
    }

    fn start(&mut self) -> Result<(), CanonicalError> {
        if self.is_running() {
            return Ok(());
        }
        let callback = match &self.callback {
            Some(cb) => cb.clone(),
            None => return Err(failed_precondition_error("No frame callback registered")),
        };
        let base = self.render_base();
        let settings = self.settings;
        let frame_interval = Duration::from_micros(settings.exposure_time_us as u64)
            .max(self.config.min_frame_interval);
        let scene_lux = self.config.scene_lux;
        let frames_produced = self.frames_produced.clone();
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("simulated-camera".to_string())
            .spawn(move || {
                SimulatedCamera::worker_loop(base, settings, frame_interval, scene_lux,
                                             callback, frames_produced, stop_rx);
            })
            .map_err(|e| failed_precondition_error(&e.to_string()))?;
        self.worker = Some(Worker{stop_tx, handle});
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CanonicalError> {
        if let Some(worker) = self.worker.take() {
            // The worker may already be gone; either way it is told to stop.
            let _ = worker.stop_tx.send(());
            if worker.handle.join().is_err() {
                return Err(failed_precondition_error("Producer thread panicked"));
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

/// We arrange to call stop() when SimulatedCamera object goes out of scope.
impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.stop().unwrap_or_else(|err| {
            warn!("Error stopping simulated camera: {}", err);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn small_config() -> SimulatedCameraConfig {
        SimulatedCameraConfig{sensor_size: (64, 48),
                              exposure_step_us: 10,
                              min_frame_interval: Duration::from_millis(2),
                              ..Default::default()}
    }

    fn collecting_callback() -> (FrameCallback, Arc<Mutex<Vec<ExposureMetadata>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let seen_clone = seen.clone();
        let callback: FrameCallback = Arc::new(move |raw: RawCapture| {
            assert_eq!(raw.pixels.len(), (raw.width * raw.height * 3) as usize);
            seen_clone.lock().unwrap().push(raw.exposure);
        });
        (callback, seen)
    }

    fn wait_for_frames(seen: &Mutex<Vec<ExposureMetadata>>, count: usize) {
        for _ in 0..500 {
            if seen.lock().unwrap().len() >= count {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("Timed out waiting for {} frames", count);
    }

    #[test]
    fn test_reports_rounded_manual_settings() {
        let mut camera = SimulatedCamera::new(small_config());
        let (callback, seen) = collecting_callback();
        camera.set_frame_callback(callback);
        camera.configure((32, 24), false).unwrap();
        camera.apply_controls(&ControlMap{ae_enable: Some(false),
                                          exposure_time_us: Some(2004),
                                          analogue_gain: Some(3.0),
                                          colour_gains: Some((1.5, 2.5)),
                                          ..Default::default()}).unwrap();
        camera.start().unwrap();
        wait_for_frames(&seen, 2);
        camera.stop().unwrap();
        let exposure = seen.lock().unwrap()[0];
        assert_eq!(exposure.exposure_time_us, 2000);
        assert_eq!(exposure.analogue_gain, 3.0);
        assert_eq!(exposure.colour_gains, (1.5, 2.5));
        assert_eq!(exposure.resolution, (32, 24));
    }

    #[test]
    fn test_auto_overrides_numeric_values() {
        let mut camera = SimulatedCamera::new(small_config());
        let (callback, seen) = collecting_callback();
        camera.set_frame_callback(callback);
        camera.configure((16, 16), false).unwrap();
        camera.apply_controls(&ControlMap{ae_enable: Some(true),
                                          awb_enable: Some(true),
                                          ..Default::default()}).unwrap();
        camera.start().unwrap();
        wait_for_frames(&seen, 1);
        camera.stop().unwrap();
        let exposure = seen.lock().unwrap()[0];
        assert_eq!(exposure.analogue_gain, AUTO_GAIN);
        assert_eq!(exposure.exposure_time_us, AUTO_EXPOSURE_US);
    }

    #[test]
    fn test_no_callbacks_after_stop() {
        let mut camera = SimulatedCamera::new(small_config());
        let (callback, seen) = collecting_callback();
        camera.set_frame_callback(callback);
        camera.configure((8, 8), false).unwrap();
        camera.start().unwrap();
        wait_for_frames(&seen, 1);
        camera.stop().unwrap();
        let count = seen.lock().unwrap().len();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(seen.lock().unwrap().len(), count);
        assert!(!camera.is_running());
    }

    #[test]
    fn test_rejects_changes_while_running() {
        let mut camera = SimulatedCamera::new(small_config());
        let (callback, _seen) = collecting_callback();
        camera.set_frame_callback(callback);
        camera.start().unwrap();
        assert!(camera.configure((8, 8), false).is_err());
        assert!(camera.apply_controls(&ControlMap::default()).is_err());
        camera.stop().unwrap();
        assert!(camera.configure((8, 8), false).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut camera = SimulatedCamera::new(small_config());
        assert!(camera.configure((0, 8), false).is_err());
        assert!(camera.configure((65, 8), false).is_err());
        assert!(camera.apply_controls(&ControlMap{analogue_gain: Some(100.0),
                                                  ..Default::default()}).is_err());
        assert!(camera.apply_controls(&ControlMap{exposure_time_us: Some(0),
                                                  ..Default::default()}).is_err());
    }

    #[test]
    fn test_panicking_callback_keeps_producing() {
        let mut camera = SimulatedCamera::new(small_config());
        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = calls.clone();
        camera.set_frame_callback(Arc::new(move |_raw: RawCapture| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            panic!("bad frame");
        }));
        camera.configure((8, 8), false).unwrap();
        camera.start().unwrap();
        for _ in 0..500 {
            if calls.load(Ordering::SeqCst) >= 3 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        camera.stop().unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert!(camera.frames_produced() >= 3);
    }

    #[test]
    fn test_source_image_is_rescaled() {
        let source = RgbImage::from_pixel(20, 10, image::Rgb([100, 50, 10]));
        let mut camera = SimulatedCamera::with_image(small_config(), source);
        camera.configure((10, 5), false).unwrap();
        let base = camera.render_base();
        assert_eq!(base.dimensions(), (10, 5));
        let pixel = base.get_pixel(3, 3).0;
        for (got, want) in pixel.iter().zip([100u8, 50, 10]) {
            assert!((*got as i32 - want as i32).abs() <= 1);
        }
    }

    #[test]
    fn test_start_requires_callback() {
        let mut camera = SimulatedCamera::new(small_config());
        assert!(camera.start().is_err());
    }
}
