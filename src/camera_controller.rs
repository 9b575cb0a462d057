// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use canonical_error::CanonicalError;
use chrono::offset::Local;
use image::{ImageFormat, RgbImage};
use log::{debug, error, info, warn};

use crate::capture_device::{AwbMode, CaptureDevice, ConfigurationRequest, ControlLimits,
                            ControlMap, ExposureMode, FrameCallback, MeteringMode,
                            NoiseReductionMode, RawCapture};
use crate::clock::{Clock, MonotonicClock};
use crate::error::CameraError;
use crate::frame_buffer::{FrameRecord, TimeIndexedFrameBuffer};
use crate::frame_signal::FrameSignal;

/// The reserved seconds-ago value that requests a blocking wait for the next
/// frame.
pub const BLOCK_FOR_NEXT_FRAME: f64 = -1.0;

/// Which frame capture() should return.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CaptureWhen {
    /// Block until a frame newer than the one returned by the previous
    /// NextFrame capture arrives.
    NextFrame,
    /// The buffered frame captured nearest to this many seconds ago.
    SecondsAgo(f64),
}

impl From<f64> for CaptureWhen {
    fn from(seconds_ago: f64) -> Self {
        if seconds_ago == BLOCK_FOR_NEXT_FRAME {
            CaptureWhen::NextFrame
        } else {
            CaptureWhen::SecondsAgo(seconds_ago)
        }
    }
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// How long frames are retained for secondsAgo queries.
    pub window: Duration,
    /// Expected capture rate; only affects fill-ratio diagnostics.
    pub nominal_fps: f64,
    /// If set, reconfigure() gives up with ReconfigureTimeout when it cannot
    /// start within this long. None waits indefinitely.
    pub reconfigure_timeout: Option<Duration>,
    /// Exposure time the device reports when it clamped an invalid value.
    pub clamped_exposure_sentinel_us: u32,
    /// Applied when the controller is created.
    pub initial: ConfigurationRequest,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig{window: Duration::from_secs(2),
                         nominal_fps: 30.0,
                         reconfigure_timeout: None,
                         clamped_exposure_sentinel_us: 0,
                         initial: ConfigurationRequest::default()}
    }
}

/// Translates a request into device controls. Auto and manual are the only
/// two modes.
pub fn derive_controls(request: &ConfigurationRequest) -> ControlMap {
    let mut controls = ControlMap{
        noise_reduction_mode: Some(NoiseReductionMode::HighQuality),
        ..Default::default()
    };
    if request.is_auto() {
        controls.ae_enable = Some(true);
        controls.awb_enable = Some(true);
        controls.ae_metering_mode = Some(MeteringMode::CentreWeighted);
        // Long exposure mode helps in low light.
        controls.ae_exposure_mode = Some(ExposureMode::Long);
        controls.awb_mode = Some(AwbMode::Auto);
        controls.exposure_value = Some(4.0);
    } else {
        controls.ae_enable = Some(false);
        controls.awb_enable = Some(false);
        controls.exposure_time_us = Some(request.exposure_time_us);
        controls.analogue_gain = Some(request.analogue_gain);
        controls.colour_gains = Some(request.colour_gains);
    }
    controls
}

// FIFO ticket lock. Reconfigurations run one at a time in the order they
// arrived; each one derives partly from the state the previous one left.
struct ReconfigureQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

#[derive(Default)]
struct QueueState {
    next_ticket: u64,
    now_serving: u64,
    // Tickets whose holders timed out before being served.
    abandoned: BTreeSet<u64>,
}

// Holding a QueueTurn means it is our turn; dropping it passes the turn on.
struct QueueTurn<'a> {
    queue: &'a ReconfigureQueue,
}

impl ReconfigureQueue {
    fn new() -> Self {
        ReconfigureQueue{state: Mutex::new(QueueState::default()), cond: Condvar::new()}
    }

    fn acquire(&self, timeout: Option<Duration>) -> Result<QueueTurn<'_>, CameraError> {
        let deadline = timeout.map(|t| (t, Instant::now() + t));
        let mut state = self.state.lock().unwrap();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.now_serving != ticket {
            match deadline {
                None => {
                    state = self.cond.wait(state).unwrap();
                },
                Some((limit, deadline)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining == Duration::ZERO {
                        state.abandoned.insert(ticket);
                        return Err(CameraError::ReconfigureTimeout(limit));
                    }
                    state = self.cond.wait_timeout(state, remaining).unwrap().0;
                },
            }
        }
        Ok(QueueTurn{queue: self})
    }
}

impl Drop for QueueTurn<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock().unwrap();
        state.now_serving += 1;
        loop {
            let serving = state.now_serving;
            if !state.abandoned.remove(&serving) {
                break;
            }
            state.now_serving += 1;
        }
        self.queue.cond.notify_all();
    }
}

struct DeviceSlot {
    device: Box<dyn CaptureDevice>,
    // Most recent request the device accepted; the rollback target.
    last_good: Option<ConfigurationRequest>,
}

/// Sole owner of one CaptureDevice and one TimeIndexedFrameBuffer.
///
/// The device's producer thread feeds the buffer through a callback that
/// never touches the reconfiguration machinery, so frame delivery is not held
/// up by a caller waiting to reconfigure. latest_applied is written by
/// reconfigure() when a push succeeds and then refined by that callback from
/// live metadata; pending_requested is written by reconfigure(). Each has its
/// own lock.
pub struct CameraController {
    device: Mutex<DeviceSlot>,
    queue: ReconfigureQueue,
    buffer: Arc<TimeIndexedFrameBuffer>,
    signal: Arc<FrameSignal>,
    latest_applied: Arc<Mutex<ConfigurationRequest>>,
    pending_requested: Mutex<ConfigurationRequest>,
    // Sequence of the frame most recently returned by a blocking capture.
    last_next_frame: Mutex<u64>,
    auto_mode: Arc<AtomicBool>,
    model: String,
    control_limits: ControlLimits,
    reconfigure_timeout: Option<Duration>,
    clamped_exposure_sentinel_us: u32,
}

impl CameraController {
    /// Takes ownership of `device`, installs the frame callback and applies
    /// `config.initial`.
    pub fn new(device: Box<dyn CaptureDevice>, config: ControllerConfig)
               -> Result<Self, CameraError> {
        Self::with_clock(device, config, Arc::new(MonotonicClock))
    }

    pub fn with_clock(mut device: Box<dyn CaptureDevice>, config: ControllerConfig,
                      clock: Arc<dyn Clock>) -> Result<Self, CameraError> {
        let buffer = Arc::new(TimeIndexedFrameBuffer::with_clock(
            config.window, config.nominal_fps, clock));
        let signal = Arc::new(FrameSignal::new());
        let latest_applied = Arc::new(Mutex::new(config.initial.clone()));
        let auto_mode = Arc::new(AtomicBool::new(config.initial.is_auto()));
        device.set_frame_callback(Self::frame_callback(
            buffer.clone(), signal.clone(), latest_applied.clone(), auto_mode.clone()));
        let controller = CameraController{
            model: device.model(),
            control_limits: device.control_limits(),
            device: Mutex::new(DeviceSlot{device, last_good: None}),
            queue: ReconfigureQueue::new(),
            buffer,
            signal,
            latest_applied,
            pending_requested: Mutex::new(config.initial.clone()),
            last_next_frame: Mutex::new(0),
            auto_mode,
            reconfigure_timeout: config.reconfigure_timeout,
            clamped_exposure_sentinel_us: config.clamped_exposure_sentinel_us,
        };
        controller.reconfigure(config.initial)?;
        info!("Camera {} running", controller.model);
        Ok(controller)
    }

    // Runs on the device's producer thread for every completed capture. Only
    // converts, stores and signals; problems are logged and the frame dropped.
    fn frame_callback(buffer: Arc<TimeIndexedFrameBuffer>, signal: Arc<FrameSignal>,
                      latest_applied: Arc<Mutex<ConfigurationRequest>>,
                      auto_mode: Arc<AtomicBool>) -> FrameCallback {
        Arc::new(move |raw: RawCapture| {
            let capture_timestamp = buffer.now();
            let image = match bgr_to_rgb(raw.width, raw.height, raw.pixels) {
                Some(image) => image,
                None => {
                    warn!("Dropping malformed {}x{} frame", raw.width, raw.height);
                    return;
                },
            };
            let mut exposure = raw.exposure;
            exposure.resolution = image.dimensions();
            let applied = ConfigurationRequest::from_metadata(
                &exposure, auto_mode.load(Ordering::Relaxed));
            buffer.add(FrameRecord{image: Arc::new(image),
                                   exposure,
                                   environment: raw.environment,
                                   capture_timestamp,
                                   sequence: 0});
            *latest_applied.lock().unwrap() = applied;
            signal.notify();
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn control_limits(&self) -> ControlLimits {
        self.control_limits
    }

    pub fn clamped_exposure_sentinel_us(&self) -> u32 {
        self.clamped_exposure_sentinel_us
    }

    pub fn buffer(&self) -> &Arc<TimeIndexedFrameBuffer> {
        &self.buffer
    }

    /// The device's actual settings, as reported by the most recent frame.
    pub fn latest_applied(&self) -> ConfigurationRequest {
        self.latest_applied.lock().unwrap().clone()
    }

    /// The most recently requested settings.
    pub fn pending_requested(&self) -> ConfigurationRequest {
        self.pending_requested.lock().unwrap().clone()
    }

    pub fn is_auto(&self) -> bool {
        self.auto_mode.load(Ordering::Relaxed)
    }

    /// Stops the device, pushes `request` to it and restarts it. Returns once
    /// start() has been issued. Concurrent calls queue and run in arrival
    /// order.
    ///
    /// If the device rejects the request, the previous good configuration is
    /// restored (best effort) and DeviceConfiguration is returned.
    pub fn reconfigure(&self, request: ConfigurationRequest) -> Result<(), CameraError> {
        let _turn = self.queue.acquire(self.reconfigure_timeout)?;
        *self.pending_requested.lock().unwrap() = request.clone();
        let mut slot = self.device.lock().unwrap();
        debug!("Reconfiguring {}: {:?}", self.model, request);
        match self.push_to_device(&mut *slot.device, &request) {
            Ok(()) => {
                slot.last_good = Some(request);
                Ok(())
            },
            Err(e) => {
                error!("Reconfiguration rejected: {}", e);
                if let Some(previous) = slot.last_good.clone() {
                    match self.push_to_device(&mut *slot.device, &previous) {
                        Ok(()) => {
                            warn!("Restored previous configuration");
                            *self.pending_requested.lock().unwrap() = previous;
                        },
                        Err(e) => error!("Could not restore previous configuration: {}", e),
                    }
                }
                Err(CameraError::DeviceConfiguration(e.to_string()))
            },
        }
    }

    fn push_to_device(&self, device: &mut dyn CaptureDevice,
                      request: &ConfigurationRequest) -> Result<(), CanonicalError> {
        device.stop()?;
        let stream = device.configure(request.resolution, /*raw_enabled=*/true)?;
        device.apply_controls(&derive_controls(request))?;
        let auto = request.is_auto();
        self.auto_mode.store(auto, Ordering::Relaxed);
        // Accepted. Frames produced after start() refine this from metadata.
        *self.latest_applied.lock().unwrap() = ConfigurationRequest{
            auto_exposure: auto, auto_white_balance: auto, ..request.clone()};
        device.start()?;
        debug!("Device restarted with stream {}", stream);
        Ok(())
    }

    /// Switches the device to automatic exposure and white balance. The
    /// previously requested gain and exposure are kept as advisory values.
    pub fn set_auto(&self) -> Result<(), CameraError> {
        let mut request = self.pending_requested();
        request.auto_exposure = true;
        request.auto_white_balance = true;
        self.reconfigure(request)
    }

    /// NextFrame blocks, without timeout, until a frame newer than the one
    /// the previous blocking capture returned is buffered. SecondsAgo does not
    /// block, and returns EmptyBuffer if nothing has been captured.
    pub fn capture(&self, when: CaptureWhen) -> Result<FrameRecord, CameraError> {
        match when {
            CaptureWhen::NextFrame => loop {
                self.signal.wait();
                if let Some(frame) = self.take_newer()? {
                    return Ok(frame);
                }
            },
            CaptureWhen::SecondsAgo(seconds_ago) => self.buffer.get(seconds_ago),
        }
    }

    /// Bounded form of capture(CaptureWhen::NextFrame).
    pub fn capture_timeout(&self, timeout: Duration) -> Result<FrameRecord, CameraError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.signal.wait_timeout(remaining) {
                return Err(CameraError::Timeout(timeout));
            }
            if let Some(frame) = self.take_newer()? {
                return Ok(frame);
            }
        }
    }

    // A notification can outlive the frame it announced: the waiter may have
    // already read a later frame whose own notify comes after. Such a wakeup
    // yields None.
    fn take_newer(&self) -> Result<Option<FrameRecord>, CameraError> {
        let frame = self.buffer.latest()?;
        let mut last = self.last_next_frame.lock().unwrap();
        if frame.sequence <= *last {
            return Ok(None);
        }
        *last = frame.sequence;
        Ok(Some(frame))
    }

    /// Captures a frame and writes it losslessly to
    /// `dir/<YYYY.MM.DD-HH:MM:SS.mmm>.png`, returning the path. `dir` must
    /// exist. Existing files are never overwritten; a colliding name gets a
    /// `-N` suffix.
    pub fn capture_and_save(&self, dir: &Path, when: CaptureWhen)
                            -> Result<PathBuf, CameraError> {
        let frame = self.capture(when)?;
        let stem = Local::now().format("%Y.%m.%d-%H:%M:%S%.3f").to_string();
        let (path, file) = create_unique_png(dir, &stem)?;
        if let Err(e) = write_png(&frame.image, file, &path) {
            // Leave no empty file behind.
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        info!("Saved {} (gain {:.2}, exposure {}us)", path.display(),
              frame.exposure.analogue_gain, frame.exposure.exposure_time_us);
        Ok(path)
    }
}

impl Drop for CameraController {
    fn drop(&mut self) {
        // Still stop the device if a panic poisoned the lock.
        let slot = self.device.get_mut().unwrap_or_else(|e| e.into_inner());
        slot.device.stop().unwrap_or_else(|err| {
            error!("Error stopping camera {}: {}", self.model, err);
        });
    }
}

/// Converts packed BGR to an RgbImage. Returns None if `pixels` does not hold
/// width*height*3 bytes.
pub fn bgr_to_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Option<RgbImage> {
    if pixels.len() != (width as usize) * (height as usize) * 3 {
        return None;
    }
    let mut image = RgbImage::from_raw(width, height, pixels)?;
    for p in image.pixels_mut() {
        p.0.swap(0, 2);
    }
    Some(image)
}

// Highest `-N` suffix tried before giving up.
const MAX_NAME_SUFFIX: u32 = 999;

fn create_unique_png(dir: &Path, stem: &str) -> Result<(PathBuf, File), CameraError> {
    for n in 0..=MAX_NAME_SUFFIX {
        let filename = if n == 0 {
            format!("{}.png", stem)
        } else {
            format!("{}-{}.png", stem, n)
        };
        let path = dir.join(filename);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(CameraError::Persistence(format!("{}: {}", path.display(), e))),
        }
    }
    Err(CameraError::Persistence(
        format!("{}: no free name for {}", dir.display(), stem)))
}

fn write_png(image: &RgbImage, file: File, path: &Path) -> Result<(), CameraError> {
    let persistence = |e: &dyn std::fmt::Display| {
        CameraError::Persistence(format!("{}: {}", path.display(), e))
    };
    let mut writer = BufWriter::new(file);
    image.write_to(&mut writer, ImageFormat::Png).map_err(|e| persistence(&e))?;
    writer.flush().map_err(|e| persistence(&e))
}

/// Writes `image` to `path`, replacing any existing file.
pub fn save_png(image: &RgbImage, path: &Path) -> Result<(), CameraError> {
    image.save_with_format(path, ImageFormat::Png).map_err(|e| {
        CameraError::Persistence(format!("{}: {}", path.display(), e))
    })
}
