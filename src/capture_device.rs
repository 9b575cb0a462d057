// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::Arc;

use canonical_error::CanonicalError;
use serde::{Deserialize, Serialize};

/// Exposure-related values as reported by the device for one frame. These
/// are the actual values used, which can differ from what was requested
/// (rounding to the sensor's line time, or auto exposure choosing its own).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ExposureMetadata {
    pub analogue_gain: f32,
    /// (red, blue).
    pub colour_gains: (f32, f32),
    pub exposure_time_us: u32,
    /// (width, height).
    pub resolution: (u32, u32),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EnvironmentMetadata {
    pub lux: f32,
    pub colour_temperature_k: f32,
}

/// What the device hands to the frame callback for each completed capture.
pub struct RawCapture {
    /// Packed 8-bit BGR pixels in row major order, as produced by the
    /// camera's main stream.
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub exposure: ExposureMetadata,
    pub environment: EnvironmentMetadata,
}

/// Invoked once per completed capture, on the device's producer thread. Must
/// return quickly.
pub type FrameCallback = Arc<dyn Fn(RawCapture) + Send + Sync>;

/// Desired device settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationRequest {
    pub analogue_gain: f32,
    /// (red, blue).
    pub colour_gains: (f32, f32),
    #[serde(rename = "exposure_time")]
    pub exposure_time_us: u32,
    /// (width, height).
    pub resolution: (u32, u32),
    /// When either auto flag is set, analogue_gain and exposure_time_us are
    /// advisory only.
    pub auto_exposure: bool,
    pub auto_white_balance: bool,
}

impl Default for ConfigurationRequest {
    fn default() -> Self {
        ConfigurationRequest{
            analogue_gain: 7.0,
            colour_gains: (2.25, 3.25),
            exposure_time_us: 1_000_000 / 64,
            resolution: (2028, 1520),
            auto_exposure: false,
            auto_white_balance: false,
        }
    }
}

impl ConfigurationRequest {
    /// Builds the "latest applied" view of the device from frame metadata.
    pub fn from_metadata(exposure: &ExposureMetadata, auto: bool) -> Self {
        ConfigurationRequest{
            analogue_gain: exposure.analogue_gain,
            colour_gains: exposure.colour_gains,
            exposure_time_us: exposure.exposure_time_us,
            resolution: exposure.resolution,
            auto_exposure: auto,
            auto_white_balance: auto,
        }
    }

    /// There is no partial-auto mode: either flag selects the device's
    /// automatic exposure and white balance together.
    pub fn is_auto(&self) -> bool {
        self.auto_exposure || self.auto_white_balance
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MeteringMode {
    CentreWeighted, Spot, Matrix,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExposureMode {
    Normal, Short, Long,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AwbMode {
    Auto, Daylight, Tungsten,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NoiseReductionMode {
    Off, Fast, HighQuality,
}

/// Controls pushed to the device between configure() and start(). Absent
/// entries leave the device's current value in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlMap {
    pub ae_enable: Option<bool>,
    pub awb_enable: Option<bool>,
    pub ae_metering_mode: Option<MeteringMode>,
    pub ae_exposure_mode: Option<ExposureMode>,
    pub awb_mode: Option<AwbMode>,
    pub exposure_value: Option<f32>,
    pub exposure_time_us: Option<u32>,
    pub analogue_gain: Option<f32>,
    /// (red, blue).
    pub colour_gains: Option<(f32, f32)>,
    pub noise_reduction_mode: Option<NoiseReductionMode>,
}

/// The range of manual settings a device accepts.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct ControlLimits {
    pub min_gain: f32,
    pub max_gain: f32,
    pub min_exposure_us: u32,
    pub max_exposure_us: u32,
    pub max_colour_gain: f32,
}

impl ControlLimits {
    pub fn gain_in_range(&self, gain: f32) -> bool {
        gain >= self.min_gain && gain <= self.max_gain
    }

    pub fn exposure_in_range(&self, exposure_us: u32) -> bool {
        exposure_us >= self.min_exposure_us && exposure_us <= self.max_exposure_us
    }

    pub fn colour_gains_in_range(&self, gains: (f32, f32)) -> bool {
        let ok = |g: f32| g >= 0.0 && g <= self.max_colour_gain;
        ok(gains.0) && ok(gains.1)
    }
}

/// Returned by configure(); describes the stream the device will produce.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StreamHandle {
    pub resolution: (u32, u32),
    /// Bytes per row of the main stream.
    pub stride: u32,
    pub raw_enabled: bool,
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{} stride {}{}", self.resolution.0, self.resolution.1,
               self.stride, if self.raw_enabled { " +raw" } else { "" })
    }
}

/// CaptureDevice models a camera that runs its own producer thread and
/// delivers every completed capture to a registered callback.
///
/// Reconfiguration protocol: the device must be stopped before configure()
/// and apply_controls() are called; start() then resumes delivery. A frame in
/// flight when stop() is called may or may not produce one trailing
/// callback, but no callback fires between stop() returning and the next
/// start().
pub trait CaptureDevice: Send {
    /// Returns a string identifying what kind of camera this is.
    fn model(&self) -> String;

    fn control_limits(&self) -> ControlLimits;

    /// Replaces the frame callback. Takes effect at the next start().
    fn set_frame_callback(&mut self, callback: FrameCallback);

    /// Selects the main stream size. Returns FailedPrecondition if the device
    /// is running, InvalidArgument if the resolution is unsupported.
    fn configure(&mut self, resolution: (u32, u32), raw_enabled: bool)
                 -> Result<StreamHandle, CanonicalError>;

    /// Returns FailedPrecondition if the device is running, InvalidArgument
    /// if a control value is out of range.
    fn apply_controls(&mut self, controls: &ControlMap) -> Result<(), CanonicalError>;

    fn start(&mut self) -> Result<(), CanonicalError>;

    /// Stopping a stopped device is a no-op.
    fn stop(&mut self) -> Result<(), CanonicalError>;

    fn is_running(&self) -> bool;
}
