// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;

use log::{info, warn};
use serde::Deserialize;

use crate::camera_controller::CameraController;
use crate::capture_device::ConfigurationRequest;
use crate::error::CameraError;

/// A change to one manual camera parameter.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ParameterEdit {
    AnalogueGain(f32),
    ExposureTime(u32),
    /// First element of the (red, blue) colour gains.
    RedGain(f32),
    /// Second element of the (red, blue) colour gains.
    BlueGain(f32),
}

impl ParameterEdit {
    /// Maps a control-surface parameter name to an edit. Returns None for
    /// names that are not single-value editable parameters.
    pub fn from_name(name: &str, value: f64) -> Option<Self> {
        match name {
            "analogue_gain" => Some(ParameterEdit::AnalogueGain(value as f32)),
            // Negative values saturate to 0.
            "exposure_time" => Some(ParameterEdit::ExposureTime(value.round() as u32)),
            "red_gain" => Some(ParameterEdit::RedGain(value as f32)),
            "blue_gain" => Some(ParameterEdit::BlueGain(value as f32)),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParameterEdit::AnalogueGain(_) => "analogue_gain",
            ParameterEdit::ExposureTime(_) => "exposure_time",
            ParameterEdit::RedGain(_) => "red_gain",
            ParameterEdit::BlueGain(_) => "blue_gain",
        }
    }
}

/// Several manual parameters changed together. Absent fields keep their
/// current value.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ParameterUpdate {
    pub analogue_gain: Option<f32>,
    pub exposure_time: Option<u32>,
    /// (red, blue).
    pub colour_gains: Option<(f32, f32)>,
    pub red_gain: Option<f32>,
    pub blue_gain: Option<f32>,
    /// (width, height).
    pub resolution: Option<(u32, u32)>,
}

// Exposure values equal to the device's clamp sentinel are never applied;
// the current exposure is kept instead.
fn guarded_exposure(requested: u32, current: u32, sentinel: u32) -> u32 {
    if requested == sentinel {
        warn!("Ignoring sentinel exposure {}us; keeping {}us", requested, current);
        current
    } else {
        requested
    }
}

/// Applies `edit` to a copy of `base`. Any manual edit leaves auto mode.
pub fn merge_edit(base: &ConfigurationRequest, edit: ParameterEdit,
                  clamped_exposure_sentinel_us: u32) -> ConfigurationRequest {
    let mut request = base.clone();
    match edit {
        ParameterEdit::AnalogueGain(gain) => request.analogue_gain = gain,
        ParameterEdit::ExposureTime(exposure_us) => {
            request.exposure_time_us = guarded_exposure(
                exposure_us, base.exposure_time_us, clamped_exposure_sentinel_us);
        },
        ParameterEdit::RedGain(red) => request.colour_gains.0 = red,
        ParameterEdit::BlueGain(blue) => request.colour_gains.1 = blue,
    }
    request.auto_exposure = false;
    request.auto_white_balance = false;
    request
}

/// Applies every present field of `update` to a copy of `base`. Individual
/// red_gain/blue_gain fields win over colour_gains.
pub fn merge_update(base: &ConfigurationRequest, update: &ParameterUpdate,
                    clamped_exposure_sentinel_us: u32) -> ConfigurationRequest {
    let mut request = base.clone();
    if let Some(gain) = update.analogue_gain {
        request.analogue_gain = gain;
    }
    if let Some(exposure_us) = update.exposure_time {
        request.exposure_time_us = guarded_exposure(
            exposure_us, base.exposure_time_us, clamped_exposure_sentinel_us);
    }
    if let Some(gains) = update.colour_gains {
        request.colour_gains = gains;
    }
    if let Some(red) = update.red_gain {
        request.colour_gains.0 = red;
    }
    if let Some(blue) = update.blue_gain {
        request.colour_gains.1 = blue;
    }
    if let Some(resolution) = update.resolution {
        request.resolution = resolution;
    }
    request.auto_exposure = false;
    request.auto_white_balance = false;
    request
}

/// Turns external parameter edits into full reconfigurations of the
/// controller. The starting point is always a snapshot of the controller's
/// latest applied configuration.
pub struct ParameterSync {
    controller: Arc<CameraController>,
}

impl ParameterSync {
    pub fn new(controller: Arc<CameraController>) -> Self {
        ParameterSync{controller}
    }

    pub fn controller(&self) -> &Arc<CameraController> {
        &self.controller
    }

    /// Returns the request that was applied.
    pub fn apply(&self, edit: ParameterEdit) -> Result<ConfigurationRequest, CameraError> {
        let base = self.controller.latest_applied();
        let request = merge_edit(&base, edit,
                                 self.controller.clamped_exposure_sentinel_us());
        info!("Setting {} ({:?})", edit.name(), edit);
        self.controller.reconfigure(request.clone())?;
        Ok(request)
    }

    pub fn apply_update(&self, update: &ParameterUpdate)
                        -> Result<ConfigurationRequest, CameraError> {
        let base = self.controller.latest_applied();
        let request = merge_update(&base, update,
                                   self.controller.clamped_exposure_sentinel_us());
        info!("Updating parameters {:?}", update);
        self.controller.reconfigure(request.clone())?;
        Ok(request)
    }
}
