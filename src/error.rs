// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by CameraController and the layers above it. Device
/// errors arrive as CanonicalError and are carried here by their message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    /// No frame has been captured yet; retry shortly.
    #[error("No frame has been captured yet")]
    EmptyBuffer,

    #[error("Device rejected configuration: {0}")]
    DeviceConfiguration(String),

    #[error("Could not save frame: {0}")]
    Persistence(String),

    #[error("Could not start reconfiguration within {0:?}")]
    ReconfigureTimeout(Duration),

    #[error("No new frame arrived within {0:?}")]
    Timeout(Duration),
}
