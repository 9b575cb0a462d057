// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod camera_controller;
pub mod capture_device;
pub mod clock;
pub mod control_server;
pub mod error;
pub mod frame_buffer;
pub mod frame_signal;
pub mod parameter_sync;
pub mod preview;
pub mod simulated_camera;
