// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Time-windowed store of recently captured frames.
//!
//! Retention is by age rather than by count: a frame is kept for as long as
//! `now - capture_timestamp <= window`. This keeps "the frame from N seconds
//! ago" meaningful even when the capture rate sags, e.g. during a
//! reconfiguration stall or with long exposures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use image::RgbImage;

use crate::capture_device::{EnvironmentMetadata, ExposureMetadata};
use crate::clock::{Clock, MonotonicClock};
use crate::error::CameraError;

/// One completed capture. Immutable once created; the pixel data is shared so
/// that copying a record out of the buffer does not copy the image.
#[derive(Clone, Debug)]
pub struct FrameRecord {
    pub image: Arc<RgbImage>,
    pub exposure: ExposureMetadata,
    pub environment: EnvironmentMetadata,
    pub capture_timestamp: Instant,
    /// Position in arrival order, starting at 1. Assigned by add(); whatever
    /// the caller puts here is overwritten.
    pub sequence: u64,
}

/// Single-writer, multi-reader. Exactly one producer thread calls add(); any
/// number of threads call get(). Both hold the lock for time proportional to
/// the number of frames currently retained.
pub struct TimeIndexedFrameBuffer {
    frames: Mutex<VecDeque<FrameRecord>>,
    window: Duration,
    // Expected capture rate, used only for current_fill_ratio().
    nominal_fps: f64,
    clock: Arc<dyn Clock>,
    next_sequence: AtomicU64,
}

impl TimeIndexedFrameBuffer {
    pub fn new(window: Duration, nominal_fps: f64) -> Self {
        Self::with_clock(window, nominal_fps, Arc::new(MonotonicClock))
    }

    pub fn with_clock(window: Duration, nominal_fps: f64, clock: Arc<dyn Clock>) -> Self {
        TimeIndexedFrameBuffer{frames: Mutex::new(VecDeque::new()),
                               window, nominal_fps, clock,
                               next_sequence: AtomicU64::new(1)}
    }

    /// Reading of the clock this buffer measures ages against. The producer
    /// stamps arriving frames with it.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Appends `record` and evicts, from the front, every frame older than
    /// the window. A frame whose age equals the window is retained.
    pub fn add(&self, mut record: FrameRecord) {
        let mut frames = self.frames.lock().unwrap();
        // Taken under the lock so sequence order matches buffer order.
        record.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        frames.push_back(record);
        let now = self.clock.now();
        while let Some(front) = frames.front() {
            if now.saturating_duration_since(front.capture_timestamp) > self.window {
                frames.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns the frame whose capture time is nearest to `now -
    /// seconds_ago`. Ties go to the older frame. Zero yields the most recent
    /// frame.
    pub fn get(&self, seconds_ago: f64) -> Result<FrameRecord, CameraError> {
        let now = self.clock.now();
        let frames = self.frames.lock().unwrap();
        let mut best: Option<(&FrameRecord, f64)> = None;
        for frame in frames.iter() {
            let age = now.saturating_duration_since(frame.capture_timestamp).as_secs_f64();
            let error = (age - seconds_ago).abs();
            match best {
                Some((_, best_error)) if error >= best_error => (),
                _ => best = Some((frame, error)),
            }
        }
        best.map(|(frame, _)| frame.clone()).ok_or(CameraError::EmptyBuffer)
    }

    /// The most recently added frame.
    pub fn latest(&self) -> Result<FrameRecord, CameraError> {
        self.frames.lock().unwrap().back().cloned().ok_or(CameraError::EmptyBuffer)
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained frames per second of window; the effective capture rate.
    pub fn frame_rate(&self) -> f64 {
        let window_secs = self.window.as_secs_f64();
        if window_secs == 0.0 {
            return 0.0;
        }
        self.len() as f64 / window_secs
    }

    /// Retained frame count relative to what the nominal frame rate would
    /// fill the window with. For display only.
    pub fn current_fill_ratio(&self) -> f64 {
        let expected = self.window.as_secs_f64() * self.nominal_fps;
        if expected <= 0.0 {
            return 0.0;
        }
        self.len() as f64 / expected
    }

    /// Capture timestamps of the retained frames, oldest first.
    pub fn timestamps(&self) -> Vec<Instant> {
        self.frames.lock().unwrap().iter().map(|f| f.capture_timestamp).collect()
    }
}
