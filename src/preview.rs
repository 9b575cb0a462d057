// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Builds the preview shown on the console's screen: a downsized view of the
//! frame with a full-resolution centre crop inset for focusing and
//! cross-hairs. Exposure statistics come back beside the image as
//! `OverlayStats` text lines; nothing is drawn as text on the canvas.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error, invalid_argument_error};
use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::{GrayImage, Rgb, RgbImage};
use image::imageops;
use imageproc::drawing::draw_line_segment_mut;
use imageproc::filter::box_filter;
use log::{debug, warn};

use crate::camera_controller::CameraController;
use crate::error::CameraError;
use crate::frame_buffer::FrameRecord;

/// Receives each rendered preview. Must not block the render loop.
pub trait DisplaySink: Send + Sync {
    fn input_image(&self, image: Arc<RgbImage>);
}

/// Keeps the most recent preview for whoever asks, e.g. the HTTP preview
/// endpoint.
#[derive(Default)]
pub struct SharedPreview {
    latest: Mutex<Option<Arc<RgbImage>>>,
}

impl SharedPreview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Arc<RgbImage>> {
        self.latest.lock().unwrap().clone()
    }
}

impl DisplaySink for SharedPreview {
    fn input_image(&self, image: Arc<RgbImage>) {
        *self.latest.lock().unwrap() = Some(image);
    }
}

#[derive(Copy, Clone, Debug)]
pub struct PreviewLayout {
    /// Size the whole frame is downsized to.
    pub preview_size: (u32, u32),
    /// The preview is padded on the left up to this width.
    pub canvas_width: u32,
    /// Side of the square full-resolution centre crop.
    pub crop_side: u32,
    /// Distance from the crop inset to the canvas's left and bottom edges.
    pub margin: u32,
    /// Half-lengths of the cross-hair arms.
    pub cross_half_len: u32,
    pub crop_cross_half_len: u32,
}

impl Default for PreviewLayout {
    fn default() -> Self {
        // Sized for a 480x320 display.
        PreviewLayout{preview_size: (426, 320),
                      canvas_width: 480,
                      crop_side: 170,
                      margin: 10,
                      cross_half_len: 8,
                      crop_cross_half_len: 4}
    }
}

/// Text shown next to the preview by whoever displays it. compose_preview()
/// does not render these onto the image.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayStats {
    pub address: String,
    pub sharpness: f64,
    pub analogue_gain: f32,
    pub shutter_secs: f64,
    pub lux: f32,
    pub colour_temperature_k: f32,
    pub frames_per_second: f64,
}

impl OverlayStats {
    pub fn lines(&self) -> Vec<String> {
        vec![
            self.address.clone(),
            format!("sharpness {:.1}", self.sharpness),
            format!("gain {:.1}", self.analogue_gain),
            format!("shutter {:.7}", self.shutter_secs),
            format!("lux: {:.1}", self.lux),
            format!("temperature: {:.0}", self.colour_temperature_k),
            format!("frames per second: {:3.1}", self.frames_per_second),
        ]
    }
}

pub struct PreviewFrame {
    pub image: RgbImage,
    pub stats: OverlayStats,
}

/// Mean absolute difference between `gray` and its 13x13 box blur. Larger
/// means more fine detail, i.e. better focus.
pub fn sharpness(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return 0.0;
    }
    let blurred = box_filter(gray, 6, 6);
    let total: u64 = gray.pixels().zip(blurred.pixels())
        .map(|(a, b)| (a.0[0] as i32 - b.0[0] as i32).unsigned_abs() as u64)
        .sum();
    total as f64 / (width as u64 * height as u64) as f64
}

// Black on bright scenes, white on dark ones.
fn contrast_colour(image: &RgbImage) -> Rgb<u8> {
    let count = (image.width() as u64 * image.height() as u64).max(1);
    let mut sums = [0u64; 3];
    for p in image.pixels() {
        for c in 0..3 {
            sums[c] += p.0[c] as u64;
        }
    }
    let mean = |c: usize| (sums[c] / count) as f64;
    let luminance = 0.299 * mean(0) + 0.587 * mean(1) + 0.114 * mean(2);
    if luminance > 127.0 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) }
}

fn draw_cross(image: &mut RgbImage, half_len: u32, colour: Rgb<u8>) {
    let cx = (image.width() / 2) as f32;
    let cy = (image.height() / 2) as f32;
    let half = half_len as f32;
    draw_line_segment_mut(image, (cx - half, cy), (cx + half, cy), colour);
    draw_line_segment_mut(image, (cx, cy - half), (cx, cy + half), colour);
}

fn downsize(image: &RgbImage, size: (u32, u32)) -> Result<RgbImage, CanonicalError> {
    let (width, height) = image.dimensions();
    let src = Image::from_vec_u8(width, height, image.as_raw().clone(), PixelType::U8x3)
        .map_err(|e| invalid_argument_error(&e.to_string()))?;
    let mut dst = Image::new(size.0, size.1, PixelType::U8x3);
    let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Lanczos3));
    Resizer::new().resize(&src, &mut dst, &options)
        .map_err(|e| failed_precondition_error(&e.to_string()))?;
    RgbImage::from_raw(size.0, size.1, dst.into_vec())
        .ok_or_else(|| failed_precondition_error("Resized buffer has wrong size"))
}

/// Renders the preview for `frame`. Fails for frames smaller than the crop
/// inset, or layouts whose inset does not fit the canvas.
pub fn compose_preview(frame: &FrameRecord, layout: &PreviewLayout, address: &str,
                       frames_per_second: f64) -> Result<PreviewFrame, CanonicalError> {
    let (width, height) = frame.image.dimensions();
    let side = layout.crop_side;
    let (preview_width, preview_height) = layout.preview_size;
    if width < side || height < side {
        return Err(invalid_argument_error(
            format!("Frame {}x{} smaller than {}px crop", width, height, side).as_str()));
    }
    if preview_width == 0 || preview_height == 0 || preview_width > layout.canvas_width ||
        side + 2 * layout.margin > layout.canvas_width ||
        side + layout.margin > preview_height
    {
        return Err(invalid_argument_error(format!("Bad preview layout {:?}", layout).as_str()));
    }

    let mut crop = imageops::crop_imm(
        &*frame.image, (width - side) / 2, (height - side) / 2, side, side).to_image();
    let colour = contrast_colour(&crop);
    let focus = sharpness(&imageops::grayscale(&crop));
    draw_cross(&mut crop, layout.crop_cross_half_len, colour);

    let mut preview = downsize(&frame.image, layout.preview_size)?;
    draw_cross(&mut preview, layout.cross_half_len, colour);

    let mut canvas = RgbImage::new(layout.canvas_width, preview_height);
    imageops::overlay(&mut canvas, &preview,
                      (layout.canvas_width - preview_width) as i64, 0);
    imageops::overlay(&mut canvas, &crop, layout.margin as i64,
                      (preview_height - side - layout.margin) as i64);

    let stats = OverlayStats{
        address: address.to_string(),
        sharpness: focus,
        analogue_gain: frame.exposure.analogue_gain,
        shutter_secs: frame.exposure.exposure_time_us as f64 / 1_000_000.0,
        lux: frame.environment.lux,
        colour_temperature_k: frame.environment.colour_temperature_k,
        frames_per_second,
    };
    Ok(PreviewFrame{image: canvas, stats})
}

// How long each iteration waits for a frame before re-checking `stop`.
const FRAME_WAIT: Duration = Duration::from_millis(500);

/// Renders previews until `stop` is set. A frame that cannot be rendered is
/// logged and skipped; the loop carries on with the next one.
pub fn run_preview_loop(controller: &CameraController, sink: &dyn DisplaySink,
                        layout: &PreviewLayout, address: &str, interval: Duration,
                        stop: &AtomicBool) {
    let mut rendered: u64 = 0;
    while !stop.load(Ordering::Relaxed) {
        let frame = match controller.capture_timeout(FRAME_WAIT) {
            Ok(frame) => frame,
            Err(CameraError::Timeout(_)) => continue,
            Err(e) => {
                warn!("Preview capture failed: {}", e);
                thread::sleep(interval);
                continue;
            },
        };
        match compose_preview(&frame, layout, address, controller.buffer().frame_rate()) {
            Ok(preview) => {
                if rendered % 50 == 0 {
                    debug!("Preview: {}", preview.stats.lines().join(" | "));
                }
                rendered += 1;
                sink.input_image(Arc::new(preview.image));
            },
            Err(e) => warn!("Skipping preview frame: {}", e),
        }
        thread::sleep(interval);
    }
}
