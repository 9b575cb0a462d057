// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use canonical_error::CanonicalError;

use camera_console::camera_controller::{CameraController, CaptureWhen, ControllerConfig};
use camera_console::capture_device::{CaptureDevice, ConfigurationRequest, ControlLimits,
                                     ControlMap, EnvironmentMetadata, ExposureMetadata,
                                     FrameCallback, RawCapture, StreamHandle};
use camera_console::error::CameraError;
use camera_console::parameter_sync::{ParameterEdit, ParameterSync};
use camera_console::simulated_camera::{SimulatedCamera, SimulatedCameraConfig};

fn camera_config() -> SimulatedCameraConfig {
    SimulatedCameraConfig{sensor_size: (64, 48),
                          exposure_step_us: 10,
                          min_frame_interval: Duration::from_millis(2),
                          ..Default::default()}
}

fn manual_request(exposure_time_us: u32) -> ConfigurationRequest {
    ConfigurationRequest{analogue_gain: 2.0,
                         colour_gains: (1.5, 2.5),
                         exposure_time_us,
                         resolution: (32, 24),
                         auto_exposure: false,
                         auto_white_balance: false}
}

fn controller_for(device: Box<dyn CaptureDevice>, reconfigure_timeout: Option<Duration>)
                  -> CameraController {
    let config = ControllerConfig{reconfigure_timeout,
                                  initial: manual_request(1000),
                                  ..Default::default()};
    CameraController::new(device, config).unwrap()
}

fn simulated_controller() -> CameraController {
    controller_for(Box::new(SimulatedCamera::new(camera_config())), None)
}

// Waits for a frame produced after this call. The first wait may be satisfied
// by a notification left over from before; the second cannot.
fn settle(controller: &CameraController) {
    for _ in 0..2 {
        controller.capture_timeout(Duration::from_secs(2)).unwrap();
    }
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(
        format!("camera-console-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_latest_applied_tracks_device() {
    let controller = simulated_controller();
    settle(&controller);
    assert_eq!(controller.latest_applied(), manual_request(1000));
    assert_eq!(controller.pending_requested(), manual_request(1000));
    assert!(!controller.is_auto());
    assert_eq!(controller.model(), "SimulatedCamera");
}

#[test]
fn test_concurrent_reconfigures_serialize() {
    let controller = Arc::new(simulated_controller());
    // Different in every field, so a mixture of the two is detectable.
    let requests = [manual_request(1500),
                    ConfigurationRequest{analogue_gain: 3.0,
                                         colour_gains: (1.0, 3.0),
                                         exposure_time_us: 2500,
                                         resolution: (48, 36),
                                         auto_exposure: false,
                                         auto_white_balance: false}];
    let handles: Vec<_> = requests.iter().cloned().map(|request| {
        let controller = controller.clone();
        thread::spawn(move || controller.reconfigure(request))
    }).collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    settle(&controller);
    let applied = controller.latest_applied();
    // Exactly one of the requests won, and it won completely.
    assert!(requests.contains(&applied));
    assert_eq!(applied, controller.pending_requested());
    let frame = controller.capture(CaptureWhen::NextFrame).unwrap();
    assert_eq!(frame.image.dimensions(), applied.resolution);
    assert_eq!(frame.exposure.analogue_gain, applied.analogue_gain);
}

#[test]
fn test_successive_edits_accumulate_before_frames() {
    // No frame arrives during the test, so nothing but reconfigure() can
    // update latest_applied.
    let config = SimulatedCameraConfig{min_frame_interval: Duration::from_secs(60),
                                       ..camera_config()};
    let controller = Arc::new(controller_for(Box::new(SimulatedCamera::new(config)), None));
    let sync = ParameterSync::new(controller.clone());
    sync.apply(ParameterEdit::RedGain(3.0)).unwrap();
    sync.apply(ParameterEdit::BlueGain(1.0)).unwrap();
    sync.apply(ParameterEdit::ExposureTime(4000)).unwrap();
    let expected = ConfigurationRequest{colour_gains: (3.0, 1.0), ..manual_request(4000)};
    assert_eq!(controller.pending_requested(), expected);
    assert_eq!(controller.latest_applied(), expected);

    controller.set_auto().unwrap();
    let applied = controller.latest_applied();
    assert!(applied.auto_exposure && applied.auto_white_balance);
}

#[test]
fn test_auto_and_manual_are_exclusive() {
    let controller = Arc::new(simulated_controller());
    controller.set_auto().unwrap();
    settle(&controller);
    assert!(controller.is_auto());
    let applied = controller.latest_applied();
    assert!(applied.auto_exposure && applied.auto_white_balance);

    let sync = ParameterSync::new(controller.clone());
    let request = sync.apply(ParameterEdit::ExposureTime(3000)).unwrap();
    assert!(!request.is_auto());
    settle(&controller);
    assert!(!controller.is_auto());
    let applied = controller.latest_applied();
    assert!(!applied.auto_exposure && !applied.auto_white_balance);
    assert_eq!(applied.exposure_time_us, 3000);
}

#[test]
fn test_next_frame_is_always_newer() {
    let controller = simulated_controller();
    // Many frames arrive; their notifications collapse into one.
    thread::sleep(Duration::from_millis(30));
    let first = controller.capture(CaptureWhen::NextFrame).unwrap();
    let second = controller.capture(CaptureWhen::NextFrame).unwrap();
    assert!(second.capture_timestamp > first.capture_timestamp);
}

#[test]
fn test_seconds_ago_lookup() {
    let controller = simulated_controller();
    settle(&controller);
    let frame = controller.capture(CaptureWhen::SecondsAgo(0.0)).unwrap();
    assert_eq!(frame.image.dimensions(), (32, 24));
    // Far outside the window still yields the oldest retained frame.
    assert!(controller.capture(CaptureWhen::from(100.0)).is_ok());
    assert!(controller.buffer().len() > 1);
}

#[test]
fn test_empty_buffer_and_timeout() {
    let config = SimulatedCameraConfig{min_frame_interval: Duration::from_secs(10),
                                       ..camera_config()};
    let controller = controller_for(Box::new(SimulatedCamera::new(config)), None);
    assert_eq!(controller.capture(CaptureWhen::SecondsAgo(0.0)).unwrap_err(),
               CameraError::EmptyBuffer);
    let timeout = Duration::from_millis(20);
    assert_eq!(controller.capture_timeout(timeout).unwrap_err(),
               CameraError::Timeout(timeout));
}

#[test]
fn test_capture_and_save() {
    let controller = simulated_controller();
    settle(&controller);
    let dir = temp_dir("save");
    let path = controller.capture_and_save(&dir, CaptureWhen::SecondsAgo(0.0)).unwrap();
    assert_eq!(path.extension().unwrap(), "png");
    let saved = image::open(&path).unwrap().to_rgb8();
    assert_eq!(saved.dimensions(), (32, 24));

    // The same second (or millisecond) never overwrites an earlier capture.
    let again = controller.capture_and_save(&dir, CaptureWhen::SecondsAgo(0.0)).unwrap();
    let third = controller.capture_and_save(&dir, CaptureWhen::SecondsAgo(0.0)).unwrap();
    assert_ne!(path, again);
    assert_ne!(again, third);
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 3);
    std::fs::remove_dir_all(&dir).unwrap();

    let missing = dir.join("does-not-exist");
    match controller.capture_and_save(&missing, CaptureWhen::SecondsAgo(0.0)) {
        Err(CameraError::Persistence(_)) => (),
        other => panic!("Expected persistence error, got {:?}", other),
    }
}

#[test]
fn test_rejected_request_rolls_back() {
    let controller = simulated_controller();
    settle(&controller);
    let bad = ConfigurationRequest{analogue_gain: 100.0, ..manual_request(1000)};
    match controller.reconfigure(bad) {
        Err(CameraError::DeviceConfiguration(_)) => (),
        other => panic!("Expected rejection, got {:?}", other),
    }
    assert_eq!(controller.pending_requested(), manual_request(1000));
    // Still producing, with the previous settings.
    settle(&controller);
    assert_eq!(controller.latest_applied(), manual_request(1000));
}

// Delegates to a SimulatedCamera but takes a while to stop.
struct SlowStopCamera {
    inner: SimulatedCamera,
    delay: Duration,
}

impl CaptureDevice for SlowStopCamera {
    fn model(&self) -> String {
        "SlowStopCamera".to_string()
    }
    fn control_limits(&self) -> ControlLimits {
        self.inner.control_limits()
    }
    fn set_frame_callback(&mut self, callback: FrameCallback) {
        self.inner.set_frame_callback(callback)
    }
    fn configure(&mut self, resolution: (u32, u32), raw_enabled: bool)
                 -> Result<StreamHandle, CanonicalError> {
        self.inner.configure(resolution, raw_enabled)
    }
    fn apply_controls(&mut self, controls: &ControlMap) -> Result<(), CanonicalError> {
        self.inner.apply_controls(controls)
    }
    fn start(&mut self) -> Result<(), CanonicalError> {
        self.inner.start()
    }
    fn stop(&mut self) -> Result<(), CanonicalError> {
        thread::sleep(self.delay);
        self.inner.stop()
    }
    fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}

#[test]
fn test_reconfigure_timeout() {
    let device = SlowStopCamera{inner: SimulatedCamera::new(camera_config()),
                                delay: Duration::from_millis(300)};
    let timeout = Duration::from_millis(50);
    let controller = Arc::new(controller_for(Box::new(device), Some(timeout)));

    let slow = {
        let controller = controller.clone();
        thread::spawn(move || controller.reconfigure(manual_request(2000)))
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(controller.reconfigure(manual_request(3000)).unwrap_err(),
               CameraError::ReconfigureTimeout(timeout));
    slow.join().unwrap().unwrap();
    assert_eq!(controller.pending_requested(), manual_request(2000));

    // The abandoned turn does not block later callers.
    controller.reconfigure(manual_request(4000)).unwrap();
    settle(&controller);
    assert_eq!(controller.latest_applied(), manual_request(4000));
}

// Produces frames only when the test hands them over, and can be told to
// panic in configure().
#[derive(Default)]
struct HandFedCamera {
    callback: Arc<Mutex<Option<FrameCallback>>>,
    panic_on_configure: Arc<AtomicBool>,
    running: bool,
}

impl CaptureDevice for HandFedCamera {
    fn model(&self) -> String {
        "HandFedCamera".to_string()
    }
    fn control_limits(&self) -> ControlLimits {
        camera_config().limits
    }
    fn set_frame_callback(&mut self, callback: FrameCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }
    fn configure(&mut self, resolution: (u32, u32), raw_enabled: bool)
                 -> Result<StreamHandle, CanonicalError> {
        if self.panic_on_configure.swap(false, Ordering::SeqCst) {
            panic!("configure failed hard");
        }
        Ok(StreamHandle{resolution, stride: resolution.0 * 3, raw_enabled})
    }
    fn apply_controls(&mut self, _controls: &ControlMap) -> Result<(), CanonicalError> {
        Ok(())
    }
    fn start(&mut self) -> Result<(), CanonicalError> {
        self.running = true;
        Ok(())
    }
    fn stop(&mut self) -> Result<(), CanonicalError> {
        self.running = false;
        Ok(())
    }
    fn is_running(&self) -> bool {
        self.running
    }
}

fn hand_over(callback: &Mutex<Option<FrameCallback>>, analogue_gain: f32) {
    let callback = callback.lock().unwrap().clone().unwrap();
    callback(RawCapture{pixels: vec![0; 4 * 4 * 3],
                        width: 4,
                        height: 4,
                        exposure: ExposureMetadata{analogue_gain,
                                                   colour_gains: (1.5, 2.5),
                                                   exposure_time_us: 1000,
                                                   resolution: (4, 4)},
                        environment: EnvironmentMetadata{lux: 100.0,
                                                         colour_temperature_k: 5000.0}});
}

#[test]
fn test_two_frames_then_one_wait_returns_second() {
    let device = HandFedCamera::default();
    let callback = device.callback.clone();
    let controller = controller_for(Box::new(device), None);
    hand_over(&callback, 1.0);
    hand_over(&callback, 2.0);
    let frame = controller.capture(CaptureWhen::NextFrame).unwrap();
    assert_eq!(frame.exposure.analogue_gain, 2.0);
    // Both notifications were used up by that one wait.
    let timeout = Duration::from_millis(30);
    assert_eq!(controller.capture_timeout(timeout).unwrap_err(),
               CameraError::Timeout(timeout));
    assert_eq!(controller.buffer().len(), 2);
}

#[test]
fn test_drop_after_panic_in_device() {
    let device = HandFedCamera::default();
    let panic_on_configure = device.panic_on_configure.clone();
    let controller = controller_for(Box::new(device), None);
    panic_on_configure.store(true, Ordering::SeqCst);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        controller.reconfigure(manual_request(2000))
    }));
    assert!(result.is_err());
    // The device lock is now poisoned; dropping must still stop the device
    // rather than panic.
    drop(controller);
}
