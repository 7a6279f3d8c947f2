use async_trait::async_trait;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, ControlValueSetter, FrameFormat, RequestedFormat,
    RequestedFormatType,
};
use nokhwa::Camera;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{DetectorError, DetectorResult};
use crate::frame::{Frame, FRAME_SIZE};

/// Which way the preferred camera points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    #[default]
    Environment,
}

impl FacingMode {
    fn name_hints(self) -> &'static [&'static str] {
        match self {
            FacingMode::Environment => &["rear", "back", "environment", "world"],
            FacingMode::User => &["front", "user", "facetime", "integrated"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Explicit device; `None` picks by facing preference
    pub device_index: Option<u32>,
    pub facing: FacingMode,
    pub width: u32,
    pub height: u32,
    /// Upper bound on device negotiation, enforced by the caller
    pub negotiation_timeout: Duration,
    /// Request auxiliary illumination (torch) once the stream is open
    pub illumination: bool,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            device_index: None,
            facing: FacingMode::Environment,
            width: FRAME_SIZE,
            height: FRAME_SIZE,
            negotiation_timeout: Duration::from_millis(10_000),
            illumination: true,
        }
    }
}

/// An open capture stream.
#[async_trait]
pub trait FrameSource: Send {
    /// Latest captured frame. Never waits for a new one.
    fn current_frame(&self) -> DetectorResult<Frame>;

    /// Best effort; callers ignore failures.
    async fn enable_illumination(&mut self) -> DetectorResult<()> {
        Err(DetectorError::CaptureUnavailable(
            "illumination not supported".to_string(),
        ))
    }

    fn stop(&mut self);

    fn describe(&self) -> String;
}

#[async_trait]
pub trait CaptureOpener: Send + Sync {
    async fn open(&self, request: &CaptureRequest) -> DetectorResult<Box<dyn FrameSource>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    pub index: u32,
    pub name: String,
}

pub fn list_cameras() -> DetectorResult<Vec<CameraDevice>> {
    let devices = nokhwa::query(ApiBackend::Auto)
        .map_err(|e| DetectorError::CaptureUnavailable(format!("device query failed: {}", e)))?;

    Ok(devices
        .into_iter()
        .filter_map(|info| match info.index() {
            CameraIndex::Index(index) => Some(CameraDevice {
                index: *index,
                name: info.human_name(),
            }),
            CameraIndex::String(_) => None,
        })
        .collect())
}

/// Pick the device to open: explicit index, then facing hint by name, then the first device.
pub fn choose_device(
    devices: &[CameraDevice],
    facing: FacingMode,
    explicit: Option<u32>,
) -> Option<u32> {
    if let Some(index) = explicit {
        return devices.iter().find(|d| d.index == index).map(|d| d.index);
    }

    let hints = facing.name_hints();
    devices
        .iter()
        .find(|device| {
            let name = device.name.to_lowercase();
            hints.iter().any(|hint| name.contains(hint))
        })
        .or_else(|| devices.first())
        .map(|device| device.index)
}

/// Resolve the device to open from an enumeration result.
fn select_device(
    devices: DetectorResult<Vec<CameraDevice>>,
    request: &CaptureRequest,
) -> DetectorResult<u32> {
    let devices = devices?;
    if devices.is_empty() {
        return Err(DetectorError::CaptureUnavailable(
            "no cameras detected on this system".to_string(),
        ));
    }
    info!("Found {} camera(s): {:?}", devices.len(), devices);

    choose_device(&devices, request.facing, request.device_index).ok_or_else(|| {
        DetectorError::CaptureUnavailable(format!(
            "camera {} not found",
            request.device_index.unwrap_or_default()
        ))
    })
}

fn is_illumination_control(name: &str) -> bool {
    let name = name.to_lowercase();
    ["torch", "flash", "led"]
        .iter()
        .any(|hint| name.contains(hint))
}

enum CaptureCommand {
    EnableIllumination(oneshot::Sender<DetectorResult<()>>),
    Stop,
}

/// Opens webcams through nokhwa on a dedicated capture thread.
///
/// Device enumeration, opening and the first frame all happen on that thread,
/// so the returned future only ever waits on the readiness channel.
#[derive(Debug, Default)]
pub struct NokhwaOpener;

#[async_trait]
impl CaptureOpener for NokhwaOpener {
    async fn open(&self, request: &CaptureRequest) -> DetectorResult<Box<dyn FrameSource>> {
        let latest = Arc::new(Mutex::new(None));
        let (command_tx, command_rx) = channel::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker_latest = Arc::clone(&latest);
        let worker_request = request.clone();
        std::thread::Builder::new()
            .name("toolsight-capture".to_string())
            .spawn(move || run_capture_thread(worker_request, worker_latest, command_rx, ready_tx))
            .map_err(|e| DetectorError::CaptureUnavailable(format!("capture thread: {}", e)))?;

        let device = ready_rx.await.map_err(|_| {
            DetectorError::CaptureUnavailable("capture thread exited during negotiation".to_string())
        })??;
        info!("Camera streaming ({})", device);

        Ok(Box::new(NokhwaCapture {
            device,
            latest,
            commands: command_tx,
            stopped: false,
        }))
    }
}

pub struct NokhwaCapture {
    device: String,
    latest: Arc<Mutex<Option<Frame>>>,
    commands: Sender<CaptureCommand>,
    stopped: bool,
}

#[async_trait]
impl FrameSource for NokhwaCapture {
    fn current_frame(&self) -> DetectorResult<Frame> {
        self.latest
            .lock()
            .clone()
            .ok_or_else(|| DetectorError::CaptureUnavailable("no frame captured yet".to_string()))
    }

    async fn enable_illumination(&mut self) -> DetectorResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(CaptureCommand::EnableIllumination(reply_tx))
            .map_err(|_| DetectorError::CaptureUnavailable("capture thread gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| DetectorError::CaptureUnavailable("no illumination reply".to_string()))?
    }

    fn stop(&mut self) {
        if !self.stopped {
            info!("Stopping camera {}", self.device);
            let _ = self.commands.send(CaptureCommand::Stop);
            self.stopped = true;
        }
    }

    fn describe(&self) -> String {
        self.device.clone()
    }
}

impl Drop for NokhwaCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_camera(index: u32, request: &CaptureRequest) -> DetectorResult<Camera> {
    let ideal = CameraFormat::new_from(request.width, request.height, FrameFormat::MJPEG, 30);
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(ideal));

    let mut camera = Camera::new(CameraIndex::Index(index), requested)
        .map_err(|e| DetectorError::CaptureUnavailable(format!("camera {}: {}", index, e)))?;
    camera
        .open_stream()
        .map_err(|e| DetectorError::CaptureUnavailable(format!("camera {}: {}", index, e)))?;
    Ok(camera)
}

fn grab_frame(camera: &mut Camera, target: (u32, u32), sequence: u64) -> DetectorResult<Frame> {
    let buffer = camera
        .frame()
        .map_err(|e| DetectorError::CaptureUnavailable(format!("frame capture: {}", e)))?;
    let decoded = buffer
        .decode_image::<RgbFormat>()
        .map_err(|e| DetectorError::CaptureUnavailable(format!("frame decode: {}", e)))?;
    let (width, height) = (decoded.width(), decoded.height());

    Frame::from_rgb(width, height, decoded.into_raw(), target, sequence)
        .ok_or_else(|| DetectorError::CaptureUnavailable("malformed frame buffer".to_string()))
}

fn enable_torch(camera: &mut Camera) -> DetectorResult<()> {
    let controls = camera
        .camera_controls()
        .map_err(|e| DetectorError::CaptureUnavailable(format!("camera controls: {}", e)))?;
    let torch = controls
        .iter()
        .find(|control| is_illumination_control(control.name()))
        .ok_or_else(|| DetectorError::CaptureUnavailable("no torch control".to_string()))?;

    camera
        .set_camera_control(torch.control(), ControlValueSetter::Boolean(true))
        .map_err(|e| DetectorError::CaptureUnavailable(format!("torch: {}", e)))
}

fn run_capture_thread(
    request: CaptureRequest,
    latest: Arc<Mutex<Option<Frame>>>,
    commands: Receiver<CaptureCommand>,
    ready: oneshot::Sender<DetectorResult<String>>,
) {
    let target = (request.width, request.height);
    let index = match select_device(list_cameras(), &request) {
        Ok(index) => index,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut camera = match open_camera(index, &request) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // The stream only counts as negotiated once a frame arrives
    let mut sequence = 0u64;
    match grab_frame(&mut camera, target, sequence) {
        Ok(frame) => *latest.lock() = Some(frame),
        Err(e) => {
            let _ = camera.stop_stream();
            let _ = ready.send(Err(e));
            return;
        }
    }

    if ready.send(Ok(camera.info().human_name())).is_err() {
        debug!("Camera negotiation abandoned, releasing camera {}", index);
        let _ = camera.stop_stream();
        return;
    }

    loop {
        match commands.try_recv() {
            Ok(CaptureCommand::Stop) | Err(TryRecvError::Disconnected) => break,
            Ok(CaptureCommand::EnableIllumination(reply)) => {
                let _ = reply.send(enable_torch(&mut camera));
            }
            Err(TryRecvError::Empty) => {}
        }

        sequence += 1;
        match grab_frame(&mut camera, target, sequence) {
            Ok(frame) => *latest.lock() = Some(frame),
            Err(e) => {
                warn!("Camera frame capture failed: {}", e);
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }

    match camera.stop_stream() {
        Ok(_) => info!("Camera stream stopped after {} frames", sequence),
        Err(e) => warn!("Error stopping camera stream: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(names: &[&str]) -> Vec<CameraDevice> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| CameraDevice {
                index: i as u32,
                name: name.to_string(),
            })
            .collect()
    }

    #[test]
    fn environment_prefers_rear_camera() {
        let list = devices(&["Front Camera", "Back Camera"]);
        assert_eq!(choose_device(&list, FacingMode::Environment, None), Some(1));
        assert_eq!(choose_device(&list, FacingMode::User, None), Some(0));
    }

    #[test]
    fn falls_back_to_first_device() {
        let list = devices(&["USB Video Device", "HD Webcam"]);
        assert_eq!(choose_device(&list, FacingMode::Environment, None), Some(0));
        assert_eq!(choose_device(&[], FacingMode::Environment, None), None);
    }

    #[test]
    fn explicit_index_must_exist() {
        let list = devices(&["Front Camera", "Back Camera"]);
        assert_eq!(choose_device(&list, FacingMode::Environment, Some(0)), Some(0));
        assert_eq!(choose_device(&list, FacingMode::Environment, Some(5)), None);
    }

    #[test]
    fn selection_reports_missing_devices() {
        let request = CaptureRequest::default();
        match select_device(Ok(Vec::new()), &request) {
            Err(DetectorError::CaptureUnavailable(message)) => assert!(message.contains("no cameras")),
            other => panic!("unexpected selection: {:?}", other),
        }

        let query_failed = Err(DetectorError::CaptureUnavailable("device query failed".to_string()));
        assert!(select_device(query_failed, &request).is_err());

        let pinned = CaptureRequest {
            device_index: Some(7),
            ..CaptureRequest::default()
        };
        let list = devices(&["Front Camera", "Back Camera"]);
        assert!(select_device(Ok(list.clone()), &pinned).is_err());
        assert_eq!(select_device(Ok(list), &request).unwrap(), 1);
    }

    #[test]
    fn recognises_torch_controls() {
        assert!(is_illumination_control("LED1 Mode"));
        assert!(is_illumination_control("Torch"));
        assert!(!is_illumination_control("Brightness"));
        assert!(!is_illumination_control("Backlight Compensation"));
    }

    #[test]
    fn default_request_targets_square_frames() {
        let request = CaptureRequest::default();
        assert_eq!((request.width, request.height), (FRAME_SIZE, FRAME_SIZE));
        assert_eq!(request.negotiation_timeout, Duration::from_secs(10));
        assert_eq!(request.facing, FacingMode::Environment);
    }
}
