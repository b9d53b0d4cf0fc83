use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, RgbImage};
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::camera::{
    CameraBackend, CameraConstraints, CameraError, CameraInfo, FacingMode, Frame, LiveSource, Resolution,
};
use crate::common::config::CameraConfig;

/// Device index that asks for auto-detection.
pub const AUTO_DETECT_INDEX: u32 = 999;

const STREAM_BUFFERS: u32 = 4;
const STREAM_POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    Mjpg,
    Yuyv,
    Grey,
}

impl PixelFormat {
    const PREFERENCE: [PixelFormat; 3] = [PixelFormat::Mjpg, PixelFormat::Yuyv, PixelFormat::Grey];

    fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Mjpg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Grey => FourCC::new(b"GREY"),
        }
    }

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        Self::PREFERENCE.into_iter().find(|f| f.fourcc().repr == fourcc.repr)
    }

    fn preferred_from(offered: &[FourCC]) -> Option<Self> {
        Self::PREFERENCE.into_iter()
            .find(|f| offered.iter().any(|o| o.repr == f.fourcc().repr))
    }
}

struct Negotiated {
    label: String,
    resolution: Resolution,
    pixel_format: PixelFormat,
}

/// Video4Linux2 capture devices (`/dev/video*`).
pub struct V4l2Backend {
    device_index: u32,
    warmup_frames: u32,
    warmup_delay: Duration,
}

impl V4l2Backend {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            device_index: config.device_index,
            warmup_frames: config.warmup_frames,
            warmup_delay: Duration::from_millis(config.warmup_delay_ms),
        }
    }

    /// List all video devices with their capabilities.
    pub fn list_cameras() -> Result<Vec<CameraInfo>, CameraError> {
        let entries = fs::read_dir("/dev")
            .map_err(|e| classify_io(&e, "scan /dev"))?;

        let mut cameras = Vec::new();
        for entry in entries.flatten() {
            let filename = entry.file_name();
            let Some(index) = filename.to_str()
                .and_then(|n| n.strip_prefix("video"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let Ok(device) = Device::new(index as usize) else { continue };
            let Ok(caps) = device.query_caps() else { continue };

            let formats = device.enum_formats()
                .unwrap_or_default()
                .iter()
                .map(|f| f.fourcc.str().unwrap_or("UNKNOWN").trim().to_string())
                .collect();

            cameras.push(CameraInfo {
                index,
                name: caps.card.clone(),
                formats,
                can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            });
        }

        cameras.sort_by_key(|c| c.index);
        Ok(cameras)
    }

    /// Picks the first capture device offering a colour format, else any
    /// capture device.
    pub fn detect_camera() -> Result<u32, CameraError> {
        let cameras = Self::list_cameras()?;
        let chosen = cameras.iter()
            .find(|c| c.can_capture && c.has_color_format())
            .or_else(|| cameras.iter().find(|c| c.can_capture))
            .ok_or_else(|| CameraError::DeviceUnavailable("no video capture device found".into()))?;

        tracing::info!("Selected camera: {}", chosen);
        Ok(chosen.index)
    }

}

fn resolve_index(configured: u32) -> Result<u32, CameraError> {
    if configured == AUTO_DETECT_INDEX {
        V4l2Backend::detect_camera()
    } else {
        Ok(configured)
    }
}

/// Owns the capture thread. Dropping it raises the stop flag and joins, so
/// an abandoned open or a dropped source never leaves the device held.
struct CaptureThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureThread {
    fn spawn<F>(name: String, body: F) -> io::Result<Self>
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || body(&thread_stop))?;
        Ok(Self { stop, handle: Some(handle) })
    }

    /// Returns false if the thread panicked.
    fn stop_and_join(&mut self) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        if !self.stop_and_join() {
            tracing::warn!("Camera capture thread panicked");
        }
    }
}

#[async_trait]
impl CameraBackend for V4l2Backend {
    fn name(&self) -> &str {
        "v4l2"
    }

    async fn acquire(&self, constraints: &CameraConstraints)
        -> Result<Box<dyn LiveSource>, CameraError>
    {
        let device_index = self.device_index;
        let constraints = constraints.clone();
        let warmup_frames = self.warmup_frames;
        let warmup_delay = self.warmup_delay;

        let (info_tx, info_rx) = oneshot::channel();
        let (frame_tx, frame_rx) = watch::channel(None);

        // Device discovery and opening block, so both happen on the capture thread.
        let thread = CaptureThread::spawn(format!("v4l2-capture-{}", device_index), move |stop| {
            capture_loop(device_index, &constraints, warmup_frames, warmup_delay, stop, info_tx, frame_tx)
        })
        .map_err(|e| CameraError::DeviceUnavailable(format!("failed to start capture thread: {}", e)))?;

        match info_rx.await {
            Ok(Ok(negotiated)) => Ok(Box::new(V4l2Source {
                label: negotiated.label,
                resolution: negotiated.resolution,
                frames: frame_rx,
                thread,
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CameraError::DeviceUnavailable("capture thread exited during setup".into())),
        }
    }
}

fn open_device(index: u32, constraints: &CameraConstraints) -> Result<(Device, Negotiated), CameraError> {
    tracing::debug!("Opening camera device {}...", index);

    let device = Device::new(index as usize)
        .map_err(|e| classify_io(&e, &format!("open /dev/video{}", index)))?;

    let caps = device.query_caps()
        .map_err(|e| classify_io(&e, "query capabilities"))?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::Unsupported(format!("{} does not support video capture", caps.card)));
    }

    let offered: Vec<FourCC> = device.enum_formats()
        .unwrap_or_default()
        .into_iter()
        .map(|d| d.fourcc)
        .collect();
    let wanted = PixelFormat::preferred_from(&offered)
        .ok_or_else(|| CameraError::Unsupported(format!("{} offers no MJPG, YUYV or GREY format", caps.card)))?;

    let mut fmt = device.format()
        .map_err(|e| classify_io(&e, "get format"))?;
    fmt.fourcc = wanted.fourcc();
    if let Some(preferred) = constraints.preferred {
        fmt.width = preferred.width;
        fmt.height = preferred.height;
    }

    if let Err(e) = device.set_format(&fmt) {
        if !constraints.is_minimal() {
            return Err(classify_io(&e, "set format"));
        }
        tracing::warn!("Could not set format: {}. Using device defaults.", e);
    }

    let actual = device.format()
        .map_err(|e| classify_io(&e, "get final format"))?;
    let resolution = Resolution::new(actual.width, actual.height);
    tracing::debug!("Actual format: {} {}", resolution, actual.fourcc.str().unwrap_or("????"));

    if !constraints.admits(resolution) {
        return Err(CameraError::Unsupported(format!(
            "camera negotiated {} outside the requested bounds", resolution
        )));
    }
    let pixel_format = PixelFormat::from_fourcc(actual.fourcc)
        .ok_or_else(|| CameraError::Unsupported(format!(
            "unsupported pixel format {}", actual.fourcc.str().unwrap_or("????")
        )))?;

    if let Some(fps) = constraints.frame_rate {
        if let Err(e) = device.set_params(&Parameters::with_fps(fps)) {
            tracing::debug!("Frame rate {} not accepted: {}", fps, e);
        }
    }

    Ok((device, Negotiated { label: caps.card, resolution, pixel_format }))
}

fn capture_loop(
    device_index: u32,
    constraints: &CameraConstraints,
    warmup_frames: u32,
    warmup_delay: Duration,
    stop: &AtomicBool,
    info_tx: oneshot::Sender<Result<Negotiated, CameraError>>,
    frame_tx: watch::Sender<Option<Frame>>,
) {
    let opened = resolve_index(device_index)
        .and_then(|index| open_device(index, constraints).map(|opened| (index, opened)));
    let (index, (mut device, negotiated)) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = info_tx.send(Err(e));
            return;
        }
    };
    let resolution = negotiated.resolution;
    let pixel_format = negotiated.pixel_format;

    let mut stream = match Stream::with_buffers(&mut device, Type::VideoCapture, STREAM_BUFFERS) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = info_tx.send(Err(classify_io(&e, "start stream")));
            return;
        }
    };
    stream.set_timeout(STREAM_POLL_TIMEOUT);

    // Receiver gone or stop raised means the caller abandoned the open;
    // dropping the stream and device here releases the camera.
    if stop.load(Ordering::SeqCst) || info_tx.send(Ok(negotiated)).is_err() {
        return;
    }

    let mut warmed = 0;
    while !stop.load(Ordering::Relaxed) {
        match stream.next() {
            Ok((buf, meta)) => {
                if warmed < warmup_frames {
                    warmed += 1;
                    thread::sleep(warmup_delay);
                    continue;
                }
                let used = match meta.bytesused as usize {
                    0 => buf.len(),
                    n => n.min(buf.len()),
                };
                match decode_frame(&buf[..used], pixel_format, resolution) {
                    Some(image) => {
                        if frame_tx.send(Some(Frame::new(image))).is_err() {
                            break;
                        }
                    }
                    None => tracing::debug!("Dropped undecodable {:?} frame", pixel_format),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                tracing::warn!("Camera stream error: {}", e);
                break;
            }
        }
    }

    tracing::debug!("Capture loop for /dev/video{} exiting", index);
}

fn decode_frame(data: &[u8], format: PixelFormat, resolution: Resolution) -> Option<DynamicImage> {
    let (w, h) = (resolution.width, resolution.height);
    match format {
        PixelFormat::Mjpg => image::load_from_memory_with_format(data, ImageFormat::Jpeg).ok(),
        PixelFormat::Yuyv => yuyv_to_rgb(data, w, h).map(DynamicImage::ImageRgb8),
        PixelFormat::Grey => {
            let len = (w * h) as usize;
            let pixels = data.get(..len)?.to_vec();
            ImageBuffer::<Luma<u8>, _>::from_raw(w, h, pixels).map(DynamicImage::ImageLuma8)
        }
    }
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Option<RgbImage> {
    let expected = (width * height * 2) as usize;
    if data.len() < expected || width % 2 != 0 {
        return None;
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    RgbImage::from_raw(width, height, rgb)
}

// BT.601 limited range
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 1.164 * (y as f32 - 16.0);
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [clamp(c + 1.596 * e), clamp(c - 0.392 * d - 0.813 * e), clamp(c + 2.017 * d)]
}

const EPERM: i32 = 1;
const ENOENT: i32 = 2;
const ENXIO: i32 = 6;
const EACCES: i32 = 13;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const ENOTTY: i32 = 25;

fn classify_io(err: &io::Error, context: &str) -> CameraError {
    let detail = format!("{}: {}", context, err);
    match err.raw_os_error() {
        Some(EACCES) | Some(EPERM) => CameraError::PermissionDenied(detail),
        Some(EBUSY) => CameraError::DeviceBusy(detail),
        Some(ENOENT) | Some(ENODEV) | Some(ENXIO) => CameraError::DeviceUnavailable(detail),
        Some(EINVAL) | Some(ENOTTY) => CameraError::Unsupported(detail),
        _ => match err.kind() {
            io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(detail),
            io::ErrorKind::Unsupported => CameraError::Unsupported(detail),
            _ => CameraError::DeviceUnavailable(detail),
        },
    }
}

struct V4l2Source {
    label: String,
    resolution: Resolution,
    frames: watch::Receiver<Option<Frame>>,
    thread: CaptureThread,
}

#[async_trait]
impl LiveSource for V4l2Source {
    fn label(&self) -> &str {
        &self.label
    }

    fn resolution(&self) -> Option<Resolution> {
        Some(self.resolution)
    }

    fn facing(&self) -> Option<FacingMode> {
        // V4L2 does not report mounting; a punch terminal camera faces the user.
        Some(FacingMode::User)
    }

    async fn first_frame(&mut self) -> Result<(), CameraError> {
        let mut frames = self.frames.clone();
        let produced = frames.wait_for(Option::is_some).await.is_ok();
        if produced {
            Ok(())
        } else {
            Err(CameraError::DeviceUnavailable("camera stream ended before the first frame".into()))
        }
    }

    fn latest_frame(&self) -> Option<Frame> {
        self.frames.borrow().clone()
    }

    fn stop(&mut self) {
        if !self.thread.stop_and_join() {
            tracing::warn!("Capture thread for '{}' panicked", self.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_preference() {
        let offered = [FourCC::new(b"GREY"), FourCC::new(b"YUYV")];
        assert_eq!(PixelFormat::preferred_from(&offered), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::preferred_from(&[FourCC::new(b"H264")]), None);
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
    }

    #[test]
    fn test_yuv_extremes() {
        assert_eq!(yuv_to_rgb(16, 128, 128), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(235, 128, 128), [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_frame_size_checked() {
        let data = vec![128u8; 4 * 2 * 2];
        let img = yuyv_to_rgb(&data, 4, 2).unwrap();
        assert_eq!(img.dimensions(), (4, 2));
        assert!(yuyv_to_rgb(&data[..10], 4, 2).is_none());
    }

    #[test]
    fn test_grey_decode() {
        let data = vec![200u8; 6];
        let img = decode_frame(&data, PixelFormat::Grey, Resolution::new(3, 2)).unwrap();
        assert_eq!((img.width(), img.height()), (3, 2));
        assert!(decode_frame(&data[..4], PixelFormat::Grey, Resolution::new(3, 2)).is_none());
    }

    #[test]
    fn test_dropping_capture_thread_stops_and_joins() {
        let exited = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exited);
        let thread = CaptureThread::spawn("v4l2-test".into(), move |stop| {
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        drop(thread);
        assert!(exited.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_and_join_is_idempotent() {
        let mut thread = CaptureThread::spawn("v4l2-test".into(), |_| {}).unwrap();
        assert!(thread.stop_and_join());
        assert!(thread.stop_and_join());
    }

    #[tokio::test]
    async fn test_abandoned_open_releases_thread() {
        let opened = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&opened);
        let (info_tx, info_rx) = oneshot::channel::<()>();

        let pending = async move {
            let thread = CaptureThread::spawn("v4l2-test".into(), move |stop| {
                flag.store(true, Ordering::SeqCst);
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                flag.store(false, Ordering::SeqCst);
                drop(info_tx);
            })
            .unwrap();
            let _ = info_rx.await;
            drop(thread);
        };

        // Dropping the open midway must tear the thread down before returning.
        let _ = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(!opened.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_missing_device_is_unavailable() {
        let backend = V4l2Backend {
            device_index: 4000,
            warmup_frames: 0,
            warmup_delay: Duration::ZERO,
        };
        let err = backend.acquire(&CameraConstraints::minimal()).await.err().unwrap();
        assert!(matches!(err, CameraError::DeviceUnavailable(_)));
    }

    #[test]
    fn test_errno_classification() {
        let busy = classify_io(&io::Error::from_raw_os_error(EBUSY), "set format");
        assert!(matches!(busy, CameraError::DeviceBusy(_)));
        let denied = classify_io(&io::Error::from_raw_os_error(EACCES), "open");
        assert!(matches!(denied, CameraError::PermissionDenied(_)));
        let missing = classify_io(&io::Error::from_raw_os_error(ENOENT), "open");
        assert!(matches!(missing, CameraError::DeviceUnavailable(_)));
        let unsupported = classify_io(&io::Error::from_raw_os_error(ENOTTY), "query");
        assert!(matches!(unsupported, CameraError::Unsupported(_)));
    }
}
