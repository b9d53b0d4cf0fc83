use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ColorType;

use crate::camera::{CameraError, CameraSession, Frame, Resolution};
use crate::core::model::CapturedImage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    /// 80-90; 85 by default.
    pub jpeg_quality: u8,
    /// Flip horizontally so the still matches the user's self-view.
    pub mirror: bool,
    /// Output size when the session never reported a native resolution.
    pub default_size: Resolution,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self { jpeg_quality: 85, mirror: true, default_size: Resolution::DEFAULT_OUTPUT }
    }
}

/// Turns the current frame of a live session into an encoded still.
#[derive(Debug, Clone)]
pub struct FrameCapturer {
    settings: CaptureSettings,
}

impl FrameCapturer {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }

    pub fn output_size(&self, session: &CameraSession) -> Resolution {
        session.resolution().unwrap_or(self.settings.default_size)
    }

    /// Takes the current frame without encoding it, so the caller can release
    /// the camera before the (slower) encode.
    pub fn grab(&self, session: &CameraSession) -> Result<(Frame, Resolution), CameraError> {
        let frame = session.current_frame()?;
        Ok((frame, self.output_size(session)))
    }

    /// Encodes on the blocking pool.
    pub async fn encode(&self, frame: Frame, size: Resolution) -> Result<CapturedImage, CameraError> {
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || encode_still(&frame, size, &settings))
            .await
            .map_err(|e| CameraError::Unsupported(format!("still encoding aborted: {}", e)))?
    }

    pub async fn snapshot(&self, session: &CameraSession) -> Result<CapturedImage, CameraError> {
        let (frame, size) = self.grab(session)?;
        self.encode(frame, size).await
    }
}

pub fn encode_still(frame: &Frame, size: Resolution, settings: &CaptureSettings) -> Result<CapturedImage, CameraError> {
    let mut image = (*frame.image).clone();
    if image.width() != size.width || image.height() != size.height {
        image = image.resize_exact(size.width, size.height, FilterType::Triangle);
    }
    if settings.mirror {
        image = image.fliph();
    }

    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, settings.jpeg_quality);
    encoder.encode(rgb.as_raw(), size.width, size.height, ColorType::Rgb8)
        .map_err(|e| CameraError::Unsupported(format!("failed to encode still: {}", e)))?;

    Ok(CapturedImage::jpeg(bytes, size.width, size.height, frame.captured_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraConstraints, SimulatedCamera};
    use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
    use std::time::Duration;

    fn split_frame() -> Frame {
        // Left half black, right half white.
        let img = RgbImage::from_fn(64, 48, |x, _| if x < 32 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) });
        Frame::new(DynamicImage::ImageRgb8(img))
    }

    #[test]
    fn test_encodes_jpeg_at_requested_size() {
        let settings = CaptureSettings { mirror: false, ..CaptureSettings::default() };
        let still = encode_still(&split_frame(), Resolution::new(32, 24), &settings).unwrap();

        assert_eq!(still.mime_type(), "image/jpeg");
        assert_eq!((still.width(), still.height()), (32, 24));
        let decoded = image::load_from_memory(still.bytes()).unwrap();
        assert_eq!(decoded.dimensions(), (32, 24));
    }

    #[test]
    fn test_mirror_flips_horizontally() {
        let settings = CaptureSettings::default();
        let still = encode_still(&split_frame(), Resolution::new(64, 48), &settings).unwrap();
        let decoded = image::load_from_memory(still.bytes()).unwrap().to_rgb8();

        assert!(decoded.get_pixel(2, 24)[0] > 200);
        assert!(decoded.get_pixel(61, 24)[0] < 50);
    }

    #[tokio::test]
    async fn test_snapshot_before_ready_fails() {
        let camera = SimulatedCamera::new();
        let session = CameraSession::open(&camera, &CameraConstraints::default()).await.unwrap();
        let capturer = FrameCapturer::new(CaptureSettings::default());

        let err = capturer.snapshot(&session).await.unwrap_err();
        assert_eq!(err, CameraError::NoFrameAvailable);
    }

    #[tokio::test]
    async fn test_unreported_resolution_uses_default_output() {
        let camera = SimulatedCamera::new();
        camera.set_report_resolution(false);
        let mut session = CameraSession::open(&camera, &CameraConstraints {
            preferred: Some(Resolution::new(320, 240)),
            ..CameraConstraints::default()
        }).await.unwrap();
        session.wait_ready(Duration::from_secs(1)).await.unwrap();

        let still = FrameCapturer::new(CaptureSettings::default()).snapshot(&session).await.unwrap();
        assert_eq!((still.width(), still.height()), (640, 480));
    }
}
