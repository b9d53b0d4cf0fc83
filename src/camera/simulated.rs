use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::camera::{CameraBackend, CameraConstraints, CameraError, FacingMode, Frame, LiveSource, Resolution};

/// Counters describing how the simulated device has been used.
#[derive(Debug, Clone, Default)]
pub struct SimulatedStats {
    pub acquire_calls: u32,
    pub acquired: u32,
    pub released: u32,
    pub active: u32,
    pub last_constraints: Option<CameraConstraints>,
}

struct SimState {
    stats: SimulatedStats,
    scripted_failures: VecDeque<CameraError>,
    ideal_supported: bool,
    never_ready: bool,
    report_resolution: bool,
    native: Resolution,
    ready_delay: Duration,
    pattern: u8,
}

/// A scriptable in-process camera for development mode and tests.
///
/// Like real hardware it is exclusive: acquiring while a previous handle is
/// still held fails with [`CameraError::DeviceBusy`].
#[derive(Clone)]
pub struct SimulatedCamera {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCamera {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                stats: SimulatedStats::default(),
                scripted_failures: VecDeque::new(),
                ideal_supported: true,
                never_ready: false,
                report_resolution: true,
                native: Resolution::new(640, 480),
                ready_delay: Duration::from_millis(10),
                pattern: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    pub fn stats(&self) -> SimulatedStats {
        self.state().stats.clone()
    }

    /// Queues an error returned by the next acquisition instead of a device.
    pub fn fail_next_acquire(&self, error: CameraError) {
        self.state().scripted_failures.push_back(error);
    }

    /// When false, any non-minimal constraint set is rejected as unsupported.
    pub fn set_ideal_supported(&self, supported: bool) {
        self.state().ideal_supported = supported;
    }

    pub fn set_never_ready(&self, never: bool) {
        self.state().never_ready = never;
    }

    pub fn set_report_resolution(&self, report: bool) {
        self.state().report_resolution = report;
    }

    pub fn set_native_resolution(&self, resolution: Resolution) {
        self.state().native = resolution;
    }

    pub fn set_ready_delay(&self, delay: Duration) {
        self.state().ready_delay = delay;
    }

    /// Selects the synthetic scene; different patterns encode to different images.
    pub fn set_pattern(&self, pattern: u8) {
        self.state().pattern = pattern;
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn render_pattern(resolution: Resolution, pattern: u8) -> DynamicImage {
    let img = RgbImage::from_fn(resolution.width, resolution.height, |x, y| {
        let r = ((x * 255) / resolution.width.max(1)) as u8;
        let g = ((y * 255) / resolution.height.max(1)) as u8;
        Rgb([r ^ pattern, g, pattern.wrapping_mul(37)])
    });
    DynamicImage::ImageRgb8(img)
}

#[async_trait]
impl CameraBackend for SimulatedCamera {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn acquire(&self, constraints: &CameraConstraints)
        -> Result<Box<dyn LiveSource>, CameraError>
    {
        let mut state = self.state();
        state.stats.acquire_calls += 1;
        state.stats.last_constraints = Some(constraints.clone());

        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }
        if state.stats.active > 0 {
            return Err(CameraError::DeviceBusy("simulated camera is already in use".into()));
        }
        if !state.ideal_supported && !constraints.is_minimal() {
            return Err(CameraError::Unsupported("requested constraints cannot be satisfied".into()));
        }

        let native = constraints.preferred.unwrap_or(state.native);
        state.stats.acquired += 1;
        state.stats.active += 1;

        Ok(Box::new(SimulatedSource {
            state: Arc::clone(&self.state),
            resolution: state.report_resolution.then_some(native),
            facing: constraints.facing.or(Some(FacingMode::User)),
            frame: Frame::new(render_pattern(native, state.pattern)),
            never_ready: state.never_ready,
            ready_delay: state.ready_delay,
            ready: false,
            stopped: false,
        }))
    }
}

struct SimulatedSource {
    state: Arc<Mutex<SimState>>,
    resolution: Option<Resolution>,
    facing: Option<FacingMode>,
    frame: Frame,
    never_ready: bool,
    ready_delay: Duration,
    ready: bool,
    stopped: bool,
}

#[async_trait]
impl LiveSource for SimulatedSource {
    fn label(&self) -> &str {
        "Simulated Camera"
    }

    fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    fn facing(&self) -> Option<FacingMode> {
        self.facing
    }

    async fn first_frame(&mut self) -> Result<(), CameraError> {
        if self.stopped {
            return Err(CameraError::DeviceUnavailable("simulated camera stopped".into()));
        }
        if self.never_ready {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.ready_delay).await;
        self.ready = true;
        Ok(())
    }

    fn latest_frame(&self) -> Option<Frame> {
        (self.ready && !self.stopped).then(|| self.frame.clone())
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let mut state = lock(&self.state);
        state.stats.active = state.stats.active.saturating_sub(1);
        state.stats.released += 1;
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_is_busy_until_released() {
        let camera = SimulatedCamera::new();
        let mut first = camera.acquire(&CameraConstraints::default()).await.unwrap();

        let busy = camera.acquire(&CameraConstraints::default()).await;
        assert!(matches!(busy, Err(CameraError::DeviceBusy(_))));

        first.stop();
        assert!(camera.acquire(&CameraConstraints::default()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimal_constraints_use_native_resolution_after_delay() {
        let camera = SimulatedCamera::new();
        camera.set_native_resolution(Resolution::new(320, 240));
        camera.set_ready_delay(Duration::from_secs(2));

        let mut source = camera.acquire(&CameraConstraints::minimal()).await.unwrap();
        assert_eq!(source.resolution(), Some(Resolution::new(320, 240)));
        assert!(source.latest_frame().is_none());

        let start = tokio::time::Instant::now();
        source.first_frame().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(source.latest_frame().is_some());
    }

    #[tokio::test]
    async fn test_pattern_changes_the_scene() {
        let camera = SimulatedCamera::new();
        let mut first = camera.acquire(&CameraConstraints::minimal()).await.unwrap();
        first.first_frame().await.unwrap();
        let a = first.latest_frame().unwrap();
        first.stop();

        camera.set_pattern(42);
        let mut second = camera.acquire(&CameraConstraints::minimal()).await.unwrap();
        second.first_frame().await.unwrap();
        let b = second.latest_frame().unwrap();
        assert_ne!(a.image.to_rgb8().into_raw(), b.image.to_rgb8().into_raw());
    }

    #[test]
    fn test_patterns_differ() {
        let a = render_pattern(Resolution::new(8, 8), 0);
        let b = render_pattern(Resolution::new(8, 8), 9);
        assert_ne!(a.to_rgb8().into_raw(), b.to_rgb8().into_raw());
    }
}
