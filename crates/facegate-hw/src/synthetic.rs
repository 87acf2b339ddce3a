//! Hardware-free capture device that streams a generated test pattern.

use crate::device::{CaptureDevice, CaptureError};
use crate::frame::Frame;
use crate::surface::VideoSurface;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const FRAME_INTERVAL: Duration = Duration::from_millis(33);

struct Pump {
    live: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
    surface: Arc<VideoSurface>,
}

/// Streams a fixed synthetic face pattern at ~30 fps.
pub struct SyntheticDevice {
    width: u32,
    height: u32,
    first_frame_delay: Duration,
    pump: Mutex<Option<Pump>>,
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl SyntheticDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            first_frame_delay: Duration::ZERO,
            pump: Mutex::new(None),
        }
    }

    /// Delay before the first frame reaches the surface, mimicking a camera
    /// that takes a moment to start delivering video.
    pub fn with_first_frame_delay(mut self, delay: Duration) -> Self {
        self.first_frame_delay = delay;
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

#[async_trait]
impl CaptureDevice for SyntheticDevice {
    async fn acquire(&self, surface: Arc<VideoSurface>) -> Result<(), CaptureError> {
        let mut pump = self.pump.lock().unwrap_or_else(|e| e.into_inner());
        if pump.is_some() {
            return Err(CaptureError::DeviceUnavailable("synthetic device busy".into()));
        }

        let pattern = face_pattern(self.width, self.height);
        let live = Arc::new(Mutex::new(true));
        let task = {
            let live = live.clone();
            let surface = surface.clone();
            let delay = self.first_frame_delay;
            let (width, height) = (self.width, self.height);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut ticker = tokio::time::interval(FRAME_INTERVAL);
                let mut sequence = 0u32;
                loop {
                    ticker.tick().await;
                    let frame = match Frame::from_gray(pattern.clone(), width, height, sequence) {
                        Ok(f) => f,
                        Err(err) => {
                            tracing::warn!(error = %err, "synthetic frame rejected");
                            break;
                        }
                    };
                    // Holding the flag while presenting keeps a racing release()
                    // from being followed by a stale frame.
                    let live = live.lock().unwrap_or_else(|e| e.into_inner());
                    if !*live {
                        break;
                    }
                    surface.present(frame);
                    drop(live);
                    sequence = sequence.wrapping_add(1);
                }
            })
        };

        tracing::info!(width = self.width, height = self.height, "synthetic camera acquired");
        *pump = Some(Pump { live, task, surface });
        Ok(())
    }

    fn release(&self) {
        let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        *pump.live.lock().unwrap_or_else(|e| e.into_inner()) = false;
        pump.task.abort();
        pump.surface.clear();
        tracing::info!("synthetic camera released");
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.release();
    }
}

/// Grayscale frame with a bright oval "face", two dark eyes and a mouth on a
/// vertical gradient background.
pub fn face_pattern(width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as f32, height as f32);
    let (cx, cy) = (w / 2.0, h / 2.0);
    let (rx, ry) = (w * 0.18, h * 0.32);
    let eye_r = (w.min(h) * 0.04).max(1.0);
    let eyes = [(cx - rx * 0.4, cy - ry * 0.25), (cx + rx * 0.4, cy - ry * 0.25)];

    let mut data = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let (fx, fy) = (x as f32, y as f32);
            let background = 40.0 + 60.0 * fy / h.max(1.0);

            let nx = (fx - cx) / rx;
            let ny = (fy - cy) / ry;
            let in_face = nx * nx + ny * ny <= 1.0;

            let value = if !in_face {
                background
            } else if eyes
                .iter()
                .any(|&(ex, ey)| (fx - ex).powi(2) + (fy - ey).powi(2) <= eye_r * eye_r)
            {
                30.0
            } else if ny > 0.45 && ny < 0.55 && nx.abs() < 0.35 {
                70.0
            } else {
                200.0 - 40.0 * (nx * nx + ny * ny)
            };
            data.push(value.clamp(0.0, 255.0) as u8);
        }
    }
    data
}
