//! Live video surface shared between a capture device and the presentation layer.

use crate::frame::Frame;
use std::sync::Mutex;
use tokio::sync::watch;

/// Rendering target a device streams into.
///
/// The presentation layer owns the surface and renders [`latest_frame`](Self::latest_frame);
/// a bound device calls [`present`](Self::present) for every delivered frame.
/// Dimensions stay 0×0 until the first frame arrives and fall back to 0×0 on
/// [`clear`](Self::clear).
pub struct VideoSurface {
    latest: Mutex<Option<Frame>>,
    dimensions: watch::Sender<(u32, u32)>,
}

impl Default for VideoSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSurface {
    pub fn new() -> Self {
        let (dimensions, _) = watch::channel((0, 0));
        Self {
            latest: Mutex::new(None),
            dimensions,
        }
    }

    /// Replace the displayed frame.
    pub fn present(&self, frame: Frame) {
        let dims = (frame.width, frame.height);
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
        self.dimensions.send_if_modified(|current| {
            if *current != dims {
                *current = dims;
                true
            } else {
                false
            }
        });
    }

    /// Drop the displayed frame; called when the stream stops.
    pub fn clear(&self) {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.dimensions.send_replace((0, 0));
    }

    /// Current video dimensions, `(0, 0)` before the stream delivers.
    pub fn dimensions(&self) -> (u32, u32) {
        *self.dimensions.borrow()
    }

    pub fn is_ready(&self) -> bool {
        let (w, h) = self.dimensions();
        w > 0 && h > 0
    }

    /// Most recent frame, if the stream has delivered one.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolve once the surface reports non-zero dimensions.
    pub async fn ready(&self) {
        let mut rx = self.dimensions.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|&(w, h)| w > 0 && h > 0).await;
    }
}
