//! Capture device contract: acquire a stream, release it, take a still.

use crate::frame::FrameError;
use crate::surface::VideoSurface;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("video surface has not delivered a frame yet")]
    NotReady,
    #[error("still encoding failed: {0}")]
    Encode(#[from] FrameError),
    #[error("stream error: {0}")]
    Stream(String),
}

/// A single still extracted from the live surface, encoded as an image data URL.
///
/// Owned by the action that captured it and consumed when that action
/// produces an enrollment record or a verification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFrame {
    /// `data:image/png;base64,...`
    pub image_data: String,
    pub width: u32,
    pub height: u32,
}

/// A camera that streams into a [`VideoSurface`].
///
/// `acquire` binds the stream and returns once it is running; the surface
/// signals readiness separately (see [`VideoSurface::ready`]). `release` must
/// be safe to call at any time, including when nothing is held.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Request the camera and start delivering frames to `surface`.
    async fn acquire(&self, surface: Arc<VideoSurface>) -> Result<(), CaptureError>;

    /// Stop the stream and free the device.
    fn release(&self);

    /// Extract exactly one frame from the bound surface.
    ///
    /// Fails with [`CaptureError::NotReady`] when the surface has no frame
    /// with non-zero dimensions. No retry is attempted.
    async fn capture_still(&self, surface: &VideoSurface) -> Result<CaptureFrame, CaptureError> {
        snapshot(surface)
    }
}

/// Encode the surface's current frame as a [`CaptureFrame`].
pub fn snapshot(surface: &VideoSurface) -> Result<CaptureFrame, CaptureError> {
    let frame = surface
        .latest_frame()
        .filter(|f| !f.is_empty())
        .ok_or(CaptureError::NotReady)?;

    let image_data = frame.to_data_url()?;
    tracing::debug!(
        width = frame.width,
        height = frame.height,
        sequence = frame.sequence,
        "still captured"
    );

    Ok(CaptureFrame {
        image_data,
        width: frame.width,
        height: frame.height,
    })
}
