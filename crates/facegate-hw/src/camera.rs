//! V4L2 camera capture via the `v4l` crate.

use crate::device::{CaptureDevice, CaptureError};
use crate::frame;
use crate::streaming::{self, BufferSource, LiveFlag, StreamSlot};
use crate::surface::VideoSurface;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 360;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

impl From<CameraError> for CaptureError {
    fn from(err: CameraError) -> Self {
        match err {
            CameraError::CaptureFailed(msg) => CaptureError::Stream(msg),
            other => CaptureError::DeviceUnavailable(other.to_string()),
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel, native IR camera output).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel, common IR camera format).
    Y16,
}

/// Open V4L2 camera handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CameraError::PermissionDenied(device_path.to_string())
            }
            _ if e.raw_os_error() == Some(16) => CameraError::DeviceBusy, // EBUSY
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Convert a raw buffer to grayscale based on the negotiated format.
    fn buf_to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let pixels = (self.width * self.height) as usize;

        match self.pixel_format {
            PixelFormat::Grey => buf
                .get(..pixels)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| short_buffer("GREY", pixels, buf.len())),
            PixelFormat::Y16 => {
                let bytes = buf
                    .get(..pixels * 2)
                    .ok_or_else(|| short_buffer("Y16", pixels * 2, buf.len()))?;
                // Little-endian 16-bit, keep the high byte.
                Ok(bytes.chunks_exact(2).map(|px| px[1]).collect())
            }
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        }
    }

    /// Stream frames into `surface` until `live` is cleared.
    ///
    /// Reports stream start-up through `started`, discards `warmup_frames`
    /// for AGC/AE stabilisation, and skips dark frames.
    fn pump(
        self,
        surface: Arc<VideoSurface>,
        live: LiveFlag,
        warmup_frames: usize,
        started: oneshot::Sender<Result<(), CaptureError>>,
    ) {
        let mut stream =
            match MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = started.send(Err(CaptureError::Stream(format!(
                        "failed to create mmap stream: {e}"
                    ))));
                    return;
                }
            };
        let _ = started.send(Ok(()));

        for _ in 0..warmup_frames {
            if !streaming::is_live(&live) {
                break;
            }
            let _ = stream.next();
        }

        streaming::pump_frames(
            &mut stream,
            |buf| self.buf_to_grayscale(buf),
            self.width,
            self.height,
            &surface,
            &live,
        );
        tracing::debug!(device = %self.device_path, "stream stopped");
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

fn short_buffer(format: &str, expected: usize, actual: usize) -> CameraError {
    CameraError::CaptureFailed(format!(
        "{format} buffer too short: expected {expected}, got {actual}"
    ))
}

impl BufferSource for MmapStream<'_> {
    fn next_buffer(&mut self) -> std::io::Result<(&[u8], u32)> {
        let (buf, meta) = CaptureStream::next(self)?;
        Ok((buf, meta.sequence))
    }
}

/// [`CaptureDevice`] backed by a V4L2 node.
///
/// The node is opened on `acquire` and closed on `release`; between the two a
/// dedicated OS thread owns the camera and feeds the surface.
pub struct V4l2Device {
    device_path: String,
    warmup_frames: usize,
    stream: StreamSlot,
}

impl V4l2Device {
    pub fn new(device_path: impl Into<String>, warmup_frames: usize) -> Self {
        Self {
            device_path: device_path.into(),
            warmup_frames,
            stream: StreamSlot::default(),
        }
    }
}

#[async_trait]
impl CaptureDevice for V4l2Device {
    async fn acquire(&self, surface: Arc<VideoSurface>) -> Result<(), CaptureError> {
        if self.stream.is_held() {
            return Err(CameraError::DeviceBusy.into());
        }

        let path = self.device_path.clone();
        let camera = tokio::task::spawn_blocking(move || Camera::open(&path))
            .await
            .map_err(|e| CaptureError::Stream(format!("camera open task failed: {e}")))??;

        let warmup = self.warmup_frames;
        let target = surface.clone();
        self.stream
            .start("facegate-v4l2", surface, move |live, started| {
                camera.pump(target, live, warmup, started)
            })
            .await?;
        tracing::info!(device = %self.device_path, "camera acquired");
        Ok(())
    }

    fn release(&self) {
        if self.stream.stop() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.release();
    }
}
