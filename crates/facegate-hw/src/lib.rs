//! facegate-hw: Capture device abstraction.
//!
//! A [`CaptureDevice`] binds a live stream to a [`VideoSurface`] owned by the
//! presentation layer and extracts encoded stills from it. Ships a synthetic
//! device and, with the `v4l2` feature, a V4L2 camera.

#[cfg(feature = "v4l2")]
pub mod camera;
pub mod device;
pub mod frame;
mod streaming;
pub mod surface;
pub mod synthetic;

#[cfg(feature = "v4l2")]
pub use camera::{Camera, CameraError, V4l2Device};
pub use device::{CaptureDevice, CaptureError, CaptureFrame};
pub use frame::Frame;
pub use surface::VideoSurface;
pub use synthetic::SyntheticDevice;
