//! Blocking stream plumbing shared by thread-backed capture devices.
//!
//! A device thread pulls raw buffers from a [`BufferSource`] and feeds the
//! surface through [`pump_frames`]; a [`StreamSlot`] owns that thread from
//! start-up until it is stopped.
#![cfg_attr(not(feature = "v4l2"), allow(dead_code))]

use crate::device::CaptureError;
use crate::frame::Frame;
use crate::surface::VideoSurface;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

/// Producer of raw capture buffers, one per call.
pub(crate) trait BufferSource {
    /// Block until the next buffer is available. Returns the buffer and its
    /// driver sequence number.
    fn next_buffer(&mut self) -> std::io::Result<(&[u8], u32)>;
}

/// Stop flag shared between a stream thread and its owner.
pub(crate) type LiveFlag = Arc<Mutex<bool>>;

pub(crate) fn is_live(live: &Mutex<bool>) -> bool {
    *live.lock().unwrap_or_else(|e| e.into_inner())
}

/// Convert buffers to grayscale frames and present them until `live` is
/// cleared or the source fails.
///
/// The stop flag is checked before every dequeue, so malformed and dark
/// frames (which are skipped) never delay shutdown by more than one buffer.
pub(crate) fn pump_frames<S, F, E>(
    source: &mut S,
    to_gray: F,
    width: u32,
    height: u32,
    surface: &VideoSurface,
    live: &Mutex<bool>,
) where
    S: BufferSource + ?Sized,
    F: Fn(&[u8]) -> Result<Vec<u8>, E>,
    E: Display,
{
    while is_live(live) {
        let (buf, sequence) = match source.next_buffer() {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(error = %e, "failed to dequeue buffer; stopping stream");
                break;
            }
        };

        let gray = match to_gray(buf) {
            Ok(gray) => gray,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                continue;
            }
        };
        let frame = match Frame::from_gray(gray, width, height, sequence) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                continue;
            }
        };
        if frame.is_dark {
            tracing::trace!(seq = sequence, "skipping dark frame");
            continue;
        }

        surface.present(frame);
    }
}

struct StreamThread {
    live: LiveFlag,
    thread: JoinHandle<()>,
    surface: Arc<VideoSurface>,
}

impl StreamThread {
    /// Signal the thread, wait for it to close the device, clear the surface.
    fn stop(self) {
        *self.live.lock().unwrap_or_else(|e| e.into_inner()) = false;
        if self.thread.join().is_err() {
            tracing::warn!("stream thread panicked");
        }
        self.surface.clear();
    }
}

/// Holds at most one running stream thread.
#[derive(Default)]
pub(crate) struct StreamSlot {
    inner: Mutex<Option<StreamThread>>,
}

impl StreamSlot {
    fn lock(&self) -> MutexGuard<'_, Option<StreamThread>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_held(&self) -> bool {
        self.lock().is_some()
    }

    /// Spawn `run` on a named thread and wait for it to report start-up.
    ///
    /// The thread is stored before the wait, so if the returned future is
    /// dropped mid-start the thread is still reachable by [`stop`](Self::stop).
    /// A start-up failure stops the thread before returning.
    pub(crate) async fn start<F>(
        &self,
        name: &str,
        surface: Arc<VideoSurface>,
        run: F,
    ) -> Result<(), CaptureError>
    where
        F: FnOnce(LiveFlag, oneshot::Sender<Result<(), CaptureError>>) + Send + 'static,
    {
        let started_rx = {
            let mut slot = self.lock();
            if slot.is_some() {
                return Err(CaptureError::DeviceUnavailable("device busy".into()));
            }

            let live: LiveFlag = Arc::new(Mutex::new(true));
            let (started_tx, started_rx) = oneshot::channel();
            let thread = {
                let live = live.clone();
                std::thread::Builder::new()
                    .name(name.into())
                    .spawn(move || run(live, started_tx))
                    .map_err(|e| {
                        CaptureError::Stream(format!("failed to spawn stream thread: {e}"))
                    })?
            };
            *slot = Some(StreamThread {
                live,
                thread,
                surface,
            });
            started_rx
        };

        match started_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.stop();
                Err(err)
            }
            Err(_) => {
                self.stop();
                Err(CaptureError::Stream("stream thread exited during start-up".into()))
            }
        }
    }

    /// Stop the held thread, if any. Returns whether one was running.
    pub(crate) fn stop(&self) -> bool {
        let Some(stream) = self.lock().take() else {
            return false;
        };
        stream.stop();
        true
    }
}
