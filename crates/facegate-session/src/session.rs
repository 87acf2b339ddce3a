//! Session state machine.
//!
//! Drives `Idle → ModelsLoading → ModelsReady → CameraRequesting → CameraReady
//! → Capturing → Deciding → {Enrolled | Verified | Denied | Failed}` over a
//! capture device, an enrollment store and a verification oracle.
//!
//! Actions never propagate component failures: they are classified into an
//! [`ErrorKind`] and published as `Failed(kind)`. The only `Err` results are
//! rejections that leave the phase unchanged (busy, wrong phase, surface not
//! delivering video yet).

use crate::phase::{ErrorKind, Phase, SessionResult, SessionStatus};
use chrono::Utc;
use facegate_core::{EnrollmentRecord, EnrollmentStore, OracleError, VerificationOracle};
use facegate_hw::{CaptureDevice, CaptureError, CaptureFrame, VideoSurface};
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex as OpLock, MutexGuard as OpPermit};
use tokio::time::timeout;

/// An action was refused without changing the session phase.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn busy() -> Self {
        Self::new(ErrorKind::SessionBusy, ErrorKind::SessionBusy.default_message())
    }
}

/// Bounds on the suspending steps. Camera acquisition is unbounded since it
/// may wait on a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub capture: Duration,
    pub decide: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            capture: Duration::from_secs(5),
            decide: Duration::from_secs(5),
        }
    }
}

fn capture_kind(err: &CaptureError) -> ErrorKind {
    match err {
        CaptureError::DeviceUnavailable(_) | CaptureError::Stream(_) => {
            ErrorKind::DeviceUnavailable
        }
        CaptureError::NotReady => ErrorKind::NotReady,
        CaptureError::Encode(_) => ErrorKind::Unknown,
    }
}

fn oracle_kind(err: &OracleError) -> ErrorKind {
    match err {
        OracleError::Unavailable(_) => ErrorKind::OracleUnavailable,
        OracleError::InvalidImage(_) => ErrorKind::Unknown,
    }
}

struct State {
    status: SessionStatus,
    /// Set before `acquire` is awaited so a failed or abandoned acquisition
    /// is still released.
    camera_held: bool,
}

struct Shared {
    device: Arc<dyn CaptureDevice>,
    store: Arc<dyn EnrollmentStore>,
    oracle: Arc<dyn VerificationOracle>,
    surface: Arc<VideoSurface>,
    timeouts: SessionTimeouts,
    state: Mutex<State>,
    events: watch::Sender<SessionStatus>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn phase(&self) -> Phase {
        self.lock().status.phase
    }

    fn publish(&self, status: SessionStatus) -> SessionStatus {
        let mut state = self.lock();
        tracing::debug!(phase = ?status.phase, message = %status.message, "session transition");
        state.status = status.clone();
        self.events.send_replace(status.clone());
        status
    }

    /// Move to a non-terminal phase.
    fn enter(&self, phase: Phase, message: impl Into<String>) -> SessionStatus {
        self.publish(SessionStatus::new(phase, message))
    }

    fn mark_camera_held(&self) {
        self.lock().camera_held = true;
    }

    /// Release the camera if held. Runs at most once per acquisition.
    fn release_camera(&self) {
        let held = std::mem::replace(&mut self.lock().camera_held, false);
        if held {
            self.device.release();
            tracing::info!("camera released");
        }
    }

    /// Move to a terminal phase or back to `Idle`; both release the camera.
    fn settle(&self, status: SessionStatus) -> SessionStatus {
        self.release_camera();
        self.publish(status)
    }

    fn fail(&self, kind: ErrorKind, detail: impl Display) -> SessionStatus {
        tracing::warn!(?kind, %detail, "session failed");
        self.settle(SessionStatus::new(
            Phase::Failed(kind),
            format!("{} ({detail})", kind.default_message()),
        ))
    }
}

/// Marks an action in flight. Dropping it before [`settle`](Self::settle)
/// means the caller abandoned the action's future.
struct InFlight<'a> {
    shared: &'a Shared,
    _permit: OpPermit<'a, ()>,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(
        mut self,
        result: Result<SessionStatus, SessionError>,
    ) -> Result<SessionStatus, SessionError> {
        self.settled = true;
        result
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(phase = ?self.shared.phase(), "session abandoned mid-operation");
            self.shared
                .settle(SessionStatus::new(Phase::Idle, "Session abandoned."));
        }
    }
}

/// Early exit from an action step.
enum Interrupt {
    Settled(SessionStatus),
    Rejected(SessionError),
}

impl From<Interrupt> for Result<SessionStatus, SessionError> {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Settled(status) => Ok(status),
            Interrupt::Rejected(err) => Err(err),
        }
    }
}

/// One face-authentication session over a single device profile.
///
/// Not reentrant: while `prepare`, `enroll` or `authenticate` is in flight,
/// every other action is rejected with [`ErrorKind::SessionBusy`].
pub struct Session {
    shared: Shared,
    op_lock: OpLock<()>,
}

impl Session {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        store: Arc<dyn EnrollmentStore>,
        oracle: Arc<dyn VerificationOracle>,
        surface: Arc<VideoSurface>,
        timeouts: SessionTimeouts,
    ) -> Self {
        let status = SessionStatus::idle();
        let (events, _) = watch::channel(status.clone());
        Self {
            shared: Shared {
                device,
                store,
                oracle,
                surface,
                timeouts,
                state: Mutex::new(State {
                    status,
                    camera_held: false,
                }),
                events,
            },
            op_lock: OpLock::new(()),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> SessionStatus {
        self.shared.lock().status.clone()
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    /// Receive the status published after every transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.events.subscribe()
    }

    /// Surface the camera streams into while the session holds it.
    pub fn surface(&self) -> Arc<VideoSurface> {
        self.shared.surface.clone()
    }

    /// The stored reference, if any.
    pub fn enrollment(&self) -> Option<EnrollmentRecord> {
        self.shared.store.load()
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        self.shared.timeouts
    }

    fn begin(&self) -> Result<InFlight<'_>, SessionError> {
        let permit = self.op_lock.try_lock().map_err(|_| {
            tracing::debug!("action rejected: session busy");
            SessionError::busy()
        })?;
        Ok(InFlight {
            shared: &self.shared,
            _permit: permit,
            settled: false,
        })
    }

    /// Warm up the oracle, then acquire the camera.
    ///
    /// Allowed from `Idle` or a terminal phase; ends in `CameraReady` or
    /// `Failed`.
    pub async fn prepare(&self) -> Result<SessionStatus, SessionError> {
        let flight = self.begin()?;
        let result = self.run_prepare().await;
        flight.settle(result)
    }

    /// Capture a still and persist it as the enrollment reference.
    pub async fn enroll(&self) -> Result<SessionStatus, SessionError> {
        let flight = self.begin()?;
        let result = self.run_enroll().await;
        flight.settle(result)
    }

    /// Capture a still and decide it against the enrollment reference.
    ///
    /// An empty store yields `Failed(NoEnrollment)` from any phase without
    /// touching the camera.
    pub async fn authenticate(&self) -> Result<SessionStatus, SessionError> {
        let flight = self.begin()?;
        let result = self.run_authenticate().await;
        flight.settle(result)
    }

    /// Clear the enrollment, release the camera and return to `Idle`.
    pub fn reset(&self) -> Result<SessionStatus, SessionError> {
        let _permit = self.op_lock.try_lock().map_err(|_| SessionError::busy())?;
        let shared = &self.shared;

        if let Err(e) = shared.store.clear() {
            return Ok(shared.fail(ErrorKind::PersistenceUnavailable, e));
        }
        tracing::info!("session reset");
        Ok(shared.settle(SessionStatus::new(Phase::Idle, "Enrollment removed.")))
    }

    async fn run_prepare(&self) -> Result<SessionStatus, SessionError> {
        let shared = &self.shared;
        let phase = shared.phase();
        if !phase.can_prepare() {
            return Err(SessionError::new(
                ErrorKind::NotReady,
                format!("cannot prepare while {phase:?}"),
            ));
        }

        shared.enter(Phase::ModelsLoading, Phase::ModelsLoading.default_message());
        if let Err(e) = shared.oracle.warm_up().await {
            return Ok(shared.fail(oracle_kind(&e), e));
        }
        shared.enter(Phase::ModelsReady, Phase::ModelsReady.default_message());

        shared.enter(Phase::CameraRequesting, Phase::CameraRequesting.default_message());
        shared.mark_camera_held();
        if let Err(e) = shared.device.acquire(shared.surface.clone()).await {
            return Ok(shared.fail(capture_kind(&e), e));
        }
        tracing::info!("camera acquired");

        Ok(shared.enter(Phase::CameraReady, Phase::CameraReady.default_message()))
    }

    async fn run_enroll(&self) -> Result<SessionStatus, SessionError> {
        let shared = &self.shared;
        self.require_camera_ready("enroll")?;

        shared.enter(Phase::Capturing, "Capturing and enrolling face...");
        let frame = match self.capture().await {
            Ok(frame) => frame,
            Err(interrupt) => return interrupt.into(),
        };

        let record = EnrollmentRecord::from_capture(frame, Utc::now());
        if let Err(e) = shared.store.save(&record) {
            return Ok(shared.fail(ErrorKind::PersistenceUnavailable, e));
        }
        tracing::info!(created_at = %record.created_at, "face enrolled");

        Ok(shared.settle(
            SessionStatus::new(Phase::Enrolled, Phase::Enrolled.default_message())
                .with_result(SessionResult::Enrolled(record)),
        ))
    }

    async fn run_authenticate(&self) -> Result<SessionStatus, SessionError> {
        let shared = &self.shared;
        let Some(reference) = shared.store.load() else {
            tracing::info!("authentication attempted without enrollment");
            return Ok(shared.settle(SessionStatus::new(
                Phase::Failed(ErrorKind::NoEnrollment),
                ErrorKind::NoEnrollment.default_message(),
            )));
        };
        self.require_camera_ready("authenticate")?;

        shared.enter(Phase::Capturing, "Verifying identity...");
        let frame = match self.capture().await {
            Ok(frame) => frame,
            Err(interrupt) => return interrupt.into(),
        };

        shared.enter(Phase::Deciding, Phase::Deciding.default_message());
        let decision = shared.oracle.decide(&frame, &reference);
        let outcome = match timeout(shared.timeouts.decide, decision).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Ok(shared.fail(oracle_kind(&e), e)),
            Err(_) => {
                return Ok(shared.fail(
                    ErrorKind::Timeout,
                    format!("decision exceeded {:?}", shared.timeouts.decide),
                ))
            }
        };

        let phase = if outcome.verified { Phase::Verified } else { Phase::Denied };
        tracing::info!(
            verified = outcome.verified,
            confidence = outcome.confidence,
            "authentication decided"
        );
        Ok(shared.settle(
            SessionStatus::new(phase, phase.default_message())
                .with_result(SessionResult::Verification(outcome)),
        ))
    }

    fn require_camera_ready(&self, action: &str) -> Result<(), SessionError> {
        match self.shared.phase() {
            Phase::CameraReady => Ok(()),
            phase => Err(SessionError::new(
                ErrorKind::NotReady,
                format!("cannot {action} while {phase:?}; prepare the session first"),
            )),
        }
    }

    /// Take one still under the capture timeout.
    ///
    /// A surface that has not delivered video yet is a precondition failure:
    /// the session returns to `CameraReady` with the camera still held.
    async fn capture(&self) -> Result<CaptureFrame, Interrupt> {
        let shared = &self.shared;
        match timeout(shared.timeouts.capture, shared.device.capture_still(&shared.surface)).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(CaptureError::NotReady)) => {
                shared.enter(Phase::CameraReady, "Camera is not delivering video yet.");
                Err(Interrupt::Rejected(SessionError::new(
                    ErrorKind::NotReady,
                    CaptureError::NotReady.to_string(),
                )))
            }
            Ok(Err(e)) => Err(Interrupt::Settled(shared.fail(capture_kind(&e), e))),
            Err(_) => Err(Interrupt::Settled(shared.fail(
                ErrorKind::Timeout,
                format!("capture exceeded {:?}", shared.timeouts.capture),
            ))),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.release_camera();
    }
}
