//! Session phases and the status published after every transition.

use facegate_core::{EnrollmentRecord, VerificationOutcome};
use serde::Serialize;

/// Why a session ended in [`Phase::Failed`] or why an action was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    DeviceUnavailable,
    NotReady,
    PersistenceUnavailable,
    OracleUnavailable,
    NoEnrollment,
    SessionBusy,
    Timeout,
    Unknown,
}

/// Discrete step of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "kind")]
pub enum Phase {
    Idle,
    ModelsLoading,
    ModelsReady,
    CameraRequesting,
    CameraReady,
    Capturing,
    Deciding,
    Enrolled,
    Verified,
    Denied,
    Failed(ErrorKind),
}

/// How the presentation layer should style a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageClass {
    Progress,
    Success,
    Denial,
    Error,
}

impl Phase {
    /// No further action proceeds from here without `prepare` or `reset`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Enrolled | Phase::Verified | Phase::Denied | Phase::Failed(_)
        )
    }

    /// Phases `prepare` may start from.
    pub fn can_prepare(self) -> bool {
        self == Phase::Idle || self.is_terminal()
    }

    pub fn message_class(self) -> MessageClass {
        match self {
            Phase::Enrolled | Phase::Verified => MessageClass::Success,
            Phase::Denied => MessageClass::Denial,
            Phase::Failed(_) => MessageClass::Error,
            _ => MessageClass::Progress,
        }
    }

    /// Default status copy for the phase.
    pub fn default_message(self) -> &'static str {
        match self {
            Phase::Idle => "Enroll your face the first time, then use face login.",
            Phase::ModelsLoading => "Loading recognition models...",
            Phase::ModelsReady => "Recognition models ready.",
            Phase::CameraRequesting => "Requesting camera access...",
            Phase::CameraReady => "Camera ready. Stay inside the frame.",
            Phase::Capturing => "Capturing...",
            Phase::Deciding => "Verifying identity...",
            Phase::Enrolled => "Face enrolled successfully.",
            Phase::Verified => "Access granted.",
            Phase::Denied => "Access denied.",
            Phase::Failed(kind) => kind.default_message(),
        }
    }
}

impl ErrorKind {
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorKind::DeviceUnavailable => "Camera is unavailable.",
            ErrorKind::NotReady => "Camera is not ready yet.",
            ErrorKind::PersistenceUnavailable => "Enrollment could not be stored.",
            ErrorKind::OracleUnavailable => "Recognition models could not be loaded.",
            ErrorKind::NoEnrollment => "No face is enrolled.",
            ErrorKind::SessionBusy => "Another operation is in progress.",
            ErrorKind::Timeout => "The operation timed out.",
            ErrorKind::Unknown => "Unexpected error.",
        }
    }
}

/// Payload carried by a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionResult {
    Enrolled(EnrollmentRecord),
    Verification(VerificationOutcome),
}

/// What the presentation layer sees after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub phase: Phase,
    pub message: String,
    pub result: Option<SessionResult>,
}

impl SessionStatus {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            result: None,
        }
    }

    pub fn idle() -> Self {
        Self::new(Phase::Idle, Phase::Idle.default_message())
    }

    pub fn with_result(mut self, result: SessionResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn outcome(&self) -> Option<&VerificationOutcome> {
        match &self.result {
            Some(SessionResult::Verification(outcome)) => Some(outcome),
            _ => None,
        }
    }

    pub fn record(&self) -> Option<&EnrollmentRecord> {
        match &self.result {
            Some(SessionResult::Enrolled(record)) => Some(record),
            _ => None,
        }
    }
}
