use async_trait::async_trait;
use chrono::Utc;
use facegate_core::{
    DescriptorOracle, EnrollmentRecord, EnrollmentStore, FileStore, MemoryStore, OracleError,
    StoreError, VerificationOracle, VerificationOutcome,
};
use facegate_hw::device::snapshot;
use facegate_hw::frame::decode_data_url;
use facegate_hw::synthetic::face_pattern;
use facegate_hw::{CaptureDevice, CaptureError, CaptureFrame, Frame, SyntheticDevice, VideoSurface};
use facegate_session::{ErrorKind, MessageClass, Phase, Session, SessionTimeouts};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

// --- Test doubles ---

/// Device that logs every acquire/release and can stall captures.
#[derive(Default)]
struct ScriptedDevice {
    deny: bool,
    /// Frame presented to the surface on acquire; `None` keeps it unready.
    frame_size: Option<(u32, u32)>,
    hold_capture: bool,
    gate: Notify,
    log: Mutex<Vec<&'static str>>,
    captures: AtomicUsize,
    surface: Mutex<Option<Arc<VideoSurface>>>,
}

impl ScriptedDevice {
    fn streaming(width: u32, height: u32) -> Self {
        Self {
            frame_size: Some((width, height)),
            ..Default::default()
        }
    }

    fn log(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }

    fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for ScriptedDevice {
    async fn acquire(&self, surface: Arc<VideoSurface>) -> Result<(), CaptureError> {
        self.log.lock().unwrap().push("acquire");
        if self.deny {
            return Err(CaptureError::DeviceUnavailable("permission denied".into()));
        }
        if let Some((w, h)) = self.frame_size {
            surface.present(Frame::from_gray(face_pattern(w, h), w, h, 0).unwrap());
        }
        *self.surface.lock().unwrap() = Some(surface);
        Ok(())
    }

    fn release(&self) {
        self.log.lock().unwrap().push("release");
        if let Some(surface) = self.surface.lock().unwrap().take() {
            surface.clear();
        }
    }

    async fn capture_still(&self, surface: &VideoSurface) -> Result<CaptureFrame, CaptureError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.hold_capture {
            self.gate.notified().await;
        }
        snapshot(surface)
    }
}

/// Oracle returning a fixed confidence.
struct ScriptedOracle {
    confidence: f32,
    threshold: f32,
    fail_warm_up: bool,
    decide_delay: Duration,
    warm_ups: AtomicUsize,
    decides: AtomicUsize,
}

impl ScriptedOracle {
    fn scoring(confidence: f32) -> Self {
        Self {
            confidence,
            threshold: 0.6,
            fail_warm_up: false,
            decide_delay: Duration::ZERO,
            warm_ups: AtomicUsize::new(0),
            decides: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VerificationOracle for ScriptedOracle {
    async fn warm_up(&self) -> Result<(), OracleError> {
        self.warm_ups.fetch_add(1, Ordering::SeqCst);
        if self.fail_warm_up {
            return Err(OracleError::Unavailable("model files missing".into()));
        }
        Ok(())
    }

    async fn decide(
        &self,
        _live: &CaptureFrame,
        _reference: &EnrollmentRecord,
    ) -> Result<VerificationOutcome, OracleError> {
        self.decides.fetch_add(1, Ordering::SeqCst);
        if !self.decide_delay.is_zero() {
            tokio::time::sleep(self.decide_delay).await;
        }
        Ok(VerificationOutcome::from_score(self.confidence, self.threshold))
    }
}

/// Store whose writes always fail.
#[derive(Default)]
struct FailingStore {
    inner: MemoryStore,
}

impl EnrollmentStore for FailingStore {
    fn save(&self, _record: &EnrollmentRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        )))
    }

    fn load(&self) -> Option<EnrollmentRecord> {
        self.inner.load()
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear()
    }
}

fn reference_record() -> EnrollmentRecord {
    let frame = Frame::from_gray(face_pattern(64, 48), 64, 48, 0).unwrap();
    EnrollmentRecord {
        reference_image: frame.to_data_url().unwrap(),
        created_at: Utc::now(),
    }
}

fn enrolled_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.save(&reference_record()).unwrap();
    store
}

fn session_with(
    device: Arc<ScriptedDevice>,
    store: Arc<dyn EnrollmentStore>,
    oracle: Arc<ScriptedOracle>,
    timeouts: SessionTimeouts,
) -> Session {
    Session::new(device, store, oracle, Arc::new(VideoSurface::new()), timeouts)
}

fn session(
    device: Arc<ScriptedDevice>,
    store: Arc<dyn EnrollmentStore>,
    oracle: Arc<ScriptedOracle>,
) -> Session {
    session_with(device, store, oracle, SessionTimeouts::default())
}

fn assert_alternating(log: &[&str]) {
    for (i, event) in log.iter().enumerate() {
        let expected = if i % 2 == 0 { "acquire" } else { "release" };
        assert_eq!(*event, expected, "unbalanced camera lifecycle: {log:?}");
    }
}

// --- Prepare ---

#[tokio::test]
async fn test_prepare_reaches_camera_ready() {
    let device = Arc::new(ScriptedDevice::streaming(640, 480));
    let oracle = Arc::new(ScriptedOracle::scoring(0.9));
    let s = session(device.clone(), Arc::new(MemoryStore::new()), oracle.clone());

    let status = s.prepare().await.unwrap();
    assert_eq!(status.phase, Phase::CameraReady);
    assert_eq!(s.phase(), Phase::CameraReady);
    assert_eq!(oracle.warm_ups.load(Ordering::SeqCst), 1);
    assert_eq!(device.log(), vec!["acquire"]);
    assert!(s.surface().is_ready());
}

#[tokio::test]
async fn test_prepare_twice_is_rejected_without_second_acquire() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let s = session(
        device.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedOracle::scoring(0.9)),
    );

    s.prepare().await.unwrap();
    let err = s.prepare().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotReady);
    assert_eq!(s.phase(), Phase::CameraReady);
    assert_eq!(device.log(), vec!["acquire"]);
}

#[tokio::test]
async fn test_camera_denied_fails_and_releases() {
    let device = Arc::new(ScriptedDevice {
        deny: true,
        ..Default::default()
    });
    let s = session(
        device.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedOracle::scoring(0.9)),
    );

    let status = s.prepare().await.unwrap();
    assert_eq!(status.phase, Phase::Failed(ErrorKind::DeviceUnavailable));
    assert_eq!(status.phase.message_class(), MessageClass::Error);
    assert!(status.message.contains("permission denied"));
    assert_eq!(device.log(), vec!["acquire", "release"]);

    // Failed is terminal; prepare may be retried.
    let status = s.prepare().await.unwrap();
    assert_eq!(status.phase, Phase::Failed(ErrorKind::DeviceUnavailable));
    assert_eq!(device.log(), vec!["acquire", "release", "acquire", "release"]);
}

#[tokio::test]
async fn test_oracle_unavailable_fails_before_camera() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let oracle = Arc::new(ScriptedOracle {
        fail_warm_up: true,
        ..ScriptedOracle::scoring(0.9)
    });
    let s = session(device.clone(), Arc::new(MemoryStore::new()), oracle);

    let status = s.prepare().await.unwrap();
    assert_eq!(status.phase, Phase::Failed(ErrorKind::OracleUnavailable));
    assert!(device.log().is_empty());
}

// --- Enroll ---

#[tokio::test]
async fn test_enroll_persists_captured_frame() {
    let device = Arc::new(ScriptedDevice::streaming(640, 480));
    let store = Arc::new(MemoryStore::new());
    let s = session(device.clone(), store.clone(), Arc::new(ScriptedOracle::scoring(0.9)));

    s.prepare().await.unwrap();
    let before = Utc::now();
    let status = s.enroll().await.unwrap();
    let after = Utc::now();

    assert_eq!(status.phase, Phase::Enrolled);
    assert_eq!(status.phase.message_class(), MessageClass::Success);

    let record = store.load().expect("record persisted");
    assert!(record.created_at >= before && record.created_at <= after);
    let image = decode_data_url(&record.reference_image).unwrap();
    assert_eq!((image.width, image.height), (640, 480));
    assert_eq!(status.record(), Some(&record));

    // Terminal: camera handed back.
    assert_eq!(device.log(), vec!["acquire", "release"]);
    assert!(!s.surface().is_ready());
}

#[tokio::test]
async fn test_enroll_replaces_previous_record() {
    let device = Arc::new(ScriptedDevice::streaming(32, 24));
    let store = enrolled_store();
    let old = store.load().unwrap();
    let s = session(device, store.clone(), Arc::new(ScriptedOracle::scoring(0.9)));

    s.prepare().await.unwrap();
    s.enroll().await.unwrap();
    let new = store.load().unwrap();
    assert_ne!(new, old);
    assert_eq!(decode_data_url(&new.reference_image).unwrap().width, 32);
}

#[tokio::test]
async fn test_enroll_before_prepare_is_rejected() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let s = session(
        device.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedOracle::scoring(0.9)),
    );

    let err = s.enroll().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotReady);
    assert_eq!(s.phase(), Phase::Idle);
    assert!(device.log().is_empty());
    assert_eq!(device.captures(), 0);
}

#[tokio::test]
async fn test_capture_before_video_is_not_ready_and_keeps_camera() {
    // Stream bound, but no frame delivered yet.
    let device = Arc::new(ScriptedDevice::default());
    let store = Arc::new(MemoryStore::new());
    let s = session(device.clone(), store.clone(), Arc::new(ScriptedOracle::scoring(0.9)));

    s.prepare().await.unwrap();
    let err = s.enroll().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotReady);
    assert_eq!(s.phase(), Phase::CameraReady);
    assert_eq!(device.log(), vec!["acquire"]);
    assert!(store.load().is_none());

    // Once video arrives the same session can enroll.
    s.surface()
        .present(Frame::from_gray(vec![150; 16 * 12], 16, 12, 1).unwrap());
    assert_eq!(s.enroll().await.unwrap().phase, Phase::Enrolled);
    assert_eq!(device.log(), vec!["acquire", "release"]);
}

#[tokio::test]
async fn test_persistence_failure_keeps_previous_record() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let store = Arc::new(FailingStore::default());
    let previous = reference_record();
    store.inner.save(&previous).unwrap();
    let s = session(device.clone(), store.clone(), Arc::new(ScriptedOracle::scoring(0.9)));

    s.prepare().await.unwrap();
    let status = s.enroll().await.unwrap();
    assert_eq!(status.phase, Phase::Failed(ErrorKind::PersistenceUnavailable));
    assert!(status.result.is_none());
    assert_eq!(store.load(), Some(previous));
    assert_eq!(device.log(), vec!["acquire", "release"]);
}

#[tokio::test]
async fn test_capture_timeout_fails_and_releases() {
    let device = Arc::new(ScriptedDevice {
        hold_capture: true,
        ..ScriptedDevice::streaming(64, 48)
    });
    let timeouts = SessionTimeouts {
        capture: Duration::from_millis(50),
        decide: Duration::from_secs(5),
    };
    let s = session_with(
        device.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedOracle::scoring(0.9)),
        timeouts,
    );

    s.prepare().await.unwrap();
    let status = s.enroll().await.unwrap();
    assert_eq!(status.phase, Phase::Failed(ErrorKind::Timeout));
    assert_eq!(device.log(), vec!["acquire", "release"]);
}

// --- Authenticate ---

#[tokio::test]
async fn test_authenticate_verified_above_threshold() {
    let device = Arc::new(ScriptedDevice::streaming(640, 480));
    let oracle = Arc::new(ScriptedOracle::scoring(0.92));
    let s = session(device.clone(), enrolled_store(), oracle.clone());

    s.prepare().await.unwrap();
    let status = s.authenticate().await.unwrap();

    assert_eq!(status.phase, Phase::Verified);
    let outcome = status.outcome().expect("verification result");
    assert!(outcome.verified);
    assert!((outcome.confidence - 0.92).abs() < 1e-6);
    assert_eq!(oracle.decides.load(Ordering::SeqCst), 1);
    assert_eq!(device.log(), vec!["acquire", "release"]);
}

#[tokio::test]
async fn test_authenticate_denied_is_not_failure() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let s = session(device.clone(), enrolled_store(), Arc::new(ScriptedOracle::scoring(0.3)));

    s.prepare().await.unwrap();
    let status = s.authenticate().await.unwrap();

    assert_eq!(status.phase, Phase::Denied);
    assert_eq!(status.phase.message_class(), MessageClass::Denial);
    assert_eq!(status.message, "Access denied.");
    assert!(!status.outcome().unwrap().verified);
    assert_eq!(device.log(), vec!["acquire", "release"]);
}

#[tokio::test]
async fn test_authenticate_without_enrollment_never_touches_camera() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let oracle = Arc::new(ScriptedOracle::scoring(0.99));
    let s = session(device.clone(), Arc::new(MemoryStore::new()), oracle.clone());

    for _ in 0..2 {
        let status = s.authenticate().await.unwrap();
        assert_eq!(status.phase, Phase::Failed(ErrorKind::NoEnrollment));
    }
    assert!(device.log().is_empty());
    assert_eq!(device.captures(), 0);
    assert_eq!(oracle.decides.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_authenticate_without_enrollment_after_prepare_releases() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let s = session(
        device.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedOracle::scoring(0.99)),
    );

    s.prepare().await.unwrap();
    let status = s.authenticate().await.unwrap();
    assert_eq!(status.phase, Phase::Failed(ErrorKind::NoEnrollment));
    assert_eq!(device.captures(), 0);
    assert_eq!(device.log(), vec!["acquire", "release"]);
}

#[tokio::test]
async fn test_decide_timeout_fails() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let oracle = Arc::new(ScriptedOracle {
        decide_delay: Duration::from_millis(500),
        ..ScriptedOracle::scoring(0.9)
    });
    let timeouts = SessionTimeouts {
        capture: Duration::from_secs(5),
        decide: Duration::from_millis(50),
    };
    let s = session_with(device.clone(), enrolled_store(), oracle, timeouts);

    s.prepare().await.unwrap();
    let status = s.authenticate().await.unwrap();
    assert_eq!(status.phase, Phase::Failed(ErrorKind::Timeout));
    assert_eq!(device.log(), vec!["acquire", "release"]);
}

#[tokio::test]
async fn test_second_action_while_capturing_is_busy() {
    let device = Arc::new(ScriptedDevice {
        hold_capture: true,
        ..ScriptedDevice::streaming(64, 48)
    });
    let s = Arc::new(session(
        device.clone(),
        enrolled_store(),
        Arc::new(ScriptedOracle::scoring(0.92)),
    ));
    s.prepare().await.unwrap();

    let mut events = s.subscribe();
    let first = {
        let s = s.clone();
        tokio::spawn(async move { s.authenticate().await })
    };
    timeout(Duration::from_secs(1), events.wait_for(|st| st.phase == Phase::Capturing))
        .await
        .expect("first call never reached Capturing")
        .unwrap();

    assert_eq!(s.authenticate().await.unwrap_err().kind, ErrorKind::SessionBusy);
    assert_eq!(s.enroll().await.unwrap_err().kind, ErrorKind::SessionBusy);
    assert_eq!(s.prepare().await.unwrap_err().kind, ErrorKind::SessionBusy);
    assert_eq!(s.reset().unwrap_err().kind, ErrorKind::SessionBusy);
    assert_eq!(s.phase(), Phase::Capturing);

    device.gate.notify_one();
    let status = first.await.unwrap().unwrap();
    assert_eq!(status.phase, Phase::Verified);
    assert_eq!(device.captures(), 1);
    assert_eq!(device.log(), vec!["acquire", "release"]);
}

#[tokio::test]
async fn test_abandoned_action_releases_camera() {
    let device = Arc::new(ScriptedDevice {
        hold_capture: true,
        ..ScriptedDevice::streaming(64, 48)
    });
    let s = Arc::new(session(
        device.clone(),
        enrolled_store(),
        Arc::new(ScriptedOracle::scoring(0.92)),
    ));
    s.prepare().await.unwrap();

    let mut events = s.subscribe();
    let task = {
        let s = s.clone();
        tokio::spawn(async move { s.authenticate().await })
    };
    timeout(Duration::from_secs(1), events.wait_for(|st| st.phase == Phase::Capturing))
        .await
        .unwrap()
        .unwrap();

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_eq!(s.phase(), Phase::Idle);
    assert_eq!(s.status().message, "Session abandoned.");
    assert_eq!(device.log(), vec!["acquire", "release"]);

    // The session is usable again.
    assert_eq!(s.prepare().await.unwrap().phase, Phase::CameraReady);
}

// --- Reset and lifecycle ---

#[tokio::test]
async fn test_reset_clears_enrollment_and_releases() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let store = enrolled_store();
    let s = session(device.clone(), store.clone(), Arc::new(ScriptedOracle::scoring(0.9)));

    s.prepare().await.unwrap();
    let status = s.reset().unwrap();
    assert_eq!(status.phase, Phase::Idle);
    assert_eq!(status.message, "Enrollment removed.");
    assert!(store.load().is_none());
    assert!(s.enrollment().is_none());
    assert_eq!(device.log(), vec!["acquire", "release"]);

    // Idempotent: nothing left to clear or release.
    assert_eq!(s.reset().unwrap().phase, Phase::Idle);
    assert_eq!(device.log(), vec!["acquire", "release"]);
}

#[tokio::test]
async fn test_dropping_session_releases_camera() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let s = session(
        device.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedOracle::scoring(0.9)),
    );
    s.prepare().await.unwrap();
    drop(s);
    assert_eq!(device.log(), vec!["acquire", "release"]);
}

#[tokio::test]
async fn test_acquire_and_release_alternate_across_actions() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let store = Arc::new(MemoryStore::new());
    let s = session(device.clone(), store, Arc::new(ScriptedOracle::scoring(0.3)));

    s.authenticate().await.unwrap();
    s.prepare().await.unwrap();
    s.enroll().await.unwrap();
    s.prepare().await.unwrap();
    s.authenticate().await.unwrap();
    s.reset().unwrap();
    s.prepare().await.unwrap();
    s.reset().unwrap();
    s.prepare().await.unwrap();
    drop(s);

    let log = device.log();
    assert_eq!(log.len(), 8);
    assert_alternating(&log);
}

#[tokio::test]
async fn test_subscribers_see_terminal_status() {
    let device = Arc::new(ScriptedDevice::streaming(64, 48));
    let s = session(device, Arc::new(MemoryStore::new()), Arc::new(ScriptedOracle::scoring(0.9)));
    let events = s.subscribe();
    assert_eq!(events.borrow().phase, Phase::Idle);

    s.prepare().await.unwrap();
    assert_eq!(events.borrow().phase, Phase::CameraReady);

    s.enroll().await.unwrap();
    let latest = events.borrow().clone();
    assert_eq!(latest, s.status());
    assert_eq!(latest.phase, Phase::Enrolled);
    assert!(latest.record().is_some());
}

// --- End to end ---

#[tokio::test]
async fn test_synthetic_camera_enroll_then_verify() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path(), "default"));
    let s = Session::new(
        Arc::new(SyntheticDevice::new(320, 240)),
        store,
        Arc::new(DescriptorOracle::default()),
        Arc::new(VideoSurface::new()),
        SessionTimeouts::default(),
    );

    s.prepare().await.unwrap();
    timeout(Duration::from_secs(2), s.surface().ready()).await.unwrap();
    assert_eq!(s.enroll().await.unwrap().phase, Phase::Enrolled);

    s.prepare().await.unwrap();
    timeout(Duration::from_secs(2), s.surface().ready()).await.unwrap();
    let status = s.authenticate().await.unwrap();
    assert_eq!(status.phase, Phase::Verified);
    assert!(status.outcome().unwrap().confidence > 0.99);

    // Survives a restart: a fresh handle reads the same record.
    assert_eq!(FileStore::new(dir.path(), "default").load(), s.enrollment());
}
