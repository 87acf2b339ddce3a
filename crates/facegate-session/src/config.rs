use crate::session::SessionTimeouts;
use facegate_core::oracle::DEFAULT_THRESHOLD;
use facegate_core::store::DEFAULT_PROFILE;
use std::path::PathBuf;
use std::time::Duration;

/// Session configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory holding the enrollment record.
    pub data_dir: PathBuf,
    /// Profile key; the record is stored as `<data_dir>/<profile>.json`.
    pub profile: String,
    /// Confidence at or above which a capture is accepted.
    pub match_threshold: f32,
    /// Bound on extracting a still from the live surface.
    pub capture_timeout_secs: u64,
    /// Bound on a single verification decision.
    pub decide_timeout_secs: u64,
    /// Frames discarded after the stream starts (camera AGC/AE stabilization).
    pub warmup_frames: usize,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("FACEGATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        Self {
            camera_device: std::env::var("FACEGATE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            data_dir,
            profile: std::env::var("FACEGATE_PROFILE")
                .unwrap_or_else(|_| DEFAULT_PROFILE.to_string()),
            match_threshold: env_parse("FACEGATE_MATCH_THRESHOLD", DEFAULT_THRESHOLD),
            capture_timeout_secs: env_parse("FACEGATE_CAPTURE_TIMEOUT_SECS", 5),
            decide_timeout_secs: env_parse("FACEGATE_DECIDE_TIMEOUT_SECS", 5),
            warmup_frames: env_parse("FACEGATE_WARMUP_FRAMES", 4),
        }
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            capture: Duration::from_secs(self.capture_timeout_secs),
            decide: Duration::from_secs(self.decide_timeout_secs),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
