use chrono::{DateTime, Utc};
use facegate_hw::CaptureFrame;
use serde::{Deserialize, Serialize};

/// The enrolled reference for a device profile.
///
/// Persisted as `{"referenceImage": "<data URL>", "createdAt": "<RFC 3339>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRecord {
    /// Encoded still image (`data:image/png;base64,...`).
    pub reference_image: String,
    pub created_at: DateTime<Utc>,
}

impl EnrollmentRecord {
    /// Turn a captured still into a reference, consuming the capture.
    pub fn from_capture(frame: CaptureFrame, created_at: DateTime<Utc>) -> Self {
        Self {
            reference_image: frame.image_data,
            created_at,
        }
    }
}

/// Decision for one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VerificationOutcome {
    pub verified: bool,
    /// Score in [0, 1].
    pub confidence: f32,
}

impl VerificationOutcome {
    /// Build an outcome whose decision is consistent with its score:
    /// `verified == (confidence >= threshold)` after clamping to [0, 1].
    pub fn from_score(confidence: f32, threshold: f32) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            verified: confidence >= threshold,
            confidence,
        }
    }
}

/// Face descriptor vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Descriptor pipeline that produced this vector (e.g., "grid16-clahe").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}
