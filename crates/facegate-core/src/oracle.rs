//! Verification oracle: decide whether a live capture matches the reference.
//!
//! [`DescriptorOracle`] is a deterministic appearance matcher. Each image is
//! reduced to a lighting-normalised grid descriptor and compared by cosine
//! similarity. Any other matcher can be substituted behind
//! [`VerificationOracle`] without touching the session.

use crate::types::{Embedding, EnrollmentRecord, VerificationOutcome};
use async_trait::async_trait;
use facegate_hw::frame::{clahe_enhance, decode_data_url, FrameError};
use facegate_hw::CaptureFrame;
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::sync::OnceLock;
use thiserror::Error;

/// Default decision threshold on the [0, 1] confidence scale.
pub const DEFAULT_THRESHOLD: f32 = 0.6;
/// Default descriptor grid (cells per side).
pub const DEFAULT_GRID: u32 = 16;

/// Pixels per grid cell after resizing.
const CELL_SIZE: u32 = 4;
const CLAHE_TILES: u32 = 4;
const CLAHE_CLIP_LIMIT: f32 = 0.02;

#[derive(Error, Debug, Clone)]
pub enum OracleError {
    #[error("matcher unavailable: {0}")]
    Unavailable(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
}

impl From<FrameError> for OracleError {
    fn from(err: FrameError) -> Self {
        OracleError::InvalidImage(err.to_string())
    }
}

/// Strategy for deciding a live capture against the enrolled reference.
///
/// Implementations must be deterministic: the same `(live, reference)` pair
/// always produces the same outcome. A non-match is `Ok` with
/// `verified == false`; errors are reserved for an unusable matcher or input.
#[async_trait]
pub trait VerificationOracle: Send + Sync {
    /// Load whatever the matcher needs. Calls after the first are no-ops.
    async fn warm_up(&self) -> Result<(), OracleError>;

    async fn decide(
        &self,
        live: &CaptureFrame,
        reference: &EnrollmentRecord,
    ) -> Result<VerificationOutcome, OracleError>;
}

/// Validated matcher parameters, produced once by `warm_up`.
#[derive(Debug, Clone, Copy)]
struct Params {
    threshold: f32,
    grid: u32,
}

/// Grid-descriptor matcher.
pub struct DescriptorOracle {
    threshold: f32,
    grid: u32,
    params: OnceLock<Result<Params, OracleError>>,
}

impl Default for DescriptorOracle {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl DescriptorOracle {
    pub fn new(threshold: f32) -> Self {
        Self::with_grid(threshold, DEFAULT_GRID)
    }

    pub fn with_grid(threshold: f32, grid: u32) -> Self {
        Self {
            threshold,
            grid,
            params: OnceLock::new(),
        }
    }

    fn params(&self) -> Result<Params, OracleError> {
        self.params
            .get_or_init(|| {
                if !(0.0..=1.0).contains(&self.threshold) {
                    return Err(OracleError::Unavailable(format!(
                        "threshold {} outside [0, 1]",
                        self.threshold
                    )));
                }
                if self.grid < 2 {
                    return Err(OracleError::Unavailable(format!(
                        "descriptor grid {} too small",
                        self.grid
                    )));
                }
                tracing::info!(
                    threshold = self.threshold,
                    grid = self.grid,
                    "descriptor matcher ready"
                );
                Ok(Params {
                    threshold: self.threshold,
                    grid: self.grid,
                })
            })
            .clone()
    }
}

#[async_trait]
impl VerificationOracle for DescriptorOracle {
    async fn warm_up(&self) -> Result<(), OracleError> {
        self.params().map(|_| ())
    }

    async fn decide(
        &self,
        live: &CaptureFrame,
        reference: &EnrollmentRecord,
    ) -> Result<VerificationOutcome, OracleError> {
        let params = self.params()?;
        let live_image = live.image_data.clone();
        let reference_image = reference.reference_image.clone();

        let similarity = tokio::task::spawn_blocking(move || {
            let probe = describe(&live_image, params.grid)?;
            let enrolled = describe(&reference_image, params.grid)?;
            Ok::<_, OracleError>(probe.similarity(&enrolled))
        })
        .await
        .map_err(|e| OracleError::Unavailable(format!("descriptor task failed: {e}")))??;

        let outcome = VerificationOutcome::from_score(similarity, params.threshold);
        tracing::info!(
            verified = outcome.verified,
            confidence = outcome.confidence,
            threshold = params.threshold,
            "verification decided"
        );
        Ok(outcome)
    }
}

/// Reduce an encoded image to a zero-mean, unit-length grid descriptor.
///
/// Pipeline: decode → luma → resize to `grid * 4` square → CLAHE → mean of
/// each 4×4 cell.
pub fn describe(image_data: &str, grid: u32) -> Result<Embedding, OracleError> {
    let frame = decode_data_url(image_data)?;
    let source = GrayImage::from_raw(frame.width, frame.height, frame.data)
        .ok_or_else(|| OracleError::InvalidImage("pixel buffer does not match dimensions".into()))?;

    let side = grid * CELL_SIZE;
    let mut resized = imageops::resize(&source, side, side, FilterType::Triangle);
    clahe_enhance(&mut resized, side, side, CLAHE_TILES, CLAHE_CLIP_LIMIT);

    let cell_pixels = (CELL_SIZE * CELL_SIZE) as f32;
    let mut values = Vec::with_capacity((grid * grid) as usize);
    for gy in 0..grid {
        for gx in 0..grid {
            let mut sum = 0.0f32;
            for y in gy * CELL_SIZE..(gy + 1) * CELL_SIZE {
                for x in gx * CELL_SIZE..(gx + 1) * CELL_SIZE {
                    sum += resized.get_pixel(x, y)[0] as f32;
                }
            }
            values.push(sum / cell_pixels);
        }
    }

    let mean = values.iter().sum::<f32>() / values.len() as f32;
    values.iter_mut().for_each(|v| *v -= mean);
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }

    Ok(Embedding {
        values,
        model_version: Some(format!("grid{grid}-clahe")),
    })
}
