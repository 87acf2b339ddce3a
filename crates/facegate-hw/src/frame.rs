//! Frame type and image processing: YUYV conversion, dark detection, CLAHE,
//! and the PNG data-URL encoding used for still captures.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, GrayImage, ImageFormat};
use std::io::Cursor;

/// MIME prefix produced by [`Frame::to_data_url`].
const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// A grayscale camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap raw grayscale pixels, validating the buffer length.
    pub fn from_gray(
        data: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize);
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let is_dark = is_dark_frame(&data, 0.95);
        Ok(Self {
            data,
            width,
            height,
            sequence,
            is_dark,
        })
    }

    /// True when the frame carries no pixels (a surface that has not started).
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Encode as PNG and wrap as `data:image/png;base64,...`.
    pub fn to_data_url(&self) -> Result<String, FrameError> {
        let img = GrayImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected: (self.width as usize) * (self.height as usize),
                actual: self.data.len(),
            },
        )?;

        let mut png = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| FrameError::Encode(e.to_string()))?;

        Ok(format!("{PNG_DATA_URL_PREFIX}{}", STANDARD.encode(png)))
    }
}

/// Decode a `data:image/*;base64,` URL back into a grayscale frame.
///
/// Any format the `image` crate was built with is accepted; colour input is
/// converted to luma.
pub fn decode_data_url(url: &str) -> Result<Frame, FrameError> {
    let bytes = data_url_bytes(url)?;
    let gray = image::load_from_memory(&bytes)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .to_luma8();

    let (width, height) = gray.dimensions();
    Frame::from_gray(gray.into_raw(), width, height, 0)
}

/// Encoded image bytes carried by a `data:image/*;base64,` URL.
pub fn data_url_bytes(url: &str) -> Result<Vec<u8>, FrameError> {
    let rest = url
        .strip_prefix("data:image/")
        .ok_or_else(|| FrameError::Decode("not an image data URL".into()))?;
    let (_, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| FrameError::Decode("data URL is not base64-encoded".into()))?;

    STANDARD
        .decode(payload.trim())
        .map_err(|e| FrameError::Decode(format!("base64: {e}")))
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
/// Grayscale = every even-indexed byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Check if a frame is dark.
///
/// Returns true if more than `threshold_pct` of pixels fall below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in-place.
///
/// Divides the image into a square grid of tiles, computes a clipped
/// histogram per tile, builds CDFs, and bilinearly interpolates between
/// neighbouring tile CDFs.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || tiles == 0 || gray.len() < w * h {
        return;
    }

    let grid = tiles as usize;
    let tile_w = w / grid;
    let tile_h = h / grid;
    if tile_w == 0 || tile_h == 0 {
        return;
    }

    let cdfs: Vec<[f32; 256]> = (0..grid * grid)
        .map(|i| {
            let (y0, x0) = ((i / grid) * tile_h, (i % grid) * tile_w);
            tile_cdf(gray, w, y0, x0, tile_w, tile_h, clip_limit)
        })
        .collect();

    for y in 0..h {
        let fy = ((y as f32 / tile_h as f32) - 0.5).clamp(0.0, (grid - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(grid - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = ((x as f32 / tile_w as f32) - 0.5).clamp(0.0, (grid - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(grid - 1);
            let dx = fx - c0 as f32;

            let pixel = gray[y * w + x] as usize;
            let top = cdfs[r0 * grid + c0][pixel] * (1.0 - dx) + cdfs[r0 * grid + c1][pixel] * dx;
            let bot = cdfs[r1 * grid + c0][pixel] * (1.0 - dx) + cdfs[r1 * grid + c1][pixel] * dx;
            let val = top * (1.0 - dy) + bot * dy;

            gray[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clipped, redistributed and normalised CDF for one tile.
fn tile_cdf(
    gray: &[u8],
    stride: usize,
    y0: usize,
    x0: usize,
    tile_w: usize,
    tile_h: usize,
    clip_limit: f32,
) -> [f32; 256] {
    let tile_pixels = tile_w * tile_h;
    let mut hist = [0u32; 256];
    for y in y0..y0 + tile_h {
        for &p in &gray[y * stride + x0..y * stride + x0 + tile_w] {
            hist[p as usize] += 1;
        }
    }

    let clip = ((clip_limit * tile_pixels as f32) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let redist = excess / 256;
    let leftover = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += redist;
        if i < leftover {
            *bin += 1;
        }
    }

    let mut cdf = [0f32; 256];
    cdf[0] = hist[0] as f32;
    for i in 1..256 {
        cdf[i] = cdf[i - 1] + hist[i] as f32;
    }
    let cdf_min = cdf.iter().find(|&&v| v > 0.0).copied().unwrap_or(0.0);
    let denom = (tile_pixels as f32) - cdf_min;
    if denom > 0.0 {
        for v in cdf.iter_mut() {
            *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
        }
    }
    cdf
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image encode failed: {0}")]
    Encode(String),
    #[error("image decode failed: {0}")]
    Decode(String),
}
