//! Image preprocessing stages.
//!
//! Each stage is a pure function over owned buffers:
//!
//! ```text
//! RGBA image ─rescale─▶ RGBA (w×h) ─reduce_channels─▶ u8 intensities
//!            ─pack_to_tensor─▶ f32 in [0, 1] ─normalize─▶ model input
//! ```

use image::imageops::{self, FilterType};
use image::RgbaImage;
use tracing::debug;

use splitnn_types::config::{ChannelPolicy, PreprocessConfig};
use splitnn_types::tensor::element_count;
use splitnn_types::{Result, SplitError, Tensor};

/// Resample `image` to `width × height` with bilinear (triangle) filtering.
/// The source is first copied onto a scratch surface at native size.
/// Rescaling to the current dimensions returns the pixels unchanged.
pub fn rescale(image: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage> {
    if width == 0 || height == 0 {
        return Err(SplitError::InvalidParameter(format!(
            "target dimensions must be non-zero, got {width}x{height}"
        )));
    }
    let mut scratch = RgbaImage::new(image.width(), image.height());
    imageops::replace(&mut scratch, image, 0, 0);

    if scratch.dimensions() == (width, height) {
        return Ok(scratch);
    }
    Ok(imageops::resize(&scratch, width, height, FilterType::Triangle))
}

/// Reduce RGBA pixels to `policy.channels()` intensities per pixel.
pub fn reduce_channels(image: &RgbaImage, policy: ChannelPolicy) -> Vec<u8> {
    match policy {
        ChannelPolicy::Alpha => image.pixels().map(|p| p.0[3]).collect(),
        ChannelPolicy::Luma => image
            .pixels()
            .map(|p| {
                let [r, g, b, _] = p.0;
                let y = 0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b);
                y.round().clamp(0.0, 255.0) as u8
            })
            .collect(),
        ChannelPolicy::Rgba => image.as_raw().clone(),
    }
}

/// 0–255 intensities to 0.0–1.0 floats, order preserved.
pub fn pack_to_tensor(intensities: &[u8]) -> Vec<f32> {
    intensities.iter().map(|&v| f32::from(v) / 255.0).collect()
}

/// `(x - mean[c]) / std[c]` with `c = i % channels`.
pub fn normalize(values: &[f32], mean: &[f32], std: &[f32], channels: usize) -> Result<Vec<f32>> {
    if channels == 0 {
        return Err(SplitError::InvalidParameter("channels must be non-zero".into()));
    }
    if mean.len() < channels || std.len() < channels {
        return Err(SplitError::InvalidParameter(format!(
            "mean/std need {channels} entries, got {}/{}",
            mean.len(),
            std.len()
        )));
    }
    if let Some(bad) = std[..channels].iter().find(|s| **s == 0.0 || !s.is_finite()) {
        return Err(SplitError::InvalidParameter(format!("std must be finite and non-zero, got {bad}")));
    }
    Ok(values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let c = i % channels;
            (v - mean[c]) / std[c]
        })
        .collect())
}

/// Run every stage and shape the result for the model input.
pub fn preprocess(image: &RgbaImage, config: &PreprocessConfig) -> Result<Tensor> {
    let scaled = rescale(image, config.width, config.height)?;
    let channels = config.policy.channels();
    let packed = pack_to_tensor(&reduce_channels(&scaled, config.policy));

    let values = if config.mean.is_empty() && config.std.is_empty() {
        packed
    } else {
        normalize(&packed, &config.mean, &config.std, channels)?
    };

    let shape = config.resolved_input_shape();
    if element_count(&shape) != Some(values.len()) {
        return Err(SplitError::InvalidParameter(format!(
            "input shape {shape:?} does not hold the {} elements preprocessing produced",
            values.len()
        )));
    }
    debug!(
        src_w = image.width(),
        src_h = image.height(),
        policy = ?config.policy,
        ?shape,
        "image preprocessed"
    );
    Tensor::from_f32(shape, &values)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
