//! Raster normalisation ahead of layout detection and OCR.
//!
//! Applied in this order, each step optional:
//!
//! 1. resolution cap — downscale so the long edge fits `max_dimension`
//! 2. denoise        — 3×3 median filter (salt-and-pepper from scanners)
//! 3. deskew         — projection-variance search on a thumbnail
//! 4. contrast       — 1st/99th percentile stretch
//!
//! The resolution cap runs first so the expensive filters never see an
//! oversized raster.

use crate::config::PreprocessConfig;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::filter::median_filter;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use tracing::debug;

/// Long edge of the thumbnail used for skew estimation.
const SKEW_THUMBNAIL_EDGE: u32 = 600;
/// Angular resolution of the skew search, in degrees.
const SKEW_STEP_DEGREES: f32 = 0.5;
/// Skews at or below this are left alone.
const SKEW_MIN_CORRECTION: f32 = 0.5;

/// A normalised raster.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub image: GrayImage,
    /// Rotation applied to straighten the page (0 when none).
    pub skew_degrees: f32,
    pub downscaled: bool,
}

/// Run every enabled normalisation step on one page raster.
pub fn preprocess(image: GrayImage, config: &PreprocessConfig) -> Preprocessed {
    let (image, downscaled) = cap_resolution(image, config.max_dimension);
    let image = if config.denoise {
        median_filter(&image, 1, 1)
    } else {
        image
    };

    let mut skew_degrees = 0.0;
    let image = if config.deskew {
        let angle = estimate_skew(&image, config.max_skew_degrees);
        if angle.abs() > SKEW_MIN_CORRECTION {
            skew_degrees = angle;
            rotate_about_center(
                &image,
                angle.to_radians(),
                Interpolation::Bilinear,
                Luma([255]),
            )
        } else {
            image
        }
    } else {
        image
    };

    let image = if config.contrast {
        stretch_contrast(&image)
    } else {
        image
    };

    debug!(
        "Preprocessed {}x{} raster (skew {:.1}°, downscaled: {})",
        image.width(),
        image.height(),
        skew_degrees,
        downscaled
    );

    Preprocessed {
        image,
        skew_degrees,
        downscaled,
    }
}

fn cap_resolution(image: GrayImage, max_dimension: u32) -> (GrayImage, bool) {
    let (w, h) = image.dimensions();
    let long = w.max(h);
    if max_dimension == 0 || long <= max_dimension {
        return (image, false);
    }
    let factor = max_dimension as f32 / long as f32;
    let nw = ((w as f32 * factor).round() as u32).max(1);
    let nh = ((h as f32 * factor).round() as u32).max(1);
    (imageops::resize(&image, nw, nh, FilterType::Triangle), true)
}

/// Rotation (degrees) that makes text lines horizontal.
///
/// Rotates a binarised thumbnail through `±max_degrees` and keeps the angle
/// whose row-ink profile has the highest variance: when lines are level the
/// rows alternate sharply between ink and whitespace.
pub fn estimate_skew(image: &GrayImage, max_degrees: f32) -> f32 {
    let (w, h) = image.dimensions();
    if w < 8 || h < 8 || max_degrees <= 0.0 {
        return 0.0;
    }
    let factor = (SKEW_THUMBNAIL_EDGE as f32 / w.max(h) as f32).min(1.0);
    let thumb = imageops::resize(
        image,
        ((w as f32 * factor) as u32).max(1),
        ((h as f32 * factor) as u32).max(1),
        FilterType::Triangle,
    );
    let threshold = otsu_level(&thumb);

    let steps = (max_degrees / SKEW_STEP_DEGREES).floor() as i32;
    let mut best_angle = 0.0f32;
    let mut best_score = row_profile_variance(&thumb, threshold);
    for i in -steps..=steps {
        if i == 0 {
            continue;
        }
        let angle = i as f32 * SKEW_STEP_DEGREES;
        let rotated = rotate_about_center(
            &thumb,
            angle.to_radians(),
            Interpolation::Nearest,
            Luma([255]),
        );
        let score = row_profile_variance(&rotated, threshold);
        if score > best_score {
            best_score = score;
            best_angle = angle;
        }
    }
    best_angle
}

fn row_profile_variance(image: &GrayImage, threshold: u8) -> f64 {
    let rows: Vec<f64> = image
        .rows()
        .map(|row| row.filter(|p| p[0] <= threshold).count() as f64)
        .collect();
    if rows.is_empty() {
        return 0.0;
    }
    let mean = rows.iter().sum::<f64>() / rows.len() as f64;
    rows.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / rows.len() as f64
}

/// Linear stretch mapping the 1st..99th percentile to 0..255.
fn stretch_contrast(image: &GrayImage) -> GrayImage {
    let mut histogram = [0u64; 256];
    for p in image.pixels() {
        histogram[p[0] as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return image.clone();
    }
    let percentile = |fraction: f64| -> u8 {
        let target = (total as f64 * fraction).ceil() as u64;
        let mut seen = 0;
        for (level, count) in histogram.iter().enumerate() {
            seen += count;
            if seen >= target.max(1) {
                return level as u8;
            }
        }
        255
    };
    let lo = percentile(0.01);
    let hi = percentile(0.99);
    if hi <= lo {
        return image.clone();
    }
    let span = (hi - lo) as f32;
    let mut out = image.clone();
    for p in out.pixels_mut() {
        let v = p[0].clamp(lo, hi);
        p[0] = (((v - lo) as f32 / span) * 255.0).round() as u8;
    }
    out
}
