//! Pixel-level primitives used by the image quality gate.
//!
//! Decoding goes through `image`; filtering, edge detection, contour tracing
//! and polygon simplification through `imageproc`. Everything here is synchronous and CPU bound.

use crate::error::DecodeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, GrayImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::edges::canny;
use imageproc::filter::{gaussian_blur_f32, laplacian_filter};
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::point::Point;

/// Sigma roughly equivalent to a 5x5 Gaussian kernel.
const EDGE_BLUR_SIGMA: f32 = 1.1;

/// Strip an optional `data:image/...;base64,` prefix and decode the payload.
pub fn decode_base64(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let data = match payload.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => payload,
    };
    let data = data.trim();
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(STANDARD.decode(data)?)
}

/// Decode raw image bytes (any format `image` understands).
pub fn decode(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let image = image::load_from_memory(bytes)?;
    Ok(DecodedImage::new(image))
}

/// A decoded image together with its grayscale rendering.
pub struct DecodedImage {
    width: u32,
    height: u32,
    gray: GrayImage,
}

impl DecodedImage {
    pub fn new(image: DynamicImage) -> Self {
        Self::from_gray(image.to_luma8())
    }

    pub fn from_gray(gray: GrayImage) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            gray,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Mean and population standard deviation of grayscale intensity.
    pub fn intensity_stats(&self) -> (f64, f64) {
        let n = self.gray.as_raw().len();
        if n == 0 {
            return (0.0, 0.0);
        }
        let (sum, sum_sq) = self.gray.as_raw().iter().fold((0.0f64, 0.0f64), |(s, sq), &v| {
            let v = f64::from(v);
            (s + v, sq + v * v)
        });
        let mean = sum / n as f64;
        let variance = (sum_sq / n as f64 - mean * mean).max(0.0);
        (mean, variance.sqrt())
    }

    /// Variance of the 3x3 Laplacian response. Higher means sharper.
    pub fn laplacian_variance(&self) -> f64 {
        if self.width < 3 || self.height < 3 {
            return 0.0;
        }

        let response = laplacian_filter(&self.gray);
        let n = response.as_raw().len() as f64;
        let (sum, sum_sq) = response.as_raw().iter().fold((0.0f64, 0.0f64), |(s, sq), &v| {
            let v = f64::from(v);
            (s + v, sq + v * v)
        });
        let mean = sum / n;
        (sum_sq / n - mean * mean).max(0.0)
    }

    /// Canny edge map of the blurred image. Edge pixels are 255, everything
    /// else 0.
    pub fn edge_map(&self, low_threshold: f32, high_threshold: f32) -> GrayImage {
        if self.width < 3 || self.height < 3 {
            return GrayImage::new(self.width, self.height);
        }
        let blurred = gaussian_blur_f32(&self.gray, EDGE_BLUR_SIGMA);
        canny(&blurred, low_threshold, high_threshold)
    }
}

/// Outer contours of an edge map, each simplified to a polygon.
pub fn contours(edges: &GrayImage) -> Vec<Polygon> {
    find_contours::<i32>(edges)
        .into_iter()
        .filter(|c| matches!(c.border_type, BorderType::Outer))
        .map(|c| Polygon { points: c.points })
        .collect()
}

/// Closed polygon traced from an edge map.
#[derive(Debug, Clone)]
pub struct Polygon {
    pub points: Vec<Point<i32>>,
}

impl Polygon {
    /// Enclosed area (shoelace formula).
    pub fn area(&self) -> f64 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let twice: i64 = (0..n)
            .map(|i| {
                let a = self.points[i];
                let b = self.points[(i + 1) % n];
                i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y)
            })
            .sum();
        (twice as f64 / 2.0).abs()
    }

    pub fn perimeter(&self) -> f64 {
        arc_length(&self.points, true)
    }

    /// Vertex count after Douglas-Peucker simplification with a tolerance of
    /// `epsilon_ratio` times the perimeter.
    pub fn simplified_vertices(&self, epsilon_ratio: f64) -> usize {
        if self.points.len() < 3 {
            return self.points.len();
        }
        approximate_polygon_dp(&self.points, epsilon_ratio * self.perimeter(), true).len()
    }
}
