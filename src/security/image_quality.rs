use crate::imaging::{self, DecodedImage};
use serde::Serialize;

/// Thresholds for admitting an uploaded photo of tiles
#[derive(Debug, Clone)]
pub struct ImageQualityConfig {
    /// Laplacian variance below this is blurry
    pub blur_threshold: f64,
    /// Mean grayscale intensity bounds (0-255)
    pub min_brightness: f64,
    pub max_brightness: f64,
    /// Grayscale standard deviation below this is flat
    pub min_contrast: f64,
    pub min_resolution: (u32, u32),
    /// Estimated decoded size limit in bytes
    pub max_file_size: f64,
    /// Smallest contour area that can be a tile
    pub min_tile_area: f64,
    /// Canny hysteresis thresholds
    pub canny_low: f32,
    pub canny_high: f32,
    /// Polygon simplification tolerance as a fraction of the perimeter
    pub polygon_epsilon: f64,
}

impl Default for ImageQualityConfig {
    fn default() -> Self {
        Self {
            blur_threshold: 100.0,
            min_brightness: 30.0,
            max_brightness: 240.0,
            min_contrast: 20.0,
            min_resolution: (300, 300),
            max_file_size: 10.0 * 1024.0 * 1024.0,
            min_tile_area: 500.0,
            canny_low: 50.0,
            canny_high: 150.0,
            polygon_epsilon: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageQualityReport {
    pub acceptable: bool,
    pub blur_score: f64,
    pub brightness_score: f64,
    pub contrast_score: f64,
    pub sharpness_score: f64,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ImageQualityReport {
    fn undecodable() -> Self {
        Self {
            acceptable: false,
            blur_score: 0.0,
            brightness_score: 0.0,
            contrast_score: 0.0,
            sharpness_score: 0.0,
            issues: vec!["failed to decode image".to_string()],
            recommendations: vec!["Please upload a valid image file (JPEG, PNG, etc.)".to_string()],
        }
    }

    /// User-friendly summary of the report
    pub fn summary(&self) -> QualitySummary {
        let sharpness = format!("{:.0}%", self.sharpness_score);
        if self.acceptable {
            QualitySummary {
                status: "good",
                message: "Image quality is suitable for analysis",
                sharpness,
                issues: None,
                recommendations: None,
            }
        } else {
            QualitySummary {
                status: "poor",
                message: "Image quality needs improvement",
                sharpness,
                issues: Some(self.issues.clone()),
                recommendations: Some(self.recommendations.clone()),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualitySummary {
    pub status: &'static str,
    pub message: &'static str,
    pub sharpness: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<String>>,
}

/// Accumulates issues and recommendations; every check runs.
#[derive(Default)]
struct Findings {
    issues: Vec<String>,
    recommendations: Vec<String>,
}

impl Findings {
    fn flag(&mut self, issue: String, recommendation: &str) {
        self.issues.push(issue);
        self.recommendations.push(recommendation.to_string());
    }
}

/// Decides whether an uploaded photo is good enough to send to the model
#[derive(Debug, Clone, Default)]
pub struct ImageQualityGate {
    config: ImageQualityConfig,
}

impl ImageQualityGate {
    pub fn new(config: ImageQualityConfig) -> Self {
        Self { config }
    }

    /// Assess a base64 payload (optionally a `data:` URL)
    ///
    /// The size check uses the encoded length times 3/4 rather than the
    /// decoded byte count.
    pub fn assess(&self, encoded: &str) -> ImageQualityReport {
        let image = match imaging::decode_base64(encoded).and_then(|bytes| imaging::decode(&bytes)) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode uploaded image");
                return ImageQualityReport::undecodable();
            }
        };

        let estimated_size = encoded.len() as f64 * 0.75;
        self.assess_decoded(&image, estimated_size)
    }

    /// Run every metric on an already decoded image.
    pub fn assess_decoded(&self, image: &DecodedImage, estimated_size: f64) -> ImageQualityReport {
        let cfg = &self.config;
        let mut findings = Findings::default();

        let size_ok = estimated_size <= cfg.max_file_size;
        if !size_ok {
            findings.flag(
                format!("Image too large ({:.1}MB)", estimated_size / 1024.0 / 1024.0),
                "Please compress the image or take a smaller photo",
            );
        }

        let (width, height) = image.dimensions();
        let (min_w, min_h) = cfg.min_resolution;
        let resolution_ok = width >= min_w && height >= min_h;
        if !resolution_ok {
            findings.flag(
                format!("Resolution too low ({}x{})", width, height),
                &format!("Please use at least {}x{} resolution", min_w, min_h),
            );
        }

        let blur_score = image.laplacian_variance();
        let sharp_ok = blur_score >= cfg.blur_threshold;
        if !sharp_ok {
            findings.flag(
                format!("Image is blurry (sharpness: {:.1})", blur_score),
                "Please hold the camera steady and ensure the tiles are in focus",
            );
        }

        let (brightness_score, contrast_score) = image.intensity_stats();
        let brightness_ok = (cfg.min_brightness..=cfg.max_brightness).contains(&brightness_score);
        if brightness_score < cfg.min_brightness {
            findings.flag(
                format!("Image too dark (brightness: {:.1})", brightness_score),
                "Please take the photo in better lighting or use flash",
            );
        } else if brightness_score > cfg.max_brightness {
            findings.flag(
                format!("Image overexposed (brightness: {:.1})", brightness_score),
                "Please reduce lighting or move away from bright light sources",
            );
        }

        let contrast_ok = contrast_score >= cfg.min_contrast;
        if !contrast_ok {
            findings.flag(
                format!("Poor contrast (contrast: {:.1})", contrast_score),
                "Please ensure good lighting with clear tile edges visible",
            );
        }

        let shapes_ok = self.count_tile_shapes(image) >= 1;
        if !shapes_ok {
            findings.flag(
                "No clear tile shapes detected".to_string(),
                "Please ensure Mahjong tiles are clearly visible and well-framed",
            );
        }

        let sharpness_score = (100.0 * blur_score / cfg.blur_threshold).clamp(0.0, 100.0);

        ImageQualityReport {
            acceptable: size_ok && resolution_ok && sharp_ok && brightness_ok && contrast_ok && shapes_ok,
            blur_score,
            brightness_score,
            contrast_score,
            sharpness_score,
            issues: findings.issues,
            recommendations: findings.recommendations,
        }
    }

    /// Contours whose area fits a tile (up to a quarter of the frame) and whose
    /// simplified outline has at least four corners.
    pub fn count_tile_shapes(&self, image: &DecodedImage) -> usize {
        let cfg = &self.config;
        let max_area = (image.area() / 4) as f64;

        imaging::contours(&image.edge_map(cfg.canny_low, cfg.canny_high))
            .iter()
            .filter(|polygon| {
                let area = polygon.area();
                area >= cfg.min_tile_area && area <= max_area
            })
            .filter(|polygon| polygon.simplified_vertices(cfg.polygon_epsilon) >= 4)
            .count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    pub(crate) fn encode_png(gray: GrayImage) -> String {
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(gray)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        STANDARD.encode(buf)
    }

    /// 400x400 dark table with four bright 60x80 tiles.
    pub(crate) fn tiles_photo() -> String {
        let tiles = [(40, 40), (160, 40), (40, 200), (160, 200)];
        encode_png(GrayImage::from_fn(400, 400, |x, y| {
            let on_tile = tiles
                .iter()
                .any(|&(tx, ty)| x >= tx && x < tx + 60 && y >= ty && y < ty + 80);
            Luma([if on_tile { 220 } else { 40 }])
        }))
    }

    fn has_issue(report: &ImageQualityReport, needle: &str) -> bool {
        report
            .issues
            .iter()
            .any(|issue| issue.to_lowercase().contains(needle))
    }

    #[test]
    fn test_default_thresholds() {
        let cfg = ImageQualityConfig::default();
        assert_eq!(cfg.blur_threshold, 100.0);
        assert_eq!((cfg.min_brightness, cfg.max_brightness), (30.0, 240.0));
        assert_eq!(cfg.min_contrast, 20.0);
        assert_eq!(cfg.min_resolution, (300, 300));
        assert_eq!(cfg.max_file_size, 10.0 * 1024.0 * 1024.0);
        assert_eq!((cfg.canny_low, cfg.canny_high), (50.0, 150.0));
    }

    #[test]
    fn test_tiny_gray_image_fails_on_resolution() {
        let gate = ImageQualityGate::default();
        let report = gate.assess(&encode_png(GrayImage::from_pixel(10, 10, Luma([128]))));

        assert!(!report.acceptable);
        assert!(has_issue(&report, "resolution"));
        assert!(report.issues.iter().any(|i| i.contains("10x10")));
        // flat gray also fails focus, contrast and shape checks
        assert!(has_issue(&report, "blurry"));
        assert!(has_issue(&report, "contrast"));
        assert!(has_issue(&report, "tile shapes"));
        assert_eq!(report.issues.len(), report.recommendations.len());
    }

    #[test]
    fn test_good_photo_is_acceptable() {
        let gate = ImageQualityGate::default();
        let report = gate.assess(&tiles_photo());

        assert!(report.acceptable, "issues: {:?}", report.issues);
        assert!(report.issues.is_empty());
        assert!(report.recommendations.is_empty());
        assert!(report.blur_score >= 100.0);
        assert_eq!(report.sharpness_score, 100.0);
    }

    #[test]
    fn test_good_photo_accepts_data_url() {
        let gate = ImageQualityGate::default();
        let report = gate.assess(&format!("data:image/png;base64,{}", tiles_photo()));
        assert!(report.acceptable, "issues: {:?}", report.issues);
    }

    #[test]
    fn test_undecodable_payload() {
        let gate = ImageQualityGate::default();

        for payload in ["", "not-base64!!", &STANDARD.encode(b"plain text, not pixels")] {
            let report = gate.assess(payload);
            assert!(!report.acceptable);
            assert_eq!(report.issues, vec!["failed to decode image".to_string()]);
            assert_eq!(report.blur_score, 0.0);
            assert_eq!(report.brightness_score, 0.0);
            assert_eq!(report.contrast_score, 0.0);
            assert_eq!(report.sharpness_score, 0.0);
        }
    }

    #[test]
    fn test_dark_and_overexposed() {
        let gate = ImageQualityGate::default();

        let dark = gate.assess(&encode_png(GrayImage::from_pixel(320, 320, Luma([5]))));
        assert!(!dark.acceptable);
        assert!(has_issue(&dark, "too dark"));
        assert!(dark.recommendations.iter().any(|r| r.contains("better lighting")));

        let bright = gate.assess(&encode_png(GrayImage::from_pixel(320, 320, Luma([250]))));
        assert!(has_issue(&bright, "overexposed"));
        assert!(!has_issue(&bright, "too dark"));
    }

    #[test]
    fn test_checks_accumulate_independently() {
        let gate = ImageQualityGate::default();
        let report = gate.assess(&encode_png(GrayImage::from_pixel(320, 320, Luma([0]))));

        // resolution is fine, everything else fails
        assert!(!has_issue(&report, "resolution"));
        assert_eq!(report.issues.len(), 4);
        assert_eq!(report.recommendations.len(), 4);
        assert_eq!(report.sharpness_score, 0.0);
    }

    #[test]
    fn test_size_estimate_uses_encoded_length() {
        let payload = tiles_photo();
        let estimated = payload.len() as f64 * 0.75;

        let gate = ImageQualityGate::new(ImageQualityConfig {
            max_file_size: estimated - 1.0,
            ..ImageQualityConfig::default()
        });
        let report = gate.assess(&payload);
        assert!(!report.acceptable);
        assert!(has_issue(&report, "too large"));
        assert_eq!(report.issues.len(), 1);

        let gate = ImageQualityGate::new(ImageQualityConfig {
            max_file_size: estimated,
            ..ImageQualityConfig::default()
        });
        assert!(gate.assess(&payload).acceptable);
    }

    #[test]
    fn test_oversized_shape_is_not_a_tile() {
        // one rectangle covering most of the frame
        let gate = ImageQualityGate::default();
        let image = DecodedImage::from_gray(GrayImage::from_fn(400, 400, |x, y| {
            let inside = (20..380).contains(&x) && (20..380).contains(&y);
            Luma([if inside { 200 } else { 30 }])
        }));
        assert_eq!(gate.count_tile_shapes(&image), 0);
    }

    #[test]
    fn test_summary() {
        let gate = ImageQualityGate::default();

        let good = gate.assess(&tiles_photo()).summary();
        assert_eq!(good.status, "good");
        assert_eq!(good.sharpness, "100%");
        assert!(good.issues.is_none());

        let poor = gate.assess("garbage").summary();
        assert_eq!(poor.status, "poor");
        assert_eq!(poor.sharpness, "0%");
        assert_eq!(poor.issues.unwrap(), vec!["failed to decode image".to_string()]);

        let json = serde_json::to_value(gate.assess(&tiles_photo()).summary()).unwrap();
        assert!(json.get("issues").is_none());
    }
}
