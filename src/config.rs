use anyhow::Result;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub server_address: String,
    pub frontend_origin: String,
    /// Hard wall-clock deadline per OCR request.
    pub ocr_timeout: Duration,
    pub max_upload_bytes: usize,
    pub segmentation: SegmentationConfig,
    pub recognizer_command: String,
}

/// Tunables consumed by the line segmenter. Kept separate from the rest of
/// the config so the worker side only needs this slice.
#[derive(Clone, Debug)]
pub struct SegmentationConfig {
    /// Cap on recognizer calls per request; topmost lines win.
    pub max_lines: usize,
    /// Projection runs shorter than this many rows are ignored.
    pub min_line_height: u32,
    /// Padding added around the ink bounding box before cropping.
    pub crop_pad: u32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            max_lines: 8,
            min_line_height: 18,
            crop_pad: 18,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server_address: env::var("SERVER_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            frontend_origin: env::var("FRONTEND_ORIGIN")
                .unwrap_or_else(|_| "*".to_string()),
            ocr_timeout: ocr_timeout_from(env::var("OCR_TIMEOUT_S").ok()),
            max_upload_bytes: env::var("MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10 * 1024 * 1024),
            segmentation: SegmentationConfig {
                max_lines: env::var("MAX_LINES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8),
                min_line_height: env::var("MIN_LINE_H")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(18),
                crop_pad: env::var("CROP_PAD")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(18),
            },
            recognizer_command: env::var("RECOGNIZER_CMD")
                .unwrap_or_else(|_| "pix2text-mfr".to_string()),
        })
    }
}

const DEFAULT_OCR_TIMEOUT_S: f64 = 2.0;

/// Parse the per-request deadline, rejecting values `Duration::from_secs_f64`
/// would panic on (negative, NaN, infinite) along with anything unparseable.
fn ocr_timeout_from(raw: Option<String>) -> Duration {
    let secs = raw
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .unwrap_or(DEFAULT_OCR_TIMEOUT_S);
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(raw: &str) -> Duration {
        ocr_timeout_from(Some(raw.to_string()))
    }

    #[test]
    fn timeout_parses_fractional_seconds() {
        assert_eq!(parsed("0.5"), Duration::from_millis(500));
        assert_eq!(parsed("30"), Duration::from_secs(30));
    }

    #[test]
    fn unset_timeout_uses_the_default() {
        assert_eq!(ocr_timeout_from(None), Duration::from_secs(2));
    }

    #[test]
    fn bogus_timeout_values_fall_back_to_the_default() {
        for raw in ["-5", "NaN", "inf", "-inf", "two", ""] {
            assert_eq!(parsed(raw), Duration::from_secs(2), "value {:?}", raw);
        }
    }
}
