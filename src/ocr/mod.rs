pub mod compose;
pub mod error;
pub mod recognizer;
pub mod segmentation;

use std::panic::{catch_unwind, AssertUnwindSafe};

use image::RgbImage;
use tracing::{debug, warn};

use crate::config::SegmentationConfig;
use crate::ocr::compose::aligned_from_lines;
use crate::ocr::error::OcrError;
use crate::ocr::recognizer::Recognizer;
use crate::ocr::segmentation::segment;

/// The per-request recognition pipeline: decode, segment into line bands,
/// recognize each band, compose the per-line markup.
///
/// The outward contract is best-effort: any failure degrades to an empty
/// string rather than propagating, so a bad upload can never wedge the
/// worker loop.
pub struct OcrPipeline {
    config: SegmentationConfig,
}

impl OcrPipeline {
    pub fn new(config: SegmentationConfig) -> Self {
        Self { config }
    }

    /// Run the whole pipeline over raw upload bytes. Never fails outward.
    pub fn recognize_bytes(&self, bytes: &[u8], recognizer: &mut dyn Recognizer) -> String {
        match self.try_recognize(bytes, recognizer) {
            Ok(markup) => markup,
            Err(e) => {
                warn!("recognition failed, returning empty result: {}", e);
                String::new()
            }
        }
    }

    fn try_recognize(
        &self,
        bytes: &[u8],
        recognizer: &mut dyn Recognizer,
    ) -> Result<String, OcrError> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| OcrError::DecodeFailed {
                details: e.to_string(),
            })?
            .to_rgb8();

        let sub_images = segment(&img, &self.config);
        debug!(lines = sub_images.len(), "recognizing segmented lines");

        // Sequential on purpose: the backend is not assumed reentrant.
        let lines: Vec<String> = sub_images
            .iter()
            .map(|sub| recognize_line(recognizer, sub))
            .collect();

        Ok(aligned_from_lines(&lines))
    }
}

/// Recognize a single line crop, containing any failure (including panics)
/// to an empty string so one bad line cannot abort the request.
fn recognize_line(recognizer: &mut dyn Recognizer, sub: &RgbImage) -> String {
    let outcome = catch_unwind(AssertUnwindSafe(|| recognizer.recognize(sub)));
    match outcome {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!("recognizer error on line, substituting empty: {}", e);
            String::new()
        }
        Err(_) => {
            warn!("recognizer panicked on line, substituting empty");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Cursor;

    /// Scripted recognizer: returns canned lines in order, optionally
    /// failing or panicking on selected calls.
    struct ScriptedRecognizer {
        responses: Vec<Result<String, OcrError>>,
        calls: usize,
        panic_on: Option<usize>,
    }

    impl ScriptedRecognizer {
        fn returning(lines: &[&str]) -> Self {
            Self {
                responses: lines.iter().map(|s| Ok(s.to_string())).collect(),
                calls: 0,
                panic_on: None,
            }
        }
    }

    impl Recognizer for ScriptedRecognizer {
        fn recognize(&mut self, _image: &RgbImage) -> Result<String, OcrError> {
            let call = self.calls;
            self.calls += 1;
            if self.panic_on == Some(call) {
                panic!("scripted panic");
            }
            match self.responses.get_mut(call) {
                Some(slot) => std::mem::replace(slot, Ok(String::new())),
                None => Ok(String::new()),
            }
        }
    }

    fn png_with_bands(band_rows: &[(u32, u32)], width: u32, height: u32) -> Vec<u8> {
        let mut img = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
        for &(y0, y1) in band_rows {
            for y in y0..y1 {
                for x in 10..width - 10 {
                    img.put_pixel(x, y, Rgb([0, 0, 0]));
                }
            }
        }
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn undecodable_bytes_degrade_to_empty() {
        let pipeline = OcrPipeline::new(SegmentationConfig::default());
        let mut rec = ScriptedRecognizer::returning(&["should never be used"]);
        assert_eq!(pipeline.recognize_bytes(b"not an image", &mut rec), "");
        assert_eq!(rec.calls, 0);
    }

    #[test]
    fn blank_image_recognizes_to_empty_without_backend_calls() {
        let pipeline = OcrPipeline::new(SegmentationConfig::default());
        let mut rec = ScriptedRecognizer::returning(&["unused"]);
        let png = png_with_bands(&[], 200, 100);
        assert_eq!(pipeline.recognize_bytes(&png, &mut rec), "");
        assert_eq!(rec.calls, 0);
    }

    #[test]
    fn single_line_result_is_unwrapped() {
        let pipeline = OcrPipeline::new(SegmentationConfig::default());
        let mut rec = ScriptedRecognizer::returning(&["x^2"]);
        let png = png_with_bands(&[(40, 80)], 300, 120);
        assert_eq!(pipeline.recognize_bytes(&png, &mut rec), "x^2");
        assert_eq!(rec.calls, 1);
    }

    #[test]
    fn multi_line_result_is_aligned_in_order() {
        let pipeline = OcrPipeline::new(SegmentationConfig::default());
        let mut rec = ScriptedRecognizer::returning(&["a = b", "c = d"]);
        let png = png_with_bands(&[(40, 80), (140, 180)], 300, 240);
        assert_eq!(
            pipeline.recognize_bytes(&png, &mut rec),
            "\\begin{aligned}\na = b \\\\\nc = d\n\\end{aligned}"
        );
        assert_eq!(rec.calls, 2);
    }

    #[test]
    fn panicking_backend_only_loses_its_line() {
        let pipeline = OcrPipeline::new(SegmentationConfig::default());
        let mut rec = ScriptedRecognizer::returning(&["a = b", "c = d"]);
        rec.panic_on = Some(0);
        let png = png_with_bands(&[(40, 80), (140, 180)], 300, 240);
        // First line panics away; the survivor is returned unwrapped.
        assert_eq!(pipeline.recognize_bytes(&png, &mut rec), "c = d");
        assert_eq!(rec.calls, 2);
    }
}
