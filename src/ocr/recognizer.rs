use std::io::{Cursor, Write};
use std::process::{Command, Stdio};

use image::RgbImage;
use tracing::debug;

use crate::ocr::error::OcrError;

/// A backend that turns one cropped line image into markup text.
///
/// Calls are synchronous and assumed non-reentrant; the worker invokes them
/// one line at a time.
pub trait Recognizer {
    fn recognize(&mut self, image: &RgbImage) -> Result<String, OcrError>;
}

/// Recognizer backed by an external command (e.g. a pix2text CLI wrapper).
///
/// The line crop is piped to the command's stdin as PNG; the command is
/// expected to print the recognized markup on stdout and exit zero.
pub struct CommandRecognizer {
    program: String,
    args: Vec<String>,
}

impl CommandRecognizer {
    /// Parse a whitespace-separated command line such as
    /// `"pix2text-mfr --device cpu"`.
    pub fn from_command_line(command_line: &str) -> Result<Self, OcrError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(OcrError::EmptyRecognizerCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn encode_png(image: &RgbImage) -> Result<Vec<u8>, OcrError> {
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(image.clone())
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .map_err(|e| OcrError::DecodeFailed {
                details: format!("PNG encode failed: {}", e),
            })?;
        Ok(buf)
    }
}

impl Recognizer for CommandRecognizer {
    fn recognize(&mut self, image: &RgbImage) -> Result<String, OcrError> {
        let png = Self::encode_png(image)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OcrError::RecognizerSpawnFailed {
                program: self.program.clone(),
                details: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A backend that exits without draining stdin produces a broken
            // pipe here; its exit status below is the interesting part.
            let _ = stdin.write_all(&png);
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(OcrError::RecognizerFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let text = String::from_utf8(output.stdout)
            .map_err(|_| OcrError::RecognizerOutputNotUtf8)?
            .trim()
            .to_string();
        debug!(chars = text.len(), "recognizer returned");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn tiny_image() -> RgbImage {
        RgbImage::from_pixel(8, 8, Rgb([255, 255, 255]))
    }

    #[test]
    fn empty_command_line_is_rejected() {
        assert!(matches!(
            CommandRecognizer::from_command_line("   "),
            Err(OcrError::EmptyRecognizerCommand)
        ));
    }

    #[test]
    fn command_line_splits_into_program_and_args() {
        let rec = CommandRecognizer::from_command_line("pix2text-mfr --device cpu").unwrap();
        assert_eq!(rec.program, "pix2text-mfr");
        assert_eq!(rec.args, vec!["--device", "cpu"]);
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let mut rec =
            CommandRecognizer::from_command_line("/nonexistent/recognizer-binary").unwrap();
        assert!(matches!(
            rec.recognize(&tiny_image()),
            Err(OcrError::RecognizerSpawnFailed { .. })
        ));
    }

    #[test]
    fn stdout_is_trimmed() {
        let mut rec = CommandRecognizer::from_command_line("echo x+y=z").unwrap();
        let text = rec.recognize(&tiny_image()).unwrap();
        assert_eq!(text, "x+y=z");
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let mut rec = CommandRecognizer::from_command_line("false").unwrap();
        assert!(matches!(
            rec.recognize(&tiny_image()),
            Err(OcrError::RecognizerFailed { .. })
        ));
    }
}
