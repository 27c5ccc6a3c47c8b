//! The isolated worker process hosting the recognition backend.
//!
//! The supervisor spawns `mathink worker` and speaks the framed protocol
//! over the child's stdin/stdout. Keeping the backend in its own process
//! means a hung or crashed recognition call can be recovered from by
//! killing and respawning the child, without taking the server down.

pub mod protocol;
pub mod supervisor;

use std::io::{Read, Write};

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::ocr::recognizer::{CommandRecognizer, Recognizer};
use crate::ocr::OcrPipeline;
use crate::worker::protocol::{read_message, write_message, Message, ProtocolError};

/// Entry point for the `worker` subcommand.
///
/// The recognizer is constructed exactly once here; everything expensive
/// about backend startup is amortized over the process lifetime.
pub fn run_worker(config: &Config) -> Result<()> {
    info!(
        command = %config.recognizer_command,
        "worker starting, loading recognition backend"
    );
    let mut recognizer = CommandRecognizer::from_command_line(&config.recognizer_command)?;
    let pipeline = OcrPipeline::new(config.segmentation.clone());

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_worker_loop(
        &mut stdin.lock(),
        &mut stdout.lock(),
        &pipeline,
        &mut recognizer,
    )?;
    info!("worker exiting");
    Ok(())
}

/// The blocking receive loop: one request is processed fully before the
/// next is read, so replies are FIFO relative to requests.
///
/// Per-request failures never end the loop; only the stop sentinel, EOF on
/// the request stream (supervisor gone), or an unrecoverable protocol error
/// do.
pub fn run_worker_loop<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    pipeline: &OcrPipeline,
    recognizer: &mut dyn Recognizer,
) -> Result<(), ProtocolError> {
    loop {
        let message = match read_message(reader) {
            Ok(message) => message,
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("request stream closed, worker loop ending");
                return Ok(());
            }
            Err(e) => {
                error!("unrecoverable protocol error in worker loop: {}", e);
                return Err(e);
            }
        };

        match message {
            Message::Stop => {
                info!("stop sentinel received");
                return Ok(());
            }
            Message::Request { id, image_bytes } => {
                // recognize_bytes contains every per-request failure and
                // degrades to an empty string, so the reply always goes out.
                let text = pipeline.recognize_bytes(&image_bytes, recognizer);
                write_message(writer, &Message::Reply { id, text })?;
            }
            Message::Reply { id, .. } => {
                warn!(id, "ignoring unexpected reply frame on request stream");
            }
        }
    }
}
