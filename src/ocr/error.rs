use thiserror::Error;

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("Failed to decode image: {details}")]
    DecodeFailed { details: String },

    #[error("Recognizer command is empty")]
    EmptyRecognizerCommand,

    #[error("Failed to spawn recognizer '{program}': {details}")]
    RecognizerSpawnFailed { program: String, details: String },

    #[error("Recognizer exited with {status}: {stderr}")]
    RecognizerFailed { status: String, stderr: String },

    #[error("Recognizer produced non-UTF-8 output")]
    RecognizerOutputNotUtf8,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
