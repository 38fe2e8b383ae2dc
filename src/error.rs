use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    /// The source ended before a required field could be read.
    #[error("incomplete data while reading {context}")]
    IncompleteData { context: &'static str },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// The stream kept failing with a retryable error until the attempt budget ran out.
    #[error("stream read failed after {attempts} attempts")]
    TransientIo { attempts: u32 },

    #[error("fetch of {url} failed after {attempts} attempts")]
    FetchExhausted { url: String, attempts: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    pub(crate) fn incomplete(context: &'static str) -> Self {
        DecodeError::IncompleteData { context }
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;
