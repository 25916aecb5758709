use thiserror::Error;

/// Failure kinds surfaced by the detection pipeline.
///
/// Callers branch on [`ErrorKind`], never on message text.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("inference unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("remote source error: {0}")]
    RemoteSource(String),

    #[error("nothing staged: {0}")]
    Empty(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    InferenceUnavailable,
    InferenceFailed,
    RemoteSource,
    Empty,
    Storage,
    Io,
    Image,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InferenceUnavailable(_) => ErrorKind::InferenceUnavailable,
            Error::InferenceFailed(_) => ErrorKind::InferenceFailed,
            Error::RemoteSource(_) => ErrorKind::RemoteSource,
            Error::Empty(_) => ErrorKind::Empty,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Io(_) => ErrorKind::Io,
            Error::Image(_) => ErrorKind::Image,
        }
    }

    /// HTTP status used when this error reaches the API boundary.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::Image => 400,
            ErrorKind::NotFound | ErrorKind::Empty => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::RemoteSource => 502,
            ErrorKind::InferenceUnavailable => 503,
            ErrorKind::InferenceFailed | ErrorKind::Storage | ErrorKind::Io => 500,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(format!("serialization: {}", err))
    }
}
