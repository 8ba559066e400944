use thiserror::Error;

/// Failures of the ingestion pipeline.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("init failed: {0}")]
    InitFail(String),
    #[error("run error: {0}")]
    RunError(String),
    #[error("pipeline is not initialized")]
    NotInitialized,
    #[error("ffmpeg: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),
}

impl BusError {
    pub fn init_fail(msg: impl Into<String>) -> Self {
        BusError::InitFail(msg.into())
    }

    pub fn run_error(msg: impl Into<String>) -> Self {
        BusError::RunError(msg.into())
    }
}

/// Outcome of a decoder call that did not produce what was asked for.
///
/// `Again` and `Eof` are regular flow-control answers of a decoder; only
/// `Failed` is a hard error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("decoder needs more input")]
    Again,
    #[error("decoder reached end of stream")]
    Eof,
    #[error("decoder failure: {0}")]
    Failed(String),
}

impl From<ffmpeg_next::Error> for DecodeError {
    fn from(err: ffmpeg_next::Error) -> Self {
        match err {
            ffmpeg_next::Error::Eof => DecodeError::Eof,
            ffmpeg_next::Error::Other { errno } if errno == ffmpeg_next::util::error::EAGAIN => {
                DecodeError::Again
            }
            err => DecodeError::Failed(err.to_string()),
        }
    }
}
