//! Error types shared across the middleware kernel.
//!
//! Recoverable faults at the HTTP edge are converted to the API envelope
//! (`{"code": -1, "message": …, "data": null}`) by the handlers themselves;
//! everything else propagates as [`Error`] through [`Result`].

use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// A terminal writer was invoked on a context that already produced a
    /// response. The first writer wins; later ones receive this.
    #[error("response already written")]
    ResponseWritten,

    /// `serve` was called on a server that is already running.
    #[error("server already started")]
    AlreadyStarted,

    /// `start` was called on a task queue that is neither new nor finished.
    #[error("task queue already running")]
    QueueRunning,

    /// Invalid request data or a missing required parameter.
    #[error("{message}")]
    BadRequest { message: String },

    /// `send` was called with an empty message batch.
    #[error("no messages to send")]
    EmptyBatch,

    /// Broker-side failure from the message bus.
    #[error("broker error: {0}")]
    Broker(String),

    /// A pipeline name that no manager knows about.
    #[error("pipeline {0} not registered")]
    PipelineNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Unexpected error with full context chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
