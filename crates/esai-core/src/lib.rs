//! Running assistant-authored code inside the conversation.
//!
//! A [`Runner`] takes one block or a whole reply. Scripts go to the shared
//! [`ExecutionSession`]. Markup goes to a [`esai_preview::PreviewSink`].

pub mod pipeline;
pub mod session;

mod runner;

use thiserror::Error;

pub use pipeline::{NO_OUTPUT, ProjectPlan, Step};
pub use runner::Runner;
pub use session::{
    BusyPolicy, Captured, EngineFactory, ExecutionSession, RunPermit, SessionError,
    SessionHandle, SessionState, python_factory,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub transcript: String,
    pub failed: bool,
    pub error_text: Option<String>,
    /// Label of the markup block published during this run, if any.
    pub previewed: Option<String>,
}

impl RunResult {
    pub fn ok(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            ..Self::default()
        }
    }

    pub fn failure(transcript: impl Into<String>, error_text: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            failed: true,
            error_text: Some(error_text.into()),
            previewed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("interpreter failed to initialize: {0}")]
    Initialization(String),
    #[error("another run is still in progress; try again when it finishes")]
    Busy,
    #[error("block #{order} is neither a script nor markup")]
    Unsupported { order: usize },
    #[error("interpreter session failed: {0}")]
    Session(String),
}

impl From<SessionError> for RunError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Initialization(message) => Self::Initialization(message),
            SessionError::Busy => Self::Busy,
            other => Self::Session(other.to_string()),
        }
    }
}
