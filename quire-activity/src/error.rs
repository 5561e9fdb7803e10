use miette::Diagnostic;
use std::fmt;
use thiserror::Error;

/// Why a cancellation signal was triggered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StopReason {
    /// The owning activity was stopped.
    #[default]
    Stopped,
    /// Cancelled with an explicit message.
    Message(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Stopped => write!(f, "stopped"),
            StopReason::Message(message) => write!(f, "stopped: {}", message),
        }
    }
}

#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    #[diagnostic(code(quire::activity::stopped))]
    Stopped(StopReason),
    #[error("cancellation action was abandoned")]
    #[diagnostic(code(quire::activity::abandoned))]
    Abandoned,
    #[error("activity {activity} cannot manage itself or one of its ancestors")]
    #[diagnostic(code(quire::activity::self_management))]
    SelfManagement { activity: u64 },
    #[error("activity {activity} is already managed by activity {manager}")]
    #[diagnostic(code(quire::activity::already_managed))]
    AlreadyManaged { activity: u64, manager: u64 },
}

impl Error {
    /// True for cancellation failures, false for contract violations.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Error::Stopped(_))
    }
}
