use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

/// Position of a strategy failure inside the rendered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Location {
    /// 1-based
    pub line: usize,
    /// 0-based
    pub column: usize,
}

fn location_suffix(location: &Option<Location>) -> String {
    match location {
        Some(Location { line, column }) => format!(" (line {}, column {})", line, column),
        None => String::new(),
    }
}

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Activity(#[from] quire_activity::Error),
    #[error("no renderer registered for type {0:?}")]
    #[diagnostic(code(quire::output::renderer_not_found))]
    RendererNotFound(String),
    #[error("invalid renderer type {0:?}")]
    #[diagnostic(code(quire::output::invalid_type))]
    InvalidType(String),
    #[error("renderer is not the active registration for type {0:?}")]
    #[diagnostic(code(quire::output::not_registered))]
    NotRegistered(String),
    #[error("invalid render options: {0}")]
    #[diagnostic(code(quire::output::invalid_options))]
    InvalidOptions(String),
    #[error("parent output context belongs to a different session")]
    #[diagnostic(code(quire::output::session_mismatch))]
    SessionMismatch,
    #[error("{renderer}: {message}{}", location_suffix(.location))]
    #[diagnostic(code(quire::output::render))]
    Render {
        renderer: String,
        message: String,
        location: Option<Location>,
    },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn render(renderer: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Render {
            renderer: renderer.into(),
            message: message.into(),
            location: None,
        }
    }

    pub fn located(
        renderer: impl Into<String>,
        message: impl Into<String>,
        line: usize,
        column: usize,
    ) -> Self {
        Error::Render {
            renderer: renderer.into(),
            message: message.into(),
            location: Some(Location { line, column }),
        }
    }

    /// The unit of work was cancelled, as opposed to failing on its own.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Error::Activity(error) if error.is_stopped())
    }
}
