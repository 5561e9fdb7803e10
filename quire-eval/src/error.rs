use miette::Diagnostic;
use quire_activity::StopReason;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Output(#[from] quire_output::Error),
    #[error("cell does not exist: {0}")]
    #[diagnostic(code(quire::eval::cell_not_found))]
    CellNotFound(String),
    #[error("duplicate cell id in document: {0}")]
    #[diagnostic(code(quire::eval::duplicate_cell))]
    DuplicateCell(String),
    #[error("invalid settings")]
    #[diagnostic(code(quire::eval::settings))]
    Settings(#[from] serde_yaml::Error),
    #[error("invalid document snapshot")]
    #[diagnostic(code(quire::eval::snapshot))]
    Snapshot(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<quire_activity::Error> for Error {
    fn from(error: quire_activity::Error) -> Self {
        Error::Output(error.into())
    }
}

impl Error {
    pub(crate) fn stopped() -> Self {
        quire_activity::Error::Stopped(StopReason::Stopped).into()
    }

    /// The evaluation was cancelled rather than failing on its own.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Error::Output(error) if error.is_stopped())
    }
}
