//! Named commands, as delivered by a key binding or menu layer.

use crate::error::Error;
use crate::evaluator::Evaluator;
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "kebab-case")]
pub enum Command {
    /// Evaluate the target cell.
    Eval,
    /// Evaluate every cell above the target.
    EvalBefore,
    /// Evaluate the whole document.
    EvalAll,
    /// Stop the target cell's evaluations.
    Stop,
    StopAll,
    /// Stop the target cell and clear its output.
    Reset,
    ResetAll,
    AddBefore,
    AddAfter,
    Duplicate,
    Delete,
    MoveUp,
    MoveDown,
}

impl Command {
    pub fn needs_target(self) -> bool {
        !matches!(self, Command::EvalAll | Command::StopAll | Command::ResetAll)
    }
}

impl Evaluator {
    /// Run the command called `name` against the cell `target`.
    ///
    /// Returns `Ok(false)` when the command is unknown, needs a target that
    /// is missing, or did not succeed (an evaluation failure has already been
    /// rendered into the cell's output).
    pub async fn perform_command(&self, name: &str, target: Option<&str>) -> Result<bool, Error> {
        let Ok(command) = Command::from_str(name) else {
            debug!(command = name, "unknown command");
            return Ok(false);
        };
        let target = target.and_then(|id| self.document().cell(id));
        if command.needs_target() && target.is_none() {
            debug!(%command, "command needs a target cell");
            return Ok(false);
        }

        let handled = match (command, target) {
            (Command::Eval, Some(cell)) => self.evaluate_cell(&cell).await.is_ok(),
            (Command::EvalBefore, Some(cell)) => self.evaluate_before(cell.id()).await.is_ok(),
            (Command::EvalAll, _) => self.evaluate_all().await.is_ok(),
            (Command::Stop, Some(cell)) => {
                self.stop_cell(&cell);
                true
            }
            (Command::StopAll, _) => {
                self.stop();
                true
            }
            (Command::Reset, Some(cell)) => {
                self.reset_cell(&cell);
                true
            }
            (Command::ResetAll, _) => {
                self.reset()?;
                true
            }
            (Command::AddBefore, Some(cell)) => {
                self.document().insert_next_to(cell.id(), false, cell.kind(), "")?;
                true
            }
            (Command::AddAfter, Some(cell)) => {
                self.document().insert_next_to(cell.id(), true, cell.kind(), "")?;
                true
            }
            (Command::Duplicate, Some(cell)) => {
                self.document().insert_next_to(cell.id(), true, cell.kind(), cell.text())?;
                true
            }
            (Command::Delete, Some(cell)) => {
                self.reset_cell(&cell);
                self.document().remove_cell(cell.id())?;
                true
            }
            (Command::MoveUp, Some(cell)) => self.document().move_cell(cell.id(), false)?,
            (Command::MoveDown, Some(cell)) => self.document().move_cell(cell.id(), true)?,
            (command, None) => {
                warn!(%command, "command reached dispatch without a target");
                false
            }
        };
        Ok(handled)
    }
}
