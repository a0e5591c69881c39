//! Status-tracked remote state values.
//!
//! A [`StateCell`] holds the last known remote state for one attribute
//! together with an explicit settlement status. Cells only move forward:
//! `Unset -> InProgress -> Applied | Failed`. Re-entering `InProgress`
//! requires an explicitly new command (in practice every command owns a
//! fresh cell).

use std::fmt;
use thiserror::Error;

use pfe_client::PfeError;

/// Errors raised by illegal cell transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    /// `begin_apply` was called while an apply was already in progress.
    #[error("apply already in progress")]
    AlreadyInProgress,

    /// `complete` was called on a cell that never began an apply.
    #[error("completion on a cell that was never applied")]
    NotStarted,

    /// A settled cell was completed again with a differing outcome.
    ///
    /// This is a real conflict (two replies disagreeing about the same
    /// attempt) and is reported to the caller rather than dropped.
    #[error("conflicting completion: cell settled as {previous}, new outcome {attempted}")]
    CompletionConflict { previous: String, attempted: String },
}

/// Settlement status of a [`StateCell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellStatus<T> {
    /// No command has touched this attribute yet.
    Unset,
    /// A command has been issued and its reply is outstanding.
    InProgress,
    /// The engine acknowledged the value.
    Applied(T),
    /// The attempt failed; carries the terminal error.
    Failed(PfeError),
}

impl<T: fmt::Debug> fmt::Display for CellStatus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellStatus::Unset => write!(f, "unset"),
            CellStatus::InProgress => write!(f, "in-progress"),
            CellStatus::Applied(v) => write!(f, "applied({:?})", v),
            CellStatus::Failed(e) => write!(f, "failed({})", e),
        }
    }
}

/// A status-tracked value mirroring one attribute of remote state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCell<T> {
    status: CellStatus<T>,
}

impl<T> StateCell<T>
where
    T: Clone + PartialEq + fmt::Debug,
{
    /// Creates an unset cell.
    pub fn new() -> Self {
        Self {
            status: CellStatus::Unset,
        }
    }

    /// Returns the current status.
    pub fn status(&self) -> &CellStatus<T> {
        &self.status
    }

    /// Returns true once the cell has left `Unset`/`InProgress`.
    pub fn is_settled(&self) -> bool {
        matches!(self.status, CellStatus::Applied(_) | CellStatus::Failed(_))
    }

    /// Returns true if the engine acknowledged the value.
    pub fn is_applied(&self) -> bool {
        matches!(self.status, CellStatus::Applied(_))
    }

    /// Returns the applied value, if any.
    pub fn applied(&self) -> Option<&T> {
        match &self.status {
            CellStatus::Applied(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the terminal error, if the cell failed.
    pub fn failure(&self) -> Option<&PfeError> {
        match &self.status {
            CellStatus::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Marks the start of an apply attempt.
    ///
    /// Legal from `Unset`, `Failed` and `Applied` (a new command
    /// superseding a settled one); illegal while a previous attempt is
    /// still outstanding.
    pub fn begin_apply(&mut self) -> Result<(), CellError> {
        match self.status {
            CellStatus::InProgress => Err(CellError::AlreadyInProgress),
            _ => {
                self.status = CellStatus::InProgress;
                Ok(())
            }
        }
    }

    /// Settles the cell with the outcome of the attempt.
    ///
    /// From `InProgress` this settles exactly once. On an already settled
    /// cell an identical outcome is a harmless no-op; a differing outcome
    /// is a [`CellError::CompletionConflict`].
    pub fn complete(&mut self, outcome: Result<T, PfeError>) -> Result<(), CellError> {
        match &self.status {
            CellStatus::InProgress => {
                self.status = match outcome {
                    Ok(v) => CellStatus::Applied(v),
                    Err(e) => CellStatus::Failed(e),
                };
                Ok(())
            }
            CellStatus::Unset => Err(CellError::NotStarted),
            CellStatus::Applied(prev) => match outcome {
                Ok(v) if v == *prev => Ok(()),
                other => Err(CellError::CompletionConflict {
                    previous: format!("applied({:?})", prev),
                    attempted: render_outcome(&other),
                }),
            },
            CellStatus::Failed(prev) => match outcome {
                Err(e) if e == *prev => Ok(()),
                other => Err(CellError::CompletionConflict {
                    previous: format!("failed({})", prev),
                    attempted: render_outcome(&other),
                }),
            },
        }
    }
}

impl<T> Default for StateCell<T>
where
    T: Clone + PartialEq + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

fn render_outcome<T: fmt::Debug>(outcome: &Result<T, PfeError>) -> String {
    match outcome {
        Ok(v) => format!("applied({:?})", v),
        Err(e) => format!("failed({})", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfe_client::PfeStatus;

    #[test]
    fn test_transition_sequence() {
        let mut cell: StateCell<bool> = StateCell::new();
        assert!(!cell.is_settled());

        cell.begin_apply().unwrap();
        assert_eq!(*cell.status(), CellStatus::InProgress);
        assert!(cell.begin_apply().is_err());

        cell.complete(Ok(true)).unwrap();
        assert!(cell.is_settled());
        assert!(cell.is_applied());
        assert_eq!(cell.applied(), Some(&true));
    }

    #[test]
    fn test_failed_then_reapply() {
        let mut cell: StateCell<bool> = StateCell::new();
        cell.begin_apply().unwrap();
        cell.complete(Err(PfeError::Timeout)).unwrap();
        assert_eq!(cell.failure(), Some(&PfeError::Timeout));

        // A new attempt may leave the failed state.
        cell.begin_apply().unwrap();
        cell.complete(Ok(true)).unwrap();
        assert!(cell.is_applied());
    }

    #[test]
    fn test_identical_double_complete_is_noop() {
        let mut cell: StateCell<bool> = StateCell::new();
        cell.begin_apply().unwrap();
        cell.complete(Ok(true)).unwrap();
        assert!(cell.complete(Ok(true)).is_ok());
        assert!(cell.is_applied());
    }

    #[test]
    fn test_conflicting_double_complete_reported() {
        let mut cell: StateCell<bool> = StateCell::new();
        cell.begin_apply().unwrap();
        cell.complete(Ok(true)).unwrap();

        let err = cell.complete(Ok(false)).unwrap_err();
        assert!(matches!(err, CellError::CompletionConflict { .. }));
        // The settled state is untouched by the conflicting reply.
        assert_eq!(cell.applied(), Some(&true));

        let err = cell
            .complete(Err(PfeError::Rejection {
                status: PfeStatus::TableFull,
            }))
            .unwrap_err();
        assert!(matches!(err, CellError::CompletionConflict { .. }));
    }

    #[test]
    fn test_complete_without_begin() {
        let mut cell: StateCell<bool> = StateCell::new();
        assert_eq!(cell.complete(Ok(true)), Err(CellError::NotStarted));
    }
}
