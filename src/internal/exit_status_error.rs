use std::error::Error;
use std::fmt;
use std::process::ExitStatus;

/// Describes the result of a process after it has failed.
///
/// Produced by the [`.exit_ok`](ExitStatusExt::exit_ok) method on [`ExitStatus`].
/// This is a stable-Rust implementation of the nightly `exit_status_error`
/// feature, used by [`crate::plugin`] to report `INSTALL`/`REMOVE` script
/// failures.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct ExitStatusError(ExitStatus);

impl ExitStatusError {
    /// Reports the exit code, if applicable, from an `ExitStatusError`.
    pub fn code(&self) -> Option<i32> {
        self.0.code()
    }

    /// Converts an `ExitStatusError` (back) to an `ExitStatus`.
    pub fn into_status(self) -> ExitStatus {
        self.0
    }
}

impl Error for ExitStatusError {}

impl fmt::Display for ExitStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process exited unsuccessfully: {}", self.into_status())
    }
}

pub(crate) trait ExitStatusExt {
    /// Was termination successful? Returns a `Result`.
    fn exit_ok(self) -> Result<(), ExitStatusError>;
}

impl ExitStatusExt for ExitStatus {
    fn exit_ok(self) -> Result<(), ExitStatusError> {
        if self.success() {
            Ok(())
        } else {
            Err(ExitStatusError(self))
        }
    }
}
