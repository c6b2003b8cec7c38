pub mod boot;
pub mod cleanup;
pub mod context;
pub mod hooks;
pub mod install;
pub mod reset;
pub mod storage;
pub mod upgrade;

use capstan_api::error::{CapstanError, CapstanResultExt, ServicingError};

use cleanup::CleanupStack;

pub use context::EngineContext;

/// Runs the cleanup stack after an action. The action's error, if any, stays
/// the primary result; cleanup failures are appended to its message. A
/// cleanup failure after a successful action is itself an error.
pub(crate) fn finish(
    mut cleanup: CleanupStack,
    result: Result<(), CapstanError>,
) -> Result<(), CapstanError> {
    match result {
        Ok(()) => {
            use capstan_api::error::ReportError;
            cleanup.cleanup(None).structured(ServicingError::Cleanup)
        }
        Err(action_error) => match cleanup.cleanup(None) {
            Ok(()) => Err(action_error),
            Err(cleanup_error) => {
                Err(action_error).message(format!("While cleaning up:\n{cleanup_error:#}"))
            }
        },
    }
}
