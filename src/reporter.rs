//! Writes task outcomes back to the server.

use crate::error::Error;
use crate::protocol::Message;
use crate::runner::task::Outcome;
use crate::session::Session;

/// Sends `BuildResult` messages through the session's single writer.
///
/// There is no retry queue: a result that cannot be written is logged and
/// dropped, and the server re-offers the build after its own timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResultReporter;

impl ResultReporter {
    pub fn new() -> Self {
        Self
    }

    pub async fn report(
        &self,
        session: &mut Session,
        build_uuid: &str,
        runner_uuid: &str,
        outcome: &Outcome,
    ) -> Result<(), Error> {
        let msg = Message::build_result(runner_uuid, build_uuid, outcome);
        match session.write_message(&msg).await {
            Ok(()) => {
                tracing::info!(build_uuid, outcome = %outcome, "Reported build result");
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    build_uuid,
                    outcome = %outcome,
                    error = %e,
                    "Failed to report build result, dropping it"
                );
                Err(e)
            }
        }
    }
}
