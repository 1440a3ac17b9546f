//! Run outcome and per-state tallies

use crate::error::{Error, PersistenceError, Result};
use crate::types::ItemId;
use serde::Serialize;

/// Item that ended a run in a failed state, with its reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    /// Item ID
    pub id: ItemId,
    /// Recorded reason
    pub reason: String,
}

/// Tallies of what happened to the items dispatched in one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Items recorded SUCCEEDED (downloaded or skipped)
    pub succeeded: u64,
    /// Succeeded items that were already on disk
    pub skipped: u64,
    /// Items recorded FAILED_PERMANENT
    pub failed_permanent: Vec<FailedItem>,
    /// Items no identity could serve in this run
    ///
    /// Open items are left PENDING; items that had already failed
    /// permanently keep that state.
    pub failed_exhausted: Vec<FailedItem>,
    /// Items put back to PENDING by cancellation
    pub cancelled: u64,
}

impl RunSummary {
    /// Number of items that reached any outcome
    pub fn processed(&self) -> u64 {
        self.succeeded
            + self.failed_permanent.len() as u64
            + self.failed_exhausted.len() as u64
            + self.cancelled
    }
}

/// Why a run stopped
#[derive(Debug)]
pub enum RunOutcome {
    /// Every pending item was dispatched and settled
    Drained,
    /// Stopped early: no identity could serve the remaining items
    IdentitiesExhausted,
    /// Stopped early by the cancellation signal
    Cancelled,
    /// The ledger could not be read or written
    Fatal(PersistenceError),
}

/// Result of [`Scheduler::run`](super::Scheduler::run)
#[derive(Debug)]
pub struct RunReport {
    /// Why the run stopped
    pub outcome: RunOutcome,
    /// What happened to the dispatched items
    pub summary: RunSummary,
}

impl RunReport {
    /// Process exit code for the run
    ///
    /// `0` when the batch drained, `1` when it stopped early (identities
    /// exhausted or cancelled), `2` when the ledger failed.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Drained => 0,
            RunOutcome::IdentitiesExhausted | RunOutcome::Cancelled => 1,
            RunOutcome::Fatal(_) => 2,
        }
    }

    /// Summary of a drained run, or the run-level error that stopped it
    pub fn into_result(self) -> Result<RunSummary> {
        match self.outcome {
            RunOutcome::Drained => Ok(self.summary),
            RunOutcome::IdentitiesExhausted => Err(Error::AllIdentitiesExhausted(format!(
                "{} items not served",
                self.summary.failed_exhausted.len()
            ))),
            RunOutcome::Cancelled => Err(Error::Cancelled),
            RunOutcome::Fatal(e) => Err(Error::Persistence(e)),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn make_report(outcome: RunOutcome) -> RunReport {
        RunReport {
            outcome,
            summary: RunSummary::default(),
        }
    }

    #[test]
    fn test_exit_code_matches_run_level_error() {
        let cases = [
            RunOutcome::IdentitiesExhausted,
            RunOutcome::Cancelled,
            RunOutcome::Fatal(PersistenceError::WriterStopped),
        ];
        for outcome in cases {
            let report = make_report(outcome);
            let code = report.exit_code();
            assert_eq!(report.into_result().unwrap_err().exit_code(), code);
        }

        let drained = make_report(RunOutcome::Drained);
        assert_eq!(drained.exit_code(), 0);
        assert!(drained.into_result().is_ok());
    }

    #[test]
    fn test_processed_counts_every_outcome() {
        let failed = FailedItem {
            id: ItemId::from("b"),
            reason: "PermanentRemoteError: HTTP 404".to_string(),
        };
        let summary = RunSummary {
            succeeded: 3,
            skipped: 1,
            failed_permanent: vec![failed.clone()],
            failed_exhausted: vec![failed],
            cancelled: 2,
        };
        assert_eq!(summary.processed(), 7);
    }
}
