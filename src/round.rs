//! Transaction round coordinator: the state machine that coordinates
//! pre-commit callbacks, size/time budget checks, en-masse commit or
//! rollback, and post-commit callbacks across every primary-facing handle
//! acquired during a request.
//!
//! Grounded in pgdog's `backend::two_pc` (a counter-tagged coordinator that
//! drives `prepare`/`commit`/`rollback` across a connection) generalised
//! from two_pc's single-connection, caller-driven protocol to a multi-handle
//! round that owns the fixpoint finalize and idle-callback draining `two_pc`
//! leaves to its caller.

use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};

use crate::pool::Handle;

#[derive(Debug, Error)]
pub enum Error {
    #[error("round method called in stage {actual:?}, expected {expected:?}")]
    WrongStage { expected: Stage, actual: Stage },

    #[error("begin() called with a round id already set")]
    AlreadyBegun,

    #[error("explicit atomic section still open on a writer handle at approve")]
    AtomicSectionOpen,

    #[error("write duration budget of {budget:?} exceeded (estimated {estimated:?})")]
    WriteDurationBudgetExceeded { budget: Duration, estimated: Duration },

    #[error("ping failed during approve: {0}")]
    ApprovePingFailed(#[source] crate::driver::DriverError),

    #[error("commit failed on {failures} of {total} writer handles: {diagnostic}")]
    CommitAggregate {
        failures: usize,
        total: usize,
        diagnostic: String,
    },

    #[error("driver error: {0}")]
    Driver(#[from] crate::driver::DriverError),
}

/// The round's state diagram, modeled as an explicit enum rather than
/// raised exceptions -- tagged result values propagated at each transition
/// boundary, checked by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Cursory,
    Finalized,
    Approved,
    CommitCallbacks,
    RollbackCallbacks,
    /// Terminal for the current attempt; only `rollback()` recovers from it.
    Error,
}

/// Coordinates a single in-flight round over the writer handles acquired
/// for it. One instance exists per balancer; a round id is assigned at
/// `begin` and cleared when the round returns to `Cursory`.
pub struct RoundCoordinator {
    stage: Stage,
    round_id: Option<String>,
    max_write_duration: Option<Duration>,
}

impl Default for RoundCoordinator {
    fn default() -> Self {
        Self {
            stage: Stage::Cursory,
            round_id: None,
            max_write_duration: None,
        }
    }
}

impl RoundCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a previously-persisted callback-stage round (`roundStage`
    /// config key).
    pub fn resume(stage: Stage, round_id: Option<String>) -> Self {
        Self {
            stage,
            round_id,
            max_write_duration: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn round_id(&self) -> Option<&str> {
        self.round_id.as_deref()
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.stage, Stage::Cursory)
    }

    fn expect_stage(&self, expected: Stage) -> Result<(), Error> {
        if self.stage != expected {
            return Err(Error::WrongStage {
                expected,
                actual: self.stage,
            });
        }
        Ok(())
    }

    /// `begin()`: must be called in `Cursory` with no round id set. Flushes
    /// empty snapshots on every writer handle so implicit reads don't leak
    /// into the round's view, then marks each handle a round participant.
    pub async fn begin(&mut self, round_id: impl Into<String>, handles: &mut [Handle]) -> Result<(), Error> {
        self.expect_stage(Stage::Cursory)?;
        if self.round_id.is_some() {
            return Err(Error::AlreadyBegun);
        }

        self.stage = Stage::Error;
        let round_id = round_id.into();
        for handle in handles.iter_mut() {
            handle.conn_mut().flush_snapshot().await?;
            handle.apply_round_flags(Some(&round_id));
        }
        self.round_id = Some(round_id);
        self.stage = Stage::Cursory;
        Ok(())
    }

    /// `finalize()` (pre-commit). Repeatedly run pre-commit callbacks on
    /// every writer handle until a full pass adds no new work (fixpoint),
    /// required because a callback on one handle may queue callbacks on
    /// another. Suppresses post-commit callback execution on every handle
    /// on success.
    pub async fn finalize(&mut self, handles: &mut [Handle]) -> Result<(), Error> {
        self.expect_stage(Stage::Cursory)?;
        self.stage = Stage::Error;

        loop {
            let mut ran_any = false;
            for handle in handles.iter_mut() {
                let ran = handle.conn_mut().run_precommit_callbacks().await?;
                ran_any |= ran > 0;
            }
            if !ran_any {
                break;
            }
        }

        for handle in handles.iter_mut() {
            handle.conn_mut().set_post_commit_callbacks_suppressed(true);
        }

        self.stage = Stage::Finalized;
        Ok(())
    }

    /// `approve()`. Rejects if an explicit atomic section is open on any
    /// writer handle; checks each handle's estimated write duration against
    /// `max_write_duration`; pings handles with pending writes or session
    /// locks to detect silently dropped connections before commit.
    pub async fn approve(
        &mut self,
        handles: &mut [Handle],
        max_write_duration: Option<Duration>,
    ) -> Result<(), Error> {
        self.expect_stage(Stage::Finalized)?;
        self.stage = Stage::Error;
        self.max_write_duration = max_write_duration;

        for handle in handles.iter_mut() {
            if handle.conn().atomic_section_open() {
                return Err(Error::AtomicSectionOpen);
            }

            let estimated = handle.conn().estimate_write_duration();
            if let Some(budget) = max_write_duration {
                if estimated > budget {
                    return Err(Error::WriteDurationBudgetExceeded { budget, estimated });
                }
            }

            if handle.conn().write_pending() || handle.conn().session_locks_held() {
                handle.conn_mut().ping().await.map_err(Error::ApprovePingFailed)?;
            }
        }

        self.stage = Stage::Approved;
        Ok(())
    }

    /// `commit()`. Commits every writer handle with "flushing all peers"
    /// set; accumulates failures into a single aggregate error if any
    /// occur. On success, undoes round flags and transitions to
    /// `CommitCallbacks`.
    pub async fn commit(&mut self, handles: &mut [Handle]) -> Result<(), Error> {
        self.expect_stage(Stage::Approved)?;
        self.stage = Stage::Error;

        let mut failures = Vec::new();
        for handle in handles.iter_mut() {
            if let Err(e) = handle.conn_mut().commit(true).await {
                failures.push(format!("server {}: {e}", handle.server_index()));
            }
        }

        if !failures.is_empty() {
            error!(round_id = ?self.round_id, failures = failures.len(), "round commit aggregate failure");
            return Err(Error::CommitAggregate {
                failures: failures.len(),
                total: handles.len(),
                diagnostic: failures.join("; "),
            });
        }

        for handle in handles.iter_mut() {
            handle.undo_round_flags();
        }

        self.stage = Stage::CommitCallbacks;
        Ok(())
    }

    /// `rollback()`. Unconditionally rolls back every writer handle with
    /// "flushing all peers" set, undoes round flags, and transitions to
    /// `RollbackCallbacks`. Callable from any stage, including `Error` --
    /// exactly one of commit/rollback recovers the round from `Error`.
    pub async fn rollback(&mut self, handles: &mut [Handle]) -> Result<(), Error> {
        self.stage = Stage::Error;

        for handle in handles.iter_mut() {
            if let Err(e) = handle.conn_mut().rollback(true).await {
                warn!(server_index = handle.server_index(), error = %e, "rollback failed on writer handle");
            }
            handle.undo_round_flags();
        }

        self.stage = Stage::RollbackCallbacks;
        Ok(())
    }

    /// `runIdleCallbacks()`. Re-enables post-commit callback execution, then
    /// loops: for each writer handle with no open transaction, run pending
    /// idle callbacks; after each pass, commit (flushing all peers) any
    /// handle whose callbacks opened a new empty transaction. Continues
    /// until a full pass executes zero callbacks. Accumulates callback
    /// errors but returns only the first; finally runs transaction-listener
    /// callbacks, accumulated the same way.
    pub async fn run_idle_callbacks(&mut self, handles: &mut [Handle]) -> Result<(), Error> {
        self.expect_any(&[Stage::CommitCallbacks, Stage::RollbackCallbacks])?;

        for handle in handles.iter_mut() {
            handle.conn_mut().set_post_commit_callbacks_suppressed(false);
        }

        let mut first_error = None;
        loop {
            let mut ran_any = false;
            for handle in handles.iter_mut() {
                if handle.conn().in_transaction() {
                    continue;
                }
                match handle.conn_mut().run_idle_callbacks().await {
                    Ok(ran) => ran_any |= ran > 0,
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
                if handle.conn().in_transaction() && !handle.conn().write_pending() {
                    if let Err(e) = handle.conn_mut().commit(true).await {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
            if !ran_any {
                break;
            }
        }

        for handle in handles.iter_mut() {
            if let Err(e) = handle.conn_mut().run_transaction_listener_callbacks().await {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        self.stage = Stage::Cursory;
        self.round_id = None;
        self.max_write_duration = None;

        if let Some(e) = first_error {
            return Err(Error::Driver(e));
        }
        Ok(())
    }

    fn expect_any(&self, allowed: &[Stage]) -> Result<(), Error> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(Error::WrongStage {
                expected: allowed[0],
                actual: self.stage,
            })
        }
    }

    /// Invariant 4: `true` during `Finalized..CommitCallbacks`.
    pub fn suppresses_post_commit_callbacks(&self) -> bool {
        matches!(
            self.stage,
            Stage::Finalized | Stage::Approved | Stage::CommitCallbacks
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pool::Handle as PoolHandle;
    use crate::test_support::writer_handle_with;

    fn writer_handle(id: u64) -> PoolHandle {
        writer_handle_with(id, |_| {})
    }

    #[tokio::test]
    async fn test_full_round_commit_success() {
        let mut round = RoundCoordinator::new();
        let mut handles = vec![writer_handle(1), writer_handle(2)];

        round.begin("r1", &mut handles).await.unwrap();
        assert_eq!(round.stage(), Stage::Cursory);
        assert_eq!(round.round_id(), Some("r1"));

        round.finalize(&mut handles).await.unwrap();
        assert_eq!(round.stage(), Stage::Finalized);
        assert!(round.suppresses_post_commit_callbacks());

        round.approve(&mut handles, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(round.stage(), Stage::Approved);

        round.commit(&mut handles).await.unwrap();
        assert_eq!(round.stage(), Stage::CommitCallbacks);

        round.run_idle_callbacks(&mut handles).await.unwrap();
        assert_eq!(round.stage(), Stage::Cursory);
        assert!(round.round_id().is_none());
    }

    #[tokio::test]
    async fn test_write_duration_budget_exceeded_then_rollback() {
        let mut round = RoundCoordinator::new();
        let mut handles = vec![writer_handle_with(1, |db| {
            db.write_duration = Duration::from_secs(7);
        })];

        round.begin("r1", &mut handles).await.unwrap();
        round.finalize(&mut handles).await.unwrap();

        let err = round
            .approve(&mut handles, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WriteDurationBudgetExceeded { .. }));
        assert_eq!(round.stage(), Stage::Error);

        round.rollback(&mut handles).await.unwrap();
        assert_eq!(round.stage(), Stage::RollbackCallbacks);
    }

    #[tokio::test]
    async fn test_double_begin_rejected() {
        let mut round = RoundCoordinator::new();
        let mut handles = vec![writer_handle(1)];
        round.begin("r1", &mut handles).await.unwrap();
        round.stage = Stage::Cursory;
        let err = round.begin("r2", &mut handles).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyBegun));
    }

    #[tokio::test]
    async fn test_wrong_stage_rejected() {
        let mut round = RoundCoordinator::new();
        let mut handles = vec![writer_handle(1)];
        let err = round.approve(&mut handles, None).await.unwrap_err();
        assert!(matches!(err, Error::WrongStage { .. }));
    }

    #[tokio::test]
    async fn test_commit_aggregate_error_on_partial_failure() {
        let mut round = RoundCoordinator::new();
        let mut handles = vec![
            writer_handle(1),
            writer_handle_with(2, |db| db.fail_commit = true),
        ];

        round.begin("r1", &mut handles).await.unwrap();
        round.finalize(&mut handles).await.unwrap();
        round.approve(&mut handles, None).await.unwrap();
        let err = round.commit(&mut handles).await.unwrap_err();
        assert!(matches!(err, Error::CommitAggregate { failures: 1, total: 2, .. }));
        assert_eq!(round.stage(), Stage::Error);
    }
}
