//! Completion polling ("wait") shared by every long-running module command.
//!
//! A module is considered done with an action once its reported state differs from
//! the busy state the action started. The poller re-queries status every check
//! period until that happens or the execution budget runs out:
//!
//! ```text
//!   awaiting ──(state unchanged, budget left)──> sleep, re-query
//!      │
//!      ├─ state changed to IDLE, no fault flags ──> NoError
//!      ├─ state changed to IDLE, fault flags    ──> ExecutionError
//!      ├─ state changed to anything else        ──> ExecutionError
//!      └─ budget exhausted                      ──> TimeoutError
//! ```
//!
//! The budget is `exe_timeout / check_period` counted as a float, so a fractional
//! remainder becomes a shorter final sleep. A zero period or timeout still yields
//! exactly one status query.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{trace, warn};

use super::{ReturnCode, IDLE_STATE};
use crate::error::AppResult;

/// A status snapshot the poller can judge.
pub trait PolledStatus: Debug + Send {
    /// Module state; [`IDLE_STATE`] when nothing is running.
    fn state(&self) -> u8;

    /// True if a module-specific error bit is set.
    fn has_fault(&self) -> bool;
}

/// Anything that can be asked for a fresh status snapshot.
#[async_trait]
pub trait StatusSource: Sync {
    /// Snapshot type returned by [`StatusSource::query_status`].
    type Status: PolledStatus;

    /// Queries the module once.
    async fn query_status(&self) -> AppResult<Self::Status>;
}

/// Outcome of a wait, with the last status seen (if any query was made).
#[derive(Debug)]
pub struct Completion<S> {
    /// How the wait ended.
    pub code: ReturnCode,
    /// Last snapshot queried.
    pub status: Option<S>,
}

/// Polling parameters for one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPoller {
    exe_timeout: Duration,
    check_period: Duration,
}

impl CommandPoller {
    /// Poller allowing `exe_timeout` for an action, checking every `check_period`.
    pub const fn new(exe_timeout: Duration, check_period: Duration) -> Self {
        Self {
            exe_timeout,
            check_period,
        }
    }

    /// Time a started action may take.
    pub fn exe_timeout(&self) -> Duration {
        self.exe_timeout
    }

    /// Spacing between status queries.
    pub fn check_period(&self) -> Duration {
        self.check_period
    }

    /// Number of status checks `timeout` allows, as a float countdown.
    fn budget(&self, timeout: Duration) -> f64 {
        if self.check_period.is_zero() {
            return 1.0;
        }
        let budget = timeout.as_nanos() as f64 / self.check_period.as_nanos() as f64;
        if budget > 0.0 {
            budget
        } else {
            1.0
        }
    }

    /// Sleeps for the share of a check period the remaining budget allows.
    async fn pause(&self, budget: f64) {
        if budget > 0.0 && !self.check_period.is_zero() {
            tokio::time::sleep(self.check_period.mul_f64(budget.min(1.0))).await;
        }
    }

    /// Waits for `source` to leave the `awaiting` state.
    pub async fn wait<S>(&self, source: &S, awaiting: u8) -> AppResult<Completion<S::Status>>
    where
        S: StatusSource + ?Sized,
    {
        let mut budget = self.budget(self.exe_timeout);
        let mut last = None;
        let mut changed = false;

        while budget > 0.0 {
            let status = source.query_status().await?;
            trace!(state = status.state(), awaiting, budget, "poll");
            let state = status.state();
            last = Some(status);
            if state != awaiting {
                changed = true;
                break;
            }
            budget -= 1.0;
            self.pause(budget).await;
        }

        let code = match &last {
            _ if !changed => {
                warn!(awaiting, timeout = ?self.exe_timeout, status = ?last, "command timed out");
                ReturnCode::TimeoutError
            }
            Some(status) if status.state() != IDLE_STATE => {
                warn!(status = ?status, "module stopped in a non-idle state");
                ReturnCode::ExecutionError
            }
            Some(status) if status.has_fault() => {
                warn!(status = ?status, "module reported a fault");
                ReturnCode::ExecutionError
            }
            _ => ReturnCode::NoError,
        };

        Ok(Completion { code, status: last })
    }

    /// Re-queries `source` every check period until `done` holds or `timeout` passes.
    ///
    /// Returns `NoError` as soon as a snapshot satisfies `done`, `TimeoutError` when
    /// the budget is spent.
    pub async fn until<S, F>(
        &self,
        source: &S,
        timeout: Duration,
        mut done: F,
    ) -> AppResult<Completion<S::Status>>
    where
        S: StatusSource + ?Sized,
        F: FnMut(&S::Status) -> bool + Send,
    {
        let mut budget = self.budget(timeout);
        loop {
            let status = source.query_status().await?;
            if done(&status) {
                return Ok(Completion {
                    code: ReturnCode::NoError,
                    status: Some(status),
                });
            }
            budget -= 1.0;
            if budget <= 0.0 {
                warn!(timeout = ?timeout, status = ?status, "condition not reached");
                return Ok(Completion {
                    code: ReturnCode::TimeoutError,
                    status: Some(status),
                });
            }
            self.pause(budget).await;
        }
    }
}
