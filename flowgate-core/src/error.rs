//! Error taxonomy for scenario orchestration.
//!
//! Four families, each with a different propagation rule:
//!
//! - [`UsageError`]: programming mistakes in scenario authoring. Returned
//!   immediately, never contained.
//! - [`AssertionFailure`]: the backend behaved unexpectedly. Contained on the
//!   fixture that raised it and surfaced as a flow failure.
//! - [`LockTimeout`] / [`ConvergenceTimeout`]: contained, reported with the
//!   resource or condition name.
//! - Infrastructure errors: plain `anyhow::Error` from collaborators. They
//!   abort the enclosing flow.

use std::time::Duration;

use thiserror::Error;

use crate::resources::Resource;

/// Mistakes in how a scenario uses the orchestration API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("job '{job}' cannot depend on itself")]
    SelfDependency { job: String },

    #[error("dependency '{job}' -> '{dependency}' would create a cycle")]
    CyclicDependency { job: String, dependency: String },

    #[error("job '{job}' is locked: dependencies cannot change once scheduling started")]
    JobLocked { job: String },

    #[error("job '{job}' was already scheduled")]
    AlreadyScheduled { job: String },

    #[error("a job labelled '{job}' already exists")]
    DuplicateJob { job: String },

    #[error("job '{job}' belongs to a different scheduler")]
    ForeignJob { job: String },

    #[error("fixture '{fixture}' was already run")]
    FixtureAlreadyRun { fixture: String },

    #[error("fixture '{fixture}': checked execution result before running")]
    NotExecuted { fixture: String },

    #[error("tip step {step} overflows for {count} ordered actions")]
    TipOverflow { count: usize, step: u64 },
}

/// An assertion about backend behaviour that did not hold.
///
/// Fixtures return this through `anyhow` (`Err(AssertionFailure::new(..).into())`
/// or [`crate::ensure_that!`]); the fixture runner recognises it by downcast and
/// captures it instead of propagating.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("assertion failed: {message}")]
pub struct AssertionFailure {
    pub message: String,
}

impl AssertionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Resource acquisition did not succeed within the allowed time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("timed out after {waited:?} waiting for resource lock '{resource}'")]
pub struct LockTimeout {
    pub resource: Resource,
    pub waited: Duration,
}

/// A read-side condition never became true within the poll budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("condition '{condition}' did not converge after {attempts} attempts (last error: {last_error})")]
pub struct ConvergenceTimeout {
    pub condition: String,
    pub attempts: u32,
    pub last_error: String,
}

/// Scenario-level failures, decided by the scenario runner.
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("scenario failed: {} job(s) did not succeed: {}", failed.len(), failed.join(", "))]
    JobsFailed { failed: Vec<String> },

    #[error("scenario interrupted")]
    Interrupted,

    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error("snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Return a contained [`AssertionFailure`] from the enclosing function when
/// the condition does not hold.
#[macro_export]
macro_rules! ensure_that {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::AssertionFailure::new(format!($($arg)+)).into());
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(value: u32) -> anyhow::Result<()> {
        crate::ensure_that!(value == 2, "expected 2, got {}", value);
        Ok(())
    }

    #[test]
    fn test_ensure_that_produces_downcastable_failure() {
        assert!(check(2).is_ok());
        let err = check(3).unwrap_err();
        let failure = err.downcast_ref::<AssertionFailure>().unwrap();
        assert_eq!(failure.message, "expected 2, got 3");
    }

    #[test]
    fn test_jobs_failed_message_lists_labels() {
        let err = ScenarioError::JobsFailed {
            failed: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "scenario failed: 2 job(s) did not succeed: a, b"
        );
    }
}
