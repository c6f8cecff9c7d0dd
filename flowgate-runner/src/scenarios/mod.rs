//! Built-in scenarios runnable against the in-memory chain.

mod expected_rejection;
mod failure_demo;
mod smoke;

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use serde_json::{json, Value};

use flowgate_core::{ensure_that, ConvergenceCheck, InclusionResult, ScenarioBuilder, UsageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioKind {
    /// Accounts, capped proposals under lock contention, tip ordering
    Smoke,
    /// A failing job: its `requires` dependent is skipped, its `after` dependent runs
    FailureDemo,
    /// Fixtures that expect named dispatch errors
    ExpectedRejection,
}

impl ScenarioKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smoke => "smoke",
            Self::FailureDemo => "failure-demo",
            Self::ExpectedRejection => "expected-rejection",
        }
    }

    /// Declare this scenario's jobs on `s`.
    pub fn define(&self, s: &mut ScenarioBuilder<'_>) -> Result<(), UsageError> {
        match self {
            Self::Smoke => smoke::define(s),
            Self::FailureDemo => failure_demo::define(s),
            Self::ExpectedRejection => expected_rejection::define(s),
        }
    }
}

impl std::fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Id of the proposal created by the first result.
pub(crate) fn created_proposal_id(results: &[InclusionResult]) -> Result<u64> {
    results
        .first()
        .and_then(|r| r.find_event("proposals", "ProposalCreated"))
        .and_then(|e| e.data["id"].as_u64())
        .ok_or_else(|| anyhow!("no ProposalCreated event in inclusion result"))
}

/// Wait until the indexer reports proposal `id` with `status`.
pub(crate) fn proposal_status_check(id: u64, status: &'static str) -> ConvergenceCheck {
    ConvergenceCheck::new(
        format!("proposal {id} {status}"),
        "proposal",
        json!({ "id": id }),
        move |indexed: &Value, _: &[InclusionResult]| {
            ensure_that!(
                indexed["status"] == status,
                "proposal {} indexed as {}, expected {}",
                id,
                indexed["status"],
                status
            );
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use flowgate_core::{HarnessConfig, JobOutcome, MemoryChain, PollConfig, ScenarioRunner};

    async fn run(kind: ScenarioKind) -> flowgate_core::ScenarioOutcome {
        let dir = tempfile::tempdir().unwrap();
        let env = HarnessConfig {
            lock_poll_interval: Duration::from_secs(1),
            query_poll: PollConfig::new(Duration::from_secs(3), 10),
            output_path: dir.path().join("output.json"),
            ..HarnessConfig::default()
        };
        let chain = Arc::new(MemoryChain::new());
        ScenarioRunner::new(kind.as_str(), chain.clone(), chain, env)
            .quiet()
            .run_until(|s| kind.define(s), std::future::pending())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_smoke_succeeds() {
        let outcome = run(ScenarioKind::Smoke).await;
        assert!(outcome.is_success(), "{}", outcome.report.render());
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_demo_outcomes() {
        let outcome = run(ScenarioKind::FailureDemo).await;
        assert_eq!(outcome.report.outcome_of("a"), Some(JobOutcome::Failed));
        assert_eq!(outcome.report.outcome_of("b"), Some(JobOutcome::Skipped));
        assert_eq!(outcome.report.outcome_of("c"), Some(JobOutcome::Succeeded));
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expected_rejection_succeeds() {
        let outcome = run(ScenarioKind::ExpectedRejection).await;
        assert!(outcome.is_success(), "{}", outcome.report.render());
    }

    #[test]
    fn test_created_proposal_id_requires_event() {
        assert!(created_proposal_id(&[]).is_err());
    }
}
