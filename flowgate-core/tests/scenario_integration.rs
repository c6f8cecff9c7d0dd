//! End-to-end scenarios over the in-memory chain.
//!
//! These tests verify that:
//! 1. A contained assertion failure fails its job, skips `requires`
//!    dependents and leaves `after` dependents running
//! 2. The snapshot is written even when the scenario fails
//! 3. Proposal capacity is never oversubscribed under contention

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{json, Value};

use flowgate_core::{
    flow, ActionFixture, Backend, ConvergenceCheck, Context, FixtureRunner, HarnessConfig,
    InclusionResult, JobOutcome, KeyRegistry, MemoryChain, PollConfig, Resource, ResourceLimits,
    ResourceManager, ScenarioRunner, Scheduler, SignedAction, SnapshotWriter,
};

fn test_env(dir: &tempfile::TempDir) -> HarnessConfig {
    HarnessConfig {
        lock_poll_interval: Duration::from_secs(1),
        query_poll: PollConfig::new(Duration::from_secs(2), 20),
        output_path: dir.path().join("output.json"),
        ..HarnessConfig::default()
    }
}

fn created_id(results: &[InclusionResult]) -> anyhow::Result<Value> {
    results
        .first()
        .and_then(|r| r.find_event("proposals", "ProposalCreated"))
        .map(|e| e.data["id"].clone())
        .ok_or_else(|| anyhow!("no ProposalCreated event"))
}

#[tokio::test(start_paused = true)]
async fn test_failed_job_skips_requires_and_runs_after() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MemoryChain::new());
    let c_ran = Arc::new(AtomicUsize::new(0));
    let c_counter = c_ran.clone();

    let outcome = ScenarioRunner::new("e2e", chain.clone(), chain, test_env(&dir))
        .quiet()
        .run_until(
            |s| {
                let a = s.job(
                    "a",
                    vec![
                        flow(|props| async move {
                            let signer = props.ctx.keys.create_account();
                            let set = SignedAction::new(
                                signer,
                                "kv.set",
                                json!({ "key": "greeting", "value": "hello" }),
                            );
                            FixtureRunner::new(ActionFixture::new("set-greeting", vec![set]))
                                .run_and_verify(&props.ctx)
                                .await
                        }),
                        flow(|props| async move {
                            // nothing to remove: the chain rejects with KeyNotFound
                            let signer = props.ctx.keys.create_account();
                            let remove =
                                SignedAction::new(signer, "kv.remove", json!({ "key": "missing" }));
                            let mut runner =
                                FixtureRunner::new(ActionFixture::new("remove-missing", vec![remove]));
                            runner.run(&props.ctx).await?;
                            assert!(runner.did_fail()?);
                            runner.verify_convergence(&props.ctx).await
                        }),
                    ],
                )?;
                let b = s.job("b", vec![flow(|_| async { Ok(()) })])?;
                let c = s.job(
                    "c",
                    vec![flow(move |_| {
                        let counter = c_counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })],
                )?;
                b.requires(&a)?;
                c.after(&a)?;
                Ok(())
            },
            std::future::pending(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.report.outcome_of("a"), Some(JobOutcome::Failed));
    assert_eq!(outcome.report.outcome_of("b"), Some(JobOutcome::Skipped));
    assert_eq!(outcome.report.outcome_of("c"), Some(JobOutcome::Succeeded));
    assert_eq!(c_ran.load(Ordering::SeqCst), 1);
    assert_ne!(outcome.exit_code(), 0);

    let saved = SnapshotWriter::new(dir.path().join("output.json"))
        .load()
        .await
        .unwrap()
        .unwrap();
    assert!(!saved.success);
    assert_eq!(saved.next_key_id, 2);
    assert_eq!(saved.job_outcomes.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_proposal_capacity_is_never_oversubscribed() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MemoryChain::new());
    let env = Arc::new(test_env(&dir));
    let ctx = Context::new(chain.clone(), chain.clone(), env.clone(), KeyRegistry::new("//test", 0));
    let resources = ResourceManager::new(
        &ResourceLimits::default(),
        env.lock_poll_interval,
        env.lock_timeout,
    );

    let holding = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let proposer = {
        let holding = holding.clone();
        let peak = peak.clone();
        flow(move |props| {
            let holding = holding.clone();
            let peak = peak.clone();
            async move {
                let slot = props.lock.lock(Resource::Proposals).await?;
                let now = holding.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                let proposer = props.ctx.keys.create_account();
                let create = SignedAction::new(
                    proposer.clone(),
                    "proposal.create",
                    json!({ "title": props.label }),
                );
                let check = ConvergenceCheck::new(
                    "proposal indexed",
                    "events",
                    json!({ "section": "proposals", "method": "ProposalCreated" }),
                    |indexed, results| {
                        let id = created_id(results)?;
                        let found = indexed
                            .as_array()
                            .is_some_and(|events| events.iter().any(|e| e["data"]["id"] == id));
                        flowgate_core::ensure_that!(found, "proposal {} not indexed yet", id);
                        Ok(())
                    },
                );
                let mut create = FixtureRunner::new(
                    ActionFixture::new("create-proposal", vec![create]).with_convergence(check),
                );
                create.run_and_verify(&props.ctx).await?;

                let id = created_id(create.fixture().results())?;
                let finalize = SignedAction::new(proposer, "proposal.finalize", json!({ "id": id }));
                FixtureRunner::new(ActionFixture::new("finalize-proposal", vec![finalize]))
                    .run_and_verify(&props.ctx)
                    .await?;

                holding.fetch_sub(1, Ordering::SeqCst);
                slot.release();
                Ok(())
            }
        })
    };

    let mut scheduler = Scheduler::new();
    scheduler
        .create_job("proposals", (0..8).map(|_| proposer.clone()).collect())
        .unwrap();
    let report = scheduler.run(ctx, resources.clone()).await.unwrap();

    assert!(report.is_success(), "{}", report.render());
    assert!(peak.load(Ordering::SeqCst) <= 5);
    assert_eq!(resources.held(Resource::Proposals), 0);
    let executed = chain
        .all_events()
        .into_iter()
        .filter(|(_, e)| e.is("proposals", "ProposalExecuted"))
        .count();
    assert_eq!(executed, 8);
    assert_eq!(
        chain.read_state("proposals/active").await.unwrap(),
        Some(json!(0))
    );
}

#[tokio::test(start_paused = true)]
async fn test_lock_timeout_fails_only_the_waiting_flow() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MemoryChain::new());
    let env = HarnessConfig {
        lock_timeout: Duration::from_secs(10),
        ..test_env(&dir)
    };
    let outcome = ScenarioRunner::new("contended", chain.clone(), chain, env)
        .quiet()
        .run_until(
            |s| {
                s.job(
                    "election",
                    vec![
                        flow(|props| async move {
                            let _council = props.lock.lock(Resource::CouncilElection).await?;
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            Ok(())
                        }),
                        flow(|props| async move {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            props.lock.lock(Resource::CouncilElection).await?;
                            Ok(())
                        }),
                    ],
                )?;
                Ok(())
            },
            std::future::pending(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.report.outcome_of("election"), Some(JobOutcome::Failed));
    let failures = &outcome.report.jobs[0].failures;
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("council"), "{}", failures[0]);
}
