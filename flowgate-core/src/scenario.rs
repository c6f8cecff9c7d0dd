//! Scenario runner: wires the shared context, resource manager and scheduler,
//! runs the job graph and persists the output snapshot on the way out.
//!
//! A scenario definition only declares jobs and their dependencies; nothing
//! touches the backend until the scheduler starts.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::accounts::KeyRegistry;
use crate::backend::{Backend, QueryClient};
use crate::config::HarnessConfig;
use crate::context::Context;
use crate::error::{ScenarioError, UsageError};
use crate::job::{Flow, Job};
use crate::report::ScheduleReport;
use crate::resources::ResourceManager;
use crate::scheduler::Scheduler;
use crate::snapshot::{OutputSnapshot, SnapshotWriter};

/// Handed to the scenario definition to declare the job graph.
pub struct ScenarioBuilder<'a> {
    scheduler: &'a mut Scheduler,
    ctx: &'a Context,
}

impl ScenarioBuilder<'_> {
    pub fn job(&mut self, label: impl Into<String>, flows: Vec<Flow>) -> Result<Job, UsageError> {
        self.scheduler.create_job(label, flows)
    }

    pub fn env(&self) -> &HarnessConfig {
        &self.ctx.env
    }

    pub fn context(&self) -> &Context {
        self.ctx
    }
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Completed,
    Interrupted,
    InvalidDefinition,
}

/// Result of one scenario run.
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub report: ScheduleReport,
    pub snapshot: OutputSnapshot,
}

impl ScenarioOutcome {
    pub fn is_success(&self) -> bool {
        self.snapshot.success
    }

    /// 0 on full success, 130 when interrupted, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.snapshot.interrupted {
            130
        } else if self.snapshot.success {
            0
        } else {
            1
        }
    }

    pub fn ensure_success(&self) -> Result<(), ScenarioError> {
        if self.snapshot.interrupted {
            return Err(ScenarioError::Interrupted);
        }
        self.report.ensure_success()
    }
}

pub struct ScenarioRunner {
    name: String,
    backend: Arc<dyn Backend>,
    query: Arc<dyn QueryClient>,
    env: Arc<HarnessConfig>,
    print_report: bool,
}

impl ScenarioRunner {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        query: Arc<dyn QueryClient>,
        env: HarnessConfig,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            query,
            env: Arc::new(env),
            print_report: true,
        }
    }

    /// Skip printing the outcome table (it is still returned).
    pub fn quiet(mut self) -> Self {
        self.print_report = false;
        self
    }

    /// Run the scenario, treating Ctrl-C as an interrupt.
    pub async fn run<D>(self, define: D) -> Result<ScenarioOutcome, ScenarioError>
    where
        D: FnOnce(&mut ScenarioBuilder<'_>) -> Result<(), UsageError>,
    {
        self.run_until(define, async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("could not install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run the scenario until it completes or `shutdown` resolves.
    ///
    /// The snapshot is written in both cases. Definition errors are returned
    /// after the snapshot is written.
    pub async fn run_until<D, S>(self, define: D, shutdown: S) -> Result<ScenarioOutcome, ScenarioError>
    where
        D: FnOnce(&mut ScenarioBuilder<'_>) -> Result<(), UsageError>,
        S: Future<Output = ()>,
    {
        let writer = SnapshotWriter::new(self.env.output_path.clone());
        let start_key_id = self.start_key_id(&writer).await;
        let keys = KeyRegistry::new(self.env.key_uri_prefix.clone(), start_key_id);
        let ctx = Context::new(
            self.backend.clone(),
            self.query.clone(),
            self.env.clone(),
            keys.clone(),
        );
        let resources = ResourceManager::new(
            &self.env.resource_limits,
            self.env.lock_poll_interval,
            self.env.lock_timeout,
        );

        let mut scheduler = Scheduler::new();
        let defined = {
            let mut builder = ScenarioBuilder {
                scheduler: &mut scheduler,
                ctx: &ctx,
            };
            define(&mut builder)
        };
        if let Err(usage) = defined {
            error!(scenario = %self.name, %usage, "invalid scenario definition");
            self.finish(&writer, &keys, ScheduleReport::default(), Exit::InvalidDefinition)
                .await?;
            return Err(usage.into());
        }

        info!(scenario = %self.name, start_key_id, "running scenario");
        let (report, exit) = tokio::select! {
            report = scheduler.run(ctx, resources) => (report?, Exit::Completed),
            _ = shutdown => {
                warn!(scenario = %self.name, "interrupted, writing snapshot");
                (ScheduleReport::from_jobs(scheduler.jobs()), Exit::Interrupted)
            }
        };

        self.finish(&writer, &keys, report, exit).await
    }

    /// An unreadable previous snapshot falls back to `start_key_id` so the
    /// run still reaches `finish` and overwrites it.
    async fn start_key_id(&self, writer: &SnapshotWriter) -> u64 {
        if !self.env.reuse_keys {
            return self.env.start_key_id;
        }
        let previous = match writer.load().await {
            Ok(snapshot) => snapshot.map(|s| s.next_key_id).unwrap_or(0),
            Err(e) => {
                warn!(
                    path = %writer.path().display(),
                    error = %e,
                    "previous snapshot unreadable, starting from START_KEY_ID"
                );
                0
            }
        };
        previous.max(self.env.start_key_id)
    }

    /// Single exit point: print the report and persist the snapshot.
    ///
    /// On interrupt, flows still parked on the abandoned scheduler may draw
    /// keys after the snapshot is taken, so `next_key_id` is pushed forward by
    /// `interrupt_key_margin` to keep a reusing run clear of them.
    async fn finish(
        &self,
        writer: &SnapshotWriter,
        keys: &KeyRegistry,
        report: ScheduleReport,
        exit: Exit,
    ) -> Result<ScenarioOutcome, ScenarioError> {
        if self.print_report {
            report.print();
        }
        let next_key_id = match exit {
            Exit::Interrupted => keys
                .next_key_id()
                .saturating_add(self.env.interrupt_key_margin),
            _ => keys.next_key_id(),
        };
        let snapshot = OutputSnapshot {
            run_id: Uuid::now_v7(),
            scenario: self.name.clone(),
            next_key_id,
            success: exit == Exit::Completed && report.is_success(),
            interrupted: exit == Exit::Interrupted,
            job_outcomes: report.outcomes(),
            finished_at: Utc::now(),
        };
        writer.write(&snapshot).await?;
        Ok(ScenarioOutcome { report, snapshot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{flow, JobOutcome};
    use crate::memory::MemoryChain;
    use anyhow::anyhow;
    use std::time::Duration;

    fn runner(name: &str, env: HarnessConfig) -> ScenarioRunner {
        let chain = Arc::new(MemoryChain::new());
        ScenarioRunner::new(name, chain.clone(), chain, env).quiet()
    }

    fn env_in(dir: &tempfile::TempDir) -> HarnessConfig {
        HarnessConfig {
            output_path: dir.path().join("output.json"),
            ..HarnessConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_run_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = runner("ok", env_in(&dir))
            .run_until(
                |s| {
                    s.job(
                        "accounts",
                        vec![flow(|props| async move {
                            props.ctx.keys.create_accounts(3);
                            Ok(())
                        })],
                    )?;
                    Ok(())
                },
                std::future::pending(),
            )
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.snapshot.next_key_id, 3);
        let saved = SnapshotWriter::new(dir.path().join("output.json"))
            .load()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.next_key_id, 3);
        assert_eq!(
            saved.job_outcomes,
            vec![("accounts".to_string(), JobOutcome::Succeeded)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_keys_continues_from_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let define = |s: &mut ScenarioBuilder<'_>| -> Result<(), UsageError> {
            s.job(
                "one-account",
                vec![flow(|props| async move {
                    props.ctx.keys.create_account();
                    Ok(())
                })],
            )?;
            Ok(())
        };
        runner("first", env_in(&dir))
            .run_until(define, std::future::pending())
            .await
            .unwrap();

        let env = HarnessConfig {
            reuse_keys: true,
            ..env_in(&dir)
        };
        let second = runner("second", env)
            .run_until(define, std::future::pending())
            .await
            .unwrap();
        assert_eq!(second.snapshot.next_key_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_gives_exit_code_one() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = runner("fails", env_in(&dir))
            .run_until(
                |s| {
                    s.job("broken", vec![flow(|_| async { Err(anyhow!("no")) })])?;
                    Ok(())
                },
                std::future::pending(),
            )
            .await
            .unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.exit_code(), 1);
        assert!(matches!(
            outcome.ensure_success(),
            Err(ScenarioError::JobsFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_still_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = runner("interrupted", env_in(&dir))
            .run_until(
                |s| {
                    s.job(
                        "forever",
                        vec![flow(|_| async {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            Ok(())
                        })],
                    )?;
                    Ok(())
                },
                tokio::time::sleep(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code(), 130);
        assert_eq!(outcome.report.outcome_of("forever"), Some(JobOutcome::Pending));
        let saved = SnapshotWriter::new(dir.path().join("output.json"))
            .load()
            .await
            .unwrap()
            .unwrap();
        assert!(saved.interrupted);
        assert!(!saved.success);
        assert_eq!(saved.next_key_id, HarnessConfig::default().interrupt_key_margin);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_leaves_key_margin_past_detached_flows() {
        let dir = tempfile::tempdir().unwrap();
        let env = HarnessConfig {
            interrupt_key_margin: 50,
            ..env_in(&dir)
        };
        let outcome = runner("interrupted", env)
            .run_until(
                |s| {
                    s.job(
                        "slow-keys",
                        vec![flow(|props| async move {
                            props.ctx.keys.create_accounts(2);
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            props.ctx.keys.create_account();
                            Ok(())
                        })],
                    )?;
                    Ok(())
                },
                tokio::time::sleep(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code(), 130);
        assert_eq!(outcome.snapshot.next_key_id, 52);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_previous_snapshot_falls_back_to_start_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let env = HarnessConfig {
            reuse_keys: true,
            start_key_id: 7,
            ..env_in(&dir)
        };
        let outcome = runner("after-corrupt", env)
            .run_until(
                |s| {
                    s.job(
                        "two-accounts",
                        vec![flow(|props| async move {
                            props.ctx.keys.create_accounts(2);
                            Ok(())
                        })],
                    )?;
                    Ok(())
                },
                std::future::pending(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.snapshot.next_key_id, 9);
        let saved = SnapshotWriter::new(path).load().await.unwrap().unwrap();
        assert_eq!(saved.next_key_id, 9);
        assert!(saved.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_definition_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = runner("cyclic", env_in(&dir))
            .run_until(
                |s| {
                    let a = s.job("a", vec![])?;
                    let b = s.job("b", vec![])?;
                    a.requires(&b)?;
                    b.requires(&a)?;
                    Ok(())
                },
                std::future::pending(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScenarioError::Usage(UsageError::CyclicDependency { .. })
        ));
        assert!(dir.path().join("output.json").exists());
    }
}
