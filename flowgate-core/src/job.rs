//! Jobs: scheduling nodes wrapping one or more flows.
//!
//! A job carries two kinds of dependency edges. `requires` gates on the
//! dependency's success; `after` only orders behind its completion. Edges live
//! in a graph shared by every job of one scheduler, and an edge that would
//! close a cycle is rejected before anything changes.
//!
//! The outcome is a write-once value behind a `watch` channel: exactly one
//! resolution, any number of awaiting readers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::{join_all, BoxFuture};
use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, info_span, Instrument};

use crate::context::{Context, FlowProps};
use crate::error::UsageError;
use crate::resources::ResourceManager;

/// A flow: concurrent unit of test logic run inside a job.
pub type Flow = Arc<dyn Fn(FlowProps) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async function as a [`Flow`].
pub fn flow<F, Fut>(f: F) -> Flow
where
    F: Fn(FlowProps) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |props| Box::pin(f(props)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobOutcome {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

impl JobOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Skipped => "Skipped",
        }
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Gate on the dependency's success.
    Required,
    /// Gate on the dependency's completion, whatever the outcome.
    After,
}

/// Edges point from a job to the jobs it depends on.
#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    graph: DiGraphMap<usize, DependencyKind>,
}

impl DependencyGraph {
    pub(crate) fn add_node(&mut self) -> usize {
        let id = self.graph.node_count();
        self.graph.add_node(id);
        id
    }
}

pub(crate) type SharedGraph = Arc<Mutex<DependencyGraph>>;

struct JobInner {
    id: usize,
    label: String,
    flows: Vec<Flow>,
    graph: SharedGraph,
    required: Mutex<Vec<Job>>,
    after: Mutex<Vec<Job>>,
    locked: AtomicBool,
    outcome: watch::Sender<JobOutcome>,
    duration: Mutex<Option<Duration>>,
    failures: Mutex<Vec<String>>,
}

/// Handle to a scheduling node. Cheap to clone.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Job {
    pub(crate) fn new(label: String, flows: Vec<Flow>, graph: SharedGraph) -> Self {
        let id = guard(&graph).add_node();
        let (outcome, _) = watch::channel(JobOutcome::Pending);
        Self {
            inner: Arc::new(JobInner {
                id,
                label,
                flows,
                graph,
                required: Mutex::new(Vec::new()),
                after: Mutex::new(Vec::new()),
                locked: AtomicBool::new(false),
                outcome,
                duration: Mutex::new(None),
                failures: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn flow_count(&self) -> usize {
        self.inner.flows.len()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::Acquire)
    }

    /// Run only if `dependency` succeeds; otherwise this job is skipped.
    pub fn requires(&self, dependency: &Job) -> Result<&Self, UsageError> {
        self.add_dependency(dependency, DependencyKind::Required)?;
        Ok(self)
    }

    /// Run only after `dependency` finished, whatever its outcome.
    pub fn after(&self, dependency: &Job) -> Result<&Self, UsageError> {
        self.add_dependency(dependency, DependencyKind::After)?;
        Ok(self)
    }

    fn add_dependency(&self, dependency: &Job, kind: DependencyKind) -> Result<(), UsageError> {
        if self.is_locked() {
            return Err(UsageError::JobLocked {
                job: self.label().to_string(),
            });
        }
        if Arc::ptr_eq(&self.inner, &dependency.inner) {
            return Err(UsageError::SelfDependency {
                job: self.label().to_string(),
            });
        }
        if !Arc::ptr_eq(&self.inner.graph, &dependency.inner.graph) {
            return Err(UsageError::ForeignJob {
                job: dependency.label().to_string(),
            });
        }

        let mut graph = guard(&self.inner.graph);
        // self -> dependency closes a cycle iff dependency already reaches self.
        if has_path_connecting(&graph.graph, dependency.inner.id, self.inner.id, None) {
            return Err(UsageError::CyclicDependency {
                job: self.label().to_string(),
                dependency: dependency.label().to_string(),
            });
        }
        let edge_kind = match graph.graph.edge_weight(self.inner.id, dependency.inner.id) {
            Some(DependencyKind::Required) => DependencyKind::Required,
            _ => kind,
        };
        graph
            .graph
            .add_edge(self.inner.id, dependency.inner.id, edge_kind);
        drop(graph);

        let list = match kind {
            DependencyKind::Required => &self.inner.required,
            DependencyKind::After => &self.inner.after,
        };
        guard(list).push(dependency.clone());
        Ok(())
    }

    /// Freeze the dependency set. Fails if the job was already locked.
    pub fn lock(&self) -> Result<(), UsageError> {
        if self.inner.locked.swap(true, Ordering::AcqRel) {
            return Err(UsageError::AlreadyScheduled {
                job: self.label().to_string(),
            });
        }
        Ok(())
    }

    pub fn current_outcome(&self) -> JobOutcome {
        *self.inner.outcome.borrow()
    }

    /// Wait until the outcome is resolved.
    pub async fn outcome(&self) -> JobOutcome {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = match rx.wait_for(JobOutcome::is_terminal).await {
            Ok(outcome) => *outcome,
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.current_outcome(),
        };
        outcome
    }

    /// Resolve the outcome. Only the first resolution takes effect.
    fn resolve(&self, outcome: JobOutcome) -> bool {
        let resolved = self.inner.outcome.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = outcome;
                true
            }
        });
        if resolved {
            info!(job = self.label(), %outcome, "job resolved");
        }
        resolved
    }

    pub fn duration(&self) -> Option<Duration> {
        *guard(&self.inner.duration)
    }

    /// Error messages of the flows that failed.
    pub fn failures(&self) -> Vec<String> {
        guard(&self.inner.failures).clone()
    }

    pub fn required_jobs(&self) -> Vec<Job> {
        guard(&self.inner.required).clone()
    }

    pub fn after_jobs(&self) -> Vec<Job> {
        guard(&self.inner.after).clone()
    }

    /// Wait for dependencies, then run every flow concurrently and resolve.
    pub(crate) async fn run(self, ctx: Context, resources: ResourceManager) -> JobOutcome {
        let span = info_span!("job", job = %self.label());
        self.run_inner(ctx, resources).instrument(span).await
    }

    async fn run_inner(self, ctx: Context, resources: ResourceManager) -> JobOutcome {
        let required = self.required_jobs();
        let outcomes = join_all(required.iter().map(Job::outcome)).await;
        if let Some((dependency, outcome)) = required
            .iter()
            .zip(outcomes)
            .find(|(_, outcome)| *outcome != JobOutcome::Succeeded)
        {
            info!(
                dependency = dependency.label(),
                %outcome,
                "required dependency did not succeed, skipping"
            );
            self.resolve(JobOutcome::Skipped);
            return JobOutcome::Skipped;
        }

        join_all(self.after_jobs().iter().map(Job::outcome)).await;

        info!(flows = self.flow_count(), "job started");
        let started = Instant::now();
        let runs = self.inner.flows.iter().enumerate().map(|(index, flow)| {
            let label = format!("{}:flow-{index}", self.label());
            run_flow(label, flow.clone(), ctx.clone(), &resources)
        });
        let results = join_all(runs).await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err().map(|e| format!("{e:#}")))
            .collect();
        *guard(&self.inner.duration) = Some(started.elapsed());

        let outcome = if failures.is_empty() {
            JobOutcome::Succeeded
        } else {
            JobOutcome::Failed
        };
        *guard(&self.inner.failures) = failures;
        self.resolve(outcome);
        outcome
    }

    /// Resolve as failed if nothing resolved the job yet.
    pub(crate) fn fail_unresolved(&self, reason: String) {
        guard(&self.inner.failures).push(reason);
        self.resolve(JobOutcome::Failed);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("label", &self.inner.label)
            .field("outcome", &self.current_outcome())
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Run one flow on its own task with a locker scoped to it. The locker is
/// released whether the flow returns, fails or panics, and a failure never
/// cancels sibling flows.
fn run_flow(
    label: String,
    flow: Flow,
    ctx: Context,
    resources: &ResourceManager,
) -> impl Future<Output = Result<()>> {
    let locker = resources.locker(label.clone());
    let props = FlowProps {
        ctx,
        lock: locker.clone(),
        label: label.clone(),
    };
    let span = info_span!("flow", flow = %label);
    async move {
        let handle = tokio::spawn(flow(props).instrument(span));
        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(anyhow!("flow panicked: {join_error}")),
        };
        locker.release_all();
        if let Err(err) = &result {
            let message = format!("{err:#}");
            error!(flow = %label, error = %message, "flow failed");
        }
        result
    }
}
