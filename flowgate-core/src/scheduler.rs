//! Job graph scheduler.
//!
//! Jobs are declared up front, wired with `requires`/`after`, then started all
//! at once by [`Scheduler::run`]. Each job waits on its dependencies' outcome
//! futures directly; there is no central dispatch loop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tracing::{error, info};

use crate::context::Context;
use crate::error::UsageError;
use crate::job::{DependencyGraph, Flow, Job, SharedGraph};
use crate::report::ScheduleReport;
use crate::resources::ResourceManager;

#[derive(Debug, Default)]
pub struct Scheduler {
    graph: SharedGraph,
    jobs: Vec<Job>,
    labels: HashSet<String>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            graph: Arc::new(Mutex::new(DependencyGraph::default())),
            jobs: Vec::new(),
            labels: HashSet::new(),
        }
    }

    /// Declare a job. Labels must be unique within the scheduler.
    pub fn create_job(&mut self, label: impl Into<String>, flows: Vec<Flow>) -> Result<Job, UsageError> {
        let label = label.into();
        if !self.labels.insert(label.clone()) {
            return Err(UsageError::DuplicateJob { job: label });
        }
        let job = Job::new(label, flows, self.graph.clone());
        self.jobs.push(job.clone());
        Ok(job)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Lock every job, start them all concurrently and wait for every
    /// outcome. Returns the per-job report; a failing job never stops the
    /// others from resolving.
    pub async fn run(&self, ctx: Context, resources: ResourceManager) -> Result<ScheduleReport, UsageError> {
        for job in &self.jobs {
            job.lock()?;
        }
        info!(jobs = self.jobs.len(), "scheduling jobs");

        let handles: Vec<_> = self
            .jobs
            .iter()
            .map(|job| tokio::spawn(job.clone().run(ctx.clone(), resources.clone())))
            .collect();

        for (job, joined) in self.jobs.iter().zip(join_all(handles).await) {
            if let Err(join_error) = joined {
                error!(job = job.label(), %join_error, "job task aborted");
                job.fail_unresolved(format!("job task aborted: {join_error}"));
            }
        }

        Ok(ScheduleReport::from_jobs(&self.jobs))
    }
}
