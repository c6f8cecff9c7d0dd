//! Per-job outcome report printed at the end of every run.

use std::time::Duration;

use colored::Colorize;
use serde::Serialize;

use crate::error::ScenarioError;
use crate::job::{Job, JobOutcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub label: String,
    pub outcome: JobOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl JobReport {
    pub fn from_job(job: &Job) -> Self {
        Self {
            label: job.label().to_string(),
            outcome: job.current_outcome(),
            duration_ms: job.duration().map(|d| d.as_millis() as u64),
            failures: job.failures(),
        }
    }
}

/// Outcome of every job, in creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleReport {
    pub jobs: Vec<JobReport>,
}

impl ScheduleReport {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        Self {
            jobs: jobs.iter().map(JobReport::from_job).collect(),
        }
    }

    pub fn outcome_of(&self, label: &str) -> Option<JobOutcome> {
        self.jobs
            .iter()
            .find(|j| j.label == label)
            .map(|j| j.outcome)
    }

    /// `(label, outcome)` pairs in creation order.
    pub fn outcomes(&self) -> Vec<(String, JobOutcome)> {
        self.jobs
            .iter()
            .map(|j| (j.label.clone(), j.outcome))
            .collect()
    }

    /// Labels of jobs that did not succeed. Skipped jobs count.
    pub fn failed_labels(&self) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|j| j.outcome != JobOutcome::Succeeded)
            .map(|j| j.label.clone())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed_labels().is_empty()
    }

    pub fn ensure_success(&self) -> Result<(), ScenarioError> {
        let failed = self.failed_labels();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ScenarioError::JobsFailed { failed })
        }
    }

    /// Width of the label column: the longest label, at least the header.
    fn label_width(&self) -> usize {
        self.jobs
            .iter()
            .map(|j| j.label.len())
            .max()
            .unwrap_or(0)
            .max("JOB".len())
    }

    /// Plain aligned table.
    pub fn render(&self) -> String {
        let width = self.label_width();
        let mut out = format!("{:<width$}  {:<9}  DURATION\n", "JOB", "OUTCOME");
        for job in &self.jobs {
            out.push_str(&format!(
                "{:<width$}  {:<9}  {}\n",
                job.label,
                job.outcome.as_str(),
                format_duration(job.duration_ms)
            ));
        }
        out
    }

    pub fn print(&self) {
        let width = self.label_width();
        println!("\n{}", "═".repeat(width + 30));
        println!("{}", "JOB OUTCOMES".bold());
        println!("{}", "═".repeat(width + 30));
        for job in &self.jobs {
            let outcome = format!("{:<9}", job.outcome.as_str());
            let outcome = match job.outcome {
                JobOutcome::Succeeded => outcome.green(),
                JobOutcome::Failed => outcome.red(),
                JobOutcome::Skipped => outcome.yellow(),
                JobOutcome::Pending => outcome.dimmed(),
            };
            println!(
                "{:<width$}  {}  {}",
                job.label,
                outcome,
                format_duration(job.duration_ms)
            );
            for failure in &job.failures {
                println!("{:<width$}    {}", "", failure.red());
            }
        }
        println!("{}", "═".repeat(width + 30));
    }
}

fn format_duration(ms: Option<u64>) -> String {
    match ms {
        Some(ms) => format!("{:.2}s", Duration::from_millis(ms).as_secs_f64()),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(label: &str, outcome: JobOutcome) -> JobReport {
        JobReport {
            label: label.to_string(),
            outcome,
            duration_ms: None,
            failures: Vec::new(),
        }
    }

    #[test]
    fn test_skipped_counts_as_failure() {
        let report = ScheduleReport {
            jobs: vec![
                row("a", JobOutcome::Succeeded),
                row("b", JobOutcome::Skipped),
            ],
        };
        assert!(!report.is_success());
        assert_eq!(report.failed_labels(), vec!["b".to_string()]);
        assert!(matches!(
            report.ensure_success(),
            Err(ScenarioError::JobsFailed { .. })
        ));
    }

    #[test]
    fn test_label_column_fits_header_and_longest_label() {
        assert_eq!(ScheduleReport::default().label_width(), 3);
        let short = ScheduleReport {
            jobs: vec![row("a", JobOutcome::Succeeded)],
        };
        assert_eq!(short.label_width(), 3);
        let long = ScheduleReport {
            jobs: vec![row("a", JobOutcome::Succeeded), row("tip-ordering", JobOutcome::Pending)],
        };
        assert_eq!(long.label_width(), "tip-ordering".len());
        let empty = ScheduleReport::default().render();
        assert_eq!(empty, "JOB  OUTCOME    DURATION\n");
    }

    #[test]
    fn test_render_aligns_columns() {
        let mut long = row("create-members", JobOutcome::Succeeded);
        long.duration_ms = Some(1500);
        let report = ScheduleReport {
            jobs: vec![long, row("b", JobOutcome::Failed)],
        };
        let table = report.render();
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines[0], "JOB             OUTCOME    DURATION");
        assert_eq!(lines[1], "create-members  Succeeded  1.50s");
        assert_eq!(lines[2], "b               Failed     -");
    }
}
