//! Output snapshot written once at scenario exit.
//!
//! Carries the bookkeeping a follow-up run needs (the next unused account
//! derivation index) plus the final job outcomes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ScenarioError;
use crate::job::JobOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSnapshot {
    pub run_id: Uuid,
    pub scenario: String,
    pub next_key_id: u64,
    pub success: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub job_outcomes: Vec<(String, JobOutcome)>,
    pub finished_at: DateTime<Utc>,
}

/// Writes [`OutputSnapshot`]s to a fixed path.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    path: PathBuf,
}

impl SnapshotWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot of a previous run, if one exists.
    pub async fn load(&self) -> Result<Option<OutputSnapshot>, ScenarioError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write(&self, snapshot: &OutputSnapshot) -> Result<(), ScenarioError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&self.path, json).await?;
        info!(path = %self.path.display(), next_key_id = snapshot.next_key_id, "snapshot written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("nested").join("output.json"));
        assert_eq!(writer.load().await.unwrap(), None);

        let snapshot = OutputSnapshot {
            run_id: Uuid::now_v7(),
            scenario: "smoke".to_string(),
            next_key_id: 17,
            success: false,
            interrupted: false,
            job_outcomes: vec![("a".to_string(), JobOutcome::Failed)],
            finished_at: Utc::now(),
        };
        writer.write(&snapshot).await.unwrap();
        assert_eq!(writer.load().await.unwrap(), Some(snapshot));

        let raw = std::fs::read_to_string(writer.path()).unwrap();
        assert!(raw.contains("\"nextKeyId\": 17"));
    }
}
