use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::crawler::task::{Task, TaskStatus};

const SNAPSHOT_VERSION: u32 = 1;

/// Tasks still queued when the orchestrator stopped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

impl QueueSnapshot {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            tasks,
        }
    }

    /// Write atomically: a temporary file renamed over the target.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }

        let json = serde_json::to_vec_pretty(self).context("Failed to serialize snapshot")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .await
            .context(format!("Failed to write snapshot: {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .context(format!("Failed to move snapshot into place: {}", path.display()))?;

        info!("Saved {} queued tasks to {}", self.tasks.len(), path.display());
        Ok(())
    }

    /// Load a snapshot. A missing file is not an error.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}", path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(e).context(format!("Failed to read snapshot: {}", path.display()))
            }
        };

        let snapshot: QueueSnapshot = serde_json::from_slice(&bytes)
            .context(format!("Failed to parse snapshot: {}", path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "Unsupported snapshot version {} in {}",
                snapshot.version,
                path.display()
            );
        }
        Ok(Some(snapshot))
    }

    /// Tasks ready to be enqueued again. They restart as pending and keep
    /// their attempt count; finished tasks are skipped.
    pub fn into_pending_tasks(self) -> Vec<Task> {
        self.tasks
            .into_iter()
            .filter(|task| !task.is_terminal())
            .map(|mut task| {
                task.status = TaskStatus::Pending;
                task.queued_at = None;
                task.started_at = None;
                task.worker_id = None;
                task
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::TaskType;

    #[tokio::test]
    async fn test_save_then_load_restores_pending_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("queue.json");

        let mut queued = Task::new("https://example.com/a", TaskType::Visit).unwrap();
        queued.transition(TaskStatus::Queued).unwrap();
        queued.attempt = 2;
        let mut done = Task::new("https://example.com/b", TaskType::Visit).unwrap();
        done.transition(TaskStatus::Cancelled).unwrap();

        QueueSnapshot::new(vec![queued.clone(), done]).save(&path).await.unwrap();
        let restored = QueueSnapshot::load(&path)
            .await
            .unwrap()
            .unwrap()
            .into_pending_tasks();

        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, queued.id);
        assert_eq!(restored[0].status, TaskStatus::Pending);
        assert_eq!(restored[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_none_and_garbage_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        assert!(QueueSnapshot::load(&path).await.unwrap().is_none());

        fs::write(&path, b"not json").await.unwrap();
        assert!(QueueSnapshot::load(&path).await.is_err());
    }
}
