use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::crawler::task::{Task, TaskResult};

/// Destination for task results and screenshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutputWriter: Send + Sync {
    async fn write(&self, result: &TaskResult) -> Result<()>;

    /// Store a screenshot, returning where it was written
    async fn write_screenshot(&self, task: &Task, png: &[u8]) -> Result<String>;
}

/// Appends results to `results.jsonl` and stores screenshots as PNG files
/// under `screenshots/`.
pub struct JsonlOutputWriter {
    directory: PathBuf,
    /// Serializes appends so lines never interleave
    file_lock: Mutex<()>,
}

impl JsonlOutputWriter {
    pub async fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(directory.join("screenshots"))
            .await
            .context(format!("Failed to create output directory: {}", directory.display()))?;
        Ok(Self {
            directory,
            file_lock: Mutex::new(()),
        })
    }

    pub fn results_path(&self) -> PathBuf {
        self.directory.join("results.jsonl")
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[async_trait]
impl OutputWriter for JsonlOutputWriter {
    async fn write(&self, result: &TaskResult) -> Result<()> {
        let mut line = serde_json::to_string(result).context("Failed to serialize result")?;
        line.push('\n');

        let _guard = self.file_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.results_path())
            .await
            .context("Failed to open results file")?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write result")?;
        file.flush().await?;
        Ok(())
    }

    async fn write_screenshot(&self, task: &Task, png: &[u8]) -> Result<String> {
        let name = format!(
            "{}-{}-{}.png",
            task.id,
            task.attempt,
            Utc::now().format("%Y%m%dT%H%M%S")
        );
        let path = self.directory.join("screenshots").join(name);
        fs::write(&path, png)
            .await
            .context(format!("Failed to save screenshot to: {}", path.display()))?;
        debug!("Screenshot saved to: {}", path.display());
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{PageOutcome, TaskType};

    #[tokio::test]
    async fn test_appends_one_line_per_result() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonlOutputWriter::new(dir.path()).await.unwrap();
        let task = Task::new("https://example.com/", TaskType::Visit).unwrap();

        for _ in 0..3 {
            writer
                .write(&TaskResult::succeeded(&task, PageOutcome::default(), Utc::now()))
                .await
                .unwrap();
        }

        let contents = fs::read_to_string(writer.results_path()).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: TaskResult = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.task_id, task.id);
    }

    #[tokio::test]
    async fn test_screenshot_written_under_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonlOutputWriter::new(dir.path()).await.unwrap();
        let task = Task::new("https://example.com/", TaskType::Screenshot).unwrap();

        let path = writer.write_screenshot(&task, b"\x89PNG").await.unwrap();
        assert!(path.ends_with(".png"));
        assert_eq!(fs::read(&path).await.unwrap(), b"\x89PNG");
    }
}
