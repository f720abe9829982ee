//! Regression transcript writer
//!
//! The transcript is the human-readable log of a regression run: every external command with
//! its output, firewall controller chatter and timing lines. It is shared by the runner and the
//! task draining the firewall controller's stdout, so writes go through an async mutex.

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct LogWriter {
    path: std::path::PathBuf,
    log: std::sync::Arc<tokio::sync::Mutex<tokio::io::BufWriter<tokio::fs::File>>>,
}

impl LogWriter {
    /// Open the transcript truncating any previous contents.
    pub async fn create(path: &std::path::Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open log file: {:?}", path))?;
        Ok(Self::from_file(path, file))
    }

    /// Open the transcript for appending, creating it if needed.
    pub async fn append(path: &std::path::Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open log file: {:?}", path))?;
        Ok(Self::from_file(path, file))
    }

    fn from_file(path: &std::path::Path, file: tokio::fs::File) -> Self {
        Self {
            path: path.to_owned(),
            log: std::sync::Arc::new(tokio::sync::Mutex::new(tokio::io::BufWriter::new(file))),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn write(&self, msg: &str) -> Result<()> {
        let mut log = self.log.lock().await;
        log.write_all(msg.as_bytes())
            .await
            .context("Failed to write to log file")
    }

    pub async fn writeln(&self, msg: &str) -> Result<()> {
        let mut log = self.log.lock().await;
        log.write_all(msg.as_bytes())
            .await
            .context("Failed to write to log file")?;
        log.write_all(b"\n")
            .await
            .context("Failed to write to log file")
    }

    /// Write several pieces while holding the lock so they are not interleaved with other writers.
    pub async fn write_all(&self, parts: &[&str]) -> Result<()> {
        let mut log = self.log.lock().await;
        for part in parts {
            log.write_all(part.as_bytes())
                .await
                .context("Failed to write to log file")?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let mut log = self.log.lock().await;
        log.flush().await.context("Failed to flush log file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_truncates_and_append_keeps() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.log");
        tokio::fs::write(&path, "stale contents\n").await?;
        let log = LogWriter::create(&path).await?;
        log.writeln("first").await?;
        log.flush().await?;
        assert_eq!(tokio::fs::read_to_string(&path).await?, "first\n");
        let log = LogWriter::append(&path).await?;
        log.write_all(&["second", " ", "line\n"]).await?;
        log.flush().await?;
        assert_eq!(
            tokio::fs::read_to_string(&path).await?,
            "first\nsecond line\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn clones_share_one_buffer() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("shared.log");
        let log = LogWriter::create(&path).await?;
        let other = log.clone();
        let task = tokio::spawn(async move { other.writeln("from task").await });
        task.await??;
        log.writeln("from main").await?;
        log.flush().await?;
        let contents = tokio::fs::read_to_string(&path).await?;
        assert!(contents.contains("from task\n"));
        assert!(contents.contains("from main\n"));
        Ok(())
    }
}
