use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::store::models::{Id, LoggingMode};

/// Streaming transcript of one proxied session.
///
/// One file per session under the configured logs directory. Which
/// directions are fed into it is decided by the hop's [`LoggingMode`]
/// at pump time; the recorder itself just appends.
pub struct TranscriptRecorder {
    file: Mutex<tokio::fs::File>,
}

impl TranscriptRecorder {
    pub async fn create(dir: &Path, session_id: Id, host_name: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating logs directory: {}", dir.display()))?;
        let path = dir.join(format!("{session_id}-{host_name}.log"));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("creating transcript: {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append a chunk. Recording failures never tear down the session.
    pub async fn record(&self, data: &[u8]) {
        let mut file = self.file.lock().await;
        let _ = file.write_all(data).await;
    }
}

/// Whether a given pump direction is recorded under `mode`.
pub fn records_direction(mode: LoggingMode, client_to_upstream: bool) -> bool {
    match mode {
        LoggingMode::Disabled => false,
        LoggingMode::Input => client_to_upstream,
        LoggingMode::Everything => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_selection() {
        assert!(!records_direction(LoggingMode::Disabled, true));
        assert!(!records_direction(LoggingMode::Disabled, false));
        assert!(records_direction(LoggingMode::Input, true));
        assert!(!records_direction(LoggingMode::Input, false));
        assert!(records_direction(LoggingMode::Everything, true));
        assert!(records_direction(LoggingMode::Everything, false));
    }

    #[tokio::test]
    async fn transcript_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        let rec = TranscriptRecorder::create(dir.path(), 42, "web01")
            .await
            .unwrap();
        rec.record(b"ls\n").await;
        rec.record(b"total 0\n").await;

        let content = tokio::fs::read_to_string(dir.path().join("42-web01.log"))
            .await
            .unwrap();
        assert_eq!(content, "ls\ntotal 0\n");
    }
}
