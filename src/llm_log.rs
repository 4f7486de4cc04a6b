//! Append-only JSONL record of outbound gateway calls.
//!
//! Writes are fire-and-forget: a failed append is logged and never fails
//! the wake-up path.

use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt as _;

/// One line in `logs/llm-calls.jsonl`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub timestamp: i64,
    pub source: &'static str,
    pub agent_id: String,
    pub channel_id: String,
    pub session_key: String,
    pub idempotency_key: String,
    pub prompt_chars: usize,
}

/// Appender for the call log. Cheap to clone; each append opens the file
/// fresh so concurrent writers interleave whole lines.
#[derive(Clone)]
pub struct CallLogger {
    path: PathBuf,
}

impl CallLogger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one record. Fire-and-forget.
    pub fn record(&self, record: CallRecord) {
        let path = self.path.clone();
        tokio::spawn(async move {
            if let Err(error) = append_line(&path, &record).await {
                tracing::warn!(%error, path = %path.display(), "failed to append call record");
            }
        });
    }
}

async fn append_line(path: &std::path::Path, record: &CallRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_append_as_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("llm-calls.jsonl");
        let logger = CallLogger::new(path.clone());

        for index in 0..2 {
            logger.record(CallRecord {
                timestamp: index,
                source: "trigger",
                agent_id: "builder".into(),
                channel_id: "ch-1".into(),
                session_key: "agent:builder:webchat:channel:ch-1".into(),
                idempotency_key: format!("key-{index}"),
                prompt_chars: 42,
            });
        }

        // Appends run on spawned tasks; give them a moment to land.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let raw = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).expect("valid json");
            assert_eq!(value["agentId"], "builder");
            assert_eq!(value["source"], "trigger");
        }
    }
}
