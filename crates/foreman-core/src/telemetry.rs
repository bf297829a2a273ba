use crate::error::ForemanResult;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// JSON file sink for durable telemetry records.
///
/// One file per record, named `{kind}_{timestamp}.json`, so dashboard and
/// CLI readers (out of scope here) can tail the directory. Writers treat
/// failures as log-only; nothing in the control plane depends on a write
/// succeeding.
pub struct JsonTelemetrySink {
    base_dir: PathBuf,
}

impl JsonTelemetrySink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Write one record. Returns the path it landed at.
    pub async fn write_record<T: Serialize>(
        &self,
        kind: &str,
        record: &T,
    ) -> ForemanResult<PathBuf> {
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let filename = format!("{kind}_{timestamp}.json");
        let path = self.base_dir.join(filename);

        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&path, json).await?;

        debug!(kind, path = %path.display(), "telemetry record written");
        Ok(path)
    }

    /// All record files for a kind, sorted by name (oldest first).
    pub async fn list_records(&self, kind: &str) -> ForemanResult<Vec<PathBuf>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{kind}_");
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base_dir).await?;

        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with(&prefix) && name.ends_with(".json") {
                    entries.push(path);
                }
            }
        }

        entries.sort();
        Ok(entries)
    }
}
