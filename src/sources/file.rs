use crate::error::AppError;
use crate::models::AllocationRecord;
use crate::sources::{parse_records, ReportSource};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

/// Reads a previously downloaded report from disk; the query is ignored.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReportSource for FileSource {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn fetch_records(&self, _query: &str) -> Result<Vec<AllocationRecord>, AppError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let body: Value = serde_json::from_str(&raw)?;
        parse_records(body)
    }
}
