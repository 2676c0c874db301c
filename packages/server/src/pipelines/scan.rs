//! Repository scan handler behind `POST /api/scans/start`.
//!
//! Walks the repository tree and reports file counts and sizes. The
//! heavyweight analysis passes hook in as their own handlers; this one
//! exists so a bare deployment has something to run end to end.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::kernel::classifier::JobError;
use crate::kernel::jobs::{Job, JobContext, JobHandler};

/// Pipeline id the scan worker registers under.
pub const PIPELINE_ID: &str = "repository-scan";

/// Directories that never count as repository content.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv"];

#[derive(Debug, Deserialize)]
struct ScanRequest {
    repository_path: String,
    #[serde(default)]
    #[allow(dead_code)]
    options: Option<Value>,
}

/// Scans one repository tree per job.
pub struct ScanHandler;

#[async_trait::async_trait]
impl JobHandler for ScanHandler {
    async fn run(&self, job: Job, ctx: JobContext) -> Result<Value, JobError> {
        let request: ScanRequest = serde_json::from_value(job.data.clone().unwrap_or(Value::Null))
            .map_err(|e| JobError::new(format!("invalid scan payload: {e}")))?;

        let root = PathBuf::from(&request.repository_path);
        let metadata = tokio::fs::metadata(&root).await.map_err(JobError::from)?;
        if !metadata.is_dir() {
            return Err(JobError::with_code(
                format!("{} is not a directory", root.display()),
                "ENOTDIR",
            ));
        }

        ctx.report_progress(0.1).await;

        let stats = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || walk(&root))
                .await
                .map_err(|e| JobError::new(format!("scan task failed: {e}")))?
        }?;

        ctx.checkpoint()?;
        ctx.report_progress(1.0).await;

        info!(
            repository = %root.display(),
            files = stats.file_count,
            bytes = stats.total_bytes,
            "repository scan finished"
        );

        Ok(json!({
            "repository_path": request.repository_path,
            "file_count": stats.file_count,
            "total_bytes": stats.total_bytes,
        }))
    }
}

#[derive(Debug, Default)]
struct ScanStats {
    file_count: u64,
    total_bytes: u64,
}

fn walk(root: &Path) -> Result<ScanStats, JobError> {
    let mut stats = ScanStats::default();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).map_err(JobError::from)? {
            let entry = entry.map_err(JobError::from)?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(JobError::from)?;

            if file_type.is_dir() {
                let name = entry.file_name();
                let skip = name
                    .to_str()
                    .map(|name| SKIPPED_DIRS.contains(&name))
                    .unwrap_or(false);
                if !skip {
                    pending.push(path);
                }
            } else if file_type.is_file() {
                stats.file_count += 1;
                stats.total_bytes += entry.metadata().map_err(JobError::from)?.len();
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_counts_files_and_skips_vendored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/b.rs"), "pub fn b() {}").unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules/huge.js"), "x".repeat(1000)).unwrap();

        let stats = walk(dir.path()).unwrap();
        assert_eq!(stats.file_count, 2);
        assert!(stats.total_bytes > 0);
        assert!(stats.total_bytes < 1000);
    }

    #[test]
    fn walk_of_missing_path_is_a_filesystem_error() {
        let err = walk(Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.code.as_deref(), Some("ENOENT"));
    }
}
