use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::repo::{DocumentRepository, Repository, StoreResult};
use crate::storage::ObjectStorage;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub found: usize,
    pub deleted: usize,
    pub errors: Vec<String>,
}

/// Removes documents stuck in `uploading` or `replacing` together with the
/// blobs they may have left behind.
#[derive(Clone)]
pub struct Reaper {
    repo: Arc<dyn Repository>,
    storage: Arc<dyn ObjectStorage>,
}

impl Reaper {
    pub fn new(repo: Arc<dyn Repository>, storage: Arc<dyn ObjectStorage>) -> Self {
        Self { repo, storage }
    }

    pub async fn sweep(&self, max_age: ChronoDuration) -> StoreResult<SweepReport> {
        self.sweep_before(Utc::now().naive_utc() - max_age).await
    }

    /// Never fails on a single item; per-item failures land in `errors`.
    /// Rows are removed with a conditional delete first, so a finalize that
    /// commits mid-sweep keeps its document and blob.
    pub async fn sweep_before(&self, cutoff: NaiveDateTime) -> StoreResult<SweepReport> {
        let candidates = self.repo.find_orphaned_documents(cutoff)?;
        let mut report = SweepReport {
            found: candidates.len(),
            ..SweepReport::default()
        };

        for candidate in candidates {
            let released = match self
                .repo
                .delete_orphaned_document(candidate.document_id, cutoff)
            {
                Ok(Some(released)) => released,
                Ok(None) => continue,
                Err(err) => {
                    warn!(document_id = %candidate.document_id, error = %err, "failed to delete orphaned document");
                    report
                        .errors
                        .push(format!("{}: {err}", candidate.document_id));
                    continue;
                }
            };
            report.deleted += 1;

            for key in released.into_keys() {
                // The object may never have been written.
                if let Err(err) = self.storage.delete_object(&key).await {
                    warn!(storage_key = %key, error = %err, "failed to delete orphaned object");
                    report.errors.push(format!("{key}: {err}"));
                }
            }
        }

        if report.found > 0 {
            info!(
                found = report.found,
                deleted = report.deleted,
                errors = report.errors.len(),
                "orphan sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn run(&self, interval: Duration, max_age: ChronoDuration) {
        info!(interval_secs = interval.as_secs(), "orphan reaper started");
        loop {
            if let Err(err) = self.sweep(max_age).await {
                error!(error = %err, "orphan sweep failed");
            }
            sleep(interval).await;
        }
    }
}
