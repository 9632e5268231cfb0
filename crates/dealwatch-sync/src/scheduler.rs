use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::ScanOrchestrator;

/// Builds (but does not start) a scheduler whose single job resumes one
/// chunk of every listed source per tick, using the persisted cursors.
pub async fn build_scheduler(
    orchestrator: Arc<ScanOrchestrator>,
    cron: &str,
    sources: Vec<String>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let sources = Arc::new(sources);
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        let sources = sources.clone();
        Box::pin(async move {
            for source in sources.iter() {
                match orchestrator.resume_chunked_scan(source).await {
                    Ok(chunk) => info!(
                        source = %source,
                        processed = chunk.processed,
                        expired = chunk.expired,
                        finished = chunk.finished_sequence(),
                        errors = chunk.errors.len(),
                        "scheduled chunk finished"
                    ),
                    Err(err) => warn!(source = %source, error = %err, "scheduled chunk skipped"),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DealLedger;

    #[tokio::test]
    async fn valid_cron_builds_a_scheduler() {
        let orchestrator = Arc::new(ScanOrchestrator::new(DealLedger::in_memory().await.unwrap()));
        let scheduler =
            build_scheduler(orchestrator, "0 */15 * * * *", vec!["snapbuy".into()]).await;
        assert!(scheduler.is_ok());
    }

    #[tokio::test]
    async fn malformed_cron_is_rejected() {
        let orchestrator = Arc::new(ScanOrchestrator::new(DealLedger::in_memory().await.unwrap()));
        let err = build_scheduler(orchestrator, "every quarter hour", Vec::new())
            .await
            .err()
            .expect("malformed cron should be rejected");
        assert!(err.to_string().contains("every quarter hour"));
    }
}
