//! Drives one unit through as many stages as it can go in a single pass

use super::workers::{PublishPool, enrich_files};
use crate::config::Config;
use crate::error::Result;
use crate::stages::{StageOutcome, StageRunner};
use crate::types::{FileRef, FileState, RunSummary, Stage, StageCounts, UnitId};
use tokio_util::sync::CancellationToken;

/// Run stages on `unit_id` until it is Reclaimed, fails, or has to wait
///
/// Stage failures are recorded by the stages themselves and end the unit's
/// turn; only a state store error comes back as `Err`.
pub(super) async fn drive_unit(
    runner: &StageRunner,
    config: &Config,
    unit_id: &UnitId,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let publish_pool = PublishPool::new(
        config.workers.publish_workers,
        config.workers.publish_min_interval,
    );

    loop {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }

        let unit = runner.load_unit(unit_id).await?;
        let Some(stage) = unit.state.next_stage() else {
            break;
        };

        let outcome = match stage {
            Stage::Fetch | Stage::Unpack => runner.run_unit_stage(unit_id, stage).await?,
            Stage::Enrich => {
                let pending = file_refs(runner, unit_id, FileState::Pending).await?;
                let counts =
                    enrich_files(runner, pending, config.workers.enrich_workers, cancel).await?;
                add_counts(&mut summary, Stage::Enrich, counts);
                runner.finish_enrich(unit_id).await?
            }
            Stage::Publish => {
                publish_enriched(runner, config, &publish_pool, unit_id, cancel, &mut summary)
                    .await?;
                runner.finish_publish(unit_id).await?
            }
            Stage::Reclaim => {
                // Files enriched by a ledger retry after the unit closed Publish
                publish_enriched(runner, config, &publish_pool, unit_id, cancel, &mut summary)
                    .await?;
                runner.reclaim(unit_id).await?
            }
        };

        match outcome {
            StageOutcome::Completed => {
                if matches!(stage, Stage::Fetch | Stage::Unpack | Stage::Reclaim) {
                    summary.record(stage, true);
                }
                if stage == Stage::Reclaim {
                    summary.units_reclaimed += 1;
                }
            }
            StageOutcome::Failed(_) => {
                if matches!(stage, Stage::Fetch | Stage::Unpack | Stage::Reclaim) {
                    summary.record(stage, false);
                }
                break;
            }
            StageOutcome::Blocked(reason) => {
                tracing::debug!(unit_id = %unit_id, stage = %stage, reason = %reason, "unit waits");
                break;
            }
            StageOutcome::AlreadyDone => break,
        }
    }

    Ok(summary)
}

async fn publish_enriched(
    runner: &StageRunner,
    config: &Config,
    pool: &PublishPool,
    unit_id: &UnitId,
    cancel: &CancellationToken,
    summary: &mut RunSummary,
) -> Result<()> {
    let enriched = file_refs(runner, unit_id, FileState::Enriched).await?;
    if enriched.is_empty() {
        return Ok(());
    }

    let batch_size = config.workers.publish_batch_size.max(1);
    let batches = enriched.len().div_ceil(batch_size);
    for (index, batch) in enriched.chunks(batch_size).enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        tracing::debug!(
            unit_id = %unit_id,
            batch = index + 1,
            batches,
            files = batch.len(),
            "publishing batch"
        );
        let counts = pool.publish_batch(runner, batch.to_vec(), cancel).await?;
        add_counts(summary, Stage::Publish, counts);
    }
    Ok(())
}

async fn file_refs(runner: &StageRunner, unit_id: &UnitId, state: FileState) -> Result<Vec<FileRef>> {
    Ok(runner
        .db()
        .list_files(unit_id, Some(state))
        .await?
        .iter()
        .map(|record| record.file_ref())
        .collect())
}

fn add_counts(summary: &mut RunSummary, stage: Stage, counts: StageCounts) {
    let entry = summary.stages.entry(stage).or_default();
    entry.succeeded += counts.succeeded;
    entry.failed += counts.failed;
}
