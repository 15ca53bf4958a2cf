//! Bounded per-file worker pools for Enrich and Publish
//!
//! A pool is N worker futures pulling from one shared queue of files, run
//! concurrently on the unit's task. Each publish worker owns its own
//! [`CallPacer`], so spacing applies per worker and throughput grows with the
//! worker count.
//!
//! A stop request lets every worker finish the file it holds and stops
//! handing out new ones. A state store error aborts the pool the same way and
//! is returned to the caller, which abandons the unit for this pass.

use crate::error::Result;
use crate::pacing::CallPacer;
use crate::stages::{StageOutcome, StageRunner};
use crate::types::{FileRef, StageCounts};
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Files waiting for a worker
struct WorkQueue {
    files: StdMutex<VecDeque<FileRef>>,
}

impl WorkQueue {
    fn new(files: Vec<FileRef>) -> Self {
        Self {
            files: StdMutex::new(files.into()),
        }
    }

    fn next(&self) -> Option<FileRef> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

fn tally(counts: &mut StageCounts, outcome: &StageOutcome) {
    match outcome {
        StageOutcome::Completed => counts.succeeded += 1,
        StageOutcome::Failed(_) => counts.failed += 1,
        StageOutcome::AlreadyDone | StageOutcome::Blocked(_) => {}
    }
}

fn combine(results: Vec<Result<StageCounts>>) -> Result<StageCounts> {
    let mut total = StageCounts::default();
    for result in results {
        let counts = result?;
        total.succeeded += counts.succeeded;
        total.failed += counts.failed;
    }
    Ok(total)
}

/// Enrich `files` with at most `workers` calls in flight
pub(super) async fn enrich_files(
    runner: &StageRunner,
    files: Vec<FileRef>,
    workers: usize,
    cancel: &CancellationToken,
) -> Result<StageCounts> {
    if files.is_empty() {
        return Ok(StageCounts::default());
    }
    let workers = workers.clamp(1, files.len());
    let queue = WorkQueue::new(files);
    let abort = cancel.child_token();

    let mut pool = Vec::with_capacity(workers);
    for _ in 0..workers {
        pool.push(enrich_worker(runner, &queue, &abort));
    }
    combine(join_all(pool).await)
}

async fn enrich_worker(
    runner: &StageRunner,
    queue: &WorkQueue,
    abort: &CancellationToken,
) -> Result<StageCounts> {
    let mut counts = StageCounts::default();
    while !abort.is_cancelled() {
        let Some(file) = queue.next() else { break };
        match runner.enrich_file(&file).await {
            Ok(outcome) => tally(&mut counts, &outcome),
            Err(e) => {
                abort.cancel();
                return Err(e);
            }
        }
    }
    Ok(counts)
}

/// Publish pool whose workers keep their pacing across batches
pub(super) struct PublishPool {
    pacers: Vec<Mutex<CallPacer>>,
}

impl PublishPool {
    pub(super) fn new(workers: usize, min_interval: Duration) -> Self {
        Self {
            pacers: (0..workers.max(1))
                .map(|_| Mutex::new(CallPacer::new(min_interval)))
                .collect(),
        }
    }

    /// Publish one batch with every worker of the pool
    pub(super) async fn publish_batch(
        &self,
        runner: &StageRunner,
        batch: Vec<FileRef>,
        cancel: &CancellationToken,
    ) -> Result<StageCounts> {
        if batch.is_empty() {
            return Ok(StageCounts::default());
        }
        let workers = self.pacers.len().min(batch.len());
        let queue = WorkQueue::new(batch);
        let abort = cancel.child_token();

        let mut pool = Vec::with_capacity(workers);
        for pacer in self.pacers.iter().take(workers) {
            pool.push(publish_worker(runner, &queue, pacer, &abort));
        }
        combine(join_all(pool).await)
    }
}

async fn publish_worker(
    runner: &StageRunner,
    queue: &WorkQueue,
    pacer: &Mutex<CallPacer>,
    abort: &CancellationToken,
) -> Result<StageCounts> {
    let mut counts = StageCounts::default();
    while !abort.is_cancelled() {
        let Some(file) = queue.next() else { break };
        match runner.publish_file(&file, pacer).await {
            Ok(outcome) => tally(&mut counts, &outcome),
            Err(e) => {
                abort.cancel();
                return Err(e);
            }
        }
    }
    Ok(counts)
}
