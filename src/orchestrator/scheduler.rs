//! Discovery and the scheduling pass
//!
//! Candidates are recomputed from the state store every time a slot frees
//! up, in this order:
//!
//! 1. the unit named by the checkpoint, so an interrupted stage resumes first
//! 2. residents that can make progress, furthest along first
//! 3. Pending units, oldest discovery first, but only once no undriven
//!    resident is left
//!
//! Each unit is driven at most once per pass. A Pending unit only starts
//! after the governor reserved its budget; a refused unit waits for a running
//! unit to reclaim, or is left for the next pass when nothing is running.

use super::Orchestrator;
use super::unit_task::drive_unit;
use crate::error::Result;
use crate::governor::FetchDecision;
use crate::retry::with_retry_until;
use crate::stages::StageRunner;
use crate::types::{Event, RunSummary, Unit, UnitId, UnitState};
use std::collections::HashSet;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Next unit the pass should look at
enum Candidate {
    /// Occupies disk already; no budget decision needed
    Resident(Unit),
    /// Needs a fetch authorization first
    Pending(Unit),
}

/// Residents that a stage can move forward
fn is_actionable_resident(state: UnitState) -> bool {
    matches!(
        state,
        UnitState::Fetched | UnitState::Unpacked | UnitState::Enriched | UnitState::Published
    )
}

impl Orchestrator {
    /// Ask the source for its units and record the ones not seen before as Pending
    ///
    /// Returns the number of new units. Known units are never modified.
    pub async fn discover(&self) -> Result<u64> {
        let source = self.collaborators.source.clone();
        let listed = with_retry_until(&self.config.retry, &self.current_token(), || {
            let source = source.clone();
            async move {
                source
                    .list_units()
                    .await
                    .map_err(crate::error::StageError::from)
            }
        })
        .await?;

        let mut discovered = 0u64;
        for unit in &listed {
            if self.db.insert_discovered_unit(unit).await? {
                discovered += 1;
                tracing::info!(unit_id = %unit.id, size_bytes = unit.size_bytes, "unit discovered");
                self.emit(Event::UnitDiscovered {
                    unit_id: unit.id.clone(),
                    size_bytes: unit.size_bytes,
                });
            }
        }

        tracing::debug!(
            source = self.collaborators.source.name(),
            listed = listed.len(),
            discovered,
            "discovery finished"
        );
        Ok(discovered)
    }

    /// One complete scheduling pass over every unit that has work left
    pub(super) async fn run_pass(&self, cancel: &CancellationToken) -> Result<RunSummary> {
        let runner = self.runner(cancel.clone());
        let max_units = self.config.workers.max_concurrent_units.max(1);
        let checkpoint_unit = self.db.get_checkpoint().await?.map(|c| c.unit_id);
        if let Some(unit_id) = &checkpoint_unit {
            tracing::info!(unit_id = %unit_id, "resuming from checkpoint");
        }

        let mut summary = RunSummary::default();
        let mut driven: HashSet<UnitId> = HashSet::new();
        let mut passed_over: HashSet<UnitId> = HashSet::new();
        let mut deferral_announced: HashSet<UnitId> = HashSet::new();
        let mut in_flight: JoinSet<(UnitId, Result<RunSummary>)> = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            // Fill free slots
            while in_flight.len() < max_units {
                let skip: HashSet<&UnitId> = driven.iter().chain(passed_over.iter()).collect();
                let Some(candidate) = self.next_candidate(&skip, checkpoint_unit.as_ref()).await?
                else {
                    break;
                };

                let unit = match candidate {
                    Candidate::Resident(unit) => unit,
                    Candidate::Pending(unit) => {
                        match self.governor.try_reserve(&unit.id, unit.size_bytes) {
                            FetchDecision::Authorized {
                                reserved_bytes,
                                oversized,
                            } => {
                                tracing::info!(unit_id = %unit.id, reserved_bytes, "fetch authorized");
                                self.emit(Event::FetchAuthorized {
                                    unit_id: unit.id.clone(),
                                    reserved_bytes,
                                });
                                if oversized {
                                    self.emit(Event::BudgetPolicyWarning {
                                        unit_id: unit.id.clone(),
                                        message: format!(
                                            "unit needs {} bytes, more than the disk budget allows; fetching because nothing else is resident",
                                            reserved_bytes
                                        ),
                                    });
                                }
                                unit
                            }
                            FetchDecision::Deferred {
                                requested_bytes,
                                resident_bytes,
                            } => {
                                if deferral_announced.insert(unit.id.clone()) {
                                    tracing::info!(
                                        unit_id = %unit.id,
                                        requested_bytes,
                                        resident_bytes,
                                        "fetch deferred until residents reclaim"
                                    );
                                    self.emit(Event::FetchDeferred {
                                        unit_id: unit.id.clone(),
                                        requested_bytes,
                                        resident_bytes,
                                    });
                                }
                                if in_flight.is_empty() {
                                    // Nothing running will free budget in this pass
                                    summary.units_deferred += 1;
                                    passed_over.insert(unit.id);
                                    continue;
                                }
                                break;
                            }
                        }
                    }
                };

                driven.insert(unit.id.clone());
                let runner = runner.clone();
                let config = self.config.clone();
                let cancel = cancel.clone();
                in_flight.spawn(async move {
                    let result = drive_unit(&runner, &config, &unit.id, &cancel).await;
                    (unit.id, result)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            self.collect(joined, &runner, &mut summary).await;
        }

        // In-flight units finish their current stage even after a stop
        while let Some(joined) = in_flight.join_next().await {
            self.collect(joined, &runner, &mut summary).await;
        }

        for unit_id in &driven {
            if let Some(unit) = self.db.get_unit(unit_id).await?
                && unit.state.is_resident()
            {
                summary.units_stalled += 1;
            }
        }
        summary.outstanding_failures = self.ledger().count_failures().await?;
        Ok(summary)
    }

    async fn collect(
        &self,
        joined: std::result::Result<(UnitId, Result<RunSummary>), tokio::task::JoinError>,
        runner: &StageRunner,
        summary: &mut RunSummary,
    ) {
        match joined {
            Ok((unit_id, Ok(unit_summary))) => {
                summary.merge(&unit_summary);
                self.reconcile_reservation(runner, &unit_id).await;
            }
            Ok((unit_id, Err(e))) => {
                tracing::error!(unit_id = %unit_id, error = %e, "unit aborted by state store failure; checkpoint kept for resume");
                self.reconcile_reservation(runner, &unit_id).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "unit task panicked");
            }
        }
    }

    /// Give back budget held by a unit that no longer occupies disk
    async fn reconcile_reservation(&self, runner: &StageRunner, unit_id: &UnitId) {
        match runner.load_unit(unit_id).await {
            // A failed fetch settles its own reservation against what it left on disk
            Ok(unit) if !unit.state.is_resident() && unit.state != UnitState::FailedFetch => {
                let released = self.governor.release(unit_id);
                if released > 0 {
                    tracing::debug!(unit_id = %unit_id, released_bytes = released, "reservation returned");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(unit_id = %unit_id, error = %e, "could not reconcile reservation");
            }
        }
    }

    async fn next_candidate(
        &self,
        skip: &HashSet<&UnitId>,
        checkpoint_unit: Option<&UnitId>,
    ) -> Result<Option<Candidate>> {
        let units: Vec<Unit> = self
            .db
            .list_units(None)
            .await?
            .into_iter()
            .filter(|u| !skip.contains(&u.id))
            .collect();

        if let Some(resume) = checkpoint_unit
            && let Some(unit) = units.iter().find(|u| &u.id == resume)
        {
            if is_actionable_resident(unit.state) {
                return Ok(Some(Candidate::Resident(unit.clone())));
            }
            if unit.state == UnitState::Pending {
                return Ok(Some(Candidate::Pending(unit.clone())));
            }
        }

        // Drain residents first; the furthest along frees its disk soonest
        let resident = units
            .iter()
            .filter(|u| is_actionable_resident(u.state))
            .max_by(|a, b| {
                a.state
                    .cmp(&b.state)
                    .then_with(|| b.discovered_at.cmp(&a.discovered_at))
            });
        if let Some(unit) = resident {
            return Ok(Some(Candidate::Resident(unit.clone())));
        }

        let pending = units
            .into_iter()
            .filter(|u| u.state == UnitState::Pending)
            .min_by(|a, b| {
                a.discovered_at
                    .cmp(&b.discovered_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
        Ok(pending.map(Candidate::Pending))
    }
}
