//! Startup recovery and shutdown coordination.

use super::Orchestrator;
use crate::error::Result;
use crate::stages::UnitPaths;
use crate::types::{Event, UnitState};

impl Orchestrator {
    /// Rebuild the governor's reservations from the units that occupy disk
    ///
    /// Artifacts kept from failed fetches are held at their measured size.
    /// The state store is authoritative; the budget saved at the last clean
    /// shutdown is only compared against for diagnostics.
    pub(super) async fn restore_budget(&self) -> Result<()> {
        let mut restored = 0usize;
        for unit in self.db.list_units(None).await? {
            if unit.state.is_resident() {
                self.governor.reserve(&unit.id, unit.size_bytes);
                restored += 1;
            } else if unit.state == UnitState::FailedFetch {
                let root = UnitPaths::new(&self.config.storage.work_dir, &unit.id).root;
                match crate::utils::measure_dir(root).await {
                    Ok(0) => {}
                    Ok(bytes) => {
                        self.governor.hold(&unit.id, bytes);
                        restored += 1;
                    }
                    Err(e) => {
                        tracing::warn!(unit_id = %unit.id, error = %e, "could not measure failed fetch artifacts");
                    }
                }
            }
        }

        let resident_bytes = self.governor.resident_bytes();
        match self.db.load_disk_budget().await? {
            Some(saved) if saved.resident_bytes != resident_bytes => {
                tracing::debug!(
                    saved_bytes = saved.resident_bytes,
                    resident_bytes,
                    "Saved disk budget differs from resident units; using resident units"
                );
            }
            _ => {}
        }
        if restored > 0 {
            tracing::info!(residents = restored, resident_bytes, "Restored disk budget");
        }

        if self.config.disk_budget.check_free_space
            && let Some(message) = self.governor.free_space_warning(&self.config.storage.work_dir)
        {
            tracing::warn!(%message, "Disk budget policy warning");
        }

        if let Some(checkpoint) = self.db.get_checkpoint().await? {
            tracing::info!(
                stage = %checkpoint.stage,
                unit_id = %checkpoint.unit_id,
                file = checkpoint.file_path.as_deref().unwrap_or(""),
                "Interrupted stage found; it resumes first on the next run"
            );
        }
        Ok(())
    }

    /// Gracefully shut down the pipeline
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new runs
    /// 2. Signals the current run to stop starting new stage invocations
    /// 3. Waits for in-flight invocations to finish with a timeout (30 seconds)
    /// 4. Persists the disk budget
    /// 5. Marks the shutdown as clean
    ///
    /// Every step is attempted even if an earlier one failed; failures are logged.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        // 1. Stop accepting new runs
        self.control
            .accepting_new
            .store(false, std::sync::atomic::Ordering::SeqCst);
        tracing::info!("Stopped accepting new runs");

        // 2-3. Signal the run and wait for in-flight work
        let shutdown_timeout = std::time::Duration::from_secs(30);
        match tokio::time::timeout(shutdown_timeout, self.stop()).await {
            Ok(Ok(_)) => {
                tracing::info!("Active run wound down gracefully");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Error while waiting for the active run to finish");
            }
            Err(_) => {
                tracing::warn!("Timeout waiting for the active run to finish, proceeding with shutdown");
            }
        }

        // 4. Persist final state
        if let Err(e) = self.db.save_disk_budget(&self.governor.snapshot()).await {
            tracing::error!(error = %e, "Failed to persist disk budget during shutdown");
        } else {
            tracing::info!("Disk budget persisted to database");
        }

        // 5. Mark clean shutdown in database
        if let Err(e) = self.db.set_clean_shutdown().await {
            tracing::error!(error = %e, "Failed to mark clean shutdown in database");
        } else {
            tracing::info!("Marked clean shutdown in database");
        }

        // 6. Emit shutdown event
        self.emit(Event::Shutdown);

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
