//! Disk space governor
//!
//! Decides whether the next archive may be fetched. A fetch is authorized only
//! while `resident + candidate + margin <= ceiling`, with
//! `margin = max(ceiling * margin_ratio, margin_floor)`. Resident bytes are the
//! sum of reservations held by units that have fetched but not yet reclaimed.
//!
//! The resident counter is the one process-wide mutable value of the pipeline;
//! it is an atomic so `may_fetch` and `status` never block behind a fetch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::DiskBudgetConfig;
use crate::types::{DiskBudget, Reservation, UnitId};

/// Result of asking the governor for a fetch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchDecision {
    /// The reservation is held; the unit may fetch
    Authorized {
        /// Bytes reserved for the unit
        reserved_bytes: u64,
        /// The unit alone exceeds the budget and was let through because
        /// nothing else is resident
        oversized: bool,
    },
    /// Not now; residents must reclaim first
    Deferred {
        /// Bytes the unit would need
        requested_bytes: u64,
        /// Bytes held by residents at the time of the decision
        resident_bytes: u64,
    },
}

impl FetchDecision {
    /// Whether the fetch may go ahead
    pub fn is_authorized(&self) -> bool {
        matches!(self, FetchDecision::Authorized { .. })
    }
}

/// Disk budget gate for new fetches
#[derive(Debug)]
pub struct DiskSpaceGovernor {
    ceiling: Option<u64>,
    margin: u64,
    reservation_multiplier: f64,
    resident: AtomicU64,
    reservations: Mutex<HashMap<UnitId, u64>>,
}

impl DiskSpaceGovernor {
    /// Build a governor from configuration, with nothing resident
    pub fn new(config: &DiskBudgetConfig) -> Self {
        let margin = match config.ceiling_bytes {
            Some(ceiling) => {
                let proportional = (ceiling as f64 * config.margin_ratio).ceil() as u64;
                proportional.max(config.margin_floor_bytes)
            }
            None => 0,
        };

        Self {
            ceiling: config.ceiling_bytes,
            margin,
            reservation_multiplier: config.reservation_multiplier.max(1.0),
            resident: AtomicU64::new(0),
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// Configured ceiling
    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    /// Effective safety margin
    pub fn margin(&self) -> u64 {
        self.margin
    }

    /// Bytes currently reserved by residents
    pub fn resident_bytes(&self) -> u64 {
        self.resident.load(Ordering::SeqCst)
    }

    /// Bytes a unit of `archive_size` needs while resident (archive plus extracted copy)
    pub fn reservation_for(&self, archive_size: u64) -> u64 {
        (archive_size as f64 * self.reservation_multiplier).ceil() as u64
    }

    /// Whether a unit of `archive_size` would be authorized right now
    ///
    /// Does not reserve anything; use [`try_reserve`](Self::try_reserve) to act on it.
    pub fn may_fetch(&self, archive_size: u64) -> bool {
        self.admits(self.resident_bytes(), self.provisional_for(archive_size))
    }

    /// Bytes held for a unit until its archive is on disk and measured
    ///
    /// A unit listed without a size holds all of the headroom under the
    /// ceiling, so it is only fetched while nothing else is resident.
    pub fn provisional_for(&self, archive_size: u64) -> u64 {
        match self.ceiling {
            Some(ceiling) if archive_size == 0 => ceiling.saturating_sub(self.margin).max(1),
            _ => self.reservation_for(archive_size),
        }
    }

    fn admits(&self, resident: u64, requested: u64) -> bool {
        match self.ceiling {
            None => true,
            // Sole resident is always let through so oversized units can progress
            Some(_) if resident == 0 => true,
            Some(ceiling) => resident
                .saturating_add(requested)
                .saturating_add(self.margin)
                <= ceiling,
        }
    }

    fn exceeds_alone(&self, requested: u64) -> bool {
        self.ceiling
            .is_some_and(|ceiling| requested.saturating_add(self.margin) > ceiling)
    }

    fn lock_reservations(&self) -> std::sync::MutexGuard<'_, HashMap<UnitId, u64>> {
        // A poisoned map is still consistent: every mutation is a single insert/remove
        self.reservations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check and reserve in one step
    ///
    /// A unit that already holds a reservation keeps it and is authorized again.
    pub fn try_reserve(&self, unit_id: &UnitId, archive_size: u64) -> FetchDecision {
        let requested = self.provisional_for(archive_size);
        let mut reservations = self.lock_reservations();

        if let Some(&held) = reservations.get(unit_id) {
            return FetchDecision::Authorized {
                reserved_bytes: held,
                oversized: self.exceeds_alone(held),
            };
        }

        let outcome = self
            .resident
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |resident| {
                self.admits(resident, requested)
                    .then(|| resident.saturating_add(requested))
            });

        match outcome {
            Ok(previous) => {
                reservations.insert(unit_id.clone(), requested);
                let oversized = self.exceeds_alone(requested);
                if oversized {
                    tracing::warn!(
                        unit_id = %unit_id,
                        requested_bytes = requested,
                        ceiling_bytes = ?self.ceiling,
                        "unit exceeds the disk budget on its own; authorized because nothing else is resident"
                    );
                } else {
                    tracing::debug!(
                        unit_id = %unit_id,
                        requested_bytes = requested,
                        resident_bytes = previous + requested,
                        "fetch authorized"
                    );
                }
                FetchDecision::Authorized {
                    reserved_bytes: requested,
                    oversized,
                }
            }
            Err(resident) => FetchDecision::Deferred {
                requested_bytes: requested,
                resident_bytes: resident,
            },
        }
    }

    /// Reserve budget for a unit without checking the ceiling
    ///
    /// Used to restore residents found on disk at startup. Re-reserving a unit
    /// replaces its previous reservation.
    pub fn reserve(&self, unit_id: &UnitId, archive_size: u64) -> u64 {
        self.hold(unit_id, self.reservation_for(archive_size))
    }

    /// Set a unit's reservation to exactly `bytes` without checking the ceiling
    ///
    /// Used for bytes that are already on disk, such as the artifacts a
    /// failed fetch left behind.
    pub fn hold(&self, unit_id: &UnitId, bytes: u64) -> u64 {
        let mut reservations = self.lock_reservations();

        if let Some(previous) = reservations.insert(unit_id.clone(), bytes) {
            self.resident.fetch_sub(previous, Ordering::SeqCst);
        }
        self.resident.fetch_add(bytes, Ordering::SeqCst);
        bytes
    }

    /// Resize a fetched unit's reservation from the archive size measured on disk
    ///
    /// Returns `false` when growing the reservation put the resident total over
    /// the ceiling. Nothing else is admitted until enough has been released.
    pub fn settle(&self, unit_id: &UnitId, measured_size: u64) -> bool {
        let previous = self.lock_reservations().get(unit_id).copied().unwrap_or(0);
        let held = self.hold(unit_id, self.reservation_for(measured_size));
        let resident = self.resident_bytes();
        let within = held <= previous
            || self
                .ceiling
                .is_none_or(|ceiling| resident.saturating_add(self.margin) <= ceiling);
        if !within {
            tracing::warn!(
                unit_id = %unit_id,
                held_bytes = held,
                resident_bytes = resident,
                ceiling_bytes = ?self.ceiling,
                "measured archive puts the disk budget over its ceiling; no fetch is admitted until space is released"
            );
        }
        within
    }

    /// Release a unit's reservation, returning the bytes released
    ///
    /// Releasing a unit that holds nothing is a no-op.
    pub fn release(&self, unit_id: &UnitId) -> u64 {
        let mut reservations = self.lock_reservations();
        match reservations.remove(unit_id) {
            Some(bytes) => {
                self.resident.fetch_sub(bytes, Ordering::SeqCst);
                tracing::debug!(unit_id = %unit_id, released_bytes = bytes, "reservation released");
                bytes
            }
            None => 0,
        }
    }

    /// Whether a unit currently holds a reservation
    pub fn is_resident(&self, unit_id: &UnitId) -> bool {
        self.lock_reservations().contains_key(unit_id)
    }

    /// Current budget as a persistable record
    pub fn snapshot(&self) -> DiskBudget {
        let reservations = self.lock_reservations();
        let mut entries: Vec<Reservation> = reservations
            .iter()
            .map(|(unit_id, bytes)| Reservation {
                unit_id: unit_id.clone(),
                bytes: *bytes,
            })
            .collect();
        entries.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));

        DiskBudget {
            ceiling_bytes: self.ceiling,
            margin_bytes: self.margin,
            resident_bytes: self.resident_bytes(),
            reservations: entries,
        }
    }

    /// Policy warning if the ceiling is larger than the space really free under `work_dir`
    pub fn free_space_warning(&self, work_dir: &Path) -> Option<String> {
        let ceiling = self.ceiling?;
        match crate::utils::get_available_space(work_dir) {
            Ok(available) if available.saturating_add(self.resident_bytes()) < ceiling => {
                Some(format!(
                    "disk budget ceiling of {} bytes exceeds the {} bytes free under {}",
                    ceiling,
                    available,
                    work_dir.display()
                ))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, path = %work_dir.display(), "could not probe free space");
                None
            }
        }
    }
}
