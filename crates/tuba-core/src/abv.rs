//! Alcohol-by-volume derivation from specific gravity.
//!
//! ABV is estimated from the drop between the original gravity recorded when
//! a batch was confirmed and the current gravity:
//!
//! ```text
//! ABV = (OG - SG) * 131.25
//! ```
//!
//! A batch without a recorded original gravity has no baseline, and its ABV
//! cannot be computed. That case is reported as
//! [`AbvError::MissingBaseline`] rather than silently defaulting to zero.

use std::collections::HashMap;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::debug;

use tuba_types::{AbvResult, BatchId};

use crate::error::AbvError;

/// Conversion factor between gravity points and percent alcohol.
pub const ABV_FACTOR: f64 = 131.25;

/// Plausible specific-gravity range for fermenting sap.
pub const GRAVITY_RANGE: std::ops::RangeInclusive<f64> = 0.9..=1.2;

fn check_gravity(value: f64) -> Result<f64, AbvError> {
    if value.is_finite() && GRAVITY_RANGE.contains(&value) {
        Ok(value)
    } else {
        Err(AbvError::InvalidGravity(value))
    }
}

/// Compute ABV in percent for a batch.
///
/// The result is floored at zero; a current gravity above the baseline
/// means no measurable alcohol yet.
///
/// ```
/// use tuba_core::abv::derive_abv;
/// use tuba_types::BatchId;
///
/// let batch = BatchId::new(1).unwrap();
/// let abv = derive_abv(batch, Some(1.060), 1.020).unwrap();
/// assert!((abv - 5.25).abs() < 1e-9);
/// assert!(derive_abv(batch, None, 1.020).is_err());
/// ```
pub fn derive_abv(batch_id: BatchId, original: Option<f64>, current: f64) -> Result<f64, AbvError> {
    let og = original.ok_or(AbvError::MissingBaseline(batch_id))?;
    let og = check_gravity(og)?;
    let sg = check_gravity(current)?;
    Ok(((og - sg) * ABV_FACTOR).max(0.0))
}

/// Convert specific gravity to degrees Brix.
///
/// Standard cubic approximation, accurate for the gravities seen during
/// fermentation.
#[must_use]
pub fn gravity_to_brix(sg: f64) -> f64 {
    ((182.4601 * sg - 775.6821) * sg + 1262.7794) * sg - 669.5622
}

/// Rate-limited ABV refreshes per batch.
///
/// Operators trigger refreshes by hand; the deriver refuses a second
/// refresh of the same batch within `min_interval`.
#[derive(Debug, Clone)]
pub struct AbvDeriver {
    min_interval: Duration,
    last_refresh: HashMap<BatchId, OffsetDateTime>,
}

impl Default for AbvDeriver {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl AbvDeriver {
    /// Create a deriver enforcing `min_interval` between refreshes of a batch.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_refresh: HashMap::new(),
        }
    }

    /// Minimum time between refreshes of the same batch.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Check whether `batch_id` may be refreshed at `now`.
    ///
    /// Does not consume the slot; call [`mark`](Self::mark) once the refresh
    /// has actually been performed.
    pub fn check(&self, batch_id: BatchId, now: OffsetDateTime) -> Result<(), AbvError> {
        let Some(last) = self.last_refresh.get(&batch_id) else {
            return Ok(());
        };
        let since = now - *last;
        let since = Duration::try_from(since).unwrap_or(Duration::ZERO);
        if since < self.min_interval {
            return Err(AbvError::RateLimited {
                batch_id,
                retry_after: self.min_interval - since,
            });
        }
        Ok(())
    }

    /// Record a refresh of `batch_id` at `now`.
    pub fn mark(&mut self, batch_id: BatchId, now: OffsetDateTime) {
        self.last_refresh.insert(batch_id, now);
    }

    /// Claim the refresh slot of `batch_id` before a slow refresh.
    ///
    /// The slot counts as used from `now`, so concurrent refreshes of the same
    /// batch are rejected while this one runs. Hand the reservation back to
    /// [`release`](Self::release) if the refresh fails.
    pub fn reserve(
        &mut self,
        batch_id: BatchId,
        now: OffsetDateTime,
    ) -> Result<Reservation, AbvError> {
        self.check(batch_id, now)?;
        let previous = self.last_refresh.insert(batch_id, now);
        Ok(Reservation {
            batch_id,
            at: now,
            previous,
        })
    }

    /// Undo a reservation whose refresh failed.
    ///
    /// Does nothing if the slot was reset or re-marked in the meantime.
    pub fn release(&mut self, reservation: Reservation) {
        let Reservation {
            batch_id,
            at,
            previous,
        } = reservation;
        if self.last_refresh.get(&batch_id) != Some(&at) {
            return;
        }
        match previous {
            Some(prev) => self.last_refresh.insert(batch_id, prev),
            None => self.last_refresh.remove(&batch_id),
        };
    }

    /// Derive ABV locally, enforcing the rate limit.
    ///
    /// Failed derivations do not consume the refresh slot.
    pub fn refresh(
        &mut self,
        batch_id: BatchId,
        original: Option<f64>,
        current: f64,
        now: OffsetDateTime,
    ) -> Result<AbvResult, AbvError> {
        self.check(batch_id, now)?;
        let abv = derive_abv(batch_id, original, current)?;
        self.mark(batch_id, now);
        debug!("Derived ABV {:.2}% for batch {}", abv, batch_id);
        Ok(AbvResult {
            current_abv: abv,
            original_gravity: original.unwrap_or_default(),
            current_gravity: Some(current),
        })
    }

    /// Forget all refresh timestamps.
    pub fn reset(&mut self) {
        self.last_refresh.clear();
    }
}

/// A claimed refresh slot, see [`AbvDeriver::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "release the reservation if the refresh fails"]
pub struct Reservation {
    batch_id: BatchId,
    at: OffsetDateTime,
    previous: Option<OffsetDateTime>,
}

impl Reservation {
    /// Batch whose slot is held.
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }
}
