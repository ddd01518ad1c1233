//! # Epoch Clock
//!
//! A vault lives through an endless sequence of epochs. Each epoch is
//! described by six timestamps and a cadence:
//!
//! ```text
//!  start_epoch      end_deposits  start_auction  end_auction  start_settlement  end_epoch
//!      │── Funding ──────│─ (quiet) ─────│─ Trading ───│─ (quiet) ──────│─ Settlement ──│─ Stale ─▶
//! ```
//!
//! The clock holds no state of its own. Given an [`EpochTimes`] record and
//! "now", [`Phase::at`] names the phase, and [`Operation::permitted_phases`]
//! says which calls that phase admits. Every phase check in the system goes
//! through those two functions.
//!
//! Timestamps are Unix seconds (`i64`). The [`Clock`] trait supplies "now":
//! [`SystemClock`] in production, [`ManualClock`] in tests.

mod clock;
mod phase;

pub use clock::{Clock, ManualClock, SystemClock};
pub use phase::{Operation, Phase};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while validating or advancing an epoch schedule.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EpochError {
    /// Two boundaries are in the wrong order.
    #[error("epoch boundary {later} ({later_at}) must not precede {earlier} ({earlier_at})")]
    OutOfOrder {
        /// Name of the boundary that should come first.
        earlier: &'static str,
        /// Its timestamp.
        earlier_at: i64,
        /// Name of the boundary that should come second.
        later: &'static str,
        /// Its timestamp.
        later_at: i64,
    },

    /// The cadence must be a positive number of seconds.
    #[error("epoch cadence must be positive, got {0}")]
    NonPositiveCadence(i64),

    /// The whole schedule lies in the past.
    #[error("epoch ended at {end_epoch}, which is not after the current time {now}")]
    AlreadyEnded {
        /// The schedule's `end_epoch`.
        end_epoch: i64,
        /// The time of the rejected call.
        now: i64,
    },

    /// Shifting the schedule would overflow an `i64` timestamp.
    #[error("advancing the epoch by {by}s overflows the timestamp range")]
    Overflow {
        /// The shift that was requested.
        by: i64,
    },
}

// ---------------------------------------------------------------------------
// EpochTimes
// ---------------------------------------------------------------------------

/// The six boundaries of one epoch plus the distance to the next one.
///
/// Valid schedules satisfy
/// `start_epoch < end_deposits <= start_auction < end_auction <= start_settlement < end_epoch`
/// and `epoch_cadence > 0`. Construct through [`EpochTimes::new`] to have
/// that checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochTimes {
    pub start_epoch: i64,
    pub end_deposits: i64,
    pub start_auction: i64,
    pub end_auction: i64,
    pub start_settlement: i64,
    pub end_epoch: i64,
    pub epoch_cadence: i64,
}

impl EpochTimes {
    /// Builds and validates a schedule.
    pub fn new(
        start_epoch: i64,
        end_deposits: i64,
        start_auction: i64,
        end_auction: i64,
        start_settlement: i64,
        end_epoch: i64,
        epoch_cadence: i64,
    ) -> Result<Self, EpochError> {
        let times = Self {
            start_epoch,
            end_deposits,
            start_auction,
            end_auction,
            start_settlement,
            end_epoch,
            epoch_cadence,
        };
        times.validate()?;
        Ok(times)
    }

    /// Checks the ordering invariant and the cadence.
    pub fn validate(&self) -> Result<(), EpochError> {
        // (earlier, later, strict)
        let checks = [
            (("start_epoch", self.start_epoch), ("end_deposits", self.end_deposits), true),
            (("end_deposits", self.end_deposits), ("start_auction", self.start_auction), false),
            (("start_auction", self.start_auction), ("end_auction", self.end_auction), true),
            (("end_auction", self.end_auction), ("start_settlement", self.start_settlement), false),
            (("start_settlement", self.start_settlement), ("end_epoch", self.end_epoch), true),
        ];

        for ((earlier, earlier_at), (later, later_at), strict) in checks {
            let ok = if strict {
                earlier_at < later_at
            } else {
                earlier_at <= later_at
            };
            if !ok {
                return Err(EpochError::OutOfOrder {
                    earlier,
                    earlier_at,
                    later,
                    later_at,
                });
            }
        }

        if self.epoch_cadence <= 0 {
            return Err(EpochError::NonPositiveCadence(self.epoch_cadence));
        }
        Ok(())
    }

    /// The phase this schedule is in at `now`.
    pub fn phase_at(&self, now: i64) -> Phase {
        Phase::at(self, now)
    }

    /// Returns the schedule shifted forward by `by` seconds.
    ///
    /// Relative spacing is preserved, so a valid schedule stays valid. The
    /// cadence field is carried over unchanged.
    pub fn shifted(&self, by: i64) -> Result<Self, EpochError> {
        let add = |t: i64| t.checked_add(by).ok_or(EpochError::Overflow { by });
        Ok(Self {
            start_epoch: add(self.start_epoch)?,
            end_deposits: add(self.end_deposits)?,
            start_auction: add(self.start_auction)?,
            end_auction: add(self.end_auction)?,
            start_settlement: add(self.start_settlement)?,
            end_epoch: add(self.end_epoch)?,
            epoch_cadence: self.epoch_cadence,
        })
    }

    /// The next epoch's schedule: every boundary moved by the cadence.
    ///
    /// With `new_cadence`, that value is used for this shift and stored for
    /// the ones after it.
    pub fn next(&self, new_cadence: Option<i64>) -> Result<Self, EpochError> {
        let cadence = new_cadence.unwrap_or(self.epoch_cadence);
        if cadence <= 0 {
            return Err(EpochError::NonPositiveCadence(cadence));
        }
        let mut next = self.shifted(cadence)?;
        next.epoch_cadence = cadence;
        next.validate()?;
        Ok(next)
    }

    /// Seconds of funding in this epoch.
    pub fn funding_window(&self) -> i64 {
        self.end_deposits - self.start_epoch
    }
}
