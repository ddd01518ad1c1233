//! # Lifecycle / Rollover
//!
//! Once an epoch is stale the admin rolls the vault forward: every boundary
//! moves by the cadence and a new funding window opens. Nothing else
//! changes. Collateral, claim supply and every claim record carry over as
//! they are, including claims that were never redeemed.

use tracing::debug;

use strata_protocol::epoch::{EpochTimes, Operation};
use strata_protocol::crypto::Pubkey;

use crate::vault::{VaultAccount, VaultError, VaultResult};

impl VaultAccount {
    /// Advances the schedule by one cadence. With `new_cadence`, that value
    /// is used for this step and kept for later ones.
    pub fn rollover(
        &mut self,
        signer: &Pubkey,
        new_cadence: Option<i64>,
        now: i64,
    ) -> VaultResult<EpochTimes> {
        self.authorize(Operation::Rollover, signer)?;
        self.gate(Operation::Rollover, now)?;

        let next = self.epoch.next(new_cadence)?;
        let index = self
            .epoch_index
            .checked_add(1)
            .ok_or(VaultError::ArithmeticOverflow)?;

        debug!(
            vault = %self.name,
            from = self.epoch.start_epoch,
            to = next.start_epoch,
            cadence = next.epoch_cadence,
            "rolling epoch"
        );
        self.epoch = next;
        self.epoch_index = index;
        self.updated_at = now;
        Ok(next)
    }

    /// Rollovers needed before the schedule stops being stale at `now`.
    /// Zero when the epoch has not ended.
    pub fn rollovers_behind(&self, now: i64) -> u64 {
        if now < self.epoch.end_epoch {
            return 0;
        }
        let cadence = self.epoch.epoch_cadence.max(1) as i128;
        let overdue = now as i128 - self.epoch.end_epoch as i128;
        (overdue / cadence + 1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_protocol::config::VaultParams;
    use strata_protocol::epoch::Phase;

    fn admin() -> Pubkey {
        Pubkey::new([0xAA; 32])
    }

    fn vault() -> VaultAccount {
        let times = EpochTimes::new(0, 10, 12, 15, 18, 20, 40).unwrap();
        VaultAccount::initialize("sol_put", times, admin(), &VaultParams::default(), 0).unwrap()
    }

    #[test]
    fn test_rollover_shifts_by_cadence() {
        let mut v = vault();
        let next = v.rollover(&admin(), None, 21).unwrap();
        assert_eq!(
            [
                next.start_epoch,
                next.end_deposits,
                next.start_auction,
                next.end_auction,
                next.start_settlement,
                next.end_epoch
            ],
            [40, 50, 52, 55, 58, 60]
        );
        assert_eq!(v.epoch_index, 1);
        assert_eq!(v.phase(45), Phase::Funding);
    }

    #[test]
    fn test_rollover_before_end_epoch() {
        let mut v = vault();
        assert!(matches!(
            v.rollover(&admin(), None, 19),
            Err(VaultError::PhaseViolation {
                operation: Operation::Rollover,
                current: Phase::Settlement,
                ..
            })
        ));
        assert_eq!(v.epoch.start_epoch, 0);
    }

    #[test]
    fn test_rollover_keeps_ledger() {
        let mut v = vault();
        let depositor = Pubkey::new([1; 32]);
        v.deposit(depositor, 500, 3).unwrap();
        v.rollover(&admin(), None, 20).unwrap();
        assert_eq!(v.claim_supply(), 500);
        assert_eq!(v.collateral_balance(), 500);
        assert_eq!(v.claim_of(&depositor).unwrap().balance, 500);
    }

    #[test]
    fn test_rollover_with_new_cadence() {
        let mut v = vault();
        v.rollover(&admin(), Some(100), 20).unwrap();
        assert_eq!(v.epoch.start_epoch, 100);
        assert_eq!(v.epoch.epoch_cadence, 100);
        assert!(matches!(
            v.rollover(&admin(), Some(-1), 500),
            Err(VaultError::InvalidEpochOrdering(_))
        ));
    }

    #[test]
    fn test_rollovers_behind() {
        let v = vault();
        assert_eq!(v.rollovers_behind(19), 0);
        assert_eq!(v.rollovers_behind(20), 1);
        assert_eq!(v.rollovers_behind(59), 1);
        assert_eq!(v.rollovers_behind(60), 2);
    }

    #[test]
    fn test_rollover_is_admin_only() {
        let mut v = vault();
        assert!(matches!(
            v.rollover(&Pubkey::new([3; 32]), None, 21),
            Err(VaultError::Unauthorized { .. })
        ));
    }
}
