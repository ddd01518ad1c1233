//! Phases and the admission table.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::EpochTimes;

/// Where a vault is within its current epoch.
///
/// The two `Awaiting*` variants are the quiet gaps between windows. Only
/// reads and setup calls are admitted there, plus the margin moves the
/// admin makes while preparing for or unwinding from the auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// `now < start_epoch`: the schedule has not begun.
    Pending,
    /// `[start_epoch, end_deposits)`: deposits open.
    Funding,
    /// `[end_deposits, start_auction)`.
    AwaitingAuction,
    /// `[start_auction, end_auction)`: the admin works the auction order.
    Trading,
    /// `[end_auction, start_settlement)`.
    AwaitingSettlement,
    /// `[start_settlement, end_epoch)`: margin unwinds, redemptions open.
    Settlement,
    /// `now >= end_epoch`: waiting for rollover.
    Stale,
}

impl Phase {
    /// Every phase, in schedule order.
    pub const ALL: [Phase; 7] = [
        Phase::Pending,
        Phase::Funding,
        Phase::AwaitingAuction,
        Phase::Trading,
        Phase::AwaitingSettlement,
        Phase::Settlement,
        Phase::Stale,
    ];

    /// The phase of `times` at `now`. This is the only place phases are
    /// computed.
    pub fn at(times: &EpochTimes, now: i64) -> Phase {
        if now < times.start_epoch {
            Phase::Pending
        } else if now < times.end_deposits {
            Phase::Funding
        } else if now < times.start_auction {
            Phase::AwaitingAuction
        } else if now < times.end_auction {
            Phase::Trading
        } else if now < times.start_settlement {
            Phase::AwaitingSettlement
        } else if now < times.end_epoch {
            Phase::Settlement
        } else {
            Phase::Stale
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Funding => "funding",
            Phase::AwaitingAuction => "awaiting_auction",
            Phase::Trading => "trading",
            Phase::AwaitingSettlement => "awaiting_settlement",
            Phase::Settlement => "settlement",
            Phase::Stale => "stale",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every call a vault accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Initialize,
    InitMarginAccount,
    InitOpenOrders,
    Deposit,
    DepositToMargin,
    OpenMarginPosition,
    PlaceOrder,
    CancelOrder,
    WithdrawFromMargin,
    CloseMarginPosition,
    Redeem,
    DrainResidual,
    Rollover,
}

impl Operation {
    pub const ALL: [Operation; 13] = [
        Operation::Initialize,
        Operation::InitMarginAccount,
        Operation::InitOpenOrders,
        Operation::Deposit,
        Operation::DepositToMargin,
        Operation::OpenMarginPosition,
        Operation::PlaceOrder,
        Operation::CancelOrder,
        Operation::WithdrawFromMargin,
        Operation::CloseMarginPosition,
        Operation::Redeem,
        Operation::DrainResidual,
        Operation::Rollover,
    ];

    /// The admission table: phases in which this operation may run.
    pub fn permitted_phases(&self) -> &'static [Phase] {
        use Phase::*;
        match self {
            // One-shot setup is not tied to the schedule.
            Operation::Initialize | Operation::InitMarginAccount | Operation::InitOpenOrders => {
                &Phase::ALL
            }
            Operation::Deposit => &[Funding],
            Operation::DepositToMargin | Operation::OpenMarginPosition => {
                &[AwaitingAuction, Trading]
            }
            Operation::PlaceOrder => &[Trading],
            Operation::CancelOrder => &[Trading, AwaitingSettlement],
            Operation::WithdrawFromMargin | Operation::CloseMarginPosition => &[Settlement],
            // Redemption stays open after end_epoch so every claim can be
            // burned before a residual drain.
            Operation::Redeem => &[Settlement, Stale],
            Operation::DrainResidual | Operation::Rollover => &[Stale],
        }
    }

    pub fn is_permitted(&self, phase: Phase) -> bool {
        self.permitted_phases().contains(&phase)
    }

    /// Whether only the vault admin may invoke this.
    pub fn admin_only(&self) -> bool {
        !matches!(
            self,
            Operation::Initialize | Operation::Deposit | Operation::Redeem
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Initialize => "initialize",
            Operation::InitMarginAccount => "init_margin_account",
            Operation::InitOpenOrders => "init_open_orders",
            Operation::Deposit => "deposit",
            Operation::DepositToMargin => "deposit_to_margin",
            Operation::OpenMarginPosition => "open_margin_position",
            Operation::PlaceOrder => "place_order",
            Operation::CancelOrder => "cancel_order",
            Operation::WithdrawFromMargin => "withdraw_from_margin",
            Operation::CloseMarginPosition => "close_margin_position",
            Operation::Redeem => "redeem",
            Operation::DrainResidual => "drain_residual",
            Operation::Rollover => "rollover",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times() -> EpochTimes {
        EpochTimes::new(0, 10, 12, 15, 18, 20, 40).unwrap()
    }

    #[test]
    fn test_phase_boundaries() {
        let t = times();
        let cases = [
            (-1, Phase::Pending),
            (0, Phase::Funding),
            (9, Phase::Funding),
            (10, Phase::AwaitingAuction),
            (11, Phase::AwaitingAuction),
            (12, Phase::Trading),
            (14, Phase::Trading),
            (15, Phase::AwaitingSettlement),
            (18, Phase::Settlement),
            (19, Phase::Settlement),
            (20, Phase::Stale),
            (1_000, Phase::Stale),
        ];
        for (now, expected) in cases {
            assert_eq!(Phase::at(&t, now), expected, "now = {now}");
        }
    }

    #[test]
    fn test_touching_windows_skip_quiet_phases() {
        let t = EpochTimes::new(0, 10, 10, 15, 15, 20, 1).unwrap();
        assert_eq!(t.phase_at(10), Phase::Trading);
        assert_eq!(t.phase_at(15), Phase::Settlement);
    }

    #[test]
    fn test_deposit_only_in_funding() {
        for phase in Phase::ALL {
            assert_eq!(
                Operation::Deposit.is_permitted(phase),
                phase == Phase::Funding
            );
        }
    }

    #[test]
    fn test_quiet_gaps_block_user_calls() {
        for phase in [Phase::AwaitingAuction, Phase::AwaitingSettlement] {
            assert!(!Operation::Deposit.is_permitted(phase));
            assert!(!Operation::Redeem.is_permitted(phase));
            assert!(!Operation::PlaceOrder.is_permitted(phase));
            assert!(!Operation::Rollover.is_permitted(phase));
        }
    }

    #[test]
    fn test_stale_admits_rollover_and_cleanup() {
        assert!(Operation::Rollover.is_permitted(Phase::Stale));
        assert!(Operation::DrainResidual.is_permitted(Phase::Stale));
        assert!(Operation::Redeem.is_permitted(Phase::Stale));
        assert!(!Operation::Deposit.is_permitted(Phase::Stale));
        assert!(!Operation::Rollover.is_permitted(Phase::Settlement));
    }

    #[test]
    fn test_admin_only() {
        assert!(!Operation::Deposit.admin_only());
        assert!(!Operation::Redeem.admin_only());
        assert!(Operation::PlaceOrder.admin_only());
        assert!(Operation::Rollover.admin_only());
    }

    #[test]
    fn test_every_operation_has_a_window() {
        for op in Operation::ALL {
            assert!(!op.permitted_phases().is_empty(), "{op}");
        }
    }
}
