//! Allocation of a paid amount over a partner's payable earnings.
//!
//! Earnings are consumed oldest first. Each one that fits entirely in the
//! remaining amount is paid in full. The first one that does not fit is
//! split: the paid portion stays on the original row, the remainder moves to
//! a new CONFIRMED row pointing back at it. At most one split per payout.

use uuid::Uuid;

use afl_schemas::Money;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSplit {
    pub earning_id: Uuid,
    pub paid_portion: Money,
    pub remainder: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    pub paid_in_full: Vec<Uuid>,
    pub split: Option<PlannedSplit>,
    /// Left over when the earnings ran out first.
    pub unapplied: Money,
}

/// `payable` must already be in oldest-first order.
pub fn plan_split(payable: &[(Uuid, Money)], amount: Money) -> SplitPlan {
    let mut remaining = amount;
    let mut paid_in_full = Vec::new();
    let mut split = None;

    for &(id, earned) in payable {
        if !remaining.is_positive() {
            break;
        }
        if earned <= remaining {
            paid_in_full.push(id);
            remaining -= earned;
        } else {
            split = Some(PlannedSplit {
                earning_id: id,
                paid_portion: remaining,
                remainder: earned - remaining,
            });
            remaining = Money::ZERO;
        }
    }

    SplitPlan {
        paid_in_full,
        split,
        unapplied: remaining,
    }
}
