//! Payout lifecycle.
//!
//! ```text
//!   PENDING ──► PROCESSING ──► PAID
//!      │             │
//!      ▼             ▼
//!  CANCELLED       FAILED
//! ```
//!
//! PAID, FAILED and CANCELLED are terminal. A failed payout is never
//! retried; the partner requests a new one.

use afl_schemas::{Payout, PayoutStatus};

use crate::error::{EngineError, EngineResult};

pub fn payout_transition_allowed(from: PayoutStatus, to: PayoutStatus) -> bool {
    use PayoutStatus::*;
    matches!(
        (from, to),
        (Pending, Processing) | (Pending, Cancelled) | (Processing, Paid) | (Processing, Failed)
    )
}

/// Returns the previous status.
pub(crate) fn transition_payout(payout: &mut Payout, to: PayoutStatus) -> EngineResult<PayoutStatus> {
    let from = payout.status;
    if !payout_transition_allowed(from, to) {
        return Err(EngineError::InvalidTransition {
            entity: "payout",
            from: from.as_str(),
            to: to.as_str(),
        });
    }
    payout.status = to;
    Ok(from)
}
