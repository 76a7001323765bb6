//! Earning lifecycle.
//!
//! ```text
//!   PENDING ──► CONFIRMED ──► PAID (terminal)
//!      │  ▲         │
//!      ▼  │         ▼
//!    CANCELLED ◄────┘
//! ```
//!
//! CANCELLED may be reopened to PENDING. PAID is terminal. Staying in the
//! same status is not a transition.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use afl_audit::AuditAction;
use afl_schemas::{Earning, EarningStatus};

use crate::error::{EngineError, EngineResult};
use crate::note_line;

pub fn earning_transition_allowed(from: EarningStatus, to: EarningStatus) -> bool {
    use EarningStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Pending, Cancelled)
            | (Confirmed, Paid)
            | (Confirmed, Cancelled)
            | (Cancelled, Pending)
    )
}

pub fn check_earning_transition(from: EarningStatus, to: EarningStatus) -> EngineResult<()> {
    if earning_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            entity: "earning",
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// Move `earning` to `to`, stamping `updated_at` and appending a note.
/// Returns the previous status.
pub(crate) fn transition_earning(
    earning: &mut Earning,
    to: EarningStatus,
    actor: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> EngineResult<EarningStatus> {
    let from = earning.status;
    check_earning_transition(from, to)?;
    earning.status = to;
    earning.updated_at = now;
    earning.push_note(note_line(
        now,
        actor,
        &format!("{} -> {}: {}", from.as_str(), to.as_str(), reason),
    ));
    Ok(from)
}

/// Audit record for a status change. `extra` keys are merged into the payload.
pub(crate) fn status_changed_action(
    now: DateTime<Utc>,
    actor: &str,
    earning: &Earning,
    from: EarningStatus,
    reason: &str,
    extra: Value,
) -> AuditAction {
    let mut payload = json!({
        "partner_id": earning.partner_id,
        "from": from.as_str(),
        "to": earning.status.as_str(),
        "amount": earning.amount_earned,
        "currency": earning.currency,
        "reason": reason,
    });
    if let (Some(dst), Value::Object(src)) = (payload.as_object_mut(), extra) {
        dst.extend(src);
    }
    AuditAction::new(
        now,
        actor,
        "earning",
        earning.id,
        "EARNING_STATUS_CHANGED",
        payload,
    )
}
