//! Deterministic in-memory rail.
//!
//! - Transfer id is `paper:transfer:{payout_id}` (or a sequence number when
//!   no payout id is given). No randomness, no timestamps.
//! - Submitting the same payout id twice returns the same id and records
//!   one transfer.
//! - `reject_with` / `fail_transport` make the next submissions fail, for
//!   exercising the FAILED payout path.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{check_request, PaymentRail, RailError, TransferId, TransferRequest};

#[derive(Default)]
struct PaperState {
    transfers: BTreeMap<String, TransferRequest>,
    seq: u64,
    failure: Option<RailError>,
}

#[derive(Default)]
pub struct PaperRail {
    state: Mutex<PaperState>,
}

impl PaperRail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every submission with this code until cleared.
    pub async fn reject_with(&self, code: &str, message: &str) {
        self.state.lock().await.failure = Some(RailError::Rejected {
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    pub async fn fail_transport(&self, message: &str) {
        self.state.lock().await.failure = Some(RailError::Transport(message.to_string()));
    }

    pub async fn clear_failure(&self) {
        self.state.lock().await.failure = None;
    }

    /// Accepted transfers keyed by transfer id.
    pub async fn transfers(&self) -> BTreeMap<String, TransferRequest> {
        self.state.lock().await.transfers.clone()
    }
}

#[async_trait]
impl PaymentRail for PaperRail {
    fn rail_name(&self) -> &'static str {
        "paper"
    }

    async fn submit_transfer(&self, req: TransferRequest) -> Result<TransferId, RailError> {
        check_request(&req)?;
        let mut st = self.state.lock().await;
        if let Some(err) = st.failure.clone() {
            return Err(err);
        }

        let id = match req.payout_id() {
            Some(pid) => format!("paper:transfer:{pid}"),
            None => {
                st.seq += 1;
                format!("paper:transfer:seq:{}", st.seq)
            }
        };
        st.transfers.entry(id.clone()).or_insert(req);
        Ok(TransferId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::META_PAYOUT_ID;

    fn req(payout: &str) -> TransferRequest {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_PAYOUT_ID.to_string(), payout.to_string());
        TransferRequest {
            amount_minor: 10_000,
            currency: "USD".into(),
            destination: "acct_1".into(),
            metadata,
        }
    }

    #[tokio::test]
    async fn same_payout_is_idempotent() {
        let rail = PaperRail::new();
        let a = rail.submit_transfer(req("p-1")).await.unwrap();
        let b = rail.submit_transfer(req("p-1")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.0, "paper:transfer:p-1");
        assert_eq!(rail.transfers().await.len(), 1);
    }

    #[tokio::test]
    async fn rejection_toggle() {
        let rail = PaperRail::new();
        rail.reject_with("account_closed", "destination closed").await;
        let err = rail.submit_transfer(req("p-2")).await.unwrap_err();
        assert!(matches!(err, RailError::Rejected { ref code, .. } if code == "account_closed"));
        rail.clear_failure().await;
        assert!(rail.submit_transfer(req("p-2")).await.is_ok());
    }
}
