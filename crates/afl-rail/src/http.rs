use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{check_request, PaymentRail, RailError, TransferId, TransferRequest};

/// JSON-over-HTTPS payment rail.
///
/// `POST {base_url}/v1/transfers` with a bearer key and the payout id as
/// `Idempotency-Key`. Requests are bounded by the configured timeout and
/// never retried. The API key is passed in by the caller; do not log it.
#[derive(Clone)]
pub struct HttpRail {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for HttpRail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRail")
            .field("base_url", &self.base_url)
            .field("api_key", &"<REDACTED>")
            .finish()
    }
}

impl HttpRail {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> Result<Self, RailError> {
        if base_url.trim().is_empty() {
            return Err(RailError::Config("payments.rail.base_url is empty".into()));
        }
        // The API version is appended per request.
        if base_url.trim_end_matches('/').ends_with("/v1") {
            return Err(RailError::Config(format!(
                "payments.rail.base_url must be the host root, not the /v1 path: {base_url}"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RailError::Config(format!("http client build failed: {e}")))?;
        Ok(Self {
            api_key,
            http,
            base_url,
        })
    }

    fn transfers_url(&self) -> String {
        format!("{}/v1/transfers", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct TransferBody<'a> {
    amount: i64,
    currency: &'a str,
    destination: &'a str,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    id: Option<String>,
    error: Option<RailApiError>,
}

#[derive(Debug, Deserialize)]
struct RailApiError {
    code: Option<String>,
    message: Option<String>,
}

#[async_trait]
impl PaymentRail for HttpRail {
    fn rail_name(&self) -> &'static str {
        "http"
    }

    async fn submit_transfer(&self, req: TransferRequest) -> Result<TransferId, RailError> {
        check_request(&req)?;

        let body = TransferBody {
            amount: req.amount_minor,
            currency: &req.currency,
            destination: &req.destination,
            metadata: &req.metadata,
        };

        let mut call = self
            .http
            .post(self.transfers_url())
            .bearer_auth(&self.api_key)
            .json(&body);
        if let Some(pid) = req.payout_id() {
            call = call.header("Idempotency-Key", pid);
        }

        let resp = call.send().await.map_err(|e| {
            if e.is_timeout() {
                RailError::Transport(format!("timeout: {e}"))
            } else {
                RailError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| RailError::Transport(format!("read body failed: {e}")))?;
        let parsed: Option<TransferResponse> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            let (code, message) = match parsed.and_then(|p| p.error) {
                Some(err) => (
                    err.code.unwrap_or_else(|| format!("http_{}", status.as_u16())),
                    err.message.unwrap_or_default(),
                ),
                None => (format!("http_{}", status.as_u16()), text),
            };
            tracing::warn!(status = status.as_u16(), %code, "rail refused transfer");
            return Err(RailError::Rejected { code, message });
        }

        match parsed.and_then(|p| p.id) {
            Some(id) if !id.trim().is_empty() => Ok(TransferId(id)),
            _ => Err(RailError::Decode(format!(
                "success response without transfer id: {text}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_base_url_is_config_error() {
        let err = HttpRail::new(" ".into(), "k".into(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RailError::Config(_)));
    }

    #[test]
    fn versioned_base_url_is_config_error() {
        for url in ["https://rail.test/v1", "https://rail.test/v1/"] {
            let err = HttpRail::new(url.into(), "k".into(), Duration::from_secs(1)).unwrap_err();
            assert!(matches!(err, RailError::Config(ref m) if m.contains("/v1")), "{url}");
        }
    }

    #[test]
    fn debug_redacts_key() {
        let rail = HttpRail::new("https://rail.test/".into(), "secret-key".into(), Duration::from_secs(1))
            .unwrap();
        let out = format!("{rail:?}");
        assert!(!out.contains("secret-key"));
        assert_eq!(rail.transfers_url(), "https://rail.test/v1/transfers");
    }
}
