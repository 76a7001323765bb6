use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use afl_db::UnsupportedStructure;
use afl_rail::RailError;
use afl_schemas::Money;

/// Every failure an engine operation can surface to its caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("partner not found: {0}")]
    PartnerNotFound(Uuid),
    #[error("offer not found: {0}")]
    OfferNotFound(Uuid),
    #[error("affiliate link not found: {0}")]
    LinkNotFound(Uuid),
    #[error("earning not found: {0}")]
    EarningNotFound(Uuid),
    #[error("payout not found: {0}")]
    PayoutNotFound(Uuid),

    #[error("offer {0} is inactive")]
    OfferInactive(Uuid),
    #[error("offer {offer_id} is outside its validity window at {at}")]
    OfferExpired { offer_id: Uuid, at: DateTime<Utc> },
    #[error("partner {0} is inactive")]
    PartnerInactive(Uuid),
    #[error("illegal {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },
    #[error("earning {id} is {status} and can no longer be adjusted")]
    NotAdjustable { id: Uuid, status: &'static str },
    #[error("job already running: {0}")]
    JobAlreadyRunning(String),
    #[error("unsupported commission structure: {0}")]
    UnsupportedStructureType(String),

    #[error("commission rate {rate} outside [{min}, {max}] for category {category}")]
    Compliance {
        category: &'static str,
        rate: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("insufficient funds: requested {requested} {currency}, available {available}")]
    InsufficientFunds {
        requested: Money,
        available: Money,
        currency: String,
    },
    #[error("payout {requested} is below the minimum of {minimum}")]
    BelowMinimum { requested: Money, minimum: Money },

    #[error(transparent)]
    Rail(#[from] RailError),

    #[error("audit sink failed: {0:#}")]
    Audit(anyhow::Error),
    #[error("store failure: {0:#}")]
    Store(anyhow::Error),
}

/// Coarse classification used by the CLI exit codes and by log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    State,
    Compliance,
    Funds,
    ExternalRail,
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::State => "state",
            ErrorKind::Compliance => "compliance",
            ErrorKind::Funds => "funds",
            ErrorKind::ExternalRail => "external_rail",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        use EngineError::*;
        match self {
            Validation(_) => ErrorKind::Validation,
            PartnerNotFound(_) | OfferNotFound(_) | LinkNotFound(_) | EarningNotFound(_)
            | PayoutNotFound(_) => ErrorKind::NotFound,
            OfferInactive(_)
            | OfferExpired { .. }
            | PartnerInactive(_)
            | InvalidTransition { .. }
            | NotAdjustable { .. }
            | JobAlreadyRunning(_)
            | UnsupportedStructureType(_) => ErrorKind::State,
            Compliance { .. } => ErrorKind::Compliance,
            InsufficientFunds { .. } | BelowMinimum { .. } => ErrorKind::Funds,
            Rail(_) => ErrorKind::ExternalRail,
            Audit(_) | Store(_) => ErrorKind::Infrastructure,
        }
    }
}

/// Store errors arrive as `anyhow`. An offer row whose structure cannot be
/// decoded keeps its own variant; everything else is infrastructure.
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<UnsupportedStructure>() {
            Ok(UnsupportedStructure(detail)) => EngineError::UnsupportedStructureType(detail),
            Err(other) => EngineError::Store(other),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_structure_survives_anyhow() {
        let err = anyhow::Error::new(UnsupportedStructure("type=bonus".into()));
        let e: EngineError = err.into();
        assert!(matches!(e, EngineError::UnsupportedStructureType(ref d) if d == "type=bonus"));
        assert_eq!(e.kind(), ErrorKind::State);
    }

    #[test]
    fn other_store_errors_are_infrastructure() {
        let e: EngineError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(e, EngineError::Store(_)));
        assert_eq!(e.kind(), ErrorKind::Infrastructure);
    }

    #[test]
    fn rail_errors_classify_as_external() {
        let e: EngineError = RailError::Transport("timeout".into()).into();
        assert_eq!(e.kind(), ErrorKind::ExternalRail);
        assert_eq!(e.to_string(), "rail transport error: timeout");
    }
}
