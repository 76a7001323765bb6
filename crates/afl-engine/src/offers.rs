//! Offer catalogue. Every structure written here passes the shape checks
//! and the owning partner's category limits.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use afl_audit::AuditAction;
use afl_schemas::{CommissionStructure, Offer, Partner};

use crate::calculator::check_structure;
use crate::compliance::ComplianceValidator;
use crate::error::{EngineError, EngineResult};
use crate::EngineContext;

#[derive(Debug, Clone, PartialEq)]
pub struct NewOffer {
    pub partner_id: Uuid,
    pub name: String,
    pub commission_structure: CommissionStructure,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

pub struct OfferCatalog {
    ctx: EngineContext,
    compliance: ComplianceValidator,
}

impl OfferCatalog {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            compliance: ComplianceValidator::new(),
        }
    }

    fn vet(&self, partner: &Partner, structure: &CommissionStructure) -> EngineResult<()> {
        check_structure(structure)?;
        self.compliance.validate_structure(partner.category, structure)
    }

    pub async fn create_offer(&self, new: NewOffer, actor: &str) -> EngineResult<Offer> {
        if new.name.trim().is_empty() {
            return Err(EngineError::Validation("offer name is empty".into()));
        }
        if new.valid_from > new.valid_to {
            return Err(EngineError::Validation(format!(
                "offer validity window is reversed: {} > {}",
                new.valid_from, new.valid_to
            )));
        }
        let now = self.ctx.now();

        let mut uow = self.ctx.begin().await?;
        let partner = uow
            .partner(new.partner_id)
            .await?
            .ok_or(EngineError::PartnerNotFound(new.partner_id))?;
        self.vet(&partner, &new.commission_structure)?;

        let offer = Offer {
            id: Uuid::new_v4(),
            partner_id: partner.id,
            name: new.name,
            commission_structure: new.commission_structure,
            valid_from: new.valid_from,
            valid_to: new.valid_to,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        uow.insert_offer(&offer).await?;
        self.ctx
            .record(AuditAction::new(
                now,
                actor,
                "offer",
                offer.id,
                "OFFER_CREATED",
                json!({
                    "partner_id": offer.partner_id,
                    "category": partner.category.as_str(),
                    "structure": offer.commission_structure,
                    "valid_from": offer.valid_from,
                    "valid_to": offer.valid_to,
                }),
            ))
            .await?;
        uow.commit().await?;

        info!(offer_id = %offer.id, partner_id = %offer.partner_id, "offer created");
        Ok(offer)
    }

    /// Replace an offer's structure. Existing earnings keep their amounts;
    /// settlement prices PENDING ones against the new structure.
    pub async fn update_structure(
        &self,
        offer_id: Uuid,
        structure: CommissionStructure,
        actor: &str,
    ) -> EngineResult<Offer> {
        let now = self.ctx.now();

        let mut uow = self.ctx.begin().await?;
        let mut offer = uow
            .offer(offer_id)
            .await?
            .ok_or(EngineError::OfferNotFound(offer_id))?;
        let partner = uow
            .partner(offer.partner_id)
            .await?
            .ok_or(EngineError::PartnerNotFound(offer.partner_id))?;
        self.vet(&partner, &structure)?;

        let before = std::mem::replace(&mut offer.commission_structure, structure);
        offer.updated_at = now;
        uow.save_offer(&offer).await?;
        self.ctx
            .record(AuditAction::new(
                now,
                actor,
                "offer",
                offer.id,
                "OFFER_STRUCTURE_UPDATED",
                json!({
                    "before": before,
                    "after": offer.commission_structure,
                }),
            ))
            .await?;
        uow.commit().await?;

        info!(offer_id = %offer.id, kind = offer.commission_structure.kind_str(), "offer structure updated");
        Ok(offer)
    }

    pub async fn set_active(&self, offer_id: Uuid, active: bool, actor: &str) -> EngineResult<Offer> {
        let now = self.ctx.now();

        let mut uow = self.ctx.begin().await?;
        let mut offer = uow
            .offer(offer_id)
            .await?
            .ok_or(EngineError::OfferNotFound(offer_id))?;
        if offer.is_active == active {
            uow.rollback().await?;
            return Ok(offer);
        }
        offer.is_active = active;
        offer.updated_at = now;
        uow.save_offer(&offer).await?;
        self.ctx
            .record(AuditAction::new(
                now,
                actor,
                "offer",
                offer.id,
                if active { "OFFER_ACTIVATED" } else { "OFFER_DEACTIVATED" },
                json!({}),
            ))
            .await?;
        uow.commit().await?;
        Ok(offer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Fixture;
    use afl_schemas::{CommissionTier, PartnerCategory, TierKind};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn new_offer(fx: &Fixture, partner_id: Uuid, structure: CommissionStructure) -> NewOffer {
        NewOffer {
            partner_id,
            name: "reef snorkel".into(),
            commission_structure: structure,
            valid_from: fx.now(),
            valid_to: fx.now() + Duration::days(90),
        }
    }

    #[tokio::test]
    async fn create_checks_category_limits() {
        let fx = Fixture::new();
        let catalog = OfferCatalog::new(fx.ctx.clone());
        let p = fx.partner(PartnerCategory::TourOperator, None).await;

        let ok = catalog
            .create_offer(new_offer(&fx, p.id, CommissionStructure::Percentage { value: dec!(18) }), "ops")
            .await
            .unwrap();
        assert!(ok.is_active);

        let err = catalog
            .create_offer(new_offer(&fx, p.id, CommissionStructure::Percentage { value: dec!(12) }), "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Compliance { category: "TOUR_OPERATOR", .. }));

        let snap = fx.store.snapshot().await;
        assert_eq!(snap.offers.len(), 1);
    }

    #[tokio::test]
    async fn fixed_structures_skip_rate_limits() {
        let fx = Fixture::new();
        let catalog = OfferCatalog::new(fx.ctx.clone());
        let p = fx.partner(PartnerCategory::Restaurant, None).await;
        assert!(catalog
            .create_offer(new_offer(&fx, p.id, CommissionStructure::Fixed { value: dec!(40) }), "ops")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn update_rejects_non_compliant_tier() {
        let fx = Fixture::new();
        let catalog = OfferCatalog::new(fx.ctx.clone());
        let p = fx.partner(PartnerCategory::Transportation, None).await;
        let offer = catalog
            .create_offer(new_offer(&fx, p.id, CommissionStructure::Percentage { value: dec!(10) }), "ops")
            .await
            .unwrap();

        let bad = CommissionStructure::Tiered {
            tiers: vec![
                CommissionTier { threshold: dec!(0), kind: TierKind::Percentage, value: dec!(8) },
                CommissionTier { threshold: dec!(1000), kind: TierKind::Percentage, value: dec!(14) },
            ],
        };
        assert!(matches!(
            catalog.update_structure(offer.id, bad, "ops").await,
            Err(EngineError::Compliance { .. })
        ));

        let good = CommissionStructure::Tiered {
            tiers: vec![
                CommissionTier { threshold: dec!(0), kind: TierKind::Percentage, value: dec!(8) },
                CommissionTier { threshold: dec!(1000), kind: TierKind::Percentage, value: dec!(12) },
            ],
        };
        let updated = catalog.update_structure(offer.id, good.clone(), "ops").await.unwrap();
        assert_eq!(updated.commission_structure, good);
        let events = fx.audit.events_for("offer", &offer.id.to_string()).await;
        assert_eq!(events.last().unwrap().action, "OFFER_STRUCTURE_UPDATED");
    }

    #[tokio::test]
    async fn reversed_window_and_unknown_partner() {
        let fx = Fixture::new();
        let catalog = OfferCatalog::new(fx.ctx.clone());
        let mut n = new_offer(&fx, Uuid::new_v4(), CommissionStructure::Fixed { value: dec!(5) });
        assert!(matches!(
            catalog.create_offer(n.clone(), "ops").await,
            Err(EngineError::PartnerNotFound(_))
        ));

        // A single-instant window is inclusive on both ends, so it passes the
        // window check and fails on the partner lookup instead.
        n.valid_to = n.valid_from;
        assert!(matches!(
            catalog.create_offer(n.clone(), "ops").await,
            Err(EngineError::PartnerNotFound(_))
        ));

        n.valid_to = n.valid_from - Duration::seconds(1);
        assert!(matches!(
            catalog.create_offer(n, "ops").await,
            Err(EngineError::Validation(_))
        ));
    }
}
