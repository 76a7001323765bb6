//! `afl offer ...`: catalogue writes go through the compliance checks.

use anyhow::{Context, Result};
use clap::Subcommand;

use afl_engine::{NewOffer, OfferCatalog};
use afl_schemas::CommissionStructure;

use super::{parse_instant, parse_uuid, print_json, GlobalArgs};

#[derive(Subcommand)]
pub enum OfferCmd {
    /// Create an offer for a partner
    Create {
        #[arg(long)]
        partner_id: String,

        #[arg(long)]
        name: String,

        /// Commission structure as tagged JSON, e.g.
        /// '{"type":"percentage","value":"12"}'
        #[arg(long)]
        structure: String,

        /// YYYY-MM-DD or RFC 3339
        #[arg(long)]
        valid_from: String,

        /// YYYY-MM-DD or RFC 3339
        #[arg(long)]
        valid_to: String,
    },

    /// Replace an offer's commission structure
    UpdateStructure {
        #[arg(long)]
        offer_id: String,

        #[arg(long)]
        structure: String,
    },

    Activate {
        #[arg(long)]
        offer_id: String,
    },

    Deactivate {
        #[arg(long)]
        offer_id: String,
    },
}

fn parse_structure(raw: &str) -> Result<CommissionStructure> {
    serde_json::from_str(raw.trim()).context("--structure must be a commission structure JSON object")
}

pub async fn run(global: &GlobalArgs, cmd: OfferCmd) -> Result<()> {
    let wired = global.connect().await?;
    let catalog = OfferCatalog::new(wired.ctx.clone());
    let actor = global.actor();

    let offer = match cmd {
        OfferCmd::Create {
            partner_id,
            name,
            structure,
            valid_from,
            valid_to,
        } => {
            let new = NewOffer {
                partner_id: parse_uuid(&partner_id, "partner_id")?,
                name,
                commission_structure: parse_structure(&structure)?,
                valid_from: parse_instant(&valid_from)?,
                valid_to: parse_instant(&valid_to)?,
            };
            catalog.create_offer(new, &actor).await?
        }
        OfferCmd::UpdateStructure { offer_id, structure } => {
            catalog
                .update_structure(
                    parse_uuid(&offer_id, "offer_id")?,
                    parse_structure(&structure)?,
                    &actor,
                )
                .await?
        }
        OfferCmd::Activate { offer_id } => {
            catalog
                .set_active(parse_uuid(&offer_id, "offer_id")?, true, &actor)
                .await?
        }
        OfferCmd::Deactivate { offer_id } => {
            catalog
                .set_active(parse_uuid(&offer_id, "offer_id")?, false, &actor)
                .await?
        }
    };
    print_json(&offer)
}
