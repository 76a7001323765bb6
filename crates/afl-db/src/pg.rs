//! Postgres store (sqlx).
//!
//! One sqlx transaction per unit of work. Earning reads take `FOR UPDATE`
//! so two settlements touching the same row serialise. Status columns are
//! upper-case text checked by the schema; money columns are NUMERIC(20,2).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use afl_schemas::{
    AffiliateLink, BatchStatus, CommissionBatch, CommissionStructure, Earning, EarningStatus,
    Invoice, InvoiceLineItem, InvoiceStatus, Money, Offer, Partner, PartnerCategory, PaymentMethod,
    Payout, PayoutStatus,
};

use crate::{EarningFilter, JobLock, Store, UnitOfWork, UnsupportedStructure, ENV_DB_URL};

/// Connect to Postgres using AFL_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_earnings_table: bool,
}

/// Connectivity + schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='earnings'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_earnings_table: exists,
    })
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await.context("begin transaction failed")?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

#[async_trait]
impl JobLock for PgStore {
    async fn try_acquire(&self, key: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert into job_locks (lock_key, holder, acquired_at)
            values ($1, $2, $3)
            on conflict (lock_key) do nothing
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("job lock acquire failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn release(&self, key: &str) -> Result<()> {
        sqlx::query("delete from job_locks where lock_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("job lock release failed")?;
        Ok(())
    }

    async fn release_stale(&self, before: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as::<_, (String,)>(
            "delete from job_locks where acquired_at < $1 returning lock_key",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .context("job lock stale release failed")?;
        let mut keys: Vec<String> = rows.into_iter().map(|(k,)| k).collect();
        keys.sort();
        Ok(keys)
    }

    async fn release_if_stale(&self, key: &str, before: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query("delete from job_locks where lock_key = $1 and acquired_at < $2")
            .bind(key)
            .bind(before)
            .execute(&self.pool)
            .await
            .context("job lock stale eviction failed")?;
        Ok(res.rows_affected() == 1)
    }
}

struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn money(row: &PgRow, col: &str) -> Result<Money> {
    let d: Decimal = row.try_get(col)?;
    Money::try_from(d).with_context(|| format!("column {col}"))
}

fn partner_from_row(row: &PgRow) -> Result<Partner> {
    Ok(Partner {
        id: row.try_get("partner_id")?,
        name: row.try_get("name")?,
        category: PartnerCategory::parse(&row.try_get::<String, _>("category")?)?,
        commission_rate_override: row.try_get("commission_rate_override")?,
        is_active: row.try_get("is_active")?,
        contact_metadata: row.try_get("contact_metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn link_from_row(row: &PgRow) -> Result<AffiliateLink> {
    Ok(AffiliateLink {
        id: row.try_get("link_id")?,
        partner_id: row.try_get("partner_id")?,
        offer_id: row.try_get("offer_id")?,
        tracking_code: row.try_get("tracking_code")?,
        is_active: row.try_get("is_active")?,
    })
}

fn structure_from_json(raw: Value) -> Result<CommissionStructure> {
    let tag = raw
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("<missing>")
        .to_string();
    serde_json::from_value(raw)
        .map_err(|e| anyhow::Error::new(UnsupportedStructure(format!("{tag}: {e}"))))
}

fn offer_from_row(row: &PgRow) -> Result<Offer> {
    Ok(Offer {
        id: row.try_get("offer_id")?,
        partner_id: row.try_get("partner_id")?,
        name: row.try_get("name")?,
        commission_structure: structure_from_json(row.try_get("commission_structure")?)?,
        valid_from: row.try_get("valid_from")?,
        valid_to: row.try_get("valid_to")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn earning_from_row(row: &PgRow) -> Result<Earning> {
    let notes: Json<Vec<String>> = row.try_get("notes")?;
    Ok(Earning {
        id: row.try_get("earning_id")?,
        partner_id: row.try_get("partner_id")?,
        offer_id: row.try_get("offer_id")?,
        link_id: row.try_get("link_id")?,
        booking_id: row.try_get("booking_id")?,
        booking_value: money(row, "booking_value")?,
        amount_earned: money(row, "amount_earned")?,
        currency: row.try_get("currency")?,
        status: EarningStatus::parse(&row.try_get::<String, _>("status")?)?,
        notes: notes.0,
        transaction_date: row.try_get("transaction_date")?,
        split_from: row.try_get("split_from")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn batch_from_row(row: &PgRow) -> Result<CommissionBatch> {
    Ok(CommissionBatch {
        id: row.try_get("batch_id")?,
        batch_date: row.try_get("batch_date")?,
        total_commissions: money(row, "total_commissions")?,
        processed_count: row.try_get("processed_count")?,
        skipped_count: row.try_get("skipped_count")?,
        status: BatchStatus::parse(&row.try_get::<String, _>("status")?)?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn payout_from_row(row: &PgRow) -> Result<Payout> {
    Ok(Payout {
        id: row.try_get("payout_id")?,
        partner_id: row.try_get("partner_id")?,
        amount: money(row, "amount")?,
        currency: row.try_get("currency")?,
        status: PayoutStatus::parse(&row.try_get::<String, _>("status")?)?,
        payment_method: PaymentMethod::parse(&row.try_get::<String, _>("payment_method")?)?,
        invoice_id: row.try_get("invoice_id")?,
        transaction_id: row.try_get("transaction_id")?,
        failure_reason: row.try_get("failure_reason")?,
        requested_at: row.try_get("requested_at")?,
        processed_at: row.try_get("processed_at")?,
        payout_date: row.try_get("payout_date")?,
    })
}

fn invoice_from_row(row: &PgRow) -> Result<Invoice> {
    let items: Json<Vec<InvoiceLineItem>> = row.try_get("line_items")?;
    Ok(Invoice {
        id: row.try_get("invoice_id")?,
        partner_id: row.try_get("partner_id")?,
        payout_id: row.try_get("payout_id")?,
        invoice_number: row.try_get("invoice_number")?,
        line_items: items.0,
        amount_due: money(row, "amount_due")?,
        currency: row.try_get("currency")?,
        status: InvoiceStatus::parse(&row.try_get::<String, _>("status")?)?,
        issued_at: row.try_get("issued_at")?,
    })
}

const EARNING_COLUMNS: &str = r#"
    earning_id, partner_id, offer_id, link_id, booking_id, booking_value, amount_earned,
    currency, status, notes, transaction_date, split_from, created_at, updated_at
"#;

const EARNING_ORDER: &str = "order by transaction_date asc, created_at asc, earning_id asc";

const BATCH_COLUMNS: &str = r#"
    batch_id, batch_date, total_commissions, processed_count, skipped_count, status,
    error_message, started_at, completed_at
"#;

const PAYOUT_COLUMNS: &str = r#"
    payout_id, partner_id, amount, currency, status, payment_method, invoice_id,
    transaction_id, failure_reason, requested_at, processed_at, payout_date
"#;

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn partner(&mut self, id: Uuid) -> Result<Option<Partner>> {
        let row = sqlx::query(
            r#"
            select partner_id, name, category, commission_rate_override, is_active,
                   contact_metadata, created_at
            from partners
            where partner_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .context("fetch partner failed")?;
        row.as_ref().map(partner_from_row).transpose()
    }

    async fn insert_partner(&mut self, p: &Partner) -> Result<()> {
        sqlx::query(
            r#"
            insert into partners (
              partner_id, name, category, commission_rate_override, is_active,
              contact_metadata, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(p.id)
        .bind(&p.name)
        .bind(p.category.as_str())
        .bind(p.commission_rate_override)
        .bind(p.is_active)
        .bind(&p.contact_metadata)
        .bind(p.created_at)
        .execute(&mut *self.tx)
        .await
        .context("insert partner failed")?;
        Ok(())
    }

    async fn save_partner(&mut self, p: &Partner) -> Result<()> {
        sqlx::query(
            r#"
            update partners
            set name = $2, category = $3, commission_rate_override = $4,
                is_active = $5, contact_metadata = $6
            where partner_id = $1
            "#,
        )
        .bind(p.id)
        .bind(&p.name)
        .bind(p.category.as_str())
        .bind(p.commission_rate_override)
        .bind(p.is_active)
        .bind(&p.contact_metadata)
        .execute(&mut *self.tx)
        .await
        .context("update partner failed")?;
        Ok(())
    }

    async fn link(&mut self, id: Uuid) -> Result<Option<AffiliateLink>> {
        let row = sqlx::query(
            r#"
            select link_id, partner_id, offer_id, tracking_code, is_active
            from affiliate_links
            where link_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .context("fetch link failed")?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn insert_link(&mut self, l: &AffiliateLink) -> Result<()> {
        sqlx::query(
            r#"
            insert into affiliate_links (link_id, partner_id, offer_id, tracking_code, is_active)
            values ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(l.id)
        .bind(l.partner_id)
        .bind(l.offer_id)
        .bind(&l.tracking_code)
        .bind(l.is_active)
        .execute(&mut *self.tx)
        .await
        .context("insert link failed")?;
        Ok(())
    }

    async fn offer(&mut self, id: Uuid) -> Result<Option<Offer>> {
        let row = sqlx::query(
            r#"
            select offer_id, partner_id, name, commission_structure, valid_from, valid_to,
                   is_active, created_at, updated_at
            from offers
            where offer_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .context("fetch offer failed")?;
        row.as_ref().map(offer_from_row).transpose()
    }

    async fn insert_offer(&mut self, o: &Offer) -> Result<()> {
        sqlx::query(
            r#"
            insert into offers (
              offer_id, partner_id, name, commission_structure, valid_from, valid_to,
              is_active, created_at, updated_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(o.id)
        .bind(o.partner_id)
        .bind(&o.name)
        .bind(Json(&o.commission_structure))
        .bind(o.valid_from)
        .bind(o.valid_to)
        .bind(o.is_active)
        .bind(o.created_at)
        .bind(o.updated_at)
        .execute(&mut *self.tx)
        .await
        .context("insert offer failed")?;
        Ok(())
    }

    async fn save_offer(&mut self, o: &Offer) -> Result<()> {
        sqlx::query(
            r#"
            update offers
            set name = $2, commission_structure = $3, valid_from = $4, valid_to = $5,
                is_active = $6, updated_at = $7
            where offer_id = $1
            "#,
        )
        .bind(o.id)
        .bind(&o.name)
        .bind(Json(&o.commission_structure))
        .bind(o.valid_from)
        .bind(o.valid_to)
        .bind(o.is_active)
        .bind(o.updated_at)
        .execute(&mut *self.tx)
        .await
        .context("update offer failed")?;
        Ok(())
    }

    async fn earning(&mut self, id: Uuid) -> Result<Option<Earning>> {
        let sql = format!("select {EARNING_COLUMNS} from earnings where earning_id = $1 for update");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .context("fetch earning failed")?;
        row.as_ref().map(earning_from_row).transpose()
    }

    async fn insert_earning(&mut self, e: &Earning) -> Result<()> {
        sqlx::query(
            r#"
            insert into earnings (
              earning_id, partner_id, offer_id, link_id, booking_id, booking_value,
              amount_earned, currency, status, notes, transaction_date, split_from,
              created_at, updated_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(e.id)
        .bind(e.partner_id)
        .bind(e.offer_id)
        .bind(e.link_id)
        .bind(&e.booking_id)
        .bind(e.booking_value.amount())
        .bind(e.amount_earned.amount())
        .bind(&e.currency)
        .bind(e.status.as_str())
        .bind(Json(&e.notes))
        .bind(e.transaction_date)
        .bind(e.split_from)
        .bind(e.created_at)
        .bind(e.updated_at)
        .execute(&mut *self.tx)
        .await
        .context("insert earning failed")?;
        Ok(())
    }

    async fn save_earning(&mut self, e: &Earning) -> Result<()> {
        let res = sqlx::query(
            r#"
            update earnings
            set amount_earned = $2, status = $3, notes = $4, updated_at = $5
            where earning_id = $1
            "#,
        )
        .bind(e.id)
        .bind(e.amount_earned.amount())
        .bind(e.status.as_str())
        .bind(Json(&e.notes))
        .bind(e.updated_at)
        .execute(&mut *self.tx)
        .await
        .context("update earning failed")?;
        if res.rows_affected() != 1 {
            return Err(anyhow!("earning {} does not exist", e.id));
        }
        Ok(())
    }

    async fn pending_earnings(&mut self) -> Result<Vec<Earning>> {
        let sql = format!("select {EARNING_COLUMNS} from earnings where status = 'PENDING' {EARNING_ORDER}");
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .context("fetch pending earnings failed")?;
        rows.iter().map(earning_from_row).collect()
    }

    async fn payable_earnings(&mut self, partner_id: Uuid, currency: &str) -> Result<Vec<Earning>> {
        let sql = format!(
            "select {EARNING_COLUMNS} from earnings \
             where partner_id = $1 and currency = $2 and status in ('PENDING','CONFIRMED') \
             {EARNING_ORDER} for update"
        );
        let rows = sqlx::query(&sql)
            .bind(partner_id)
            .bind(currency)
            .fetch_all(&mut *self.tx)
            .await
            .context("fetch payable earnings failed")?;
        rows.iter().map(earning_from_row).collect()
    }

    async fn partner_earnings(
        &mut self,
        partner_id: Uuid,
        filter: &EarningFilter,
    ) -> Result<Vec<Earning>> {
        let sql = format!(
            "select {EARNING_COLUMNS} from earnings \
             where partner_id = $1 \
               and ($2::text is null or status = $2) \
               and ($3::text is null or currency = $3) \
               and ($4::timestamptz is null or transaction_date >= $4) \
               and ($5::timestamptz is null or transaction_date < $5) \
             {EARNING_ORDER}"
        );
        let rows = sqlx::query(&sql)
            .bind(partner_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.currency.as_deref())
            .bind(filter.from)
            .bind(filter.to)
            .fetch_all(&mut *self.tx)
            .await
            .context("fetch partner earnings failed")?;
        rows.iter().map(earning_from_row).collect()
    }

    async fn batch(&mut self, id: Uuid) -> Result<Option<CommissionBatch>> {
        let sql = format!("select {BATCH_COLUMNS} from commission_batches where batch_id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .context("fetch batch failed")?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn insert_batch(&mut self, b: &CommissionBatch) -> Result<()> {
        sqlx::query(
            r#"
            insert into commission_batches (
              batch_id, batch_date, total_commissions, processed_count, skipped_count,
              status, error_message, started_at, completed_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(b.id)
        .bind(b.batch_date)
        .bind(b.total_commissions.amount())
        .bind(b.processed_count)
        .bind(b.skipped_count)
        .bind(b.status.as_str())
        .bind(&b.error_message)
        .bind(b.started_at)
        .bind(b.completed_at)
        .execute(&mut *self.tx)
        .await
        .context("insert batch failed")?;
        Ok(())
    }

    async fn save_batch(&mut self, b: &CommissionBatch) -> Result<()> {
        sqlx::query(
            r#"
            update commission_batches
            set total_commissions = $2, processed_count = $3, skipped_count = $4,
                status = $5, error_message = $6, completed_at = $7
            where batch_id = $1
            "#,
        )
        .bind(b.id)
        .bind(b.total_commissions.amount())
        .bind(b.processed_count)
        .bind(b.skipped_count)
        .bind(b.status.as_str())
        .bind(&b.error_message)
        .bind(b.completed_at)
        .execute(&mut *self.tx)
        .await
        .context("update batch failed")?;
        Ok(())
    }

    async fn recent_batches(&mut self, limit: i64) -> Result<Vec<CommissionBatch>> {
        let sql = format!(
            "select {BATCH_COLUMNS} from commission_batches \
             order by started_at desc, batch_id desc limit $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await
            .context("list batches failed")?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn stale_batches(&mut self, before: DateTime<Utc>) -> Result<Vec<CommissionBatch>> {
        let sql = format!(
            "select {BATCH_COLUMNS} from commission_batches \
             where status = 'PROCESSING' and started_at < $1 \
             order by started_at asc for update"
        );
        let rows = sqlx::query(&sql)
            .bind(before)
            .fetch_all(&mut *self.tx)
            .await
            .context("fetch stale batches failed")?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn payout(&mut self, id: Uuid) -> Result<Option<Payout>> {
        let sql = format!("select {PAYOUT_COLUMNS} from payouts where payout_id = $1 for update");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .context("fetch payout failed")?;
        row.as_ref().map(payout_from_row).transpose()
    }

    async fn insert_payout(&mut self, p: &Payout) -> Result<()> {
        sqlx::query(
            r#"
            insert into payouts (
              payout_id, partner_id, amount, currency, status, payment_method, invoice_id,
              transaction_id, failure_reason, requested_at, processed_at, payout_date
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(p.id)
        .bind(p.partner_id)
        .bind(p.amount.amount())
        .bind(&p.currency)
        .bind(p.status.as_str())
        .bind(p.payment_method.as_str())
        .bind(p.invoice_id)
        .bind(&p.transaction_id)
        .bind(&p.failure_reason)
        .bind(p.requested_at)
        .bind(p.processed_at)
        .bind(p.payout_date)
        .execute(&mut *self.tx)
        .await
        .context("insert payout failed")?;
        Ok(())
    }

    async fn save_payout(&mut self, p: &Payout) -> Result<()> {
        sqlx::query(
            r#"
            update payouts
            set status = $2, invoice_id = $3, transaction_id = $4, failure_reason = $5,
                processed_at = $6, payout_date = $7
            where payout_id = $1
            "#,
        )
        .bind(p.id)
        .bind(p.status.as_str())
        .bind(p.invoice_id)
        .bind(&p.transaction_id)
        .bind(&p.failure_reason)
        .bind(p.processed_at)
        .bind(p.payout_date)
        .execute(&mut *self.tx)
        .await
        .context("update payout failed")?;
        Ok(())
    }

    async fn pending_payouts(&mut self) -> Result<Vec<Payout>> {
        let sql = format!(
            "select {PAYOUT_COLUMNS} from payouts where status = 'PENDING' \
             order by requested_at asc, payout_id asc"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .context("fetch pending payouts failed")?;
        rows.iter().map(payout_from_row).collect()
    }

    async fn stale_payouts(&mut self, before: DateTime<Utc>) -> Result<Vec<Payout>> {
        let sql = format!(
            "select {PAYOUT_COLUMNS} from payouts \
             where status = 'PROCESSING' and coalesce(processed_at, requested_at) < $1 \
             order by requested_at asc for update"
        );
        let rows = sqlx::query(&sql)
            .bind(before)
            .fetch_all(&mut *self.tx)
            .await
            .context("fetch stale payouts failed")?;
        rows.iter().map(payout_from_row).collect()
    }

    async fn invoice(&mut self, id: Uuid) -> Result<Option<Invoice>> {
        let row = sqlx::query(
            r#"
            select invoice_id, partner_id, payout_id, invoice_number, line_items, amount_due,
                   currency, status, issued_at
            from invoices
            where invoice_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .context("fetch invoice failed")?;
        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn insert_invoice(&mut self, i: &Invoice) -> Result<()> {
        sqlx::query(
            r#"
            insert into invoices (
              invoice_id, partner_id, payout_id, invoice_number, line_items, amount_due,
              currency, status, issued_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(i.id)
        .bind(i.partner_id)
        .bind(i.payout_id)
        .bind(&i.invoice_number)
        .bind(Json(&i.line_items))
        .bind(i.amount_due.amount())
        .bind(&i.currency)
        .bind(i.status.as_str())
        .bind(i.issued_at)
        .execute(&mut *self.tx)
        .await
        .context("insert invoice failed")?;
        Ok(())
    }

    async fn save_invoice(&mut self, i: &Invoice) -> Result<()> {
        sqlx::query("update invoices set status = $2 where invoice_id = $1")
            .bind(i.id)
            .bind(i.status.as_str())
            .execute(&mut *self.tx)
            .await
            .context("update invoice failed")?;
        Ok(())
    }

    async fn count_invoices_since(&mut self, since: DateTime<Utc>) -> Result<i64> {
        // Held until commit; two requests in the same month cannot draw the same number.
        sqlx::query("select pg_advisory_xact_lock(hashtext('afl.invoice_number'))")
            .execute(&mut *self.tx)
            .await
            .context("invoice numbering lock failed")?;

        let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
            "select count(*)::bigint from invoices where issued_at >= $1",
        )
        .bind(since)
        .fetch_one(&mut *self.tx)
        .await
        .context("count invoices failed")?;
        Ok(n)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("commit failed")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.context("rollback failed")?;
        Ok(())
    }
}
