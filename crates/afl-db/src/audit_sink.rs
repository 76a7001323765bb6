use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use afl_audit::{canonical_json_line, AuditAction, AuditChain, AuditEvent, AuditSink};

/// Advisory lock key serialising appends to `audit_events` ("afl-audi").
const AUDIT_APPEND_LOCK: i64 = 0x6166_6c2d_6175_6469;

/// Audit sink writing to the `audit_events` table.
///
/// Any number of processes may share the table. Each append takes a
/// transaction-scoped advisory lock, reads the current head and inserts
/// under that lock, so the chain never forks.
pub struct PgAuditSink {
    pool: PgPool,
    hash_chain: bool,
}

impl PgAuditSink {
    pub async fn open(pool: PgPool, hash_chain: bool) -> Result<Self> {
        sqlx::query("select 1 from audit_events limit 1")
            .execute(&pool)
            .await
            .context("audit_events table not reachable")?;
        Ok(Self { pool, hash_chain })
    }
}

async fn load_head(tx: &mut Transaction<'_, Postgres>, hash_chain: bool) -> Result<AuditChain> {
    let head: Option<(Option<String>, i64)> = sqlx::query_as::<_, (Option<String>, i64)>(
        r#"
        select hash_self, (select count(*)::bigint from audit_events)
        from audit_events
        order by seq desc
        limit 1
        "#,
    )
    .fetch_optional(&mut **tx)
    .await
    .context("load audit chain head failed")?;

    let mut chain = AuditChain::new(hash_chain);
    if let Some((hash, count)) = head {
        chain.resume(hash, u64::try_from(count).unwrap_or(0));
    }
    Ok(chain)
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn log_action(&self, action: AuditAction) -> Result<AuditEvent> {
        let mut tx = self.pool.begin().await.context("begin audit transaction failed")?;
        sqlx::query("select pg_advisory_xact_lock($1)")
            .bind(AUDIT_APPEND_LOCK)
            .execute(&mut *tx)
            .await
            .context("audit append lock failed")?;

        let ev = load_head(&mut tx, self.hash_chain).await?.seal(action)?;

        sqlx::query(
            r#"
            insert into audit_events (
              event_id, ts_utc, actor, entity_type, entity_id, action, payload,
              hash_prev, hash_self
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(ev.event_id)
        .bind(ev.ts_utc)
        .bind(&ev.actor)
        .bind(&ev.entity_type)
        .bind(&ev.entity_id)
        .bind(&ev.action)
        .bind(&ev.payload)
        .bind(&ev.hash_prev)
        .bind(&ev.hash_self)
        .execute(&mut *tx)
        .await
        .context("insert audit event failed")?;

        tx.commit().await.context("commit audit event failed")?;
        Ok(ev)
    }
}

type AuditRow = (
    Uuid,
    DateTime<Utc>,
    String,
    String,
    String,
    String,
    Value,
    Option<String>,
    Option<String>,
);

/// The whole `audit_events` table as canonical JSONL in append order, ready
/// for `afl_audit::verify_hash_chain_str`.
pub async fn export_audit_jsonl(pool: &PgPool) -> Result<String> {
    let rows: Vec<AuditRow> = sqlx::query_as(
        r#"
        select event_id, ts_utc, actor, entity_type, entity_id, action, payload,
               hash_prev, hash_self
        from audit_events
        order by seq asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("export audit events failed")?;

    let mut out = String::new();
    for (event_id, ts_utc, actor, entity_type, entity_id, action, payload, hash_prev, hash_self) in rows {
        let ev = AuditEvent {
            event_id,
            ts_utc,
            actor,
            entity_type,
            entity_id,
            action,
            payload,
            hash_prev,
            hash_self,
        };
        out.push_str(&canonical_json_line(&ev)?);
        out.push('\n');
    }
    Ok(out)
}
