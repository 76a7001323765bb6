//! afl-audit
//!
//! Append-only audit trail for every financial mutation: earning creation and
//! status changes, batch outcomes, payout lifecycle, invoice issuance.
//!
//! Events are JSON Lines with an optional SHA-256 hash chain (`hash_prev` +
//! `hash_self`). The engine talks to an [`AuditSink`]; this crate ships the
//! file sink and an in-memory sink for tests. A Postgres sink lives in
//! `afl-db`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Namespace for deterministic event ids.
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6166_6c2d_6175_6469_742d_6576_656e_7401);

/// One action to be recorded. The sink assigns id and chain hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditAction {
    pub ts_utc: DateTime<Utc>,
    /// Who caused it: `system`, `scheduler`, `cli:<user>`, a partner id...
    pub actor: String,
    /// `earning`, `payout`, `invoice`, `commission_batch`, `offer`.
    pub entity_type: String,
    pub entity_id: String,
    /// Upper-snake verb, e.g. `EARNING_STATUS_CHANGED`.
    pub action: String,
    pub payload: Value,
}

impl AuditAction {
    pub fn new(
        ts_utc: DateTime<Utc>,
        actor: impl Into<String>,
        entity_type: &str,
        entity_id: impl ToString,
        action: &str,
        payload: Value,
    ) -> Self {
        Self {
            ts_utc,
            actor: actor.into(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action: action.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    pub actor: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Chain state shared by every sink: last hash plus a sequence counter.
#[derive(Debug, Clone)]
pub struct AuditChain {
    hash_chain: bool,
    last_hash: Option<String>,
    seq: u64,
}

impl AuditChain {
    pub fn new(hash_chain: bool) -> Self {
        Self {
            hash_chain,
            last_hash: None,
            seq: 0,
        }
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Continue an existing log: the head's `hash_self` and how many events it holds.
    pub fn resume(&mut self, last_hash: Option<String>, seq: u64) {
        self.last_hash = last_hash;
        self.seq = seq;
    }

    /// Turn an action into a sealed event and advance the chain.
    pub fn seal(&mut self, action: AuditAction) -> Result<AuditEvent> {
        let event_id = derive_event_id(self.last_hash.as_deref(), &action, self.seq)?;
        self.seq += 1;

        let mut ev = AuditEvent {
            event_id,
            ts_utc: action.ts_utc,
            actor: action.actor,
            entity_type: action.entity_type,
            entity_id: action.entity_id,
            action: action.action,
            payload: action.payload,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            ev.hash_prev = self.last_hash.clone();
            let self_hash = compute_event_hash(&ev)?;
            ev.hash_self = Some(self_hash.clone());
            self.last_hash = Some(self_hash);
        }

        Ok(ev)
    }
}

/// Event ids are UUIDv5 over (previous hash, sequence, canonical action), so a
/// replayed log reproduces the same ids. No RNG.
fn derive_event_id(last_hash: Option<&str>, action: &AuditAction, seq: u64) -> Result<Uuid> {
    let body = canonical_json_line(action)?;
    let name = format!("{}|{}|{}", last_hash.unwrap_or("-"), seq, body);
    Ok(Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes()))
}

/// Append-only JSONL audit writer.
///
/// Several processes (daemon and CLI) may append to the same file. Each
/// append holds an exclusive advisory lock on the file and re-reads the chain
/// head whenever the file grew behind this writer's back.
pub struct AuditWriter {
    path: PathBuf,
    chain: AuditChain,
    /// File length as of the last append or resync by this writer.
    synced_len: u64,
}

impl AuditWriter {
    /// Creates the audit writer and ensures parent dirs exist.
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {:?}", parent))?;
        }
        Ok(Self {
            path,
            chain: AuditChain::new(hash_chain),
            synced_len: 0,
        })
    }

    /// Open an existing log and continue its chain.
    ///
    /// Refuses to resume a log whose chain is already broken.
    pub fn resume(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let mut w = Self::new(path, hash_chain)?;
        if !w.path.exists() {
            return Ok(w);
        }
        let content = fs::read_to_string(&w.path)
            .with_context(|| format!("read audit log {}", w.path.display()))?;
        if hash_chain {
            if let VerifyResult::Broken { line, reason } = verify_hash_chain_str(&content)? {
                bail!("AUDIT_CHAIN_BROKEN line={line} reason={reason}");
            }
        }
        w.sync_from(&content)?;
        Ok(w)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chain(&self) -> &AuditChain {
        &self.chain
    }

    pub fn append(&mut self, action: AuditAction) -> Result<AuditEvent> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open audit log {}", self.path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("lock audit log {}", self.path.display()))?;
        // The lock is released when `file` is dropped.
        self.append_locked(&mut file, action)
    }

    fn append_locked(&mut self, file: &mut File, action: AuditAction) -> Result<AuditEvent> {
        let len = file
            .metadata()
            .with_context(|| format!("stat audit log {}", self.path.display()))?
            .len();
        if len != self.synced_len {
            let mut content = String::new();
            file.read_to_string(&mut content)
                .with_context(|| format!("read audit log {}", self.path.display()))?;
            self.sync_from(&content)?;
        }

        // Seal a copy so a failed write does not advance the chain.
        let mut next = self.chain.clone();
        let ev = next.seal(action)?;
        let mut record = canonical_json_line(&ev)?;
        record.push('\n');
        file.write_all(record.as_bytes())
            .with_context(|| format!("append to audit log {}", self.path.display()))?;
        self.chain = next;
        self.synced_len = len + record.len() as u64;
        Ok(ev)
    }

    /// Point the chain at the last event in `content`.
    fn sync_from(&mut self, content: &str) -> Result<()> {
        let events = parse_lines(content)?;
        let count = events.len() as u64;
        let tip = events.into_iter().last().and_then(|(_, ev)| ev.hash_self);
        self.chain.resume(tip, count);
        self.synced_len = content.len() as u64;
        Ok(())
    }
}

/// Non-blank lines decoded as events, paired with their 1-based line number.
fn parse_lines(content: &str) -> Result<Vec<(usize, AuditEvent)>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, raw)| !raw.trim().is_empty())
        .map(|(idx, raw)| {
            serde_json::from_str::<AuditEvent>(raw.trim())
                .map(|ev| (idx + 1, ev))
                .with_context(|| format!("audit line {} is not an event", idx + 1))
        })
        .collect()
}

/// Compact JSON with object keys sorted at every depth. One event per line.
pub fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let value = serde_json::to_value(v).context("audit event to json")?;
    serde_json::to_string(&canonical(value)).context("audit json to string")
}

fn canonical(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let ordered: BTreeMap<String, Value> =
                map.into_iter().map(|(k, inner)| (k, canonical(inner))).collect();
            Value::Object(ordered.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        other => other,
    }
}

/// SHA-256 over the canonical line of the event with `hash_self` cleared.
pub fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let unsealed = AuditEvent {
        hash_self: None,
        ..ev.clone()
    };
    let digest = Sha256::digest(canonical_json_line(&unsealed)?.as_bytes());
    Ok(hex::encode(digest))
}

pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("read audit log {}", path.display()))?;
    verify_hash_chain_str(&content)
}

/// Same as [`verify_hash_chain`] over in-memory JSONL content.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let events = parse_lines(content)?;
    let mut expected_prev: Option<String> = None;

    for (line, ev) in &events {
        if ev.hash_prev != expected_prev {
            return Ok(VerifyResult::Broken {
                line: *line,
                reason: format!(
                    "hash_prev mismatch: event carries {:?}, previous event sealed {:?}",
                    ev.hash_prev, expected_prev
                ),
            });
        }
        if let Some(sealed) = &ev.hash_self {
            let actual = compute_event_hash(ev)?;
            if sealed != &actual {
                return Ok(VerifyResult::Broken {
                    line: *line,
                    reason: format!("hash_self mismatch: sealed {sealed}, content hashes to {actual}"),
                });
            }
        }
        expected_prev = ev.hash_self.clone();
    }

    Ok(VerifyResult::Valid {
        lines: events.len(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

// ---------------------------------------------------------------------------
// Sink port
// ---------------------------------------------------------------------------

/// Where the engine records audit events.
///
/// Implementations must be durable before returning `Ok`; the engine treats
/// an error as a failed mutation and rolls the unit of work back.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_action(&self, action: AuditAction) -> Result<AuditEvent>;
}

/// File-backed sink around [`AuditWriter`].
pub struct JsonlAuditSink {
    writer: Mutex<AuditWriter>,
}

impl JsonlAuditSink {
    pub fn new(writer: AuditWriter) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Resume (or create) the log at `path`.
    pub fn open(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        Ok(Self::new(AuditWriter::resume(path, hash_chain)?))
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn log_action(&self, action: AuditAction) -> Result<AuditEvent> {
        let mut w = self.writer.lock().await;
        w.append(action)
    }
}

/// In-memory sink for tests. `set_fail(true)` makes every call error.
pub struct MemoryAuditSink {
    inner: Mutex<MemoryAuditInner>,
    fail: AtomicBool,
}

struct MemoryAuditInner {
    chain: AuditChain,
    events: Vec<AuditEvent>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryAuditInner {
                chain: AuditChain::new(true),
                events: Vec::new(),
            }),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.inner.lock().await.events.clone()
    }

    /// Events for one entity, in append order.
    pub async fn events_for(&self, entity_type: &str, entity_id: &str) -> Vec<AuditEvent> {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect()
    }

    /// The log as JSONL, for chain verification.
    pub async fn to_jsonl(&self) -> Result<String> {
        let inner = self.inner.lock().await;
        let mut out = String::new();
        for ev in &inner.events {
            out.push_str(&canonical_json_line(ev)?);
            out.push('\n');
        }
        Ok(out)
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log_action(&self, action: AuditAction) -> Result<AuditEvent> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("audit sink unavailable");
        }
        let mut inner = self.inner.lock().await;
        let ev = inner.chain.seal(action)?;
        inner.events.push(ev.clone());
        Ok(ev)
    }
}
