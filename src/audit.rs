//! Audit trail
//!
//! Mutating operations receive an explicit [`AuditContext`] and emit an
//! [`AuditEntry`] through an [`AuditSink`]. Appends are fire-and-forget: a
//! sink failure is logged and never undoes the operation that produced it.

use crate::errors::{McpError, McpResult, SafeLock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

/// Who is acting, and from where. Threaded through every mutating call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditContext {
    pub actor_id: Option<String>,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_actor(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
            ..Self::default()
        }
    }

    pub fn system() -> Self {
        Self::for_actor("system")
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_client(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Actor id, or `"anonymous"`.
    pub fn actor_or_anonymous(&self) -> String {
        self.actor_id.clone().unwrap_or_else(|| "anonymous".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub action: String,
    pub actor_id: Option<String>,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub before: Value,
    pub after: Value,
    pub timestamp: DateTime<Utc>,
    pub compliance_flags: Vec<String>,
}

impl AuditEntry {
    pub fn new(action: impl Into<String>, ctx: &AuditContext, before: Value, after: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: action.into(),
            actor_id: ctx.actor_id.clone(),
            session_id: ctx.session_id.clone(),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            before,
            after,
            timestamp: Utc::now(),
            compliance_flags: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.compliance_flags = flags;
        self
    }
}

/// Narrow append-only write interface. Implementations must not block the
/// caller on I/O.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: AuditEntry) -> McpResult<()>;
}

/// Offer an entry to a sink, logging instead of failing.
pub fn offer(sink: &dyn AuditSink, entry: AuditEntry) {
    let action = entry.action.clone();
    if let Err(e) = sink.append(entry) {
        warn!("Audit append for '{}' failed: {}", action, e);
    }
}

/// Writes entries as structured `tracing` events.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, entry: AuditEntry) -> McpResult<()> {
        info!(
            target: "audit",
            action = %entry.action,
            actor = entry.actor_id.as_deref().unwrap_or("anonymous"),
            flags = ?entry.compliance_flags,
            "audit entry {}",
            entry.id
        );
        Ok(())
    }
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
    fail: bool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that refuses every append.
    pub fn failing() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.safe_lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.action).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: AuditEntry) -> McpResult<()> {
        if self.fail {
            return Err(McpError::audit("memory sink configured to fail"));
        }
        self.entries.safe_lock()?.push(entry);
        Ok(())
    }
}

/// One line of the hash-chained log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainedAuditLine {
    pub entry: Value,
    pub prev_hash: Option<String>,
    pub hash: String,
}

pub fn chain_hash(prev_hash: Option<&str>, entry_json: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(entry_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

enum WriterCommand {
    Append(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// Append-only JSONL file where each line carries the hash of the previous
/// one. Writes happen on a background task fed by an unbounded channel.
pub struct JsonlAuditSink {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl JsonlAuditSink {
    /// Open (or continue) a log. Must be called inside a Tokio runtime.
    pub fn open(path: impl AsRef<Path>) -> McpResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| McpError::io("create audit log directory", e))?;
        }
        let last_hash = read_last_hash(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| McpError::io("open audit log", e))?;

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| McpError::audit("audit writer requires a Tokio runtime"))?;
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(run_writer(file, last_hash, rx));

        info!("Audit log opened at {}", path.display());
        Ok(Self { path, tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every entry queued so far has been written.
    pub async fn flush(&self) -> McpResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(done_tx))
            .map_err(|_| McpError::audit("audit writer stopped"))?;
        done_rx.await.map_err(|_| McpError::audit("audit writer stopped"))
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, entry: AuditEntry) -> McpResult<()> {
        self.tx
            .send(WriterCommand::Append(entry))
            .map_err(|_| McpError::audit("audit writer stopped"))
    }
}

fn read_last_hash(path: &Path) -> McpResult<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = std::fs::File::open(path).map_err(|e| McpError::io("read audit log", e))?;
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| McpError::io("read audit log", e))?;
        if line.trim().is_empty() {
            continue;
        }
        last = Some(line);
    }
    match last {
        Some(line) => {
            let parsed: ChainedAuditLine = serde_json::from_str(&line)
                .map_err(|e| McpError::serialization("last audit line", e))?;
            Ok(Some(parsed.hash))
        }
        None => Ok(None),
    }
}

async fn run_writer(
    mut file: std::fs::File,
    mut last_hash: Option<String>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Append(entry) => match write_line(&mut file, last_hash.as_deref(), &entry) {
                Ok(hash) => last_hash = Some(hash),
                Err(e) => warn!("Dropping audit entry {}: {}", entry.id, e),
            },
            WriterCommand::Flush(done) => {
                if let Err(e) = file.flush() {
                    warn!("Audit log flush failed: {}", e);
                }
                let _ = done.send(());
            }
        }
    }
}

fn write_line(file: &mut std::fs::File, prev_hash: Option<&str>, entry: &AuditEntry) -> McpResult<String> {
    let value = serde_json::to_value(entry).map_err(|e| McpError::serialization("audit entry", e))?;
    let entry_json = serde_json::to_string(&value).map_err(|e| McpError::serialization("audit entry", e))?;
    let hash = chain_hash(prev_hash, &entry_json);
    let line = ChainedAuditLine {
        entry: value,
        prev_hash: prev_hash.map(str::to_string),
        hash: hash.clone(),
    };
    let text = serde_json::to_string(&line).map_err(|e| McpError::serialization("audit line", e))?;
    writeln!(file, "{text}").map_err(|e| McpError::io("append audit line", e))?;
    Ok(hash)
}
