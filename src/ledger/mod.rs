//! Verifiable event ledger
//!
//! Per-node append-only log of every significant coordination event.
//! Entries are hash-chained (SHA-256) and signed with the node's Ed25519
//! transport keypair, persisted as JSONL under the data directory, and
//! replicable to peers via the `replication` module.

pub mod replication;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libp2p::identity::{Keypair, PublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

pub use replication::{RangeRequest, ReplicaLog, ReplicaSet};

/// Event kinds recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    // Work coordination
    TaskAnnounced,
    TaskClaimed,
    TaskProgress,
    TaskHelpRequested,
    TaskHelpOffered,
    TaskHelpReceived,
    TaskCompleted,
    TaskFailed,

    // Meta-discussion
    PlanProposed,
    ObjectionRaised,
    Collaboration,
    ConsensusReached,
    Escalation,

    // System
    PeerJoined,
    PeerLeft,
    CapabilityBroadcast,
    NetworkEvent,
}

/// A single hash-chained ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Position in the chain, monotonic from 0
    pub index: u64,

    pub timestamp: DateTime<Utc>,

    /// Peer id of the authoring node
    pub author: String,

    pub event: LedgerEvent,

    pub payload: serde_json::Map<String, serde_json::Value>,

    /// `entry_hash` of the previous entry; empty for index 0
    pub prev_hash: String,

    /// SHA-256 over the entry minus `entry_hash` and `signature`
    pub entry_hash: String,

    /// Hex Ed25519 signature over `author:entry_hash:index`
    pub signature: String,
}

/// The fields covered by `entry_hash`, in fixed serialization order.
#[derive(Serialize)]
struct HashedFields<'a> {
    index: u64,
    timestamp: &'a DateTime<Utc>,
    author: &'a str,
    event: &'a LedgerEvent,
    payload: &'a serde_json::Map<String, serde_json::Value>,
    prev_hash: &'a str,
}

/// Compute the chain hash for an entry's content fields.
pub fn entry_hash(
    index: u64,
    timestamp: &DateTime<Utc>,
    author: &str,
    event: &LedgerEvent,
    payload: &serde_json::Map<String, serde_json::Value>,
    prev_hash: &str,
) -> Result<String, LedgerError> {
    let bytes = serde_json::to_vec(&HashedFields {
        index,
        timestamp,
        author,
        event,
        payload,
        prev_hash,
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// The bytes a signature covers.
fn signature_message(author: &str, hash: &str, index: u64) -> Vec<u8> {
    format!("{}:{}:{}", author, hash, index).into_bytes()
}

/// Verify an entry's signature against the author's public key.
pub fn verify_signature(entry: &LedgerEntry, author_key: &PublicKey) -> bool {
    let Ok(sig) = hex::decode(&entry.signature) else {
        return false;
    };
    author_key.verify(
        &signature_message(&entry.author, &entry.entry_hash, entry.index),
        &sig,
    )
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger io: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("integrity violation at entry {index}")]
    Integrity { index: u64 },

    #[error("ledger is compromised; refusing to append")]
    Compromised,

    #[error("entry {0} not found")]
    NotFound(u64),

    #[error("invalid range: start {start} > end {end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("signature rejected for entry {index}")]
    BadSignature { index: u64 },
}

struct LedgerInner {
    entries: Vec<LedgerEntry>,
    head_hash: String,
    writer: BufWriter<File>,
    /// Set when integrity verification fails; blocks further appends.
    compromised: bool,
}

/// Append-only verifiable ledger for one node.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<Mutex<LedgerInner>>,
    keypair: Keypair,
    author: String,
    path: PathBuf,
    head_tx: Arc<watch::Sender<u64>>,
}

impl Ledger {
    /// Open (or create) the ledger file and verify the stored chain.
    ///
    /// A chain that fails verification is a fatal open error; the node must
    /// not run against a compromised ledger.
    pub fn open(path: &Path, keypair: Keypair) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                entries.push(serde_json::from_str::<LedgerEntry>(&line)?);
            }
        }

        if let Err(index) = verify_chain(&entries) {
            error!(index, path = %path.display(), "Ledger chain verification failed");
            return Err(LedgerError::Integrity { index });
        }

        let head_hash = entries
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_default();

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let author = keypair.public().to_peer_id().to_string();
        let head_index = entries.len() as u64;
        let (head_tx, _) = watch::channel(head_index);

        info!(
            path = %path.display(),
            entries = entries.len(),
            "Ledger opened"
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(LedgerInner {
                entries,
                head_hash,
                writer: BufWriter::new(file),
                compromised: false,
            })),
            keypair,
            author,
            path: path.to_path_buf(),
            head_tx: Arc::new(head_tx),
        })
    }

    /// Peer id of the authoring node.
    pub fn author(&self) -> &str {
        &self.author
    }

    /// Public key entries from this ledger verify against.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a new entry, advancing the chain head.
    pub async fn append(
        &self,
        event: LedgerEvent,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut inner = self.inner.lock().await;
        if inner.compromised {
            return Err(LedgerError::Compromised);
        }

        let index = inner.entries.len() as u64;
        let timestamp = Utc::now();
        let prev_hash = inner.head_hash.clone();

        let hash = entry_hash(index, &timestamp, &self.author, &event, &payload, &prev_hash)?;
        let signature = self
            .keypair
            .sign(&signature_message(&self.author, &hash, index))
            .map_err(|e| LedgerError::Signing(e.to_string()))?;

        let entry = LedgerEntry {
            index,
            timestamp,
            author: self.author.clone(),
            event,
            payload,
            prev_hash,
            entry_hash: hash.clone(),
            signature: hex::encode(signature),
        };

        let line = serde_json::to_string(&entry)?;
        writeln!(inner.writer, "{}", line)?;
        inner.writer.flush()?;

        inner.entries.push(entry.clone());
        inner.head_hash = hash;

        debug!(index, event = ?event, "Ledger entry appended");

        // Wake replicators; nobody listening is fine.
        let _ = self.head_tx.send(index + 1);

        Ok(entry)
    }

    /// Retrieve an entry by index.
    pub async fn get(&self, index: u64) -> Result<LedgerEntry, LedgerError> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .get(index as usize)
            .cloned()
            .ok_or(LedgerError::NotFound(index))
    }

    /// Number of entries in the chain.
    pub async fn len(&self) -> u64 {
        self.inner.lock().await.entries.len() as u64
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Hash of the chain head; empty when the ledger is empty.
    pub async fn head_hash(&self) -> String {
        self.inner.lock().await.head_hash.clone()
    }

    /// Entries in `[start, end)`, clamped to the chain length.
    pub async fn range(&self, start: u64, end: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        let inner = self.inner.lock().await;
        let len = inner.entries.len() as u64;
        if start > end {
            return Err(LedgerError::InvalidRange { start, end });
        }
        if start >= len {
            return Ok(Vec::new());
        }
        let end = end.min(len);
        Ok(inner.entries[start as usize..end as usize].to_vec())
    }

    /// All entries of a given event kind.
    pub async fn by_event(&self, event: LedgerEvent) -> Vec<LedgerEntry> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|e| e.event == event)
            .cloned()
            .collect()
    }

    /// All entries authored by a given peer.
    pub async fn by_author(&self, author: &str) -> Vec<LedgerEntry> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|e| e.author == author)
            .cloned()
            .collect()
    }

    /// Re-verify the whole chain. On failure the ledger is marked
    /// compromised and all further appends are refused.
    pub async fn verify_integrity(&self) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        match verify_chain(&inner.entries) {
            Ok(()) => Ok(()),
            Err(index) => {
                inner.compromised = true;
                error!(index, "Ledger integrity violation; appends disabled");
                Err(LedgerError::Integrity { index })
            }
        }
    }

    /// Watch channel carrying the chain length; bumps on every append.
    pub fn subscribe_head(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }

    /// Entry counts grouped by event kind and by author.
    pub async fn stats(&self) -> LedgerStats {
        let inner = self.inner.lock().await;
        let mut by_event: HashMap<LedgerEvent, usize> = HashMap::new();
        let mut by_author: HashMap<String, usize> = HashMap::new();
        for entry in &inner.entries {
            *by_event.entry(entry.event).or_default() += 1;
            *by_author.entry(entry.author.clone()).or_default() += 1;
        }
        LedgerStats {
            total_entries: inner.entries.len(),
            head_hash: inner.head_hash.clone(),
            by_event,
            by_author,
        }
    }
}

/// Summary counters for diagnostics.
#[derive(Debug, Clone)]
pub struct LedgerStats {
    pub total_entries: usize,
    pub head_hash: String,
    pub by_event: HashMap<LedgerEvent, usize>,
    pub by_author: HashMap<String, usize>,
}

/// Verify hash-chain continuity and per-entry hashes.
///
/// Returns the first bad index on failure.
fn verify_chain(entries: &[LedgerEntry]) -> Result<(), u64> {
    let mut prev_hash = String::new();
    for (i, entry) in entries.iter().enumerate() {
        if entry.prev_hash != prev_hash {
            return Err(i as u64);
        }
        let computed = entry_hash(
            entry.index,
            &entry.timestamp,
            &entry.author,
            &entry.event,
            &entry.payload,
            &entry.prev_hash,
        )
        .map_err(|_| i as u64)?;
        if entry.entry_hash != computed {
            return Err(i as u64);
        }
        prev_hash = entry.entry_hash.clone();
    }
    Ok(())
}
