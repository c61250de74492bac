use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use beacon_core::{MessageId, PeerAddress, PeerId, SessionEpoch};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Format version of the persisted ledger document.
pub const LEDGER_VERSION: u32 = 1;

/// Errors returned by ledger persistence helpers.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to encode ledger: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode ledger: {0}")]
    Decode(serde_json::Error),
    #[error("failed to read ledger file: {0}")]
    Read(std::io::Error),
    #[error("failed to write ledger file: {0}")]
    Write(std::io::Error),
    #[error("ledger version {found} does not match expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSent {
    pub id: MessageId,
    pub text: String,
    pub sent_at: u64,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub acked_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecv {
    pub id: MessageId,
    pub text: String,
    pub received_at: u64,
    #[serde(default)]
    pub ack_confirmed: bool,
}

/// Durable per-peer record used for reconciliation across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedPeerState {
    pub name: String,
    pub address: Option<PeerAddress>,
    pub first_seen: u64,
    pub last_seen: u64,
    pub last_session_epoch: Option<SessionEpoch>,
    /// Most recent first.
    pub sent_history: Vec<PersistedSent>,
    /// Most recent first.
    pub recv_history: Vec<PersistedRecv>,
    pub last_sync_sent_at: Option<u64>,
    /// No new messages in either direction since the last reconciliation.
    pub synced: bool,
}

impl PersistedPeerState {
    pub fn sent_ids(&self) -> Vec<MessageId> {
        self.sent_history.iter().map(|e| e.id.clone()).collect()
    }

    pub fn recv_ids(&self) -> Vec<MessageId> {
        self.recv_history.iter().map(|e| e.id.clone()).collect()
    }

    pub fn has_received(&self, id: &MessageId) -> bool {
        self.recv_history.iter().any(|e| &e.id == id)
    }
}

/// On-disk shape of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub version: u32,
    pub local_peer_id: PeerId,
    pub local_session_epoch: SessionEpoch,
    pub saved_at: u64,
    #[serde(default)]
    pub peers: BTreeMap<PeerId, PersistedPeerState>,
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    version: u32,
}

/// Encodes a ledger document as pretty JSON.
pub fn encode_ledger(doc: &LedgerDocument) -> Result<Vec<u8>, LedgerError> {
    serde_json::to_vec_pretty(doc).map_err(LedgerError::Encode)
}

/// Decodes a ledger document, rejecting other format versions.
pub fn decode_ledger(bytes: &[u8]) -> Result<LedgerDocument, LedgerError> {
    let probe: VersionProbe = serde_json::from_slice(bytes).map_err(LedgerError::Decode)?;
    if probe.version != LEDGER_VERSION {
        return Err(LedgerError::VersionMismatch {
            found: probe.version,
            expected: LEDGER_VERSION,
        });
    }
    serde_json::from_slice(bytes).map_err(LedgerError::Decode)
}

/// Durable key-value slot holding one ledger document.
pub trait LedgerStore: Send {
    /// Returns `None` when nothing was saved yet.
    fn load(&self) -> Result<Option<LedgerDocument>, LedgerError>;
    fn save(&mut self, doc: &LedgerDocument) -> Result<(), LedgerError>;
}

/// Ledger stored as a JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileLedgerStore {
    path: PathBuf,
}

impl JsonFileLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for JsonFileLedgerStore {
    fn load(&self) -> Result<Option<LedgerDocument>, LedgerError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(LedgerError::Read)?;
        decode_ledger(&bytes).map(Some)
    }

    fn save(&mut self, doc: &LedgerDocument) -> Result<(), LedgerError> {
        let bytes = encode_ledger(doc)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(LedgerError::Write)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(LedgerError::Write)?;
        fs::rename(&tmp, &self.path).map_err(LedgerError::Write)
    }
}

/// In-memory store; clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryLedgerStore {
    /// Seeds the store with raw bytes, e.g. a document from another version.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Some(bytes))),
        }
    }

    pub fn raw(&self) -> Option<Vec<u8>> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<Option<LedgerDocument>, LedgerError> {
        match self.raw() {
            Some(bytes) => decode_ledger(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save(&mut self, doc: &LedgerDocument) -> Result<(), LedgerError> {
        let bytes = encode_ledger(doc)?;
        *self.bytes.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes);
        Ok(())
    }
}

/// In-memory model of the persisted ledger.
///
/// Mutations mark the model dirty; the engine saves it on a debounce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    peers: BTreeMap<PeerId, PersistedPeerState>,
    capacity: usize,
    dirty: bool,
}

impl Ledger {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: BTreeMap::new(),
            capacity,
            dirty: false,
        }
    }

    pub fn from_document(doc: LedgerDocument, capacity: usize) -> Self {
        let mut peers = doc.peers;
        for state in peers.values_mut() {
            state.sent_history.truncate(capacity);
            state.recv_history.truncate(capacity);
        }
        Self {
            peers,
            capacity,
            dirty: false,
        }
    }

    pub fn to_document(
        &self,
        local_peer_id: &PeerId,
        epoch: &SessionEpoch,
        now: u64,
    ) -> LedgerDocument {
        LedgerDocument {
            version: LEDGER_VERSION,
            local_peer_id: local_peer_id.clone(),
            local_session_epoch: epoch.clone(),
            saved_at: now,
            peers: self.peers.clone(),
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PersistedPeerState> {
        self.peers.get(peer_id)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn entry(&mut self, peer_id: &PeerId) -> &mut PersistedPeerState {
        self.peers.entry(peer_id.clone()).or_default()
    }

    /// Refreshes identity fields. Only non-timestamp changes mark the ledger dirty.
    pub fn touch_identity(
        &mut self,
        peer_id: &PeerId,
        name: &str,
        address: &PeerAddress,
        now: u64,
    ) {
        let created = !self.peers.contains_key(peer_id);
        let entry = self.entry(peer_id);
        let mut changed = created;
        if created {
            entry.first_seen = now;
        }
        if !name.is_empty() && entry.name != name {
            entry.name = name.to_string();
            changed = true;
        }
        if entry.address.as_ref() != Some(address) {
            entry.address = Some(address.clone());
            changed = true;
        }
        entry.last_seen = now;
        if changed {
            self.dirty = true;
        }
    }

    pub fn set_session_epoch(&mut self, peer_id: &PeerId, epoch: &SessionEpoch) {
        let entry = self.entry(peer_id);
        if entry.last_session_epoch.as_ref() != Some(epoch) {
            entry.last_session_epoch = Some(epoch.clone());
            self.dirty = true;
        }
    }

    pub fn record_sent(&mut self, peer_id: &PeerId, id: MessageId, text: &str, now: u64) {
        let capacity = self.capacity;
        let entry = self.entry(peer_id);
        entry.sent_history.retain(|e| e.id != id);
        entry.sent_history.insert(
            0,
            PersistedSent {
                id,
                text: text.to_string(),
                sent_at: now,
                acknowledged: false,
                acked_at: None,
            },
        );
        entry.sent_history.truncate(capacity);
        entry.synced = false;
        self.dirty = true;
    }

    pub fn record_received(&mut self, peer_id: &PeerId, id: MessageId, text: &str, now: u64) {
        let capacity = self.capacity;
        let entry = self.entry(peer_id);
        if entry.recv_history.iter().any(|e| e.id == id) {
            return;
        }
        entry.recv_history.insert(
            0,
            PersistedRecv {
                id,
                text: text.to_string(),
                received_at: now,
                ack_confirmed: false,
            },
        );
        entry.recv_history.truncate(capacity);
        entry.synced = false;
        self.dirty = true;
    }

    /// Returns true when an unacknowledged sent entry was updated.
    pub fn mark_acknowledged(&mut self, peer_id: &PeerId, id: &MessageId, now: u64) -> bool {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return false;
        };
        let Some(sent) = entry
            .sent_history
            .iter_mut()
            .find(|e| &e.id == id && !e.acknowledged)
        else {
            return false;
        };
        sent.acknowledged = true;
        sent.acked_at = Some(now);
        self.dirty = true;
        true
    }

    pub fn mark_ack_confirmed(&mut self, peer_id: &PeerId, id: &MessageId) -> bool {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return false;
        };
        let Some(recv) = entry
            .recv_history
            .iter_mut()
            .find(|e| &e.id == id && !e.ack_confirmed)
        else {
            return false;
        };
        recv.ack_confirmed = true;
        self.dirty = true;
        true
    }

    pub fn mark_sync_sent(&mut self, peer_id: &PeerId, now: u64) {
        self.entry(peer_id).last_sync_sent_at = Some(now);
        self.dirty = true;
    }

    pub fn mark_synced(&mut self, peer_id: &PeerId) {
        let entry = self.entry(peer_id);
        if !entry.synced {
            entry.synced = true;
            self.dirty = true;
        }
    }

    /// Drops one peer's histories (its session restarted).
    pub fn clear_history(&mut self, peer_id: &PeerId) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            if !entry.sent_history.is_empty() || !entry.recv_history.is_empty() {
                entry.sent_history.clear();
                entry.recv_history.clear();
                self.dirty = true;
            }
            entry.synced = false;
        }
    }

    /// Drops every message and sync record, keeping peer identity fields.
    pub fn clear_all_history(&mut self) {
        for entry in self.peers.values_mut() {
            entry.sent_history.clear();
            entry.recv_history.clear();
            entry.last_sync_sent_at = None;
            entry.synced = false;
        }
        self.dirty = true;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns whether the model changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }
}
