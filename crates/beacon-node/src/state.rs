use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;

use beacon_codec::{CodecError, RecordFields, RecordHeader};
use beacon_core::{MessageId, PeerAddress, PeerId, SessionEpoch};
use beacon_transport::substrate::RequestId;
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::directory::PeerDirectory;
use crate::events::{EngineEvent, SubstrateCommand};
use crate::persistence::Ledger;
use crate::registry::{RecordKey, RecordRegistry};
use crate::router::DedupCache;
use crate::scheduler::Scheduler;
use crate::slots::SlotTable;

/// Identity of the local engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub peer_id: PeerId,
    /// Generated once per process lifetime.
    pub epoch: SessionEpoch,
}

impl LocalIdentity {
    pub fn new(peer_id: PeerId, epoch: SessionEpoch) -> Self {
        Self { peer_id, epoch }
    }

    /// Prefix of every message id this session mints.
    pub fn session_prefix(&self) -> String {
        MessageId::session_prefix(&self.peer_id, &self.epoch)
    }

    pub fn owns(&self, id: &MessageId) -> bool {
        id.belongs_to(&self.peer_id, &self.epoch)
    }
}

/// Bounded most-recent-first history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundedHistory<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Inserts at the front, dropping the oldest entry beyond capacity.
    pub fn push(&mut self, entry: T) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    /// Most recent first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One message this device sent to a peer (live display history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentEntry {
    pub id: MessageId,
    pub text: String,
    pub sent_at: u64,
    pub slot: Option<u8>,
    pub acknowledged: bool,
    pub acked_at: Option<u64>,
    /// Ack ids that arrived in the same record as this entry's ack.
    pub ack_batch: Vec<MessageId>,
}

/// One message received from a peer (live display history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedEntry {
    pub id: MessageId,
    pub text: String,
    pub received_at: u64,
    pub ack_sent: bool,
    pub ack_sent_at: Option<u64>,
    pub ack_send_count: u32,
    /// Sender stopped advertising the message; no further acks needed.
    pub ack_confirmed: bool,
}

impl ReceivedEntry {
    pub fn new(id: MessageId, text: String, received_at: u64) -> Self {
        Self {
            id,
            text,
            received_at,
            ack_sent: false,
            ack_sent_at: None,
            ack_send_count: 0,
            ack_confirmed: false,
        }
    }
}

/// Live state of one remote participant, keyed by substrate address.
#[derive(Debug, Clone)]
pub struct Peer {
    pub address: PeerAddress,
    pub peer_id: Option<PeerId>,
    pub display_name: String,
    pub has_app: bool,
    pub session_epoch: Option<SessionEpoch>,
    pub heartbeat_seq: u64,
    pub prev_heartbeat_seq: u64,
    pub last_heartbeat_at: Option<u64>,
    pub first_seen_at: u64,
    pub last_seen_at: u64,
    pub seen_count: u64,
    /// Online value as of the last transition check.
    pub was_online: bool,
    pub sent: BoundedHistory<SentEntry>,
    pub received: BoundedHistory<ReceivedEntry>,
    /// Message ids this peer still advertises, with the last time seen.
    pub visible_incoming: HashMap<MessageId, u64>,
}

impl Peer {
    pub fn new(address: PeerAddress, now: u64, history_capacity: usize) -> Self {
        Self {
            address,
            peer_id: None,
            display_name: String::new(),
            has_app: false,
            session_epoch: None,
            heartbeat_seq: 0,
            prev_heartbeat_seq: 0,
            last_heartbeat_at: None,
            first_seen_at: now,
            last_seen_at: now,
            seen_count: 0,
            was_online: false,
            sent: BoundedHistory::new(history_capacity),
            received: BoundedHistory::new(history_capacity),
            visible_incoming: HashMap::new(),
        }
    }

    pub fn touch(&mut self, now: u64) {
        self.last_seen_at = now;
        self.seen_count += 1;
    }

    pub fn is_online(&self, now: u64, threshold_ms: u64) -> bool {
        now.saturating_sub(self.last_seen_at) < threshold_ms
    }

    /// Drops all session-scoped state: histories, visibility, heartbeat.
    pub fn reset_session_state(&mut self) {
        self.sent.clear();
        self.received.clear();
        self.visible_incoming.clear();
        self.heartbeat_seq = 0;
        self.prev_heartbeat_seq = 0;
        self.last_heartbeat_at = None;
    }

    pub fn find_sent_mut(&mut self, id: &MessageId) -> Option<&mut SentEntry> {
        self.sent.iter_mut().find(|e| &e.id == id)
    }

    pub fn find_received_mut(&mut self, id: &MessageId) -> Option<&mut ReceivedEntry> {
        self.received.iter_mut().find(|e| &e.id == id)
    }
}

/// Outbound message occupying a slot until acknowledged or released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOutboundMessage {
    pub id: MessageId,
    pub text: String,
    /// `None` for broadcast.
    pub target: Option<PeerId>,
    pub slot_index: u8,
    pub created_at: u64,
}

/// One publication unit for an in-flight outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub index: u8,
    pub message_id: Option<MessageId>,
    pub target: Option<PeerId>,
    pub created_at: u64,
    /// The substrate confirmed the slot record.
    pub published: bool,
    /// The first timeout already granted one extension.
    pub extended: bool,
}

impl Slot {
    pub fn empty(index: u8) -> Self {
        Self {
            index,
            message_id: None,
            target: None,
            created_at: 0,
            published: false,
            extended: false,
        }
    }

    pub fn is_free(&self) -> bool {
        self.message_id.is_none()
    }
}

/// Mutable engine state. All mutation happens on the engine's single owner.
pub struct EngineState {
    pub local: LocalIdentity,
    pub config: EngineConfig,
    pub directory: PeerDirectory,
    pub pending: HashMap<MessageId, PendingOutboundMessage>,
    pub slots: SlotTable,
    /// Acks already applied, per acknowledging peer (bounded).
    pub processed_acks: LruCache<(PeerId, MessageId), ()>,
    pub dedup: DedupCache,
    pub ledger: Ledger,
    pub registry: RecordRegistry,
    pub scheduler: Scheduler,
    pub message_counter: u64,
    pub heartbeat_seq: u64,
    /// Largest encoded record the substrate accepts.
    pub record_budget: usize,
    /// Substrate requests produced since the last drain.
    pub outbox: Vec<SubstrateCommand>,
    /// Notifications produced since the last drain, in order.
    pub events: Vec<EngineEvent>,
}

impl EngineState {
    pub fn new(local: LocalIdentity, config: EngineConfig) -> Self {
        let processed_cap = NonZeroUsize::new(config.processed_ack_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            directory: PeerDirectory::default(),
            pending: HashMap::new(),
            slots: SlotTable::new(config.max_slots),
            processed_acks: LruCache::new(processed_cap),
            dedup: DedupCache::new(config.dedup_capacity, config.dedup_window),
            ledger: Ledger::new(config.ledger_history_capacity),
            registry: RecordRegistry::default(),
            scheduler: Scheduler::default(),
            message_counter: 0,
            heartbeat_seq: 0,
            record_budget: beacon_codec::fields::MAX_RECORD_BYTES,
            outbox: Vec::new(),
            events: Vec::new(),
            local,
            config,
        }
    }

    pub fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Header for a record this engine publishes at `now`.
    pub fn header(&self, now: u64) -> RecordHeader {
        RecordHeader {
            sender: self.local.peer_id.clone(),
            epoch: self.local.epoch.clone(),
            timestamp_ms: now,
        }
    }

    /// Whether an encoded record can be handed to the substrate.
    pub fn fits(&self, encoded: &Result<RecordFields, CodecError>) -> bool {
        encoded
            .as_ref()
            .is_ok_and(|f| f.encoded_len() <= self.record_budget)
    }

    /// Registers and publishes an encoded record, logging encode failures.
    pub fn publish_record(
        &mut self,
        key: RecordKey,
        name: String,
        encoded: Result<RecordFields, CodecError>,
    ) -> Option<RequestId> {
        let fields = match encoded {
            Ok(fields) if fields.encoded_len() <= self.record_budget => fields,
            Ok(fields) => {
                tracing::warn!(
                    ?key,
                    size = fields.encoded_len(),
                    limit = self.record_budget,
                    "record exceeds substrate budget"
                );
                return None;
            }
            Err(err) => {
                tracing::warn!(?key, %err, "failed to encode record");
                return None;
            }
        };
        Some(self.registry.publish(key, name, fields, &mut self.outbox))
    }

    /// Received messages whose ack is still being advertised.
    pub fn pending_ack_count(&self) -> usize {
        self.directory
            .iter()
            .map(|p| p.received.iter().filter(|e| !e.ack_confirmed).count())
            .sum()
    }

    /// Clears every in-memory map. The ledger model is left to the caller.
    pub fn clear_runtime(&mut self) {
        self.directory = PeerDirectory::default();
        self.pending.clear();
        self.slots.clear();
        self.processed_acks.clear();
        self.dedup.clear();
        self.registry.forget_all();
        self.scheduler.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use beacon_core::{MessageId, PeerAddress};

    use super::{BoundedHistory, Peer, ReceivedEntry};

    #[test]
    fn bounded_history_keeps_most_recent_first() {
        let mut history = BoundedHistory::new(3);
        for i in 0..5 {
            history.push(i);
        }
        assert_eq!(history.iter().copied().collect::<Vec<_>>(), vec![4, 3, 2]);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn session_reset_clears_histories_and_heartbeat() {
        let mut peer = Peer::new(PeerAddress::new("aa"), 0, 10);
        peer.heartbeat_seq = 9;
        peer.prev_heartbeat_seq = 8;
        peer.received
            .push(ReceivedEntry::new(MessageId::from_wire("x_1_1"), "hi".into(), 1));
        peer.visible_incoming.insert(MessageId::from_wire("x_1_1"), 1);

        peer.reset_session_state();

        assert!(peer.received.is_empty());
        assert!(peer.visible_incoming.is_empty());
        assert_eq!(peer.heartbeat_seq, 0);
        assert_eq!(peer.prev_heartbeat_seq, 0);
    }

    #[test]
    fn online_is_strictly_below_threshold() {
        let mut peer = Peer::new(PeerAddress::new("aa"), 0, 10);
        peer.touch(1_000);
        assert!(peer.is_online(15_999, 15_000));
        assert!(!peer.is_online(16_000, 15_000));
        assert_eq!(peer.seen_count, 1);
    }
}
