use beacon_codec::RecordFields;
use beacon_core::{MessageId, PeerAddress, PeerId, SessionEpoch};
use beacon_transport::substrate::{RecordHandle, RequestId};
use serde::Serialize;

use crate::engine::EnginePhase;
use crate::state::{Peer, PendingOutboundMessage, ReceivedEntry, SentEntry, Slot};

/// Request the engine wants issued against the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstrateCommand {
    Publish {
        request: RequestId,
        name: String,
        fields: RecordFields,
    },
    Withdraw {
        handle: RecordHandle,
    },
    Discover,
}

/// Notification delivered to collaborators (UI, notifier) in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    PeerFound(PeerView),
    PeerUpdated(PeerView),
    PeerLost {
        address: PeerAddress,
        peer_id: Option<PeerId>,
    },
    OnlineStatusChanged {
        address: PeerAddress,
        peer_id: Option<PeerId>,
        online: bool,
    },
    StatusChanged(String),
    Error(String),
    MessageSent {
        id: MessageId,
        text: String,
        target: Option<PeerId>,
    },
    MessageReceived {
        peer: PeerId,
        id: MessageId,
        text: String,
    },
    AckReceived {
        peer: PeerId,
        id: MessageId,
    },
    SyncCompleted {
        peer: PeerId,
    },
}

/// Immutable copy of one peer's live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerView {
    pub address: PeerAddress,
    pub peer_id: Option<PeerId>,
    pub display_name: String,
    pub has_app: bool,
    pub online: bool,
    pub session_epoch: Option<SessionEpoch>,
    pub heartbeat_seq: u64,
    pub first_seen_at: u64,
    pub last_seen_at: u64,
    pub seen_count: u64,
    pub sent: Vec<SentEntry>,
    pub received: Vec<ReceivedEntry>,
}

impl PeerView {
    pub fn of(peer: &Peer, now: u64, online_threshold_ms: u64) -> Self {
        Self {
            address: peer.address.clone(),
            peer_id: peer.peer_id.clone(),
            display_name: peer.display_name.clone(),
            has_app: peer.has_app,
            online: peer.is_online(now, online_threshold_ms),
            session_epoch: peer.session_epoch.clone(),
            heartbeat_seq: peer.heartbeat_seq,
            first_seen_at: peer.first_seen_at,
            last_seen_at: peer.last_seen_at,
            seen_count: peer.seen_count,
            sent: peer.sent.iter().cloned().collect(),
            received: peer.received.iter().cloned().collect(),
        }
    }
}

/// Read-only copy of engine state handed to external observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub device_id: PeerId,
    pub session_epoch: SessionEpoch,
    pub phase: EnginePhase,
    pub heartbeat_seq: u64,
    pub pending_ack_count: usize,
    pub peers: Vec<PeerView>,
    pub pending: Vec<PendingOutboundMessage>,
    pub slots: Vec<Slot>,
    pub taken_at: u64,
}
