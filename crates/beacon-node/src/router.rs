use std::num::NonZeroUsize;
use std::time::Duration;

use beacon_codec::{InboundRecord, MessageRecord, RecordFields};
use beacon_core::{PeerAddress, PeerId};
use lru::LruCache;

use crate::ack::{note_visible, process_inbound_acks};
use crate::config::millis;
use crate::directory::{check_online_transition, parse_service_name, validate_session};
use crate::events::{EngineEvent, PeerView};
use crate::state::{EngineState, ReceivedEntry};
use crate::sync::{force_sync_check, process_sync_record, SyncOutcome};

/// Short-window cache of recently seen record keys.
#[derive(Debug)]
pub struct DedupCache {
    seen: LruCache<String, u64>,
    window_ms: u64,
}

impl DedupCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
            window_ms: millis(window),
        }
    }

    /// Returns true if `key` was already seen within the window.
    pub fn check_and_insert(&mut self, key: String, now: u64) -> bool {
        if let Some(seen_at) = self.seen.peek(&key) {
            if now.saturating_sub(*seen_at) < self.window_ms {
                return true;
            }
        }
        self.seen.put(key, now);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

/// What happened to one observed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Malformed,
    SelfOriginated,
    Stale,
    Duplicate,
    SessionRejected,
    /// A message record addressed to another device.
    NotAddressed,
    Delivered,
}

fn dedup_key(record: &InboundRecord) -> String {
    format!(
        "{}|{}|{}|{}",
        record.header().sender,
        record.header().epoch,
        record.kind().as_wire(),
        record.dedup_discriminator()
    )
}

/// Classifies an observed record and feeds it to the engine components.
pub fn route_record(
    state: &mut EngineState,
    address: &PeerAddress,
    fields: &RecordFields,
    now: u64,
) -> RouteOutcome {
    let record = match InboundRecord::decode(fields) {
        Ok(record) => record,
        Err(err) => {
            tracing::debug!(%address, %err, "dropping malformed record");
            return RouteOutcome::Malformed;
        }
    };
    let header = record.header().clone();
    if header.sender == state.local.peer_id {
        return RouteOutcome::SelfOriginated;
    }
    if let InboundRecord::Message(msg) = &record {
        let age = now.saturating_sub(header.timestamp_ms);
        if age > millis(state.config.max_message_age) {
            tracing::debug!(%address, id = %msg.message_id, age, "dropping stale message record");
            return RouteOutcome::Stale;
        }
    }
    if state.dedup.check_and_insert(dedup_key(&record), now) {
        if let InboundRecord::Message(msg) = &record {
            note_visible(state, &header.sender, &msg.message_id, now);
        }
        return RouteOutcome::Duplicate;
    }

    let history = state.config.live_history_capacity;
    let (_, created) = state.directory.get_or_create(address, None, now, history);
    state.directory.bind_peer_id(address, &header.sender);
    let Some(peer) = state.directory.get_mut(address) else {
        return RouteOutcome::Malformed;
    };
    if !validate_session(peer, &mut state.ledger, &header.epoch, now).accepted() {
        return RouteOutcome::SessionRejected;
    }
    peer.touch(now);
    if let InboundRecord::Presence(presence) = &record {
        if !presence.display_name.is_empty() {
            peer.display_name = presence.display_name.clone();
        }
    }
    let threshold = millis(state.config.online_threshold);
    let transition = check_online_transition(peer, now, threshold);
    let display_name = peer.display_name.clone();
    state
        .ledger
        .touch_identity(&header.sender, &display_name, address, now);
    if created {
        emit_peer_view(state, address, now, true);
    }

    let outcome = dispatch(state, address, &header.sender, &record, now, created);

    if let Some(online) = transition {
        state.emit(EngineEvent::OnlineStatusChanged {
            address: address.clone(),
            peer_id: Some(header.sender.clone()),
            online,
        });
        if online {
            force_sync_check(state, &header.sender, now);
        }
    }
    outcome
}

fn dispatch(
    state: &mut EngineState,
    address: &PeerAddress,
    sender: &PeerId,
    record: &InboundRecord,
    now: u64,
    created: bool,
) -> RouteOutcome {
    match record {
        InboundRecord::Presence(presence) => {
            if let Some(peer) = state.directory.get_mut(address) {
                peer.prev_heartbeat_seq = peer.heartbeat_seq;
                peer.heartbeat_seq = presence.heartbeat_seq;
                peer.last_heartbeat_at = Some(now);
            }
            process_inbound_acks(state, sender, &presence.acks, now);
            if !created {
                emit_peer_view(state, address, now, false);
            }
            RouteOutcome::Delivered
        }
        InboundRecord::Message(msg) => {
            process_inbound_acks(state, sender, &msg.acks, now);
            if msg
                .target
                .as_ref()
                .is_some_and(|t| *t != state.local.peer_id)
            {
                return RouteOutcome::NotAddressed;
            }
            handle_incoming_message(state, address, sender, msg, now);
            RouteOutcome::Delivered
        }
        InboundRecord::Ack(ack) => {
            process_inbound_acks(state, sender, &ack.acks, now);
            RouteOutcome::Delivered
        }
        InboundRecord::Sync(sync) => match process_sync_record(state, sender, sync, now) {
            SyncOutcome::NotAddressed => RouteOutcome::NotAddressed,
            SyncOutcome::Resent(_) | SyncOutcome::Synced => RouteOutcome::Delivered,
        },
    }
}

/// Adds a message to the peer's received history, once per message id.
fn handle_incoming_message(
    state: &mut EngineState,
    address: &PeerAddress,
    sender: &PeerId,
    msg: &MessageRecord,
    now: u64,
) {
    let in_ledger = state
        .ledger
        .get(sender)
        .is_some_and(|s| s.has_received(&msg.message_id));
    let Some(peer) = state.directory.get_mut(address) else {
        return;
    };
    peer.visible_incoming.insert(msg.message_id.clone(), now);

    if let Some(entry) = peer.find_received_mut(&msg.message_id) {
        // Still advertised after confirmation: the sender missed our acks.
        if entry.ack_confirmed {
            entry.ack_confirmed = false;
        }
        return;
    }
    peer.received.push(ReceivedEntry::new(
        msg.message_id.clone(),
        msg.text.clone(),
        now,
    ));
    if in_ledger {
        tracing::debug!(
            id = %msg.message_id,
            peer = %sender,
            "message already delivered before restart"
        );
        return;
    }
    state
        .ledger
        .record_received(sender, msg.message_id.clone(), &msg.text, now);
    tracing::debug!(id = %msg.message_id, peer = %sender, "message received");
    state.emit(EngineEvent::MessageReceived {
        peer: sender.clone(),
        id: msg.message_id.clone(),
        text: msg.text.clone(),
    });
}

/// Handles a discoverable device name reported by the substrate.
pub fn observe_service_name(state: &mut EngineState, address: &PeerAddress, name: &str, now: u64) {
    let (display, has_app) = parse_service_name(name, &state.config.app_marker);
    let history = state.config.live_history_capacity;
    let (peer, created) = state.directory.get_or_create(address, None, now, history);
    let changed = peer.has_app != has_app || (!display.is_empty() && peer.display_name != display);
    peer.has_app = has_app;
    if !display.is_empty() {
        peer.display_name = display;
    }
    if created || changed {
        emit_peer_view(state, address, now, created);
    }
}

fn emit_peer_view(state: &mut EngineState, address: &PeerAddress, now: u64, found: bool) {
    let threshold = millis(state.config.online_threshold);
    let Some(view) = state
        .directory
        .get(address)
        .map(|p| PeerView::of(p, now, threshold))
    else {
        return;
    };
    state.emit(if found {
        EngineEvent::PeerFound(view)
    } else {
        EngineEvent::PeerUpdated(view)
    });
}
