//! Anti-entropy reconciliation with one peer at a time.
//!
//! Each side periodically advertises the bounded sent and received id lists
//! it keeps for a peer. The peer treats claimed-received ids as acks and
//! resends whatever it sent that the claim is missing and no ack covered.

use std::collections::HashSet;

use beacon_codec::SyncRecord;
use beacon_core::{MessageId, PeerId};

use crate::ack::process_inbound_acks;
use crate::config::millis;
use crate::events::EngineEvent;
use crate::persistence::PersistedPeerState;
use crate::registry::RecordKey;
use crate::scheduler::Task;
use crate::slots::resend;
use crate::state::EngineState;

/// Whether the persisted state for a peer still has something to reconcile.
pub fn needs_sync(state: &PersistedPeerState) -> bool {
    if state.synced {
        return false;
    }
    if state.sent_history.is_empty() && state.recv_history.is_empty() {
        return false;
    }
    state.sent_history.iter().any(|e| !e.acknowledged) || !state.recv_history.is_empty()
}

/// Most recent send or receive time recorded for a peer.
pub fn last_activity(state: &PersistedPeerState) -> Option<u64> {
    let sent = state.sent_history.iter().map(|e| e.sent_at);
    let recv = state.recv_history.iter().map(|e| e.received_at);
    sent.chain(recv).max()
}

fn is_online(state: &EngineState, peer_id: &PeerId, now: u64) -> bool {
    let threshold = millis(state.config.online_threshold);
    state
        .directory
        .address_of(peer_id)
        .and_then(|a| state.directory.get(a))
        .is_some_and(|p| p.is_online(now, threshold))
}

/// Periodic poll: publishes reconciliation records to peers that need one.
pub fn run_sync_check(state: &mut EngineState, now: u64) -> usize {
    let inactivity = millis(state.config.sync_inactivity);
    let min_interval = millis(state.config.sync_min_interval);
    let mut due = Vec::new();
    for peer_id in state.ledger.peer_ids() {
        let Some(persisted) = state.ledger.get(peer_id) else {
            continue;
        };
        if !needs_sync(persisted) {
            continue;
        }
        let recently_synced = persisted
            .last_sync_sent_at
            .is_some_and(|t| now.saturating_sub(t) < min_interval);
        if recently_synced {
            continue;
        }
        let idle = last_activity(persisted).map_or(true, |t| now.saturating_sub(t) >= inactivity);
        let unacked = persisted.sent_history.iter().any(|e| !e.acknowledged);
        if idle || unacked {
            due.push(peer_id.clone());
        }
    }
    due.retain(|p| is_online(state, p, now));
    for peer_id in &due {
        publish_sync(state, peer_id, now);
    }
    due.len()
}

/// Immediate check for a peer that just came online.
///
/// Skips the poll and inactivity timers; a reconciliation record still
/// live for the peer is not replaced.
pub fn force_sync_check(state: &mut EngineState, peer_id: &PeerId, now: u64) -> bool {
    let Some(persisted) = state.ledger.get(peer_id) else {
        return false;
    };
    if !needs_sync(persisted) {
        return false;
    }
    if state
        .registry
        .is_registered(&RecordKey::Sync(peer_id.clone()))
    {
        return false;
    }
    publish_sync(state, peer_id, now);
    true
}

/// Publishes a self-expiring reconciliation record addressed to `peer_id`.
pub fn publish_sync(state: &mut EngineState, peer_id: &PeerId, now: u64) {
    let (sent, recv) = state
        .ledger
        .get(peer_id)
        .map(|s| (s.sent_ids(), s.recv_ids()))
        .unwrap_or_default();
    let record = SyncRecord {
        header: state.header(now),
        target_short: peer_id.short().to_string(),
        sent,
        recv,
    };
    let key = RecordKey::Sync(peer_id.clone());
    let encoded = record.encode();
    let Some(request) = state.publish_record(key.clone(), record.instance_name(), encoded) else {
        return;
    };
    let due = now.saturating_add(millis(state.config.sync_record_ttl));
    state.scheduler.schedule(due, Task::ExpireRecord { key, request });
    state.ledger.mark_sync_sent(peer_id, now);
    tracing::debug!(peer = %peer_id, "reconciliation record published");
}

/// Answers with our own reconciliation record when the peer claims to have
/// sent current-session messages we never received, so it learns to resend.
fn reply_if_behind(state: &mut EngineState, from: &PeerId, record: &SyncRecord, now: u64) {
    let persisted = state.ledger.get(from);
    let live = state
        .directory
        .address_of(from)
        .and_then(|a| state.directory.get(a));
    let behind = record
        .sent
        .iter()
        .filter(|id| id.belongs_to(from, &record.header.epoch))
        .any(|id| {
            !persisted.is_some_and(|s| s.has_received(id))
                && !live.is_some_and(|p| p.received.iter().any(|e| &e.id == id))
        });
    if !behind || state.registry.is_registered(&RecordKey::Sync(from.clone())) {
        return;
    }
    tracing::debug!(peer = %from, "peer reports messages we never received; replying");
    publish_sync(state, from, now);
}

/// Outcome of processing a peer's reconciliation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    NotAddressed,
    Resent(Vec<MessageId>),
    Synced,
}

/// Handles a reconciliation record `from` sent to this device.
pub fn process_sync_record(
    state: &mut EngineState,
    from: &PeerId,
    record: &SyncRecord,
    now: u64,
) -> SyncOutcome {
    if record.target_short != state.local.peer_id.short() {
        return SyncOutcome::NotAddressed;
    }
    process_inbound_acks(state, from, &record.recv, now);
    reply_if_behind(state, from, record, now);

    let claimed: HashSet<&MessageId> = record.recv.iter().collect();
    let missing: Vec<(MessageId, String)> = state
        .ledger
        .get(from)
        .map(|s| {
            s.sent_history
                .iter()
                .rev()
                .filter(|e| !e.acknowledged && !claimed.contains(&e.id))
                .map(|e| (e.id.clone(), e.text.clone()))
                .collect()
        })
        .unwrap_or_default();

    if missing.is_empty() {
        state.ledger.mark_synced(from);
        tracing::debug!(peer = %from, "reconciliation complete");
        state.emit(EngineEvent::SyncCompleted { peer: from.clone() });
        return SyncOutcome::Synced;
    }
    for (id, text) in &missing {
        resend(state, from, id, text, now);
    }
    SyncOutcome::Resent(missing.into_iter().map(|(id, _)| id).collect())
}
