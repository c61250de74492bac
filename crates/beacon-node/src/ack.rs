use beacon_codec::AckRecord;
use beacon_core::{MessageId, PeerId};

use crate::config::millis;
use crate::events::EngineEvent;
use crate::registry::RecordKey;
use crate::slots::release_slot;
use crate::state::EngineState;

/// Ids of received messages that still need acknowledging.
///
/// Peers are visited in address order and entries oldest first, so the
/// result is deterministic. Each included entry's ack bookkeeping is updated.
pub fn collect_outgoing_acks(state: &mut EngineState, now: u64) -> Vec<MessageId> {
    let cap = state.config.max_acks_per_record;
    let mut acks = Vec::new();
    for address in state.directory.sorted_addresses() {
        if acks.len() >= cap {
            break;
        }
        let Some(peer) = state.directory.get_mut(&address) else {
            continue;
        };
        for entry in peer.received.iter_mut().rev() {
            if acks.len() >= cap {
                break;
            }
            if entry.ack_confirmed {
                continue;
            }
            entry.ack_sent = true;
            entry.ack_sent_at = Some(now);
            entry.ack_send_count += 1;
            acks.push(entry.id.clone());
        }
    }
    acks
}

/// Applies ack ids advertised by `from`. Returns how many released a slot.
///
/// Only ids minted by the current local session are considered; each id is
/// applied at most once per acknowledging peer.
pub fn process_inbound_acks(
    state: &mut EngineState,
    from: &PeerId,
    acks: &[MessageId],
    now: u64,
) -> usize {
    let batch: Vec<MessageId> = acks
        .iter()
        .filter(|id| state.local.owns(id))
        .cloned()
        .collect();
    let short_prefix = format!("{}_", state.local.peer_id.short());
    for id in acks.iter().filter(|id| !state.local.owns(id)) {
        if id.as_str().starts_with(&short_prefix) {
            tracing::debug!(%id, peer = %from, "ignoring ack for an earlier session");
        }
    }

    let mut released = 0;
    for id in &batch {
        let key = (from.clone(), id.clone());
        if state.processed_acks.contains(&key) {
            continue;
        }
        state.processed_acks.put(key, ());

        if let Some(entry) = state
            .directory
            .by_peer_id_mut(from)
            .and_then(|p| p.find_sent_mut(id))
        {
            if !entry.acknowledged {
                entry.acknowledged = true;
                entry.acked_at = Some(now);
                entry.ack_batch = batch.clone();
            }
        }
        state.ledger.mark_acknowledged(from, id, now);

        let Some(slot) = state.pending.get(id).map(|p| p.slot_index) else {
            tracing::debug!(%id, peer = %from, "ack for a message no longer pending");
            continue;
        };
        release_slot(state, slot);
        released += 1;
        tracing::debug!(%id, peer = %from, "message acknowledged");
        state.emit(EngineEvent::AckReceived {
            peer: from.clone(),
            id: id.clone(),
        });
    }
    released
}

/// Notes that the sender still advertises message `id`.
///
/// Only ids in the peer's received history are tracked.
pub fn note_visible(state: &mut EngineState, from: &PeerId, id: &MessageId, now: u64) {
    let Some(peer) = state.directory.by_peer_id_mut(from) else {
        return;
    };
    if peer.received.iter().any(|e| &e.id == id) {
        peer.visible_incoming.insert(id.clone(), now);
    }
}

/// Confirms received messages whose sender stopped advertising them.
///
/// An acked id not seen for longer than the visibility window is assumed
/// released by its sender and is dropped from future ack fields.
pub fn run_visibility_check(state: &mut EngineState, now: u64) -> usize {
    let window = millis(state.config.visibility_window);
    let mut confirmed = Vec::new();
    for peer in state.directory.iter_mut() {
        let Some(peer_id) = peer.peer_id.clone() else {
            continue;
        };
        let mut ids = Vec::new();
        for entry in peer.received.iter_mut() {
            if entry.ack_confirmed || entry.ack_send_count == 0 {
                continue;
            }
            let last_visible = peer
                .visible_incoming
                .get(&entry.id)
                .copied()
                .unwrap_or(entry.received_at);
            if now.saturating_sub(last_visible) > window {
                entry.ack_confirmed = true;
                ids.push(entry.id.clone());
            }
        }
        let received = &peer.received;
        peer.visible_incoming
            .retain(|id, _| received.iter().any(|e| &e.id == id && !e.ack_confirmed));
        confirmed.extend(ids.into_iter().map(|id| (peer_id.clone(), id)));
    }
    for (peer_id, id) in &confirmed {
        tracing::debug!(%id, peer = %peer_id, "delivery confirmed by visibility");
        state.ledger.mark_ack_confirmed(peer_id, id);
    }
    confirmed.len()
}

/// Publishes the dedicated ack record, or withdraws it when nothing is owed.
pub fn publish_ack_record(state: &mut EngineState, now: u64) {
    let acks = collect_outgoing_acks(state, now);
    if acks.is_empty() {
        let key = RecordKey::Ack;
        state.registry.withdraw(&key, &mut state.outbox);
        return;
    }
    let record = AckRecord {
        header: state.header(now),
        acks,
    };
    let encoded = record.encode();
    state.publish_record(RecordKey::Ack, record.instance_name(), encoded);
}
