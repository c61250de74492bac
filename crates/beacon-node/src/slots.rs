use beacon_codec::fields::truncate_text;
use beacon_codec::MessageRecord;
use beacon_core::{MessageId, PeerId};
use thiserror::Error;

use crate::ack::collect_outgoing_acks;
use crate::config::millis;
use crate::events::EngineEvent;
use crate::registry::RecordKey;
use crate::scheduler::Task;
use crate::state::{EngineState, PendingOutboundMessage, SentEntry, Slot};

/// Why a send request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendRejected {
    #[error("message text is empty")]
    EmptyText,
    #[error("{pending} messages already waiting for delivery to this recipient")]
    TargetBusy { pending: usize },
    #[error("all message slots are in use")]
    NoFreeSlot,
    #[error("engine is not running")]
    NotRunning,
}

/// The fixed pool of outbound message slots.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(count: usize) -> Self {
        let count = count.clamp(1, usize::from(u8::MAX));
        Self {
            slots: (0..count).map(|i| Slot::empty(i as u8)).collect(),
        }
    }

    pub fn free_index(&self) -> Option<u8> {
        self.slots.iter().find(|s| s.is_free()).map(|s| s.index)
    }

    /// Occupied slot with the earliest creation time.
    pub fn oldest_index(&self) -> Option<u8> {
        self.slots
            .iter()
            .filter(|s| !s.is_free())
            .min_by_key(|s| (s.created_at, s.index))
            .map(|s| s.index)
    }

    pub fn get(&self, index: u8) -> Option<&Slot> {
        self.slots.get(usize::from(index))
    }

    pub fn get_mut(&mut self, index: u8) -> Option<&mut Slot> {
        self.slots.get_mut(usize::from(index))
    }

    pub fn index_of(&self, id: &MessageId) -> Option<u8> {
        self.slots
            .iter()
            .find(|s| s.message_id.as_ref() == Some(id))
            .map(|s| s.index)
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot::empty(slot.index);
        }
    }
}

/// Queues a new outbound message in a free slot and publishes it.
pub fn send_message(
    state: &mut EngineState,
    text: &str,
    target: Option<PeerId>,
    now: u64,
) -> Result<MessageId, SendRejected> {
    if text.trim().is_empty() {
        return Err(SendRejected::EmptyText);
    }
    let pending = match &target {
        Some(t) => state
            .pending
            .values()
            .filter(|p| p.target.as_ref() == Some(t))
            .count(),
        None => state.pending.len(),
    };
    if pending >= state.config.max_slots {
        return Err(SendRejected::TargetBusy { pending });
    }
    let index = state.slots.free_index().ok_or(SendRejected::NoFreeSlot)?;

    state.message_counter += 1;
    let id = MessageId::new(&state.local.peer_id, &state.local.epoch, state.message_counter);
    let text = truncate_text(text, state.config.max_message_length);

    occupy(state, index, &id, &text, target.clone(), now);
    record_sent_history(state, &id, &text, index, target.as_ref(), now);
    publish_slot(state, index, now);

    tracing::debug!(%id, slot = index, target = ?target, "message queued");
    state.emit(EngineEvent::MessageSent {
        id: id.clone(),
        text,
        target,
    });
    Ok(id)
}

fn occupy(
    state: &mut EngineState,
    index: u8,
    id: &MessageId,
    text: &str,
    target: Option<PeerId>,
    now: u64,
) {
    state.pending.insert(
        id.clone(),
        PendingOutboundMessage {
            id: id.clone(),
            text: text.to_string(),
            target: target.clone(),
            slot_index: index,
            created_at: now,
        },
    );
    if let Some(slot) = state.slots.get_mut(index) {
        *slot = Slot {
            index,
            message_id: Some(id.clone()),
            target,
            created_at: now,
            published: false,
            extended: false,
        };
    }
    let due = now.saturating_add(millis(state.config.slot_timeout));
    state.scheduler.schedule(
        due,
        Task::SlotTimeout {
            slot: index,
            message_id: id.clone(),
        },
    );
}

fn record_sent_history(
    state: &mut EngineState,
    id: &MessageId,
    text: &str,
    index: u8,
    target: Option<&PeerId>,
    now: u64,
) {
    let recipients: Vec<PeerId> = match target {
        Some(t) => vec![t.clone()],
        None => state
            .directory
            .iter()
            .filter_map(|p| p.peer_id.clone())
            .collect(),
    };
    for peer_id in recipients {
        if let Some(peer) = state.directory.by_peer_id_mut(&peer_id) {
            peer.sent.push(SentEntry {
                id: id.clone(),
                text: text.to_string(),
                sent_at: now,
                slot: Some(index),
                acknowledged: false,
                acked_at: None,
                ack_batch: Vec::new(),
            });
        }
        state.ledger.record_sent(&peer_id, id.clone(), text, now);
    }
}

/// (Re)publishes the record for an occupied slot with a fresh timestamp.
pub fn publish_slot(state: &mut EngineState, index: u8, now: u64) {
    let Some(message) = state
        .slots
        .get(index)
        .and_then(|s| s.message_id.as_ref())
        .and_then(|id| state.pending.get(id))
        .cloned()
    else {
        return;
    };
    let mut record = MessageRecord {
        header: state.header(now),
        message_id: message.id,
        text: message.text,
        slot: index,
        target: message.target,
        acks: collect_outgoing_acks(state, now),
    };
    let max_chars = state.config.max_message_length;
    let mut encoded = record.encode(max_chars);
    if !state.fits(&encoded) && !record.acks.is_empty() {
        record.acks.clear();
        encoded = record.encode(max_chars);
    }
    state.publish_record(RecordKey::Slot(index), record.instance_name(), encoded);
}

/// Frees a slot: withdraws its record and drops the pending message.
pub fn release_slot(state: &mut EngineState, index: u8) {
    let Some(slot) = state.slots.get_mut(index) else {
        return;
    };
    let released = slot.message_id.take();
    *slot = Slot::empty(index);
    if let Some(id) = released {
        state.pending.remove(&id);
        tracing::debug!(%id, slot = index, "slot released");
    }
    let key = RecordKey::Slot(index);
    state.registry.withdraw(&key, &mut state.outbox);
}

/// Handles a due slot timeout.
///
/// An unacknowledged message gets one extension before the slot is freed.
pub fn on_slot_timeout(state: &mut EngineState, index: u8, message_id: &MessageId, now: u64) {
    let Some(slot) = state.slots.get_mut(index) else {
        return;
    };
    if slot.message_id.as_ref() != Some(message_id) {
        return;
    }
    if !state.pending.contains_key(message_id) {
        release_slot(state, index);
        return;
    }
    if !slot.extended {
        slot.extended = true;
        let due = now.saturating_add(millis(state.config.slot_timeout));
        state.scheduler.schedule(
            due,
            Task::SlotTimeout {
                slot: index,
                message_id: message_id.clone(),
            },
        );
        tracing::debug!(id = %message_id, slot = index, "slot timeout extended");
        return;
    }
    tracing::info!(id = %message_id, slot = index, "releasing unacknowledged slot");
    release_slot(state, index);
}

/// Republishes a message the peer reported missing.
///
/// Uses a free slot or evicts the oldest one. Returns the slot used.
pub fn resend(
    state: &mut EngineState,
    target: &PeerId,
    id: &MessageId,
    text: &str,
    now: u64,
) -> Option<u8> {
    if let Some(index) = state.slots.index_of(id) {
        tracing::debug!(%id, slot = index, "resend skipped; message already in flight");
        return None;
    }
    let index = match state.slots.free_index() {
        Some(index) => index,
        None => {
            let oldest = state.slots.oldest_index()?;
            tracing::debug!(slot = oldest, "evicting oldest slot for resend");
            release_slot(state, oldest);
            oldest
        }
    };
    occupy(state, index, id, text, Some(target.clone()), now);
    if let Some(entry) = state
        .directory
        .by_peer_id_mut(target)
        .and_then(|p| p.find_sent_mut(id))
    {
        entry.slot = Some(index);
    }
    publish_slot(state, index, now);
    tracing::info!(%id, peer = %target, slot = index, "resending message");
    Some(index)
}

#[cfg(test)]
mod tests {
    use beacon_core::PeerAddress;

    use super::{on_slot_timeout, resend, send_message, SendRejected};
    use crate::events::{EngineEvent, SubstrateCommand};
    use crate::scheduler::Task;
    use crate::test_support::{remote_id, state};

    #[test]
    fn same_text_twice_gets_distinct_ids() {
        let mut state = state();
        let a = send_message(&mut state, "hello", None, 0).expect("first send");
        let b = send_message(&mut state, "hello", None, 0).expect("second send");
        assert_ne!(a, b);
        assert!(state.local.owns(&a));
        assert_eq!(state.pending.len(), 2);
    }

    #[test]
    fn fourth_concurrent_send_is_rejected_without_new_slot() {
        let mut state = state();
        let target = remote_id(1);
        for _ in 0..3 {
            send_message(&mut state, "hi", Some(target.clone()), 0).expect("send");
        }
        let publishes = state.outbox.len();
        assert_eq!(
            send_message(&mut state, "hi", Some(target), 0),
            Err(SendRejected::TargetBusy { pending: 3 })
        );
        assert_eq!(
            send_message(&mut state, "hi", Some(remote_id(2)), 0),
            Err(SendRejected::NoFreeSlot)
        );
        assert_eq!(state.slots.occupied(), 3);
        assert_eq!(state.outbox.len(), publishes);
    }

    #[test]
    fn send_records_history_and_publishes_slot() {
        let mut state = state();
        let target = remote_id(1);
        let addr = PeerAddress::new("peer-1");
        state.directory.get_or_create(&addr, None, 0, 10);
        state.directory.bind_peer_id(&addr, &target);

        let id = send_message(&mut state, "ping", Some(target.clone()), 5).expect("send");
        let peer = state.directory.get(&addr).expect("peer");
        assert_eq!(peer.sent.iter().next().map(|e| &e.id), Some(&id));
        assert_eq!(
            state.ledger.get(&target).map(|s| s.sent_ids()),
            Some(vec![id.clone()])
        );
        assert!(matches!(
            state.outbox.last(),
            Some(SubstrateCommand::Publish { name, .. }) if name.ends_with("-0")
        ));
        assert!(matches!(
            state.events.last(),
            Some(EngineEvent::MessageSent { id: sent, .. }) if *sent == id
        ));
        assert!(state.scheduler.contains(|t| matches!(t, Task::SlotTimeout { slot: 0, .. })));
    }

    #[test]
    fn unacknowledged_slot_is_extended_once_then_released() {
        let mut state = state();
        let id = send_message(&mut state, "hi", None, 0).expect("send");

        on_slot_timeout(&mut state, 0, &id, 30_000);
        assert!(state.pending.contains_key(&id));
        assert!(state.slots.get(0).is_some_and(|s| s.extended));

        on_slot_timeout(&mut state, 0, &id, 60_000);
        assert!(state.pending.is_empty());
        assert!(state.slots.get(0).is_some_and(|s| s.is_free()));
    }

    #[test]
    fn resend_evicts_oldest_slot_when_full() {
        let mut state = state();
        let first = send_message(&mut state, "a", None, 0).expect("send");
        send_message(&mut state, "b", None, 10).expect("send");
        send_message(&mut state, "c", None, 20).expect("send");

        let missing = beacon_core::MessageId::from_wire("00000000_1_9");
        let slot = resend(&mut state, &remote_id(1), &missing, "old", 30).expect("slot");
        assert_eq!(slot, 0);
        assert!(!state.pending.contains_key(&first));
        assert!(state.pending.contains_key(&missing));
        assert!(resend(&mut state, &remote_id(1), &missing, "old", 31).is_none());
    }
}
