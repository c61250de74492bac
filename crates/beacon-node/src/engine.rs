use beacon_codec::PresenceRecord;
use beacon_core::{MessageId, PeerId, SessionEpoch};
use beacon_transport::substrate::{SubstrateCapabilities, SubstrateEvent};
use serde::Serialize;

use crate::ack::{publish_ack_record, run_visibility_check};
use crate::config::{millis, EngineConfig};
use crate::directory::check_online_transition;
use crate::events::{EngineEvent, EngineSnapshot, PeerView, SubstrateCommand};
use crate::persistence::{Ledger, LedgerStore};
use crate::registry::{CompletionOutcome, RecordKey};
use crate::router::{observe_service_name, route_record};
use crate::scheduler::{Periodic, PeriodicSchedule, Task};
use crate::slots::{on_slot_timeout, release_slot, send_message, SendRejected};
use crate::state::{EngineState, LocalIdentity};
use crate::sync::run_sync_check;

/// Lifecycle phase of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnginePhase {
    Idle,
    Running,
    /// The substrate connection broke; a restart is scheduled.
    Reconnecting,
    /// The substrate is unavailable. Only an explicit `start` resumes.
    Halted,
}

/// Sans-IO messaging engine.
///
/// Every method takes the current time in milliseconds. Substrate requests
/// and collaborator notifications accumulate until drained with
/// [`Engine::take_commands`] and [`Engine::take_events`].
pub struct Engine {
    state: EngineState,
    store: Box<dyn LedgerStore>,
    capabilities: SubstrateCapabilities,
    periodic: PeriodicSchedule,
    phase: EnginePhase,
}

impl Engine {
    pub fn new(
        identity: LocalIdentity,
        config: EngineConfig,
        store: impl LedgerStore + 'static,
    ) -> Self {
        Self {
            state: EngineState::new(identity, config),
            store: Box::new(store),
            capabilities: SubstrateCapabilities::default(),
            periodic: PeriodicSchedule::default(),
            phase: EnginePhase::Idle,
        }
    }

    /// Loads the ledger and starts advertising.
    pub fn start(&mut self, capabilities: SubstrateCapabilities, now: u64) {
        if self.phase == EnginePhase::Running {
            return;
        }
        self.capabilities = capabilities;
        self.state.record_budget = capabilities
            .max_record_bytes
            .min(beacon_codec::fields::MAX_RECORD_BYTES);
        self.state.ledger = self.load_ledger();
        self.bring_up(now);
    }

    fn load_ledger(&self) -> Ledger {
        let capacity = self.state.config.ledger_history_capacity;
        match self.store.load() {
            Ok(Some(doc)) => {
                tracing::info!(peers = doc.peers.len(), "ledger loaded");
                Ledger::from_document(doc, capacity)
            }
            Ok(None) => Ledger::new(capacity),
            Err(err) => {
                tracing::warn!(%err, "ignoring unreadable ledger");
                Ledger::new(capacity)
            }
        }
    }

    fn bring_up(&mut self, now: u64) {
        self.phase = EnginePhase::Running;
        self.periodic.arm(now, &self.state.config);
        self.publish_presence(now);
        self.state.outbox.push(SubstrateCommand::Discover);
        tracing::info!(
            device = %self.state.local.peer_id,
            epoch = %self.state.local.epoch,
            "engine running"
        );
        self.state
            .emit(EngineEvent::StatusChanged("running".to_string()));
    }

    /// Stops the engine: flushes the ledger, withdraws every record, and
    /// clears all in-memory state.
    pub fn stop(&mut self, now: u64) {
        if matches!(self.phase, EnginePhase::Idle) {
            return;
        }
        self.periodic.disarm();
        self.flush_ledger(now);
        self.state.registry.withdraw_all(&mut self.state.outbox);
        self.state.clear_runtime();
        self.phase = EnginePhase::Idle;
        tracing::info!("engine stopped");
        self.state
            .emit(EngineEvent::StatusChanged("stopped".to_string()));
    }

    /// Wipes live and persisted message state, keeping known peer identities.
    pub fn clear_all(&mut self, now: u64) {
        let occupied: Vec<u8> = self
            .state
            .slots
            .iter()
            .filter(|s| !s.is_free())
            .map(|s| s.index)
            .collect();
        for index in occupied {
            release_slot(&mut self.state, index);
        }
        self.state.pending.clear();
        for peer in self.state.directory.iter_mut() {
            peer.sent.clear();
            peer.received.clear();
            peer.visible_incoming.clear();
        }
        self.state.processed_acks.clear();
        self.state.dedup.clear();
        self.state.scheduler.cancel_where(|t| {
            matches!(t, Task::SlotTimeout { .. } | Task::ExpireRecord { .. })
        });
        let mut keys: Vec<RecordKey> = self
            .state
            .ledger
            .peer_ids()
            .map(|p| RecordKey::Sync(p.clone()))
            .collect();
        keys.push(RecordKey::Ack);
        for key in &keys {
            self.state.registry.withdraw(key, &mut self.state.outbox);
        }
        self.state.ledger.clear_all_history();
        self.flush_ledger(now);
        if self.phase == EnginePhase::Running {
            self.publish_presence(now);
        }
        tracing::info!("message state cleared");
        self.state
            .emit(EngineEvent::StatusChanged("cleared".to_string()));
    }

    pub fn send_message(
        &mut self,
        text: &str,
        target: Option<PeerId>,
        now: u64,
    ) -> Result<MessageId, SendRejected> {
        if self.phase != EnginePhase::Running {
            return Err(SendRejected::NotRunning);
        }
        let result = send_message(&mut self.state, text, target, now);
        self.schedule_save(now);
        result
    }

    /// Republishes presence and acks and requests a discovery cycle.
    pub fn force_refresh(&mut self, now: u64) {
        if self.phase != EnginePhase::Running {
            return;
        }
        self.publish_presence(now);
        publish_ack_record(&mut self.state, now);
        self.state.outbox.push(SubstrateCommand::Discover);
    }

    pub fn handle_substrate_event(&mut self, event: SubstrateEvent, now: u64) {
        match event {
            SubstrateEvent::PublishCompleted { request, result } => {
                let outcome =
                    self.state
                        .registry
                        .on_publish_completed(request, result, &mut self.state.outbox);
                match outcome {
                    CompletionOutcome::Confirmed(RecordKey::Slot(index)) => {
                        if let Some(slot) = self.state.slots.get_mut(index) {
                            slot.published = true;
                        }
                    }
                    CompletionOutcome::Failed(key) => {
                        let backoff = millis(self.state.config.publish_retry_backoff);
                        let due = now.saturating_add(backoff);
                        self.state
                            .scheduler
                            .schedule(due, Task::RetryPublish { key, request });
                    }
                    CompletionOutcome::Confirmed(_) | CompletionOutcome::Superseded => {}
                }
            }
            SubstrateEvent::WithdrawCompleted { handle, result } => {
                if let Err(reason) = result {
                    tracing::debug!(%handle, %reason, "withdraw failed");
                }
            }
            SubstrateEvent::RecordObserved { address, fields } => {
                if self.phase == EnginePhase::Running {
                    route_record(&mut self.state, &address, &fields, now);
                }
            }
            SubstrateEvent::ServiceNameObserved { address, name } => {
                if self.phase == EnginePhase::Running && self.capabilities.service_names {
                    observe_service_name(&mut self.state, &address, &name, now);
                }
            }
            SubstrateEvent::DiscoveryCompleted { ok } => {
                if !ok {
                    tracing::debug!("discovery cycle reported failure");
                }
            }
            SubstrateEvent::Disconnected => self.on_disconnected(now),
            SubstrateEvent::Unavailable(reason) => self.on_unavailable(reason, now),
        }
        self.schedule_save(now);
    }

    fn on_disconnected(&mut self, now: u64) {
        if self.phase != EnginePhase::Running {
            return;
        }
        tracing::warn!("substrate disconnected; scheduling restart");
        self.periodic.disarm();
        self.flush_ledger(now);
        self.state.clear_runtime();
        self.phase = EnginePhase::Reconnecting;
        let due = now.saturating_add(millis(self.state.config.reconnect_delay));
        self.state.scheduler.schedule(due, Task::Reconnect);
        self.state
            .emit(EngineEvent::StatusChanged("reconnecting".to_string()));
    }

    fn on_unavailable(&mut self, reason: String, now: u64) {
        tracing::error!(%reason, "discovery substrate unavailable");
        self.periodic.disarm();
        self.flush_ledger(now);
        self.state.clear_runtime();
        self.phase = EnginePhase::Halted;
        self.state.emit(EngineEvent::Error(reason));
        self.state
            .emit(EngineEvent::StatusChanged("halted".to_string()));
    }

    /// Runs due one-shot tasks and periodic duties.
    pub fn tick(&mut self, now: u64) {
        for task in self.state.scheduler.pop_due(now) {
            self.run_task(task, now);
        }
        if self.phase == EnginePhase::Running {
            for periodic in self.periodic.due(now, &self.state.config) {
                self.run_periodic(periodic, now);
            }
        }
        self.schedule_save(now);
    }

    fn run_task(&mut self, task: Task, now: u64) {
        match task {
            Task::SlotTimeout { slot, message_id } => {
                on_slot_timeout(&mut self.state, slot, &message_id, now);
            }
            Task::ExpireRecord { key, request } => {
                if self.state.registry.current_request(&key) == Some(request) {
                    self.state.registry.withdraw(&key, &mut self.state.outbox);
                }
            }
            Task::RetryPublish { key, request } => {
                if let Some(retried) = self
                    .state
                    .registry
                    .retry(&key, request, &mut self.state.outbox)
                {
                    self.state.scheduler.retarget_expiry(&key, request, retried);
                    tracing::debug!(?key, "retrying record publish");
                }
            }
            Task::SaveLedger => self.save_ledger(now),
            Task::Reconnect => {
                if self.phase == EnginePhase::Reconnecting {
                    tracing::info!("restarting after substrate disconnect");
                    self.bring_up(now);
                }
            }
        }
    }

    fn run_periodic(&mut self, periodic: Periodic, now: u64) {
        match periodic {
            Periodic::Heartbeat => self.publish_presence(now),
            Periodic::AckUpdate => publish_ack_record(&mut self.state, now),
            Periodic::VisibilityCheck => {
                run_visibility_check(&mut self.state, now);
            }
            Periodic::StaleSweep => self.sweep_peers(now),
            Periodic::SyncCheck => {
                run_sync_check(&mut self.state, now);
            }
            Periodic::Discovery => self.state.outbox.push(SubstrateCommand::Discover),
        }
    }

    fn publish_presence(&mut self, now: u64) {
        self.state.heartbeat_seq += 1;
        let mut record = PresenceRecord {
            header: self.state.header(now),
            display_name: self.state.config.display_name.clone(),
            heartbeat_seq: self.state.heartbeat_seq,
            acks: crate::ack::collect_outgoing_acks(&mut self.state, now),
        };
        let mut encoded = record.encode();
        if !self.state.fits(&encoded) && !record.acks.is_empty() {
            record.acks.clear();
            encoded = record.encode();
        }
        self.state
            .publish_record(RecordKey::Presence, record.instance_name(), encoded);
    }

    fn sweep_peers(&mut self, now: u64) {
        let threshold = millis(self.state.config.online_threshold);
        let mut changes = Vec::new();
        for peer in self.state.directory.iter_mut() {
            if let Some(online) = check_online_transition(peer, now, threshold) {
                changes.push((peer.address.clone(), peer.peer_id.clone(), online));
            }
        }
        for (address, peer_id, online) in changes {
            self.state.emit(EngineEvent::OnlineStatusChanged {
                address,
                peer_id,
                online,
            });
        }
        let ttl = millis(self.state.config.cache_ttl);
        for peer in self.state.directory.evict_stale(now, ttl) {
            tracing::debug!(address = %peer.address, "peer lost");
            self.state.emit(EngineEvent::PeerLost {
                address: peer.address,
                peer_id: peer.peer_id,
            });
        }
    }

    fn schedule_save(&mut self, now: u64) {
        if !self.state.ledger.is_dirty()
            || self
                .state
                .scheduler
                .contains(|t| matches!(t, Task::SaveLedger))
        {
            return;
        }
        let due = now.saturating_add(millis(self.state.config.ledger_save_debounce));
        self.state.scheduler.schedule(due, Task::SaveLedger);
    }

    fn save_ledger(&mut self, now: u64) {
        if !self.state.ledger.take_dirty() {
            return;
        }
        self.write_ledger(now);
    }

    /// Saves immediately, regardless of the debounce.
    fn flush_ledger(&mut self, now: u64) {
        self.state.ledger.take_dirty();
        self.state
            .scheduler
            .cancel_where(|t| matches!(t, Task::SaveLedger));
        self.write_ledger(now);
    }

    fn write_ledger(&mut self, now: u64) {
        let doc = self
            .state
            .ledger
            .to_document(&self.state.local.peer_id, &self.state.local.epoch, now);
        if let Err(err) = self.store.save(&doc) {
            tracing::warn!(%err, "failed to save ledger");
            self.state.ledger.mark_dirty();
        }
    }

    pub fn take_commands(&mut self) -> Vec<SubstrateCommand> {
        std::mem::take(&mut self.state.outbox)
    }

    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.state.events)
    }

    /// Earliest time at which [`Engine::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<u64> {
        match (
            self.state.scheduler.next_deadline(),
            self.periodic.next_deadline(),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn snapshot(&self, now: u64) -> EngineSnapshot {
        let threshold = millis(self.state.config.online_threshold);
        let mut peers: Vec<PeerView> = self
            .state
            .directory
            .iter()
            .map(|p| PeerView::of(p, now, threshold))
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        let mut pending: Vec<_> = self.state.pending.values().cloned().collect();
        pending.sort_by_key(|p| p.slot_index);
        EngineSnapshot {
            device_id: self.state.local.peer_id.clone(),
            session_epoch: self.state.local.epoch.clone(),
            phase: self.phase,
            heartbeat_seq: self.state.heartbeat_seq,
            pending_ack_count: self.state.pending_ack_count(),
            peers,
            pending,
            slots: self.state.slots.iter().cloned().collect(),
            taken_at: now,
        }
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn device_id(&self) -> &PeerId {
        &self.state.local.peer_id
    }

    pub fn session_epoch(&self) -> &SessionEpoch {
        &self.state.local.epoch
    }

    pub fn heartbeat_seq(&self) -> u64 {
        self.state.heartbeat_seq
    }

    pub fn pending_ack_count(&self) -> usize {
        self.state.pending_ack_count()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.state.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.state.config
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use beacon_transport::substrate::{RecordHandle, SubstrateCapabilities, SubstrateEvent};

    use super::{Engine, EnginePhase};
    use crate::config::EngineConfig;
    use crate::events::{EngineEvent, SubstrateCommand};
    use crate::persistence::{LedgerStore, MemoryLedgerStore};
    use crate::registry::RecordKey;
    use crate::slots::SendRejected;
    use crate::test_support::{local_identity, remote_id};

    fn engine(store: MemoryLedgerStore) -> Engine {
        Engine::new(local_identity(), EngineConfig::default(), store)
    }

    fn publish_requests(
        commands: &[SubstrateCommand],
    ) -> Vec<beacon_transport::substrate::RequestId> {
        commands
            .iter()
            .filter_map(|c| match c {
                SubstrateCommand::Publish { request, .. } => Some(*request),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_publishes_presence_and_requests_discovery() {
        let mut engine = engine(MemoryLedgerStore::default());
        engine.start(SubstrateCapabilities::default(), 0);
        let commands = engine.take_commands();
        assert!(matches!(
            &commands[0],
            SubstrateCommand::Publish { name, .. } if name.starts_with("bcn-hb-")
        ));
        assert_eq!(commands[1], SubstrateCommand::Discover);
        assert_eq!(engine.heartbeat_seq(), 1);
        assert_eq!(engine.phase(), EnginePhase::Running);
    }

    #[test]
    fn send_before_start_is_rejected() {
        let mut engine = engine(MemoryLedgerStore::default());
        assert_eq!(
            engine.send_message("hi", None, 0),
            Err(SendRejected::NotRunning)
        );
    }

    #[test]
    fn failed_publish_is_retried_after_backoff() {
        let mut engine = engine(MemoryLedgerStore::default());
        engine.start(SubstrateCapabilities::default(), 0);
        let request = publish_requests(&engine.take_commands())[0];
        engine.handle_substrate_event(
            SubstrateEvent::PublishCompleted {
                request,
                result: Err("busy".into()),
            },
            100,
        );
        engine.tick(1_000);
        assert!(publish_requests(&engine.take_commands()).is_empty());
        engine.tick(3_100);
        assert!(!publish_requests(&engine.take_commands()).is_empty());
    }

    #[test]
    fn retried_sync_record_still_expires() {
        let mut engine = engine(MemoryLedgerStore::default());
        engine.start(SubstrateCapabilities::default(), 0);
        engine.take_commands();
        let peer = remote_id(1);
        let key = RecordKey::Sync(peer.clone());
        crate::sync::publish_sync(&mut engine.state, &peer, 1_000);
        let request = publish_requests(&engine.take_commands())[0];
        engine.handle_substrate_event(
            SubstrateEvent::PublishCompleted {
                request,
                result: Err("busy".into()),
            },
            1_100,
        );

        engine.tick(4_200);
        let retried = engine
            .state
            .registry
            .current_request(&key)
            .expect("still registered");
        assert_ne!(retried, request);
        engine.handle_substrate_event(
            SubstrateEvent::PublishCompleted {
                request: retried,
                result: Ok(RecordHandle(11)),
            },
            4_300,
        );
        engine.take_commands();

        engine.tick(31_000);
        assert!(!engine.state.registry.is_registered(&key));
        assert!(engine.take_commands().contains(&SubstrateCommand::Withdraw {
            handle: RecordHandle(11)
        }));
    }

    #[test]
    fn unbounded_timeouts_do_not_overflow_deadlines() {
        let config = EngineConfig {
            slot_timeout: Duration::MAX,
            ledger_save_debounce: Duration::MAX,
            publish_retry_backoff: Duration::MAX,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(local_identity(), config, MemoryLedgerStore::default());
        engine.start(SubstrateCapabilities::default(), 100);
        let request = publish_requests(&engine.take_commands())[0];
        engine.handle_substrate_event(
            SubstrateEvent::PublishCompleted {
                request,
                result: Err("busy".into()),
            },
            150,
        );
        engine
            .send_message("hi", Some(remote_id(1)), 200)
            .expect("send");
        engine.tick(1_000_000);
        assert_eq!(engine.snapshot(1_000_000).pending.len(), 1);
    }

    #[test]
    fn stop_withdraws_records_and_flushes_ledger() {
        let store = MemoryLedgerStore::default();
        let mut engine = engine(store.clone());
        engine.start(SubstrateCapabilities::default(), 0);
        let request = publish_requests(&engine.take_commands())[0];
        engine.handle_substrate_event(
            SubstrateEvent::PublishCompleted {
                request,
                result: Ok(RecordHandle(4)),
            },
            10,
        );
        engine.stop(20);
        assert_eq!(
            engine.take_commands(),
            vec![SubstrateCommand::Withdraw {
                handle: RecordHandle(4)
            }]
        );
        assert!(store.load().expect("load").is_some());
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert!(engine.next_deadline().is_none());
    }

    #[test]
    fn late_completion_after_stop_is_withdrawn() {
        let mut engine = engine(MemoryLedgerStore::default());
        engine.start(SubstrateCapabilities::default(), 0);
        let request = publish_requests(&engine.take_commands())[0];
        engine.stop(5);
        engine.take_commands();
        engine.handle_substrate_event(
            SubstrateEvent::PublishCompleted {
                request,
                result: Ok(RecordHandle(9)),
            },
            6,
        );
        assert_eq!(
            engine.take_commands(),
            vec![SubstrateCommand::Withdraw {
                handle: RecordHandle(9)
            }]
        );
    }

    #[test]
    fn disconnect_schedules_restart_with_same_epoch() {
        let mut engine = engine(MemoryLedgerStore::default());
        engine.start(SubstrateCapabilities::default(), 0);
        let epoch = engine.session_epoch().clone();
        engine.handle_substrate_event(SubstrateEvent::Disconnected, 1_000);
        assert_eq!(engine.phase(), EnginePhase::Reconnecting);
        engine.tick(3_000);
        assert_eq!(engine.phase(), EnginePhase::Reconnecting);
        engine.tick(6_000);
        assert_eq!(engine.phase(), EnginePhase::Running);
        assert_eq!(engine.session_epoch(), &epoch);
    }

    #[test]
    fn unavailable_substrate_halts_with_error_event() {
        let mut engine = engine(MemoryLedgerStore::default());
        engine.start(SubstrateCapabilities::default(), 0);
        engine.take_events();
        engine.handle_substrate_event(SubstrateEvent::Unavailable("no wifi".into()), 1);
        assert_eq!(engine.phase(), EnginePhase::Halted);
        assert!(matches!(
            engine.take_events().first(),
            Some(EngineEvent::Error(reason)) if reason == "no wifi"
        ));
        assert_eq!(
            engine.send_message("hi", Some(remote_id(1)), 2),
            Err(SendRejected::NotRunning)
        );
    }

    #[test]
    fn version_mismatched_ledger_starts_empty() {
        let store = MemoryLedgerStore::with_bytes(br#"{"version":99,"peers":{}}"#.to_vec());
        let mut engine = engine(store);
        engine.start(SubstrateCapabilities::default(), 0);
        assert!(engine.ledger().is_empty());
    }

    #[test]
    fn ledger_saves_are_debounced() {
        let store = MemoryLedgerStore::default();
        let mut engine = engine(store.clone());
        engine.start(SubstrateCapabilities::default(), 0);
        engine
            .send_message("hi", Some(remote_id(1)), 100)
            .expect("send");
        engine.tick(1_000);
        assert!(store.raw().is_none());
        engine.tick(2_100);
        let doc = store.load().expect("load").expect("saved");
        assert_eq!(doc.peers.len(), 1);
    }

    #[test]
    fn clear_all_wipes_history_and_frees_slots() {
        let mut engine = engine(MemoryLedgerStore::default());
        engine.start(SubstrateCapabilities::default(), 0);
        engine
            .send_message("hi", Some(remote_id(1)), 100)
            .expect("send");
        engine.clear_all(200);
        let snapshot = engine.snapshot(200);
        assert!(snapshot.pending.is_empty());
        assert!(snapshot.slots.iter().all(|s| s.is_free()));
        assert!(engine
            .ledger()
            .get(&remote_id(1))
            .is_some_and(|s| s.sent_history.is_empty()));
    }
}
