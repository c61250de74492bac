//! Single-owner async service around [`Engine`].
//!
//! One task owns the engine and its substrate driver. Callers talk to it
//! through an [`EngineHandle`]: commands go over an mpsc channel, events fan
//! out on a broadcast channel in the order they occur, and observers read
//! immutable snapshots from a watch channel without touching engine state.

use std::time::Duration;

use beacon_core::{MessageId, PeerId, SessionEpoch};
use beacon_transport::substrate::DiscoverySubstrate;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::Engine;
use crate::events::{EngineEvent, EngineSnapshot};
use crate::runtime::{execute_commands, pump_once, RuntimeStats};
use crate::slots::SendRejected;

const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("engine task is no longer running")]
    Closed,
    #[error(transparent)]
    Rejected(#[from] SendRejected),
}

enum ServiceCommand {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    ClearAll(oneshot::Sender<()>),
    Send {
        text: String,
        target: Option<PeerId>,
        reply: oneshot::Sender<Result<MessageId, SendRejected>>,
    },
    ForceRefresh,
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable control surface for a running engine task.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<ServiceCommand>,
    events: broadcast::Sender<EngineEvent>,
    snapshots: watch::Receiver<EngineSnapshot>,
}

impl EngineHandle {
    async fn call(
        &self,
        build: impl FnOnce(oneshot::Sender<()>) -> ServiceCommand,
    ) -> Result<(), ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| ServiceError::Closed)?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    pub async fn start(&self) -> Result<(), ServiceError> {
        self.call(ServiceCommand::Start).await
    }

    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.call(ServiceCommand::Stop).await
    }

    pub async fn clear_all(&self) -> Result<(), ServiceError> {
        self.call(ServiceCommand::ClearAll).await
    }

    /// Stops the engine and ends the task.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.call(ServiceCommand::Shutdown).await
    }

    pub async fn send_message(
        &self,
        text: impl Into<String>,
        target: Option<PeerId>,
    ) -> Result<MessageId, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ServiceCommand::Send {
                text: text.into(),
                target,
                reply,
            })
            .await
            .map_err(|_| ServiceError::Closed)?;
        Ok(rx.await.map_err(|_| ServiceError::Closed)??)
    }

    pub async fn force_refresh(&self) -> Result<(), ServiceError> {
        self.commands
            .send(ServiceCommand::ForceRefresh)
            .await
            .map_err(|_| ServiceError::Closed)
    }

    /// Subscribes to engine events produced from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch_snapshots(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshots.clone()
    }

    pub fn device_id(&self) -> PeerId {
        self.snapshots.borrow().device_id.clone()
    }

    pub fn session_epoch(&self) -> SessionEpoch {
        self.snapshots.borrow().session_epoch.clone()
    }

    pub fn heartbeat_seq(&self) -> u64 {
        self.snapshots.borrow().heartbeat_seq
    }

    pub fn pending_ack_count(&self) -> usize {
        self.snapshots.borrow().pending_ack_count
    }
}

/// Wall clock anchored at spawn time, advanced by the tokio clock.
struct ServiceClock {
    origin: Instant,
    base_ms: u64,
}

impl ServiceClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            base_ms: beacon_core::time::unix_millis(),
        }
    }

    fn now_ms(&self) -> u64 {
        let elapsed = self.origin.elapsed().as_millis();
        self.base_ms
            .saturating_add(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }
}

struct EngineService<S> {
    engine: Engine,
    substrate: S,
    commands: mpsc::Receiver<ServiceCommand>,
    events: broadcast::Sender<EngineEvent>,
    snapshots: watch::Sender<EngineSnapshot>,
    stats: RuntimeStats,
    clock: ServiceClock,
}

impl<S: DiscoverySubstrate> EngineService<S> {
    async fn run(mut self, tick_interval: Duration) -> Engine {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("all engine handles dropped");
                        self.shutdown();
                        break;
                    };
                    if let ServiceCommand::Shutdown(reply) = command {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    self.handle(command);
                }
                _ = ticker.tick() => {}
            }
            self.pump();
        }
        self.engine
    }

    fn handle(&mut self, command: ServiceCommand) {
        let now = self.clock.now_ms();
        match command {
            ServiceCommand::Start(reply) => {
                let capabilities = self.substrate.capabilities();
                self.engine.start(capabilities, now);
                let _ = reply.send(());
            }
            ServiceCommand::Stop(reply) => {
                self.engine.stop(now);
                let _ = reply.send(());
            }
            ServiceCommand::ClearAll(reply) => {
                self.engine.clear_all(now);
                let _ = reply.send(());
            }
            ServiceCommand::Send {
                text,
                target,
                reply,
            } => {
                let _ = reply.send(self.engine.send_message(&text, target, now));
            }
            ServiceCommand::ForceRefresh => self.engine.force_refresh(now),
            ServiceCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn pump(&mut self) {
        let now = self.clock.now_ms();
        let events = pump_once(&mut self.engine, &mut self.substrate, now, &mut self.stats);
        self.publish(events, now);
    }

    /// Stops the engine; shutdown withdrawals are fire-and-forget.
    fn shutdown(&mut self) {
        let now = self.clock.now_ms();
        self.engine.stop(now);
        execute_commands(&mut self.engine, &mut self.substrate, now, &mut self.stats);
        let events = self.engine.take_events();
        self.publish(events, now);
        tracing::info!(stats = ?self.stats, "engine service finished");
    }

    fn publish(&self, events: Vec<EngineEvent>, now: u64) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        self.snapshots.send_replace(self.engine.snapshot(now));
    }
}

/// Spawns the engine task on the current tokio runtime.
///
/// The engine is returned from the task when it ends.
pub fn spawn_engine<S>(
    engine: Engine,
    substrate: S,
    tick_interval: Duration,
) -> (EngineHandle, JoinHandle<Engine>)
where
    S: DiscoverySubstrate + Send + 'static,
{
    let clock = ServiceClock::new();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (event_tx, _) = broadcast::channel(EVENT_QUEUE);
    let (snapshot_tx, snapshot_rx) = watch::channel(engine.snapshot(clock.now_ms()));
    let service = EngineService {
        engine,
        substrate,
        commands: command_rx,
        events: event_tx.clone(),
        snapshots: snapshot_tx,
        stats: RuntimeStats::default(),
        clock,
    };
    let task = tokio::spawn(service.run(tick_interval));
    (
        EngineHandle {
            commands: command_tx,
            events: event_tx,
            snapshots: snapshot_rx,
        },
        task,
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use beacon_transport::substrate::RecordingSubstrate;

    use super::{spawn_engine, ServiceError};
    use crate::config::EngineConfig;
    use crate::engine::{Engine, EnginePhase};
    use crate::events::EngineEvent;
    use crate::persistence::MemoryLedgerStore;
    use crate::slots::SendRejected;
    use crate::test_support::{local_identity, remote_id};

    fn engine() -> Engine {
        Engine::new(
            local_identity(),
            EngineConfig::default(),
            MemoryLedgerStore::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn handle_drives_engine_and_streams_events() {
        let (handle, task) = spawn_engine(
            engine(),
            RecordingSubstrate::auto_completing(),
            Duration::from_millis(250),
        );
        let mut events = handle.subscribe();

        handle.start().await.expect("start");
        let id = handle
            .send_message("hello", Some(remote_id(1)))
            .await
            .expect("send");

        let mut saw_sent = false;
        while let Ok(event) = events.recv().await {
            if let EngineEvent::MessageSent { id: sent, .. } = event {
                assert_eq!(sent, id);
                saw_sent = true;
                break;
            }
        }
        assert!(saw_sent);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.heartbeat_seq() >= 2);
        assert_eq!(handle.session_epoch(), local_identity().epoch);
        assert_eq!(handle.device_id(), local_identity().peer_id);
        assert_eq!(handle.snapshot().phase, EnginePhase::Running);
        assert_eq!(handle.snapshot().pending.len(), 1);

        handle.shutdown().await.expect("shutdown");
        let engine = task.await.expect("join");
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert!(matches!(
            handle.start().await,
            Err(ServiceError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rejections_are_returned_to_the_caller() {
        let (handle, _task) = spawn_engine(
            engine(),
            RecordingSubstrate::auto_completing(),
            Duration::from_millis(250),
        );
        let err = handle
            .send_message("too early", None)
            .await
            .expect_err("engine not started");
        assert!(matches!(err, ServiceError::Rejected(SendRejected::NotRunning)));
    }
}
