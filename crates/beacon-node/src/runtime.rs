use beacon_transport::substrate::{DiscoverySubstrate, SubstrateEvent};

use crate::engine::Engine;
use crate::events::{EngineEvent, SubstrateCommand};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Substrate notifications fed to the engine.
    pub substrate_events: usize,
    /// Publish requests handed to the substrate.
    pub publishes: usize,
    /// Withdraw requests handed to the substrate.
    pub withdraws: usize,
    /// Discovery cycles requested.
    pub discoveries: usize,
    /// Requests the substrate refused synchronously.
    pub request_failures: usize,
    /// Engine events produced.
    pub events: usize,
}

/// Drains pending substrate events, runs due timers, and executes the
/// resulting substrate requests. Returns the engine events produced.
pub fn pump_once<S: DiscoverySubstrate>(
    engine: &mut Engine,
    substrate: &mut S,
    now: u64,
    stats: &mut RuntimeStats,
) -> Vec<EngineEvent> {
    while let Some(event) = substrate.poll_event() {
        stats.substrate_events += 1;
        engine.handle_substrate_event(event, now);
    }
    engine.tick(now);
    execute_commands(engine, substrate, now, stats);
    let events = engine.take_events();
    stats.events += events.len();
    events
}

/// Hands queued engine requests to the substrate.
///
/// A publish refused synchronously is fed back as a failed completion so
/// the engine's retry path handles it. Withdraw failures are ignored.
pub fn execute_commands<S: DiscoverySubstrate>(
    engine: &mut Engine,
    substrate: &mut S,
    now: u64,
    stats: &mut RuntimeStats,
) {
    loop {
        let commands = engine.take_commands();
        if commands.is_empty() {
            break;
        }
        for command in commands {
            match command {
                SubstrateCommand::Publish {
                    request,
                    name,
                    fields,
                } => {
                    stats.publishes += 1;
                    if let Err(err) = substrate.publish(request, &name, &fields) {
                        stats.request_failures += 1;
                        engine.handle_substrate_event(
                            SubstrateEvent::PublishCompleted {
                                request,
                                result: Err(err.to_string()),
                            },
                            now,
                        );
                    }
                }
                SubstrateCommand::Withdraw { handle } => {
                    stats.withdraws += 1;
                    if let Err(err) = substrate.withdraw(handle) {
                        stats.request_failures += 1;
                        tracing::debug!(%handle, %err, "withdraw request failed");
                    }
                }
                SubstrateCommand::Discover => {
                    stats.discoveries += 1;
                    if let Err(err) = substrate.discover() {
                        stats.request_failures += 1;
                        tracing::debug!(%err, "discovery request failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use beacon_transport::substrate::RecordingSubstrate;

    use super::{pump_once, RuntimeStats};
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::events::EngineEvent;
    use crate::persistence::MemoryLedgerStore;
    use crate::test_support::local_identity;

    #[test]
    fn pump_executes_requests_and_feeds_completions_back() {
        let mut engine = Engine::new(
            local_identity(),
            EngineConfig::default(),
            MemoryLedgerStore::default(),
        );
        let mut substrate = RecordingSubstrate::auto_completing();
        let mut stats = RuntimeStats::default();
        engine.start(substrate_caps(), 0);

        let events = pump_once(&mut engine, &mut substrate, 0, &mut stats);
        assert!(matches!(events.as_slice(), [EngineEvent::StatusChanged(s)] if s == "running"));
        assert_eq!(stats.publishes, 1);
        assert_eq!(stats.discoveries, 1);
        assert_eq!(substrate.discover_calls, 1);

        // Completion is consumed on the next pump; the heartbeat republish
        // then withdraws the confirmed record.
        pump_once(&mut engine, &mut substrate, 5_000, &mut stats);
        assert_eq!(stats.substrate_events, 1);
        assert_eq!(substrate.withdrawn.len(), 1);
        assert_eq!(substrate.published_names().len(), 2);
    }

    #[test]
    fn refused_publish_is_retried() {
        let mut engine = Engine::new(
            local_identity(),
            EngineConfig::default(),
            MemoryLedgerStore::default(),
        );
        let mut substrate = RecordingSubstrate::auto_completing();
        substrate.fail_next_publishes(1);
        let mut stats = RuntimeStats::default();
        engine.start(substrate_caps(), 0);
        pump_once(&mut engine, &mut substrate, 0, &mut stats);
        pump_once(&mut engine, &mut substrate, 100, &mut stats);
        pump_once(&mut engine, &mut substrate, 3_100, &mut stats);
        let heartbeats = substrate
            .published_names()
            .iter()
            .filter(|n| n.starts_with("bcn-hb-"))
            .count();
        assert_eq!(heartbeats, 2);
    }

    fn substrate_caps() -> beacon_transport::substrate::SubstrateCapabilities {
        beacon_transport::substrate::SubstrateCapabilities::default()
    }
}
