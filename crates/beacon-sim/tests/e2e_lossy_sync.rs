use std::time::Duration;

use beacon_node::EngineConfig;
use beacon_sim::{run_scenario, SimConfig, Simulation};
use beacon_transport::lan::LanConditions;

const BLACKOUT: LanConditions = LanConditions {
    loss: 1.0,
    duplicate: 0.0,
    seed: 3,
};

#[test]
fn e2e_message_lost_in_blackout_is_recovered_by_reconciliation() {
    let mut sim = Simulation::new(BLACKOUT, Duration::from_millis(250), Duration::from_secs(2));
    sim.add_device("alpha", EngineConfig::default());
    sim.add_device("bravo", EngineConfig::default());
    sim.start_all();
    let id = sim.send(0, "are you there?", Some(1)).expect("send");

    // Slot lifetime plus its one extension runs out without any delivery.
    sim.run_for(Duration::from_secs(65));
    let alpha = sim.device(0).expect("alpha");
    let bravo_id = sim.device(1).expect("bravo").peer_id.clone();
    assert_eq!(sim.device(1).expect("bravo").received().count(), 0);
    assert!(alpha.engine.snapshot(sim.now_ms()).pending.is_empty());
    assert!(alpha
        .engine
        .ledger()
        .get(&bravo_id)
        .is_some_and(|s| !s.sent_history[0].acknowledged));

    sim.set_conditions(LanConditions::default());
    sim.run_for(Duration::from_secs(30));

    let alpha = sim.device(0).expect("alpha");
    let bravo = sim.device(1).expect("bravo");
    assert_eq!(bravo.received().filter(|r| **r == id).count(), 1);
    assert_eq!(alpha.acked().filter(|a| **a == id).count(), 1);
    assert!(alpha
        .engine
        .ledger()
        .get(&bravo_id)
        .is_some_and(|s| s.sent_history[0].acknowledged));
}

#[test]
fn e2e_ring_converges_under_random_loss() {
    let config = SimConfig {
        devices: 3,
        messages_per_device: 1,
        loss: 0.3,
        seed: 11,
        duration: Duration::from_secs(150),
        ..SimConfig::default()
    };
    let report = run_scenario(&config);
    assert_eq!(report.sent, 3);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.duplicate_deliveries, 0);
    assert_eq!(report.acked, 3);
    assert_eq!(report.pending, 0);
}
