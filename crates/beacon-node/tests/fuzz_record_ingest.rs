use beacon_codec::RecordFields;
use beacon_core::hash::derive_peer_id;
use beacon_core::{PeerAddress, SessionEpoch};
use beacon_node::persistence::MemoryLedgerStore;
use beacon_node::runtime::{pump_once, RuntimeStats};
use beacon_node::{Engine, EngineConfig, EnginePhase, LocalIdentity};
use beacon_transport::substrate::{RecordingSubstrate, SubstrateCapabilities, SubstrateEvent};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const KEYS: &[&str] = &[
    "k", "id", "s", "ts", "n", "hb", "ack", "mid", "txt", "sl", "to", "sent", "recv",
];
const KINDS: &[&str] = &["hb", "msg", "ack", "sync", "", "zz"];

fn random_value(rng: &mut StdRng, key: &str, me: &str) -> String {
    match key {
        "k" => KINDS.choose(rng).copied().unwrap_or("hb").to_string(),
        "id" => format!("{:016x}", rng.gen_range(0..6_u64)),
        "s" => format!("{:x}", rng.gen_range(0..4_u64)),
        "ts" if rng.gen_bool(0.8) => rng.gen_range(0..200_000_u64).to_string(),
        "sl" if rng.gen_bool(0.8) => rng.gen_range(0..5_u8).to_string(),
        "to" if rng.gen_bool(0.5) => me[..8].to_string(),
        "ack" | "sent" | "recv" => {
            let count = rng.gen_range(0..8);
            (0..count)
                .map(|n| format!("{}_{:x}_{n}", &me[..8], rng.gen_range(0..4_u64)))
                .collect::<Vec<_>>()
                .join(",")
        }
        _ => {
            let len = rng.gen_range(0..40);
            (0..len).map(|_| rng.gen_range(' '..='~')).collect()
        }
    }
}

#[test]
fn fuzz_like_record_ingest_does_not_panic() {
    let me = derive_peer_id("fuzz-target");
    let mut engine = Engine::new(
        LocalIdentity::new(me.clone(), SessionEpoch::from_unix_secs(2)),
        EngineConfig::default(),
        MemoryLedgerStore::default(),
    );
    let mut substrate = RecordingSubstrate::auto_completing();
    let mut stats = RuntimeStats::default();
    let mut rng = StdRng::seed_from_u64(0xBEAC0);
    engine.start(SubstrateCapabilities::default(), 0);

    for step in 0..2_000_u64 {
        let mut fields = RecordFields::new();
        for key in KEYS {
            if rng.gen_bool(0.7) {
                fields.insert(key, random_value(&mut rng, key, me.as_str()));
            }
        }
        substrate.enqueue_event(SubstrateEvent::RecordObserved {
            address: PeerAddress::new(format!("fuzz-{}", rng.gen_range(0..8))),
            fields,
        });
        if step % 50 == 0 {
            let _ = engine.send_message("probe", None, step * 100);
        }
        pump_once(&mut engine, &mut substrate, step * 100, &mut stats);
    }

    assert_eq!(engine.phase(), EnginePhase::Running);
    let snapshot = engine.snapshot(200_000);
    assert_eq!(snapshot.slots.len(), EngineConfig::default().max_slots);
    assert!(snapshot.pending.len() <= EngineConfig::default().max_slots);
    assert!(stats.substrate_events >= 2_000);
}
