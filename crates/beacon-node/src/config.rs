use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one engine instance.
///
/// All intervals are wall-clock durations; the engine converts them to
/// milliseconds against the `now_ms` values it is driven with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Human-readable name advertised in presence records.
    pub display_name: String,
    /// Marker embedded in discoverable names of devices running beacon.
    pub app_marker: String,
    /// Number of outbound message slots.
    pub max_slots: usize,
    /// Maximum characters of message text put on the wire.
    pub max_message_length: usize,
    /// Maximum ack ids carried by one record.
    pub max_acks_per_record: usize,
    /// Per-peer live history size (sent and received each).
    pub live_history_capacity: usize,
    /// Per-peer persisted history size used for reconciliation.
    pub ledger_history_capacity: usize,
    /// Size of the processed-ack dedup set.
    pub processed_ack_capacity: usize,
    /// Size of the inbound record dedup cache.
    pub dedup_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub dedup_window: Duration,
    /// Message records older than this are discarded.
    #[serde(with = "humantime_serde")]
    pub max_message_age: Duration,
    #[serde(with = "humantime_serde")]
    pub online_threshold: Duration,
    /// Silence after which a peer leaves the live directory.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub slot_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub ack_update_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub visibility_check_interval: Duration,
    /// A received id unseen for longer than this is assumed acknowledged.
    #[serde(with = "humantime_serde")]
    pub visibility_window: Duration,
    #[serde(with = "humantime_serde")]
    pub stale_sweep_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub sync_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub sync_inactivity: Duration,
    /// Minimum spacing between reconciliation records to one peer.
    #[serde(with = "humantime_serde")]
    pub sync_min_interval: Duration,
    /// Lifetime of a published reconciliation record.
    #[serde(with = "humantime_serde")]
    pub sync_record_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub discovery_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub publish_retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub ledger_save_debounce: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            display_name: "beacon".to_string(),
            app_marker: "[bcn]".to_string(),
            max_slots: 3,
            max_message_length: 120,
            max_acks_per_record: 5,
            live_history_capacity: 10,
            ledger_history_capacity: 3,
            processed_ack_capacity: 50,
            dedup_capacity: 50,
            dedup_window: Duration::from_secs(2),
            max_message_age: Duration::from_secs(120),
            online_threshold: Duration::from_secs(15),
            cache_ttl: Duration::from_secs(60),
            slot_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            ack_update_interval: Duration::from_secs(2),
            visibility_check_interval: Duration::from_secs(5),
            visibility_window: Duration::from_secs(10),
            stale_sweep_interval: Duration::from_secs(10),
            sync_check_interval: Duration::from_secs(10),
            sync_inactivity: Duration::from_secs(60),
            sync_min_interval: Duration::from_secs(60),
            sync_record_ttl: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(15),
            publish_retry_backoff: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(5),
            ledger_save_debounce: Duration::from_secs(2),
        }
    }
}

/// Converts a configured duration to the engine's millisecond clock.
pub fn millis(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{millis, EngineConfig};

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_slots, 3);
        assert_eq!(cfg.processed_ack_capacity, 50);
        assert_eq!(cfg.dedup_capacity, 50);
        assert_eq!(millis(cfg.dedup_window), 2_000);
        assert_eq!(millis(cfg.max_message_age), 120_000);
        assert!(cfg.live_history_capacity > cfg.ledger_history_capacity);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"display_name":"kitchen","slot_timeout":"45s"}"#)
                .expect("config should parse");
        assert_eq!(cfg.display_name, "kitchen");
        assert_eq!(cfg.slot_timeout, Duration::from_secs(45));
        assert_eq!(cfg.max_slots, 3);
    }
}
