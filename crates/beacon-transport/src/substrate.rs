use std::collections::VecDeque;
use std::fmt;

use beacon_codec::RecordFields;
use beacon_core::PeerAddress;

/// Correlation id tying a publish request to its later completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Substrate-issued handle for one successfully published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordHandle(pub u64);

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec#{}", self.0)
    }
}

/// Asynchronous notifications produced by a substrate driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstrateEvent {
    /// Outcome of an earlier `publish` call.
    PublishCompleted {
        request: RequestId,
        result: Result<RecordHandle, String>,
    },
    /// Outcome of an earlier `withdraw` call.
    WithdrawCompleted {
        handle: RecordHandle,
        result: Result<(), String>,
    },
    /// A record advertised by another device was observed.
    RecordObserved {
        address: PeerAddress,
        fields: RecordFields,
    },
    /// A discoverable device/service name was observed.
    ServiceNameObserved { address: PeerAddress, name: String },
    /// A scan cycle finished.
    DiscoveryCompleted { ok: bool },
    /// The connection to the substrate broke; it may come back.
    Disconnected,
    /// The substrate is unsupported or permanently unavailable.
    Unavailable(String),
}

/// Optional driver features, resolved once when the engine starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubstrateCapabilities {
    /// Driver reports device/service names alongside records.
    pub service_names: bool,
    /// Driver reports withdraw outcomes.
    pub withdraw_completions: bool,
    /// Upper bound on encoded record size accepted by the driver.
    pub max_record_bytes: usize,
}

impl Default for SubstrateCapabilities {
    fn default() -> Self {
        Self {
            service_names: true,
            withdraw_completions: false,
            max_record_bytes: beacon_codec::fields::MAX_RECORD_BYTES,
        }
    }
}

/// Coarse per-driver health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstrateHealthSnapshot {
    pub publish_requests: u64,
    pub publish_failures: u64,
    pub withdraw_requests: u64,
    pub records_observed: u64,
    pub last_error: Option<String>,
}

/// Broadcast-only discovery substrate used by the beacon engine.
///
/// Calls only issue requests; their outcomes arrive later through
/// [`DiscoverySubstrate::poll_event`], possibly out of order.
pub trait DiscoverySubstrate {
    /// Driver-specific request error.
    type Error: fmt::Display;

    /// Feature flags; called once at engine start.
    fn capabilities(&self) -> SubstrateCapabilities {
        SubstrateCapabilities::default()
    }

    /// Requests publication of a named record.
    fn publish(
        &mut self,
        request: RequestId,
        name: &str,
        fields: &RecordFields,
    ) -> Result<(), Self::Error>;

    /// Requests withdrawal of a previously published record.
    fn withdraw(&mut self, handle: RecordHandle) -> Result<(), Self::Error>;

    /// Requests a peer/service scan cycle.
    fn discover(&mut self) -> Result<(), Self::Error>;

    /// Returns the next pending notification, if any.
    fn poll_event(&mut self) -> Option<SubstrateEvent>;

    /// Best-effort health counters.
    fn health_snapshot(&self) -> SubstrateHealthSnapshot {
        SubstrateHealthSnapshot::default()
    }
}

/// Captures requests and replays scripted events, for tests.
#[derive(Debug, Default)]
pub struct RecordingSubstrate {
    pub published: Vec<(RequestId, String, RecordFields)>,
    pub withdrawn: Vec<RecordHandle>,
    pub discover_calls: usize,
    events: VecDeque<SubstrateEvent>,
    auto_complete: bool,
    fail_publishes: usize,
    next_handle: u64,
}

impl RecordingSubstrate {
    /// Completes every publish successfully as soon as it is requested.
    pub fn auto_completing() -> Self {
        Self {
            auto_complete: true,
            ..Self::default()
        }
    }

    /// Makes the next `count` publish requests complete with an error.
    pub fn fail_next_publishes(&mut self, count: usize) {
        self.fail_publishes = count;
    }

    pub fn enqueue_event(&mut self, event: SubstrateEvent) {
        self.events.push_back(event);
    }

    /// Names of records published so far, in request order.
    pub fn published_names(&self) -> Vec<String> {
        self.published.iter().map(|(_, n, _)| n.clone()).collect()
    }
}

impl DiscoverySubstrate for RecordingSubstrate {
    type Error = &'static str;

    fn publish(
        &mut self,
        request: RequestId,
        name: &str,
        fields: &RecordFields,
    ) -> Result<(), Self::Error> {
        self.published
            .push((request, name.to_string(), fields.clone()));
        if self.fail_publishes > 0 {
            self.fail_publishes -= 1;
            self.events.push_back(SubstrateEvent::PublishCompleted {
                request,
                result: Err("publish rejected".to_string()),
            });
        } else if self.auto_complete {
            self.next_handle += 1;
            self.events.push_back(SubstrateEvent::PublishCompleted {
                request,
                result: Ok(RecordHandle(self.next_handle)),
            });
        }
        Ok(())
    }

    fn withdraw(&mut self, handle: RecordHandle) -> Result<(), Self::Error> {
        self.withdrawn.push(handle);
        Ok(())
    }

    fn discover(&mut self) -> Result<(), Self::Error> {
        self.discover_calls += 1;
        Ok(())
    }

    fn poll_event(&mut self) -> Option<SubstrateEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use beacon_codec::RecordFields;

    use super::{
        DiscoverySubstrate, RecordHandle, RecordingSubstrate, RequestId, SubstrateEvent,
    };

    #[test]
    fn recording_substrate_completes_and_fails_publishes() {
        let mut substrate = RecordingSubstrate::auto_completing();
        substrate.fail_next_publishes(1);
        substrate
            .publish(RequestId(1), "bcn-hb-a", &RecordFields::new())
            .expect("publish request");
        substrate
            .publish(RequestId(2), "bcn-hb-a", &RecordFields::new())
            .expect("publish request");

        assert!(matches!(
            substrate.poll_event(),
            Some(SubstrateEvent::PublishCompleted {
                request: RequestId(1),
                result: Err(_)
            })
        ));
        assert_eq!(
            substrate.poll_event(),
            Some(SubstrateEvent::PublishCompleted {
                request: RequestId(2),
                result: Ok(RecordHandle(1)),
            })
        );
        assert!(substrate.poll_event().is_none());
        assert_eq!(substrate.published_names(), vec!["bcn-hb-a", "bcn-hb-a"]);
    }

    #[test]
    fn manual_substrate_leaves_completions_to_the_test() {
        let mut substrate = RecordingSubstrate::default();
        substrate
            .publish(RequestId(5), "bcn-ack-a", &RecordFields::new())
            .expect("publish request");
        assert!(substrate.poll_event().is_none());
        substrate.withdraw(RecordHandle(3)).expect("withdraw request");
        assert_eq!(substrate.withdrawn, vec![RecordHandle(3)]);
    }
}
