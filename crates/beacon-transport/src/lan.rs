//! In-process broadcast LAN used by tests and the simulator.
//!
//! Every device's published records are visible to every other device,
//! subject to configurable loss and duplication, the way passive DNS-SD
//! browsing behaves on a noisy network.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use beacon_codec::RecordFields;
use beacon_core::PeerAddress;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::substrate::{
    DiscoverySubstrate, RecordHandle, RequestId, SubstrateEvent, SubstrateHealthSnapshot,
};

/// Delivery conditions applied to every observation.
#[derive(Debug, Clone, Copy)]
pub struct LanConditions {
    /// Probability in `[0.0, 1.0]` that one observation is lost.
    pub loss: f64,
    /// Probability in `[0.0, 1.0]` that one observation is delivered twice.
    pub duplicate: f64,
    /// RNG seed, so lossy runs are reproducible.
    pub seed: u64,
}

impl Default for LanConditions {
    fn default() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            seed: 7,
        }
    }
}

#[derive(Debug, Default)]
struct Device {
    service_name: String,
    records: BTreeMap<RecordHandle, (String, RecordFields)>,
    inbox: VecDeque<SubstrateEvent>,
    health: SubstrateHealthSnapshot,
}

#[derive(Debug)]
struct LanInner {
    devices: BTreeMap<PeerAddress, Device>,
    conditions: LanConditions,
    rng: StdRng,
    next_handle: u64,
}

impl LanInner {
    /// Queues an observation at `to`, applying loss and duplication.
    fn observe(&mut self, to: &PeerAddress, event: SubstrateEvent) -> usize {
        if self.rng.gen::<f64>() < self.conditions.loss {
            return 0;
        }
        let copies = if self.rng.gen::<f64>() < self.conditions.duplicate {
            2
        } else {
            1
        };
        let Some(device) = self.devices.get_mut(to) else {
            return 0;
        };
        for _ in 0..copies {
            if let SubstrateEvent::RecordObserved { .. } = event {
                device.health.records_observed += 1;
            }
            device.inbox.push_back(event.clone());
        }
        copies
    }

    fn others(&self, of: &PeerAddress) -> Vec<PeerAddress> {
        self.devices.keys().filter(|a| *a != of).cloned().collect()
    }
}

/// Shared handle to the simulated network.
#[derive(Debug, Clone)]
pub struct SharedLan {
    inner: Arc<Mutex<LanInner>>,
}

impl Default for SharedLan {
    fn default() -> Self {
        Self::new(LanConditions::default())
    }
}

impl SharedLan {
    pub fn new(conditions: LanConditions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LanInner {
                devices: BTreeMap::new(),
                conditions,
                rng: StdRng::seed_from_u64(conditions.seed),
                next_handle: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LanInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a device and returns its substrate driver.
    pub fn join(
        &self,
        address: impl Into<String>,
        service_name: impl Into<String>,
    ) -> LanSubstrate {
        let address = PeerAddress::new(address);
        self.lock().devices.insert(
            address.clone(),
            Device {
                service_name: service_name.into(),
                ..Device::default()
            },
        );
        LanSubstrate {
            address,
            lan: self.clone(),
        }
    }

    pub fn set_conditions(&self, conditions: LanConditions) {
        let mut inner = self.lock();
        inner.conditions = conditions;
        inner.rng = StdRng::seed_from_u64(conditions.seed);
    }

    /// Delivers every currently published record to every other device once.
    ///
    /// Returns the number of observations queued.
    pub fn advertise_round(&self) -> usize {
        let mut inner = self.lock();
        let snapshot: Vec<(PeerAddress, Vec<RecordFields>)> = inner
            .devices
            .iter()
            .map(|(addr, d)| (addr.clone(), d.records.values().map(|(_, f)| f.clone()).collect()))
            .collect();
        let mut delivered = 0;
        for (from, records) in snapshot {
            for to in inner.others(&from) {
                for fields in &records {
                    delivered += inner.observe(
                        &to,
                        SubstrateEvent::RecordObserved {
                            address: from.clone(),
                            fields: fields.clone(),
                        },
                    );
                }
            }
        }
        delivered
    }

    /// Injects a connection loss at one device. Its published records are
    /// dropped along with the connection.
    pub fn disconnect(&self, address: &str) {
        if let Some(device) = self.lock().devices.get_mut(&PeerAddress::new(address)) {
            device.records.clear();
            device.inbox.push_back(SubstrateEvent::Disconnected);
        }
    }

    /// Records currently published by a device, as `(name, fields)`.
    pub fn published_records(&self, address: &str) -> Vec<(String, RecordFields)> {
        self.lock()
            .devices
            .get(&PeerAddress::new(address))
            .map(|d| d.records.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// One device's view of a [`SharedLan`].
#[derive(Debug, Clone)]
pub struct LanSubstrate {
    address: PeerAddress,
    lan: SharedLan,
}

impl LanSubstrate {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }
}

impl DiscoverySubstrate for LanSubstrate {
    type Error = String;

    fn publish(
        &mut self,
        request: RequestId,
        name: &str,
        fields: &RecordFields,
    ) -> Result<(), Self::Error> {
        let mut inner = self.lan.lock();
        inner.next_handle += 1;
        let handle = RecordHandle(inner.next_handle);
        let device = inner
            .devices
            .get_mut(&self.address)
            .ok_or_else(|| format!("device {} left the lan", self.address))?;
        device.health.publish_requests += 1;
        device
            .records
            .insert(handle, (name.to_string(), fields.clone()));
        device.inbox.push_back(SubstrateEvent::PublishCompleted {
            request,
            result: Ok(handle),
        });
        for to in inner.others(&self.address) {
            inner.observe(
                &to,
                SubstrateEvent::RecordObserved {
                    address: self.address.clone(),
                    fields: fields.clone(),
                },
            );
        }
        Ok(())
    }

    fn withdraw(&mut self, handle: RecordHandle) -> Result<(), Self::Error> {
        let mut inner = self.lan.lock();
        let device = inner
            .devices
            .get_mut(&self.address)
            .ok_or_else(|| format!("device {} left the lan", self.address))?;
        device.health.withdraw_requests += 1;
        if device.records.remove(&handle).is_none() {
            tracing::debug!(%handle, address = %self.address, "withdraw of unknown record");
        }
        Ok(())
    }

    fn discover(&mut self) -> Result<(), Self::Error> {
        let mut inner = self.lan.lock();
        let others: Vec<(PeerAddress, String, Vec<RecordFields>)> = inner
            .devices
            .iter()
            .filter(|(addr, _)| **addr != self.address)
            .map(|(addr, d)| {
                (
                    addr.clone(),
                    d.service_name.clone(),
                    d.records.values().map(|(_, f)| f.clone()).collect(),
                )
            })
            .collect();
        for (from, name, records) in others {
            inner.observe(
                &self.address,
                SubstrateEvent::ServiceNameObserved {
                    address: from.clone(),
                    name,
                },
            );
            for fields in records {
                inner.observe(
                    &self.address,
                    SubstrateEvent::RecordObserved {
                        address: from.clone(),
                        fields,
                    },
                );
            }
        }
        if let Some(device) = inner.devices.get_mut(&self.address) {
            device
                .inbox
                .push_back(SubstrateEvent::DiscoveryCompleted { ok: true });
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<SubstrateEvent> {
        self.lan
            .lock()
            .devices
            .get_mut(&self.address)
            .and_then(|d| d.inbox.pop_front())
    }

    fn health_snapshot(&self) -> SubstrateHealthSnapshot {
        self.lan
            .lock()
            .devices
            .get(&self.address)
            .map(|d| d.health.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use beacon_codec::RecordFields;

    use super::{LanConditions, SharedLan};
    use crate::substrate::{DiscoverySubstrate, RequestId, SubstrateEvent};

    fn drain(sub: &mut impl DiscoverySubstrate) -> Vec<SubstrateEvent> {
        std::iter::from_fn(|| sub.poll_event()).collect()
    }

    #[test]
    fn publish_is_observed_by_other_devices_only() {
        let lan = SharedLan::default();
        let mut a = lan.join("aa:aa", "alpha [bcn]");
        let mut b = lan.join("bb:bb", "bravo [bcn]");

        let mut fields = RecordFields::new();
        fields.insert("k", "hb");
        a.publish(RequestId(1), "bcn-hb-a", &fields).expect("publish");

        let a_events = drain(&mut a);
        assert!(matches!(
            a_events.as_slice(),
            [SubstrateEvent::PublishCompleted { result: Ok(_), .. }]
        ));
        let b_events = drain(&mut b);
        assert_eq!(b_events.len(), 1);
        assert!(matches!(
            &b_events[0],
            SubstrateEvent::RecordObserved { address, .. } if address.as_str() == "aa:aa"
        ));
    }

    #[test]
    fn withdrawn_records_stop_being_advertised() {
        let lan = SharedLan::default();
        let mut a = lan.join("aa:aa", "alpha");
        let mut b = lan.join("bb:bb", "bravo");
        a.publish(RequestId(1), "bcn-hb-a", &RecordFields::new())
            .expect("publish");
        let handle = match drain(&mut a).pop() {
            Some(SubstrateEvent::PublishCompleted { result: Ok(h), .. }) => h,
            other => panic!("unexpected completion: {other:?}"),
        };
        drain(&mut b);

        assert_eq!(lan.advertise_round(), 1);
        a.withdraw(handle).expect("withdraw");
        assert_eq!(lan.advertise_round(), 0);
        assert!(lan.published_records("aa:aa").is_empty());
    }

    #[test]
    fn discover_reports_service_names_and_completion() {
        let lan = SharedLan::default();
        let _a = lan.join("aa:aa", "alpha [bcn]");
        let mut b = lan.join("bb:bb", "bravo");
        b.discover().expect("discover");
        let events = drain(&mut b);
        assert!(events.iter().any(|e| matches!(
            e,
            SubstrateEvent::ServiceNameObserved { name, .. } if name == "alpha [bcn]"
        )));
        assert!(matches!(
            events.last(),
            Some(SubstrateEvent::DiscoveryCompleted { ok: true })
        ));
    }

    #[test]
    fn full_loss_drops_every_observation() {
        let lan = SharedLan::new(LanConditions {
            loss: 1.0,
            duplicate: 0.0,
            seed: 1,
        });
        let mut a = lan.join("aa:aa", "alpha");
        let mut b = lan.join("bb:bb", "bravo");
        a.publish(RequestId(1), "x", &RecordFields::new())
            .expect("publish");
        assert!(drain(&mut b).is_empty());
        assert_eq!(lan.advertise_round(), 0);
    }
}
