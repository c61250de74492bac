use std::collections::BTreeMap;

use beacon_core::MessageId;
use beacon_transport::substrate::RequestId;

use crate::config::{millis, EngineConfig};
use crate::registry::RecordKey;

/// One-shot deferred work, keyed by due time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    SlotTimeout {
        slot: u8,
        message_id: MessageId,
    },
    /// Withdraws a time-limited record if `request` is still current.
    ExpireRecord {
        key: RecordKey,
        request: RequestId,
    },
    RetryPublish {
        key: RecordKey,
        request: RequestId,
    },
    SaveLedger,
    Reconnect,
}

/// Deadline-ordered one-shot timers. Ties fire in scheduling order.
#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: BTreeMap<(u64, u64), Task>,
    seq: u64,
}

impl Scheduler {
    pub fn schedule(&mut self, due: u64, task: Task) {
        self.seq += 1;
        self.tasks.insert((due, self.seq), task);
    }

    /// Removes and returns every task due at or before `now`.
    pub fn pop_due(&mut self, now: u64) -> Vec<Task> {
        let mut due = Vec::new();
        while let Some(entry) = self.tasks.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    pub fn cancel_all(&mut self) {
        self.tasks.clear();
    }

    /// Drops pending tasks matching `pred`.
    pub fn cancel_where(&mut self, pred: impl Fn(&Task) -> bool) {
        self.tasks.retain(|_, task| !pred(task));
    }

    /// Moves pending expiries for `key` from a replaced request to the one
    /// that took its place.
    pub fn retarget_expiry(&mut self, key: &RecordKey, from: RequestId, to: RequestId) {
        for task in self.tasks.values_mut() {
            if let Task::ExpireRecord { key: k, request } = task {
                if k == key && *request == from {
                    *request = to;
                }
            }
        }
    }

    pub fn contains(&self, pred: impl Fn(&Task) -> bool) -> bool {
        self.tasks.values().any(pred)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.tasks.keys().next().map(|(due, _)| *due)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Recurring engine duties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Periodic {
    Heartbeat,
    AckUpdate,
    VisibilityCheck,
    StaleSweep,
    SyncCheck,
    Discovery,
}

impl Periodic {
    pub const ALL: [Periodic; 6] = [
        Periodic::Heartbeat,
        Periodic::AckUpdate,
        Periodic::VisibilityCheck,
        Periodic::StaleSweep,
        Periodic::SyncCheck,
        Periodic::Discovery,
    ];

    pub fn interval_ms(self, config: &EngineConfig) -> u64 {
        let interval = match self {
            Periodic::Heartbeat => config.heartbeat_interval,
            Periodic::AckUpdate => config.ack_update_interval,
            Periodic::VisibilityCheck => config.visibility_check_interval,
            Periodic::StaleSweep => config.stale_sweep_interval,
            Periodic::SyncCheck => config.sync_check_interval,
            Periodic::Discovery => config.discovery_interval,
        };
        millis(interval).max(1)
    }
}

/// Next-due times for every [`Periodic`] duty.
#[derive(Debug, Default)]
pub struct PeriodicSchedule {
    next_due: BTreeMap<Periodic, u64>,
}

impl PeriodicSchedule {
    /// Arms every duty to first fire one interval after `now`.
    pub fn arm(&mut self, now: u64, config: &EngineConfig) {
        self.next_due = Periodic::ALL
            .iter()
            .map(|p| (*p, now.saturating_add(p.interval_ms(config))))
            .collect();
    }

    pub fn disarm(&mut self) {
        self.next_due.clear();
    }

    pub fn is_armed(&self) -> bool {
        !self.next_due.is_empty()
    }

    /// Returns the duties due at `now`, rescheduling each one interval later.
    ///
    /// A duty that fell several intervals behind fires once.
    pub fn due(&mut self, now: u64, config: &EngineConfig) -> Vec<Periodic> {
        let mut fired = Vec::new();
        for (periodic, due) in self.next_due.iter_mut() {
            if *due <= now {
                fired.push(*periodic);
                *due = now.saturating_add(periodic.interval_ms(config));
            }
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.next_due.values().min().copied()
    }
}

#[cfg(test)]
mod tests {
    use beacon_transport::substrate::RequestId;

    use super::{Periodic, PeriodicSchedule, Scheduler, Task};
    use crate::config::EngineConfig;
    use crate::registry::RecordKey;
    use crate::test_support::remote_id;

    #[test]
    fn tasks_pop_in_deadline_then_insertion_order() {
        let mut scheduler = Scheduler::default();
        scheduler.schedule(20, Task::Reconnect);
        scheduler.schedule(10, Task::SaveLedger);
        scheduler.schedule(10, Task::Reconnect);

        assert_eq!(scheduler.next_deadline(), Some(10));
        assert_eq!(scheduler.pop_due(9), Vec::new());
        assert_eq!(
            scheduler.pop_due(15),
            vec![Task::SaveLedger, Task::Reconnect]
        );
        assert_eq!(scheduler.len(), 1);
        scheduler.cancel_where(|t| matches!(t, Task::Reconnect));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn periodic_duties_fire_on_their_interval() {
        let config = EngineConfig::default();
        let mut schedule = PeriodicSchedule::default();
        schedule.arm(0, &config);
        assert_eq!(schedule.next_deadline(), Some(2_000));
        assert_eq!(schedule.due(2_000, &config), vec![Periodic::AckUpdate]);

        let fired = schedule.due(10_000, &config);
        assert!(fired.contains(&Periodic::Heartbeat));
        assert!(fired.contains(&Periodic::SyncCheck));
        assert!(!fired.contains(&Periodic::Discovery));

        schedule.disarm();
        assert!(schedule.due(100_000, &config).is_empty());
    }

    #[test]
    fn expiry_follows_a_retried_request() {
        let mut scheduler = Scheduler::default();
        let key = RecordKey::Sync(remote_id(1));
        scheduler.schedule(
            30,
            Task::ExpireRecord {
                key: key.clone(),
                request: RequestId(1),
            },
        );
        scheduler.schedule(
            30,
            Task::ExpireRecord {
                key: RecordKey::Ack,
                request: RequestId(1),
            },
        );
        scheduler.retarget_expiry(&key, RequestId(1), RequestId(5));
        assert_eq!(
            scheduler.pop_due(30),
            vec![
                Task::ExpireRecord {
                    key,
                    request: RequestId(5),
                },
                Task::ExpireRecord {
                    key: RecordKey::Ack,
                    request: RequestId(1),
                },
            ]
        );
    }
}
