//! Tracks which substrate record currently represents each logical record.
//!
//! Publishing is request/completion: a completion may arrive after the
//! record was superseded or withdrawn. Such completions are withdrawn again
//! immediately so stale records never come back.

use std::collections::HashMap;

use beacon_codec::RecordFields;
use beacon_core::PeerId;
use beacon_transport::substrate::{RecordHandle, RequestId};

use crate::events::SubstrateCommand;

/// Logical record owned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Presence,
    Ack,
    Slot(u8),
    Sync(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub request: RequestId,
    pub name: String,
    pub fields: RecordFields,
    /// Set once the substrate confirms the publish.
    pub handle: Option<RecordHandle>,
}

/// What a publish completion meant for the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Confirmed(RecordKey),
    /// The current request for this key failed and should be retried.
    Failed(RecordKey),
    /// Completion for a request that is no longer current.
    Superseded,
}

#[derive(Debug, Default)]
pub struct RecordRegistry {
    next_request: u64,
    current: HashMap<RecordKey, Registration>,
}

impl RecordRegistry {
    fn next_request_id(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId(self.next_request)
    }

    /// Publishes `fields` under `key`, replacing whatever was there.
    pub fn publish(
        &mut self,
        key: RecordKey,
        name: String,
        fields: RecordFields,
        outbox: &mut Vec<SubstrateCommand>,
    ) -> RequestId {
        if let Some(handle) = self.current.get(&key).and_then(|r| r.handle) {
            outbox.push(SubstrateCommand::Withdraw { handle });
        }
        let request = self.next_request_id();
        outbox.push(SubstrateCommand::Publish {
            request,
            name: name.clone(),
            fields: fields.clone(),
        });
        self.current.insert(
            key,
            Registration {
                request,
                name,
                fields,
                handle: None,
            },
        );
        request
    }

    /// Re-issues the registration for `key` if `request` is still current.
    pub fn retry(
        &mut self,
        key: &RecordKey,
        request: RequestId,
        outbox: &mut Vec<SubstrateCommand>,
    ) -> Option<RequestId> {
        let registration = self.current.get(key)?;
        if registration.request != request || registration.handle.is_some() {
            return None;
        }
        let (name, fields) = (registration.name.clone(), registration.fields.clone());
        Some(self.publish(key.clone(), name, fields, outbox))
    }

    /// Withdraws the record for `key`. Returns false if nothing was registered.
    pub fn withdraw(&mut self, key: &RecordKey, outbox: &mut Vec<SubstrateCommand>) -> bool {
        let Some(registration) = self.current.remove(key) else {
            return false;
        };
        if let Some(handle) = registration.handle {
            outbox.push(SubstrateCommand::Withdraw { handle });
        }
        true
    }

    pub fn withdraw_all(&mut self, outbox: &mut Vec<SubstrateCommand>) {
        let mut keys: Vec<_> = self.current.keys().cloned().collect();
        keys.sort();
        for key in keys {
            self.withdraw(&key, outbox);
        }
    }

    pub fn on_publish_completed(
        &mut self,
        request: RequestId,
        result: Result<RecordHandle, String>,
        outbox: &mut Vec<SubstrateCommand>,
    ) -> CompletionOutcome {
        let key = self
            .current
            .iter()
            .find(|(_, r)| r.request == request)
            .map(|(k, _)| k.clone());
        match (key, result) {
            (Some(key), Ok(handle)) => {
                if let Some(registration) = self.current.get_mut(&key) {
                    registration.handle = Some(handle);
                }
                CompletionOutcome::Confirmed(key)
            }
            (Some(key), Err(reason)) => {
                tracing::warn!(?key, %reason, "record publish failed");
                CompletionOutcome::Failed(key)
            }
            (None, Ok(handle)) => {
                tracing::debug!(%handle, ?request, "withdrawing superseded record");
                outbox.push(SubstrateCommand::Withdraw { handle });
                CompletionOutcome::Superseded
            }
            (None, Err(_)) => CompletionOutcome::Superseded,
        }
    }

    /// Drops every registration without withdrawing.
    ///
    /// The request counter keeps running so late completions never match.
    pub fn forget_all(&mut self) {
        self.current.clear();
    }

    pub fn is_published(&self, key: &RecordKey) -> bool {
        self.current.get(key).is_some_and(|r| r.handle.is_some())
    }

    pub fn is_registered(&self, key: &RecordKey) -> bool {
        self.current.contains_key(key)
    }

    pub fn current_request(&self, key: &RecordKey) -> Option<RequestId> {
        self.current.get(key).map(|r| r.request)
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}
