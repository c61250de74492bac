use std::collections::HashMap;

use beacon_core::{PeerAddress, PeerId, SessionEpoch};

use crate::persistence::Ledger;
use crate::state::Peer;

/// Known peers keyed by substrate address, with a peer-id index.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<PeerAddress, Peer>,
    by_id: HashMap<PeerId, PeerAddress>,
}

/// Outcome of [`validate_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCheck {
    /// First epoch seen for this peer.
    Adopted,
    /// Same epoch as before.
    Accepted,
    /// Newer epoch: the peer process restarted and history was cleared.
    Restarted,
    /// Older epoch: stale substrate cache, record must be dropped.
    Rejected,
}

impl SessionCheck {
    pub fn accepted(self) -> bool {
        !matches!(self, SessionCheck::Rejected)
    }
}

impl PeerDirectory {
    /// Returns the peer at `address`, creating it on first observation.
    ///
    /// The flag is true when the peer was created by this call.
    pub fn get_or_create(
        &mut self,
        address: &PeerAddress,
        observed_name: Option<&str>,
        now: u64,
        history_capacity: usize,
    ) -> (&mut Peer, bool) {
        let created = !self.peers.contains_key(address);
        let peer = self
            .peers
            .entry(address.clone())
            .or_insert_with(|| Peer::new(address.clone(), now, history_capacity));
        if let Some(name) = observed_name.filter(|n| !n.is_empty()) {
            peer.display_name = name.to_string();
        }
        (peer, created)
    }

    /// Associates the application-level id with an address.
    pub fn bind_peer_id(&mut self, address: &PeerAddress, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(address) {
            if peer.peer_id.as_ref() != Some(peer_id) {
                peer.peer_id = Some(peer_id.clone());
            }
            self.by_id.insert(peer_id.clone(), address.clone());
        }
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&Peer> {
        self.peers.get(address)
    }

    pub fn get_mut(&mut self, address: &PeerAddress) -> Option<&mut Peer> {
        self.peers.get_mut(address)
    }

    pub fn address_of(&self, peer_id: &PeerId) -> Option<&PeerAddress> {
        self.by_id.get(peer_id)
    }

    pub fn by_peer_id_mut(&mut self, peer_id: &PeerId) -> Option<&mut Peer> {
        let address = self.by_id.get(peer_id)?;
        self.peers.get_mut(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    /// Addresses in a stable order, for deterministic iteration.
    pub fn sorted_addresses(&self) -> Vec<PeerAddress> {
        let mut out: Vec<_> = self.peers.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Removes peers silent for longer than `ttl_ms` and returns them.
    pub fn evict_stale(&mut self, now: u64, ttl_ms: u64) -> Vec<Peer> {
        let stale: Vec<PeerAddress> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.last_seen_at) > ttl_ms)
            .map(|(a, _)| a.clone())
            .collect();
        let mut evicted = Vec::with_capacity(stale.len());
        for address in stale {
            if let Some(peer) = self.peers.remove(&address) {
                if let Some(id) = &peer.peer_id {
                    if self.by_id.get(id) == Some(&address) {
                        self.by_id.remove(id);
                    }
                }
                evicted.push(peer);
            }
        }
        evicted
    }
}

/// Checks an incoming record's session epoch against what is known for `peer`.
///
/// Must run before any record handler mutates peer state. On rejection only
/// `last_seen_at` is refreshed.
pub fn validate_session(
    peer: &mut Peer,
    ledger: &mut Ledger,
    incoming: &SessionEpoch,
    now: u64,
) -> SessionCheck {
    let Some(current) = peer.session_epoch.clone() else {
        if let Some(peer_id) = &peer.peer_id {
            let persisted_older = ledger
                .get(peer_id)
                .and_then(|s| s.last_session_epoch.as_ref())
                .is_some_and(|known| incoming.is_newer_than(known));
            if persisted_older {
                tracing::info!(
                    %peer_id,
                    epoch = %incoming,
                    "peer restarted since last run; clearing ledger history"
                );
                ledger.clear_history(peer_id);
            }
            ledger.set_session_epoch(peer_id, incoming);
        }
        peer.session_epoch = Some(incoming.clone());
        return SessionCheck::Adopted;
    };

    if *incoming == current {
        return SessionCheck::Accepted;
    }
    if incoming.is_newer_than(&current) {
        tracing::info!(
            address = %peer.address,
            old = %current,
            new = %incoming,
            "peer session restarted"
        );
        peer.reset_session_state();
        peer.session_epoch = Some(incoming.clone());
        if let Some(peer_id) = &peer.peer_id {
            ledger.clear_history(peer_id);
            ledger.set_session_epoch(peer_id, incoming);
        }
        return SessionCheck::Restarted;
    }

    tracing::debug!(
        address = %peer.address,
        stale = %incoming,
        current = %current,
        "dropping record from older session"
    );
    peer.last_seen_at = now;
    SessionCheck::Rejected
}

/// Returns the new online value if it changed since the last check.
pub fn check_online_transition(peer: &mut Peer, now: u64, threshold_ms: u64) -> Option<bool> {
    let online = peer.is_online(now, threshold_ms);
    if online == peer.was_online {
        return None;
    }
    peer.was_online = online;
    Some(online)
}

/// Splits a discoverable device name into display name and app flag.
pub fn parse_service_name(name: &str, marker: &str) -> (String, bool) {
    if marker.is_empty() || !name.contains(marker) {
        return (name.trim().to_string(), false);
    }
    (name.replace(marker, "").trim().to_string(), true)
}
