use beacon_core::{PeerAddress, PeerId, SessionEpoch};

use crate::config::EngineConfig;
use crate::state::{EngineState, LocalIdentity};

pub fn local_identity() -> LocalIdentity {
    LocalIdentity::new(
        PeerId::parse("aaaaaaaa00000000").expect("local id"),
        SessionEpoch::from_unix_secs(0x6700_0000),
    )
}

pub fn remote_id(n: u64) -> PeerId {
    PeerId::parse(&format!("{n:016x}")).expect("remote id")
}

pub fn state() -> EngineState {
    EngineState::new(local_identity(), EngineConfig::default())
}

/// Registers a peer at `address` with a known id.
pub fn with_peer(state: &mut EngineState, address: &str, peer_id: &PeerId) {
    let address = PeerAddress::new(address);
    let capacity = state.config.live_history_capacity;
    state.directory.get_or_create(&address, None, 0, capacity);
    state.directory.bind_peer_id(&address, peer_id);
}
