use rand::RngCore;

use crate::types::PeerId;

const PEER_ID_DOMAIN: &[u8] = b"beacon-peer-id-v1";

/// Computes BLAKE3 and returns the 32-byte digest value.
pub fn blake3_32(input: &[u8]) -> [u8; 32] {
    *blake3::hash(input).as_bytes()
}

/// Derives the application-level peer id from a hardware-backed identifier.
///
/// The same identifier always yields the same id, so the peer id is stable
/// across process restarts while the session epoch is not.
pub fn derive_peer_id(hardware_id: &str) -> PeerId {
    let mut input = Vec::with_capacity(PEER_ID_DOMAIN.len() + hardware_id.len());
    input.extend_from_slice(PEER_ID_DOMAIN);
    input.extend_from_slice(hardware_id.trim().as_bytes());
    let digest = blake3_32(&input);
    PeerId::from_hex_unchecked(hex::encode(&digest[..8]))
}

/// Generates a random hardware identifier for hosts that expose none.
pub fn random_hardware_id() -> String {
    let mut bytes = [0_u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::{blake3_32, derive_peer_id, random_hardware_id};

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(blake3_32(b"beacon"), blake3_32(b"beacon"));
        assert_ne!(blake3_32(b"beacon-a"), blake3_32(b"beacon-b"));
    }

    #[test]
    fn peer_id_is_stable_for_same_hardware_id() {
        let a = derive_peer_id("android-serial-0042");
        let b = derive_peer_id(" android-serial-0042 ");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
        assert_ne!(a, derive_peer_id("android-serial-0043"));
    }

    #[test]
    fn random_hardware_ids_differ() {
        assert_ne!(random_hardware_id(), random_hardware_id());
    }
}
