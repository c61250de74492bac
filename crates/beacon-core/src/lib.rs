//! Core beacon primitives shared across crates.
//!
//! Includes peer/session/message identifiers, identity derivation, clock
//! helpers, and base errors.

pub mod error;
pub mod hash;
pub mod time;
pub mod types;

pub use error::BeaconError;
pub use types::{MessageId, PeerAddress, PeerId, SessionEpoch, PEER_SHORT_ID_LEN};
