//! Beacon messaging engine.
//!
//! Turns a broadcast-only discovery substrate into session-aware messaging:
//! peer presence tracking, a fixed pool of outbound message slots,
//! piggy-backed acknowledgements confirmed by record visibility, periodic
//! reconciliation, and a persisted per-peer ledger.

pub mod ack;
pub mod config;
pub mod directory;
pub mod engine;
pub mod events;
pub mod persistence;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod slots;
pub mod state;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use engine::{Engine, EnginePhase};
pub use events::{EngineEvent, EngineSnapshot, SubstrateCommand};
pub use slots::SendRejected;
pub use state::LocalIdentity;
