//! Discovery-substrate abstractions for beacon.
//!
//! The engine only depends on the request/completion substrate trait defined
//! here; concrete DNS-SD style drivers live outside this workspace.

pub mod lan;
pub mod substrate;
