//! Multi-device simulator for the beacon engine.
//!
//! Runs several engines over an in-process lossy LAN on a virtual clock and
//! reports delivery and acknowledgement statistics.

pub mod config;
pub mod sim;

pub use config::{SimConfig, SimConfigError};
pub use sim::{run_scenario, DeviceReport, SimDevice, SimReport, Simulation, SIM_EPOCH_MS};
