//! Bridges a Kingsmith WalkingPad (A1/R1/R2) to the Bluetooth SIG Fitness
//! Machine Service.
//!
//! The bridge is a dual-role BLE process on one adapter: central/client to
//! the treadmill's proprietary protocol, peripheral/server advertising FTMS
//! (0x1826) so Apple Fitness, Zwift, and friends can subscribe to live
//! speed, distance, and elapsed time. [`bridge::Bridge`] is the supervisor;
//! [`bridge::BridgeHandle`] is the facade an external control surface
//! drives it through.

pub mod bluetooth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod telemetry;

pub use bridge::{Bridge, BridgeHandle, BridgeState, Snapshot};
pub use config::Config;
pub use error::{BridgeError, Result};
pub use telemetry::{BeltState, Telemetry};
