//! BLE central gateway core.
//!
//! Connects to a fixed set of peripherals (environmental sensor, button
//! remote, light), discovers their services, subscribes to notifications
//! and turns them into typed [`ble::AppEvent`]s.
//!
//! Everything in this crate is host-testable: the radio is reached through
//! the [`ble::transport::Transport`] trait and events come back as
//! [`ble::transport::TransportEvent`]s. The embedded binary (`main.rs`,
//! feature `embedded`) provides the nRF SoftDevice implementation.
//!
//! Usage: `cargo test` on the host.

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible to every module.
mod fmt;

pub mod ble;
pub mod config;
pub mod error;

pub use ble::central::{CentralManager, SlotState};
pub use ble::clients::PeerClients;
pub use ble::transport::{Transport, TransportEvent};
pub use ble::{AppEvent, EventSink, PeerKind};
pub use config::GatewayConfig;
pub use error::{Error, TransportError};
