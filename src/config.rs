//! Application-wide constants and startup configuration.
//!
//! Timing parameters and protocol limits live here so they can be tuned in
//! one place. The target peers are supplied at startup as a
//! [`GatewayConfig`]; `Default` gives the reference gateway.

use heapless::{String, Vec};

use crate::ble::transport::{ConnParams, ScanParams};
use crate::ble::PeerKind;

// BLE scanning

/// Scan interval (0.625 ms units). 0x00A0 = 100 ms.
pub const SCAN_INTERVAL: u16 = 0x00A0;

/// Scan window (0.625 ms units). 0x0050 = 50 ms.
pub const SCAN_WINDOW: u16 = 0x0050;

/// Scan timeout; 0 means scan until stopped.
pub const SCAN_TIMEOUT: u16 = 0;

// BLE connection

/// Connection interval range (in 1.25 ms units). 6 = 7.5 ms, 24 = 30 ms.
pub const BLE_CONN_INTERVAL_MIN: u16 = 6;
pub const BLE_CONN_INTERVAL_MAX: u16 = 24;

/// BLE slave latency (number of connection events the peripheral can skip).
pub const BLE_SLAVE_LATENCY: u16 = 0;

/// BLE supervision timeout (in 10 ms units). 400 = 4 s.
pub const BLE_SUP_TIMEOUT: u16 = 400;

/// Give up on a connection attempt after this long (10 ms units). 500 = 5 s.
pub const CONNECT_TIMEOUT: u16 = 500;

/// Maximum simultaneous central links.
pub const MAX_LINKS: usize = 3;

/// Number of discovery engine instances in the stack.
pub const DISCOVERY_ENGINES: usize = 2;

// GATT

/// Outbound command queue depth per client. Must be a power of two.
pub const COMMAND_QUEUE_LEN: usize = 8;

/// Largest ATT payload we carry (default MTU 23 minus 3 bytes of header).
pub const ATT_PAYLOAD_MAX_LEN: usize = 20;

/// Largest legacy advertisement payload.
pub const ADV_DATA_MAX_LEN: usize = 31;

/// Characteristics kept per discovered service.
pub const MAX_DISCOVERED_CHARS: usize = 8;

/// Maximum number of configured target identities.
pub const MAX_TARGETS: usize = 4;

/// Longest advertised name we match against.
pub const MAX_NAME_LEN: usize = 29;

/// How a target peer is recognised in its advertisement.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TargetMatch {
    /// Exact match of the "complete local name" field.
    Name(String<MAX_NAME_LEN>),
    /// 16-bit service UUID in the (in)complete UUID list.
    Uuid16(u16),
}

/// A peer the gateway is willing to connect to.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TargetIdentity {
    pub matcher: TargetMatch,
    pub peer: PeerKind,
}

impl TargetIdentity {
    /// Target matched by name. Names longer than [`MAX_NAME_LEN`] are
    /// truncated.
    pub fn named(name: &str, peer: PeerKind) -> Self {
        let mut s = String::new();
        for c in name.chars() {
            if s.push(c).is_err() {
                break;
            }
        }
        Self {
            matcher: TargetMatch::Name(s),
            peer,
        }
    }

    pub fn by_uuid(uuid: u16, peer: PeerKind) -> Self {
        Self {
            matcher: TargetMatch::Uuid16(uuid),
            peer,
        }
    }
}

/// Startup configuration of the central manager.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GatewayConfig {
    pub targets: Vec<TargetIdentity, MAX_TARGETS>,
    pub scan: ScanParams,
    pub conn: ConnParams,
    /// Concurrent links, at most [`MAX_LINKS`].
    pub max_links: usize,
    /// Switch the light when a remote-control button is pressed.
    pub remote_controls_light: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut targets = Vec::new();
        let _ = targets.push(TargetIdentity::named("Thingy", PeerKind::Environment));
        let _ = targets.push(TargetIdentity::named("Remote", PeerKind::RemoteControl));
        let _ = targets.push(TargetIdentity::named("PLAYBULB", PeerKind::Light));

        Self {
            targets,
            scan: ScanParams {
                active: true,
                interval: SCAN_INTERVAL,
                window: SCAN_WINDOW,
                timeout: SCAN_TIMEOUT,
            },
            conn: ConnParams {
                min_interval: BLE_CONN_INTERVAL_MIN,
                max_interval: BLE_CONN_INTERVAL_MAX,
                slave_latency: BLE_SLAVE_LATENCY,
                sup_timeout: BLE_SUP_TIMEOUT,
            },
            max_links: MAX_LINKS,
            remote_controls_light: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_every_peer_kind() {
        let cfg = GatewayConfig::default();
        for kind in PeerKind::ALL {
            assert!(cfg.targets.iter().any(|t| t.peer == kind));
        }
        assert_eq!(cfg.max_links, MAX_LINKS);
        assert!(cfg.scan.active);
    }

    #[test]
    fn long_names_are_truncated() {
        let t = TargetIdentity::named("ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789", PeerKind::Light);
        match t.matcher {
            TargetMatch::Name(n) => assert_eq!(n.len(), MAX_NAME_LEN),
            TargetMatch::Uuid16(_) => panic!("expected a name matcher"),
        }
    }

    #[test]
    fn queue_len_is_power_of_two() {
        assert!(COMMAND_QUEUE_LEN.is_power_of_two());
    }
}
