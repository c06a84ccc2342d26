//! Boundary to the BLE link layer.
//!
//! The transport is an opaque request-submission API plus an event source.
//! Requests return immediately; completions and everything the radio
//! observes come back as [`TransportEvent`]s.

use heapless::Vec;

use crate::ble::{BleUuid, ConnHandle};
use crate::config::{ADV_DATA_MAX_LEN, ATT_PAYLOAD_MAX_LEN, MAX_DISCOVERED_CHARS};
use crate::error::TransportError;

/// Peer device address as reported in an advertisement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerAddress {
    /// Public / random static / resolvable ... as defined by the stack.
    pub addr_type: u8,
    /// Little-endian address bytes.
    pub bytes: [u8; 6],
}

/// GAP scan parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanParams {
    /// Request scan responses.
    pub active: bool,
    /// Scan interval (0.625 ms units).
    pub interval: u16,
    /// Scan window (0.625 ms units).
    pub window: u16,
    /// Scan timeout (10 ms units); 0 scans until stopped.
    pub timeout: u16,
}

/// GAP connection parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParams {
    /// Minimum connection interval (1.25 ms units).
    pub min_interval: u16,
    /// Maximum connection interval (1.25 ms units).
    pub max_interval: u16,
    /// Connection events the peripheral may skip.
    pub slave_latency: u16,
    /// Supervision timeout (10 ms units).
    pub sup_timeout: u16,
}

/// ATT write flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteKind {
    /// Write request; completion is a write response.
    Request,
    /// Write command (without response); completion is the TX-complete
    /// event, reported as a write response as well.
    Command,
}

/// Raw ATT payload (notification data, read response, write value).
pub type Payload = Vec<u8, ATT_PAYLOAD_MAX_LEN>;

/// One characteristic found under a discovered service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DiscoveredCharacteristic {
    /// 16-bit characteristic UUID (within the service's namespace).
    pub uuid: u16,
    pub value_handle: u16,
    /// CCCD handle, if the characteristic has one.
    pub cccd_handle: Option<u16>,
}

/// Result of discovering one service on one link.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DiscoveryResult {
    pub link: ConnHandle,
    pub service: BleUuid,
    pub characteristics: Vec<DiscoveredCharacteristic, MAX_DISCOVERED_CHARS>,
}

impl DiscoveryResult {
    pub fn new(link: ConnHandle, service: BleUuid) -> Self {
        Self {
            link,
            service,
            characteristics: Vec::new(),
        }
    }

    /// Builder used by transports and tests; extra characteristics beyond
    /// capacity are ignored.
    pub fn with(mut self, uuid: u16, value_handle: u16, cccd_handle: Option<u16>) -> Self {
        let _ = self.characteristics.push(DiscoveredCharacteristic {
            uuid,
            value_handle,
            cccd_handle,
        });
        self
    }

    pub fn find(&self, uuid: u16) -> Option<&DiscoveredCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Advertisement report.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvReport {
    pub peer: PeerAddress,
    pub rssi: i8,
    pub data: Vec<u8, ADV_DATA_MAX_LEN>,
}

/// Events delivered by the transport, in the order it produced them.
///
/// For any one link, `Connected` precedes every other event and
/// `Disconnected` is terminal until the identifier is reused.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportEvent {
    Advertisement(AdvReport),
    Connected {
        link: ConnHandle,
        peer: PeerAddress,
    },
    Disconnected {
        link: ConnHandle,
        reason: u8,
    },
    DiscoveryComplete(DiscoveryResult),
    /// The requested service is not present on the peer.
    DiscoveryFailed {
        link: ConnHandle,
        service: BleUuid,
    },
    Notification {
        link: ConnHandle,
        handle: u16,
        data: Payload,
    },
    WriteResponse {
        link: ConnHandle,
    },
    ReadResponse {
        link: ConnHandle,
        handle: u16,
        data: Payload,
    },
    /// A connection attempt timed out. Scanning itself never times out.
    ConnectionTimeout,
    /// A GATT client procedure timed out on `link`.
    GattTimeout {
        link: ConnHandle,
    },
    /// The peer asks for new connection parameters.
    ConnParamUpdateRequest {
        link: ConnHandle,
        params: ConnParams,
    },
}

/// Request side of the BLE stack.
///
/// GATT reads and writes allow exactly one outstanding operation per link;
/// a second submission before the response fails with
/// [`TransportError::Busy`].
pub trait Transport {
    fn scan_start(&mut self, params: &ScanParams) -> Result<(), TransportError>;

    fn scan_stop(&mut self) -> Result<(), TransportError>;

    fn connect(
        &mut self,
        peer: &PeerAddress,
        scan: &ScanParams,
        params: &ConnParams,
    ) -> Result<(), TransportError>;

    fn disconnect(&mut self, link: ConnHandle) -> Result<(), TransportError>;

    /// Start discovering `service` on `link`. `Busy` means this discovery
    /// engine instance is taken.
    fn discovery_start(&mut self, link: ConnHandle, service: BleUuid) -> Result<(), TransportError>;

    fn gatt_read(&mut self, link: ConnHandle, handle: u16) -> Result<(), TransportError>;

    fn gatt_write(
        &mut self,
        link: ConnHandle,
        handle: u16,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError>;

    fn conn_param_update(&mut self, link: ConnHandle, params: &ConnParams) -> Result<(), TransportError>;

    /// Register a 128-bit vendor base UUID (little-endian bytes) and return
    /// the namespace index assigned by the stack.
    fn register_vendor_uuid(&mut self, base: &[u8; 16]) -> Result<u8, TransportError>;

    /// Make future discoveries look for `service`.
    fn register_service(&mut self, service: BleUuid) -> Result<(), TransportError>;
}
