//! Bluetooth Low Energy central subsystem.
//!
//! The gateway drives the radio in **Central** role:
//!
//! 1. **Advertisement filter** - picks out peripherals advertising one of the
//!    configured target names (or 16-bit service UUIDs).
//! 2. **Central manager** - owns the active links, decides when to scan and
//!    connect, starts service discovery and reacts to disconnections.
//! 3. **Discovery dispatcher** - hands each discovered service to the GATT
//!    client that registered for it.
//! 4. **GATT clients** - one per peer type (environmental sensor, button
//!    remote, light) plus a battery client per peer type. Each owns its
//!    attribute handles and an outbound command queue.
//!
//! Everything here is synchronous and runs to completion per event; the
//! embedded binary feeds events from a single channel.

pub mod adv_parser;
pub mod central;
pub mod clients;
pub mod command_queue;
pub mod discovery;
pub mod transport;

/// Opaque connection identifier handed out by the transport.
///
/// Unique while the link is up; the transport reuses it after teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnHandle(pub u16);

/// Namespace of a 16-bit UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UuidKind {
    /// Bluetooth SIG base UUID.
    Sig,
    /// Vendor-specific base UUID, identified by the index the stack
    /// returned when the base was registered.
    Vendor(u8),
}

/// A 16-bit UUID within a namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BleUuid {
    pub uuid: u16,
    pub kind: UuidKind,
}

impl BleUuid {
    pub const fn sig(uuid: u16) -> Self {
        Self {
            uuid,
            kind: UuidKind::Sig,
        }
    }

    pub const fn vendor(uuid: u16, index: u8) -> Self {
        Self {
            uuid,
            kind: UuidKind::Vendor(index),
        }
    }
}

/// The kinds of peripheral this gateway serves. Each kind maps to one
/// target identity slot; at most one peer of each kind is connected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PeerKind {
    /// Thingy:52 style environmental sensor.
    Environment,
    /// Two-button remote control.
    RemoteControl,
    /// Playbulb style light.
    Light,
}

impl PeerKind {
    /// Identity slots in discovery priority order.
    pub const ALL: [PeerKind; 3] = [PeerKind::Environment, PeerKind::RemoteControl, PeerKind::Light];

    pub const fn index(self) -> usize {
        match self {
            PeerKind::Environment => 0,
            PeerKind::RemoteControl => 1,
            PeerKind::Light => 2,
        }
    }
}

/// The two buttons of the remote control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Button {
    On,
    Off,
}

/// Attribute handles of one characteristic: its value and, for
/// characteristics that notify, its client characteristic configuration
/// descriptor (CCCD).
///
/// `None` is the "unassigned" sentinel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharHandles {
    pub value: Option<u16>,
    pub cccd: Option<u16>,
}

impl CharHandles {
    pub const UNASSIGNED: Self = Self {
        value: None,
        cccd: None,
    };

    pub const fn new(value: u16, cccd: Option<u16>) -> Self {
        Self {
            value: Some(value),
            cccd,
        }
    }

    pub const fn is_unassigned(&self) -> bool {
        self.value.is_none() && self.cccd.is_none()
    }

    /// Fill in fields that are still unassigned; never overwrite an
    /// assigned field.
    pub fn fill_gaps(&mut self, other: &CharHandles) {
        if self.value.is_none() {
            self.value = other.value;
        }
        if self.cccd.is_none() {
            self.cccd = other.cccd;
        }
    }
}

/// Handle sets reported upstream when a client recognises its service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServiceHandles {
    Environment {
        temperature: CharHandles,
        humidity: CharHandles,
    },
    RemoteControl {
        on_button: CharHandles,
        off_button: CharHandles,
    },
    Light {
        color: CharHandles,
    },
    Battery {
        level: CharHandles,
    },
}

/// Typed events surfaced to the application layer, each tagged with the
/// peer that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AppEvent {
    /// Scanning was started (`true`) or stopped (`false`).
    Scanning(bool),
    /// A client recognised its service on `link`.
    Discovered {
        peer: PeerKind,
        link: ConnHandle,
        handles: ServiceHandles,
    },
    /// The peer's primary service is ready and notifications were requested.
    PeerReady { peer: PeerKind, link: ConnHandle },
    /// The peer disconnected.
    PeerLost { peer: PeerKind, link: ConnHandle },
    /// Battery level in percent.
    Battery { peer: PeerKind, percent: u8 },
    /// Temperature in Celsius, integer and fractional parts.
    Temperature {
        peer: PeerKind,
        integer: i8,
        decimal: u8,
    },
    /// Relative humidity in percent.
    Humidity { peer: PeerKind, percent: u8 },
    /// A remote-control button changed state.
    Button {
        peer: PeerKind,
        button: Button,
        pressed: bool,
    },
    /// The light was switched on or off.
    Light { peer: PeerKind, on: bool },
}

/// Consumer of decoded application events (display, cloud uplink, ...).
pub trait EventSink {
    fn publish(&mut self, event: AppEvent);
}

impl<const N: usize> EventSink for heapless::Vec<AppEvent, N> {
    fn publish(&mut self, event: AppEvent) {
        if self.push(event).is_err() {
            warn!("event buffer full - dropping {:?}", event);
        }
    }
}
