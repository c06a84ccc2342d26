//! Two-button remote control client.
//!
//! The remote exposes one characteristic per button; each notification is a
//! single byte, non-zero while the button is held.

use crate::ble::clients::{find_handles, ClientCore, GattClient};
use crate::ble::transport::{DiscoveryResult, Transport};
use crate::ble::{AppEvent, BleUuid, Button, CharHandles, ConnHandle, EventSink, PeerKind, ServiceHandles};
use crate::error::Error;

/// Vendor base `E54B0000-67F5-479E-8711-B3B99198CE6C`, little-endian.
pub const BUTTON_BASE_UUID: [u8; 16] = [
    0x6C, 0xCE, 0x98, 0x91, 0xB9, 0xB3, 0x11, 0x87, 0x9E, 0x47, 0xF5, 0x67, 0x00, 0x00, 0x4B, 0xE5,
];
pub const BUTTON_SERVICE_UUID: u16 = 0x0001;
pub const BUTTON_ON_CHAR_UUID: u16 = 0x0002;
pub const BUTTON_OFF_CHAR_UUID: u16 = 0x0003;

pub struct RemoteControlClient {
    core: ClientCore,
    on_button: CharHandles,
    off_button: CharHandles,
}

impl Default for RemoteControlClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteControlClient {
    pub fn new() -> Self {
        Self {
            core: ClientCore::new(PeerKind::RemoteControl, BleUuid::vendor(BUTTON_SERVICE_UUID, 0)),
            on_button: CharHandles::UNASSIGNED,
            off_button: CharHandles::UNASSIGNED,
        }
    }

    pub fn on_button(&self) -> CharHandles {
        self.on_button
    }

    pub fn off_button(&self) -> CharHandles {
        self.off_button
    }
}

impl GattClient for RemoteControlClient {
    fn core(&self) -> &ClientCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ClientCore {
        &mut self.core
    }

    fn init(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        self.core.register(transport, Some(&BUTTON_BASE_UUID))
    }

    fn on_discovery_complete(
        &mut self,
        result: &DiscoveryResult,
        sink: &mut dyn EventSink,
    ) -> Option<ServiceHandles> {
        if !self.core.accepts(result) {
            return None;
        }

        let found = ServiceHandles::RemoteControl {
            on_button: find_handles(result, BUTTON_ON_CHAR_UUID),
            off_button: find_handles(result, BUTTON_OFF_CHAR_UUID),
        };
        if self.core.owns(result.link) {
            self.handles_assign(result.link, &found);
        }

        info!("button service on {:?}: {:?}", result.link, found);
        sink.publish(AppEvent::Discovered {
            peer: self.core.peer(),
            link: result.link,
            handles: found,
        });
        Some(found)
    }

    fn handles_assign(&mut self, link: ConnHandle, handles: &ServiceHandles) {
        if self.core.associate(link) {
            self.clear_handles();
        }
        if let ServiceHandles::RemoteControl {
            on_button,
            off_button,
        } = handles
        {
            self.on_button.fill_gaps(on_button);
            self.off_button.fill_gaps(off_button);
        }
    }

    fn on_ready(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        let on_button = self.on_button;
        let off_button = self.off_button;
        self.core.notify_enable(transport, &on_button)?;
        self.core.notify_enable(transport, &off_button)
    }

    fn on_notification(&mut self, link: ConnHandle, handle: u16, data: &[u8], sink: &mut dyn EventSink) {
        if !self.core.owns(link) {
            return;
        }

        let button = if Some(handle) == self.on_button.value {
            Button::On
        } else if Some(handle) == self.off_button.value {
            Button::Off
        } else {
            return;
        };

        let Some(state) = data.first() else {
            warn!("empty {:?} button notification", button);
            return;
        };
        sink.publish(AppEvent::Button {
            peer: self.core.peer(),
            button,
            pressed: *state != 0,
        });
    }

    fn clear_handles(&mut self) {
        self.on_button = CharHandles::UNASSIGNED;
        self.off_button = CharHandles::UNASSIGNED;
    }

    fn handles_unassigned(&self) -> bool {
        self.on_button.is_unassigned() && self.off_button.is_unassigned()
    }
}
