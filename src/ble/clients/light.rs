//! Playbulb light client.
//!
//! The bulb is switched by writing a 4-byte colour (white, red, green,
//! blue) to the colour-setting characteristic with a write command. All
//! zeroes is off.

use crate::ble::clients::{find_handles, ClientCore, GattClient};
use crate::ble::transport::{DiscoveryResult, Transport, WriteKind};
use crate::ble::{AppEvent, BleUuid, CharHandles, ConnHandle, EventSink, PeerKind, ServiceHandles};
use crate::error::Error;

pub const LIGHT_SERVICE_UUID: u16 = 0xFF02;
pub const COLOR_SETTING_CHAR_UUID: u16 = 0xFFFC;

const COLOR_ON: [u8; 4] = [0xFF, 0x00, 0x00, 0x00];
const COLOR_OFF: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

pub struct LightClient {
    core: ClientCore,
    color: CharHandles,
}

impl Default for LightClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LightClient {
    pub fn new() -> Self {
        Self {
            core: ClientCore::new(PeerKind::Light, BleUuid::sig(LIGHT_SERVICE_UUID)),
            color: CharHandles::UNASSIGNED,
        }
    }

    pub fn color(&self) -> CharHandles {
        self.color
    }

    pub fn turn_on(&mut self, transport: &mut dyn Transport, sink: &mut dyn EventSink) -> Result<(), Error> {
        self.set(transport, sink, true)
    }

    pub fn turn_off(&mut self, transport: &mut dyn Transport, sink: &mut dyn EventSink) -> Result<(), Error> {
        self.set(transport, sink, false)
    }

    pub fn set(&mut self, transport: &mut dyn Transport, sink: &mut dyn EventSink, on: bool) -> Result<(), Error> {
        let color = self.color;
        let value = if on { &COLOR_ON } else { &COLOR_OFF };
        self.core.write(transport, &color, value, WriteKind::Command)?;
        debug!("light {}", if on { "on" } else { "off" });
        sink.publish(AppEvent::Light {
            peer: self.core.peer(),
            on,
        });
        Ok(())
    }
}

impl GattClient for LightClient {
    fn core(&self) -> &ClientCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ClientCore {
        &mut self.core
    }

    fn init(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        self.core.register(transport, None)
    }

    fn on_discovery_complete(
        &mut self,
        result: &DiscoveryResult,
        sink: &mut dyn EventSink,
    ) -> Option<ServiceHandles> {
        if !self.core.accepts(result) {
            return None;
        }

        let found = ServiceHandles::Light {
            color: find_handles(result, COLOR_SETTING_CHAR_UUID),
        };
        if self.core.owns(result.link) {
            self.handles_assign(result.link, &found);
        }

        info!("light service on {:?}: {:?}", result.link, found);
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
        if let ServiceHandles::Light { color } = handles {
            self.color.fill_gaps(color);
        }
    }

    /// Subscribe if the bulb exposes a CCCD, otherwise nothing to do.
    fn on_ready(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        let color = self.color;
        if color.cccd.is_none() {
            return Ok(());
        }
        self.core.notify_enable(transport, &color)
    }

    fn on_notification(&mut self, link: ConnHandle, handle: u16, data: &[u8], sink: &mut dyn EventSink) {
        if !self.core.owns(link) || Some(handle) != self.color.value {
            return;
        }
        sink.publish(AppEvent::Light {
            peer: self.core.peer(),
            on: data.iter().any(|b| *b != 0),
        });
    }

    fn clear_handles(&mut self) {
        self.color = CharHandles::UNASSIGNED;
    }

    fn handles_unassigned(&self) -> bool {
        self.color.is_unassigned()
    }
}
