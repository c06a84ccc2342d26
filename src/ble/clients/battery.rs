//! Battery service client.
//!
//! Every peer type also exposes the SIG battery service on the same link,
//! so there is one of these per [`PeerKind`]; the discovery dispatcher binds
//! it to whichever link its owner's primary service lives on.

use crate::ble::clients::{find_handles, ClientCore, GattClient};
use crate::ble::transport::{DiscoveryResult, Transport};
use crate::ble::{AppEvent, BleUuid, CharHandles, ConnHandle, EventSink, PeerKind, ServiceHandles};
use crate::error::Error;

pub const BATTERY_SERVICE_UUID: u16 = 0x180F;
pub const BATTERY_LEVEL_CHAR_UUID: u16 = 0x2A19;

/// The battery service as registered with discovery.
pub const BATTERY_SERVICE: BleUuid = BleUuid::sig(BATTERY_SERVICE_UUID);

pub struct BatteryClient {
    core: ClientCore,
    level: CharHandles,
}

impl BatteryClient {
    pub fn new(owner: PeerKind) -> Self {
        Self {
            core: ClientCore::new(owner, BATTERY_SERVICE),
            level: CharHandles::UNASSIGNED,
        }
    }

    pub fn level(&self) -> CharHandles {
        self.level
    }
}

impl GattClient for BatteryClient {
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

        let found = ServiceHandles::Battery {
            level: find_handles(result, BATTERY_LEVEL_CHAR_UUID),
        };
        if self.core.owns(result.link) {
            self.handles_assign(result.link, &found);
        }

        debug!("{:?} battery service on {:?}: {:?}", self.core.peer(), result.link, found);
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
        if let ServiceHandles::Battery { level } = handles {
            self.level.fill_gaps(level);
        }
    }

    /// Subscribe to level changes and fetch the current level once.
    fn on_ready(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        let level = self.level;
        if level.cccd.is_some() {
            self.core.notify_enable(transport, &level)?;
        }
        self.core.read(transport, &level)
    }

    fn on_notification(&mut self, link: ConnHandle, handle: u16, data: &[u8], sink: &mut dyn EventSink) {
        if !self.core.owns(link) || Some(handle) != self.level.value {
            return;
        }
        match data.first() {
            Some(level) => sink.publish(AppEvent::Battery {
                peer: self.core.peer(),
                percent: (*level).min(100),
            }),
            None => warn!("empty battery level"),
        }
    }

    fn clear_handles(&mut self) {
        self.level = CharHandles::UNASSIGNED;
    }

    fn handles_unassigned(&self) -> bool {
        self.level.is_unassigned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::clients::mock::{Events, Gatt, MockTransport};
    use crate::ble::transport::WriteKind;

    const LINK: ConnHandle = ConnHandle(4);

    fn ready_client() -> BatteryClient {
        let mut c = BatteryClient::new(PeerKind::Environment);
        c.handles_assign(
            LINK,
            &ServiceHandles::Battery {
                level: CharHandles::new(0x40, Some(0x41)),
            },
        );
        c
    }

    #[test]
    fn ready_subscribes_then_reads() {
        let mut t = MockTransport::default();
        let mut c = ready_client();
        let mut events = Events::default();
        c.on_ready(&mut t).unwrap();

        t.complete(LINK);
        c.on_write_response(LINK, &mut t, &mut events);
        assert_eq!(
            t.gatt,
            [
                Gatt::Write(LINK, 0x41, vec![0x01, 0x00], WriteKind::Request),
                Gatt::Read(LINK, 0x40),
            ]
        );

        t.complete(LINK);
        c.on_read_response(LINK, 0x40, &[87], &mut t, &mut events);
        assert_eq!(
            events.0,
            [AppEvent::Battery {
                peer: PeerKind::Environment,
                percent: 87
            }]
        );
    }

    #[test]
    fn level_without_cccd_is_only_read() {
        let mut t = MockTransport::default();
        let mut c = BatteryClient::new(PeerKind::Light);
        c.handles_assign(
            LINK,
            &ServiceHandles::Battery {
                level: CharHandles::new(0x40, None),
            },
        );
        c.on_ready(&mut t).unwrap();
        assert_eq!(t.gatt, [Gatt::Read(LINK, 0x40)]);
    }

    #[test]
    fn level_is_clamped_to_100() {
        let mut c = ready_client();
        let mut events = Events::default();
        c.on_notification(LINK, 0x40, &[250], &mut events);
        assert_eq!(
            events.0,
            [AppEvent::Battery {
                peer: PeerKind::Environment,
                percent: 100
            }]
        );
    }

    #[test]
    fn other_services_handle_sets_are_ignored() {
        let mut c = BatteryClient::new(PeerKind::Environment);
        c.handles_assign(
            LINK,
            &ServiceHandles::Light {
                color: CharHandles::new(0x30, None),
            },
        );
        assert!(c.handles_unassigned());
        assert_eq!(c.link(), Some(LINK));
    }
}
