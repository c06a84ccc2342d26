//! Environmental sensor client (Thingy:52 environment service).
//!
//! Temperature notifications carry a signed integer part followed by an
//! unsigned fractional part; humidity notifications a single percent byte.

use crate::ble::clients::{find_handles, ClientCore, GattClient};
use crate::ble::transport::{DiscoveryResult, Transport};
use crate::ble::{AppEvent, BleUuid, CharHandles, ConnHandle, EventSink, PeerKind, ServiceHandles};
use crate::error::Error;

/// Vendor base `EF68xxxx-9B35-4933-9B10-52FFA9740042`, little-endian.
pub const ENVIRONMENT_BASE_UUID: [u8; 16] = [
    0x42, 0x00, 0x74, 0xA9, 0xFF, 0x52, 0x10, 0x9B, 0x33, 0x49, 0x35, 0x9B, 0x00, 0x00, 0x68, 0xEF,
];
pub const ENVIRONMENT_SERVICE_UUID: u16 = 0x0200;
pub const TEMPERATURE_CHAR_UUID: u16 = 0x0201;
pub const HUMIDITY_CHAR_UUID: u16 = 0x0203;

pub struct EnvironmentClient {
    core: ClientCore,
    temperature: CharHandles,
    humidity: CharHandles,
}

impl Default for EnvironmentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentClient {
    pub fn new() -> Self {
        Self {
            // Namespace index is filled in by `init`.
            core: ClientCore::new(PeerKind::Environment, BleUuid::vendor(ENVIRONMENT_SERVICE_UUID, 0)),
            temperature: CharHandles::UNASSIGNED,
            humidity: CharHandles::UNASSIGNED,
        }
    }

    pub fn temperature(&self) -> CharHandles {
        self.temperature
    }

    pub fn humidity(&self) -> CharHandles {
        self.humidity
    }
}

impl GattClient for EnvironmentClient {
    fn core(&self) -> &ClientCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ClientCore {
        &mut self.core
    }

    fn init(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        self.core.register(transport, Some(&ENVIRONMENT_BASE_UUID))
    }

    fn on_discovery_complete(
        &mut self,
        result: &DiscoveryResult,
        sink: &mut dyn EventSink,
    ) -> Option<ServiceHandles> {
        if !self.core.accepts(result) {
            return None;
        }

        let found = ServiceHandles::Environment {
            temperature: find_handles(result, TEMPERATURE_CHAR_UUID),
            humidity: find_handles(result, HUMIDITY_CHAR_UUID),
        };
        if self.core.owns(result.link) {
            self.handles_assign(result.link, &found);
        }

        info!("environment service on {:?}: {:?}", result.link, found);
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
        if let ServiceHandles::Environment {
            temperature,
            humidity,
        } = handles
        {
            self.temperature.fill_gaps(temperature);
            self.humidity.fill_gaps(humidity);
        }
    }

    fn on_ready(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        let temperature = self.temperature;
        let humidity = self.humidity;
        self.core.notify_enable(transport, &temperature)?;
        self.core.notify_enable(transport, &humidity)
    }

    fn on_notification(&mut self, link: ConnHandle, handle: u16, data: &[u8], sink: &mut dyn EventSink) {
        if !self.core.owns(link) {
            return;
        }
        let peer = self.core.peer();

        if Some(handle) == self.temperature.value {
            match data {
                [integer, decimal, ..] => sink.publish(AppEvent::Temperature {
                    peer,
                    integer: *integer as i8,
                    decimal: *decimal,
                }),
                _ => warn!("short temperature notification ({} bytes)", data.len()),
            }
        } else if Some(handle) == self.humidity.value {
            match data.first() {
                Some(percent) => sink.publish(AppEvent::Humidity {
                    peer,
                    percent: *percent,
                }),
                None => warn!("empty humidity notification"),
            }
        }
    }

    fn clear_handles(&mut self) {
        self.temperature = CharHandles::UNASSIGNED;
        self.humidity = CharHandles::UNASSIGNED;
    }

    fn handles_unassigned(&self) -> bool {
        self.temperature.is_unassigned() && self.humidity.is_unassigned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::clients::mock::{Events, Gatt, MockTransport};
    use crate::ble::transport::WriteKind;

    const LINK: ConnHandle = ConnHandle(5);

    fn discovered(link: ConnHandle) -> DiscoveryResult {
        DiscoveryResult::new(link, BleUuid::vendor(ENVIRONMENT_SERVICE_UUID, 2))
            .with(TEMPERATURE_CHAR_UUID, 0x20, Some(0x21))
            .with(0x0202, 0x23, Some(0x24))
            .with(HUMIDITY_CHAR_UUID, 0x26, Some(0x27))
    }

    fn ready_client(t: &mut MockTransport) -> EnvironmentClient {
        let mut c = EnvironmentClient::new();
        c.init(t).unwrap();
        let mut events = Events::default();
        let handles = c.on_discovery_complete(&discovered(LINK), &mut events).unwrap();
        c.handles_assign(LINK, &handles);
        c
    }

    #[test]
    fn init_registers_vendor_base_then_service() {
        let mut t = MockTransport::default();
        let mut c = EnvironmentClient::new();
        c.init(&mut t).unwrap();
        assert_eq!(t.vendor_bases, 1);
        assert_eq!(t.registered, [BleUuid::vendor(ENVIRONMENT_SERVICE_UUID, 2)]);
        assert_eq!(c.service(), BleUuid::vendor(ENVIRONMENT_SERVICE_UUID, 2));
    }

    #[test]
    fn init_reports_exhausted_vendor_table() {
        let mut t = MockTransport {
            fail_vendor: true,
            ..Default::default()
        };
        let mut c = EnvironmentClient::new();
        assert!(matches!(c.init(&mut t), Err(Error::UuidRegistration(_))));
        assert!(t.registered.is_empty());
    }

    #[test]
    fn discovery_picks_known_characteristics() {
        let mut c = EnvironmentClient::new();
        let mut events = Events::default();
        let handles = c.on_discovery_complete(&discovered(LINK), &mut events).unwrap();

        assert_eq!(
            handles,
            ServiceHandles::Environment {
                temperature: CharHandles::new(0x20, Some(0x21)),
                humidity: CharHandles::new(0x26, Some(0x27)),
            }
        );
        assert_eq!(
            events.0,
            [AppEvent::Discovered {
                peer: PeerKind::Environment,
                link: LINK,
                handles
            }]
        );
        // Not associated yet: discovery alone does not bind the link.
        assert_eq!(c.link(), None);
        assert!(c.handles_unassigned());
    }

    #[test]
    fn discovery_on_another_link_is_refused_while_bound() {
        let mut t = MockTransport::default();
        let mut c = ready_client(&mut t);
        let mut events = Events::default();
        assert_eq!(c.on_discovery_complete(&discovered(ConnHandle(9)), &mut events), None);
        assert!(events.0.is_empty());
    }

    #[test]
    fn duplicate_discovery_never_overwrites_handles() {
        let mut t = MockTransport::default();
        let mut c = ready_client(&mut t);
        let moved = DiscoveryResult::new(LINK, BleUuid::vendor(ENVIRONMENT_SERVICE_UUID, 2))
            .with(TEMPERATURE_CHAR_UUID, 0x40, Some(0x41));
        let mut events = Events::default();
        c.on_discovery_complete(&moved, &mut events);
        assert_eq!(c.temperature(), CharHandles::new(0x20, Some(0x21)));
    }

    #[test]
    fn handles_assign_is_monotonic() {
        let mut c = EnvironmentClient::new();
        let real = ServiceHandles::Environment {
            temperature: CharHandles::new(0x20, Some(0x21)),
            humidity: CharHandles::UNASSIGNED,
        };
        let sentinel = ServiceHandles::Environment {
            temperature: CharHandles::UNASSIGNED,
            humidity: CharHandles::UNASSIGNED,
        };
        c.handles_assign(LINK, &real);
        c.handles_assign(LINK, &sentinel);
        assert_eq!(c.temperature(), CharHandles::new(0x20, Some(0x21)));

        // A later set fills the gap but still leaves temperature alone.
        let later = ServiceHandles::Environment {
            temperature: CharHandles::new(0x50, Some(0x51)),
            humidity: CharHandles::new(0x26, Some(0x27)),
        };
        c.handles_assign(LINK, &later);
        assert_eq!(c.temperature(), CharHandles::new(0x20, Some(0x21)));
        assert_eq!(c.humidity(), CharHandles::new(0x26, Some(0x27)));
    }

    #[test]
    fn ready_enables_both_cccds_one_at_a_time() {
        let mut t = MockTransport::default();
        let mut c = ready_client(&mut t);
        c.on_ready(&mut t).unwrap();

        assert_eq!(t.gatt, [Gatt::Write(LINK, 0x21, vec![0x01, 0x00], WriteKind::Request)]);
        assert_eq!(c.core().queue().len(), 1);

        t.complete(LINK);
        c.on_write_response(LINK, &mut t, &mut Events::default());
        assert_eq!(t.gatt[1], Gatt::Write(LINK, 0x27, vec![0x01, 0x00], WriteKind::Request));
        assert!(c.core().queue().is_empty());
    }

    #[test]
    fn notify_enable_fails_fast_without_link_or_cccd() {
        let mut t = MockTransport::default();
        let mut c = EnvironmentClient::new();
        assert_eq!(c.on_ready(&mut t), Err(Error::NotConnected));

        c.handles_assign(
            LINK,
            &ServiceHandles::Environment {
                temperature: CharHandles::new(0x20, None),
                humidity: CharHandles::UNASSIGNED,
            },
        );
        assert_eq!(c.on_ready(&mut t), Err(Error::HandleUnassigned));
        assert!(t.gatt.is_empty());
        assert!(c.core().queue().is_empty());
    }

    #[test]
    fn decodes_temperature_and_humidity() {
        let mut t = MockTransport::default();
        let mut c = ready_client(&mut t);
        let mut events = Events::default();

        c.on_notification(LINK, 0x20, &[0xFB, 25], &mut events);
        c.on_notification(LINK, 0x26, &[48], &mut events);
        c.on_notification(LINK, 0x23, &[1, 2, 3], &mut events);

        assert_eq!(
            events.0,
            [
                AppEvent::Temperature {
                    peer: PeerKind::Environment,
                    integer: -5,
                    decimal: 25
                },
                AppEvent::Humidity {
                    peer: PeerKind::Environment,
                    percent: 48
                },
            ]
        );
    }

    #[test]
    fn short_payloads_are_ignored() {
        let mut t = MockTransport::default();
        let mut c = ready_client(&mut t);
        let mut events = Events::default();
        c.on_notification(LINK, 0x20, &[21], &mut events);
        c.on_notification(LINK, 0x26, &[], &mut events);
        assert!(events.0.is_empty());
    }

    #[test]
    fn disconnect_clears_state_and_silences_stale_notifications() {
        let mut t = MockTransport::default();
        let mut c = ready_client(&mut t);
        c.on_disconnected(LINK);

        assert!(c.handles_unassigned());
        assert_eq!(c.link(), None);

        let mut events = Events::default();
        c.on_notification(LINK, 0x20, &[20, 0], &mut events);
        assert!(events.0.is_empty());
    }

    #[test]
    fn disconnect_of_other_link_is_ignored() {
        let mut t = MockTransport::default();
        let mut c = ready_client(&mut t);
        c.on_disconnected(ConnHandle(9));
        assert_eq!(c.link(), Some(LINK));
        assert!(!c.handles_unassigned());
    }
}
