//! Routes discovery results to the clients that registered for them.
//!
//! Dispatch is a linear walk over the fixed set of clients. Battery results
//! go to the battery client whose owner's primary service lives on the same
//! link, since every peer type carries the SIG battery service.

use heapless::Vec;

use crate::ble::clients::battery::BATTERY_SERVICE;
use crate::ble::clients::{GattClient, PeerClients};
use crate::ble::transport::DiscoveryResult;
use crate::ble::{EventSink, PeerKind, ServiceHandles};

/// Which of a peer's clients recognised the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServiceRole {
    Primary,
    Battery,
}

/// One client that accepted a discovery result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Dispatched {
    pub peer: PeerKind,
    pub role: ServiceRole,
    pub handles: ServiceHandles,
}

/// Hand `result` to every client whose service matches. Returns the clients
/// that accepted it, in dispatch order.
pub fn dispatch(
    result: &DiscoveryResult,
    clients: &mut PeerClients,
    sink: &mut dyn EventSink,
) -> Vec<Dispatched, 3> {
    let mut accepted = Vec::new();

    if result.service == BATTERY_SERVICE {
        for peer in PeerKind::ALL {
            if clients.primary(peer).link() != Some(result.link) {
                continue;
            }
            if let Some(handles) = clients.battery_mut(peer).on_discovery_complete(result, sink) {
                let _ = accepted.push(Dispatched {
                    peer,
                    role: ServiceRole::Battery,
                    handles,
                });
            }
        }
    } else {
        for peer in PeerKind::ALL {
            let client = clients.primary_mut(peer);
            if client.service() != result.service {
                continue;
            }
            if let Some(handles) = client.on_discovery_complete(result, sink) {
                let _ = accepted.push(Dispatched {
                    peer,
                    role: ServiceRole::Primary,
                    handles,
                });
            }
        }
    }

    if accepted.is_empty() {
        debug!("no client took {:?} on {:?}", result.service, result.link);
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::clients::environment::{ENVIRONMENT_SERVICE_UUID, TEMPERATURE_CHAR_UUID};
    use crate::ble::clients::light::{COLOR_SETTING_CHAR_UUID, LIGHT_SERVICE_UUID};
    use crate::ble::clients::mock::{Events, MockTransport};
    use crate::ble::clients::battery::BATTERY_LEVEL_CHAR_UUID;
    use crate::ble::{AppEvent, BleUuid, CharHandles, ConnHandle};

    fn clients() -> PeerClients {
        let mut clients = PeerClients::new();
        clients.init(&mut MockTransport::default()).unwrap();
        clients
    }

    #[test]
    fn primary_service_reaches_only_its_client() {
        let mut clients = clients();
        let mut events = Events::default();
        let result = DiscoveryResult::new(ConnHandle(1), BleUuid::sig(LIGHT_SERVICE_UUID))
            .with(COLOR_SETTING_CHAR_UUID, 0x30, None);

        let accepted = dispatch(&result, &mut clients, &mut events);
        assert_eq!(
            accepted.as_slice(),
            [Dispatched {
                peer: PeerKind::Light,
                role: ServiceRole::Primary,
                handles: ServiceHandles::Light {
                    color: CharHandles::new(0x30, None)
                },
            }]
        );
        assert_eq!(events.0.len(), 1);
    }

    #[test]
    fn uuid_namespace_must_match() {
        let mut clients = clients();
        let mut events = Events::default();
        // Right 16-bit value, SIG namespace instead of the vendor base.
        let result = DiscoveryResult::new(ConnHandle(1), BleUuid::sig(ENVIRONMENT_SERVICE_UUID))
            .with(TEMPERATURE_CHAR_UUID, 0x20, Some(0x21));

        assert!(dispatch(&result, &mut clients, &mut events).is_empty());
        assert!(events.0.is_empty());
    }

    #[test]
    fn battery_goes_to_the_owner_on_that_link() {
        let mut clients = clients();
        let mut events = Events::default();
        clients.light.handles_assign(
            ConnHandle(7),
            &ServiceHandles::Light {
                color: CharHandles::new(0x30, None),
            },
        );

        let result =
            DiscoveryResult::new(ConnHandle(7), BATTERY_SERVICE).with(BATTERY_LEVEL_CHAR_UUID, 0x40, Some(0x41));
        let accepted = dispatch(&result, &mut clients, &mut events);

        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].peer, PeerKind::Light);
        assert_eq!(accepted[0].role, ServiceRole::Battery);
        assert_eq!(
            events.0,
            [AppEvent::Discovered {
                peer: PeerKind::Light,
                link: ConnHandle(7),
                handles: ServiceHandles::Battery {
                    level: CharHandles::new(0x40, Some(0x41))
                },
            }]
        );
    }

    #[test]
    fn battery_on_unowned_link_is_dropped() {
        let mut clients = clients();
        let mut events = Events::default();
        let result = DiscoveryResult::new(ConnHandle(7), BATTERY_SERVICE).with(BATTERY_LEVEL_CHAR_UUID, 0x40, None);
        assert!(dispatch(&result, &mut clients, &mut events).is_empty());
    }
}
