//! End-to-end tests of the central manager against a recording transport.

use ble_gateway::ble::clients::battery::BATTERY_SERVICE;
use ble_gateway::ble::clients::environment::{
    EnvironmentClient, ENVIRONMENT_SERVICE_UUID, HUMIDITY_CHAR_UUID, TEMPERATURE_CHAR_UUID,
};
use ble_gateway::ble::clients::light::{COLOR_SETTING_CHAR_UUID, LIGHT_SERVICE_UUID};
use ble_gateway::ble::clients::remote_control::{BUTTON_OFF_CHAR_UUID, BUTTON_ON_CHAR_UUID, BUTTON_SERVICE_UUID};
use ble_gateway::ble::clients::GattClient;
use ble_gateway::ble::transport::{
    AdvReport, ConnParams, DiscoveryResult, Payload, PeerAddress, ScanParams, WriteKind,
};
use ble_gateway::ble::{BleUuid, CharHandles, ConnHandle, ServiceHandles};
use ble_gateway::{
    AppEvent, CentralManager, EventSink, GatewayConfig, PeerClients, PeerKind, SlotState, Transport, TransportError,
    TransportEvent,
};

#[derive(Debug, Clone, PartialEq)]
enum Op {
    ScanStart,
    ScanStop,
    Connect(PeerAddress),
    Disconnect(ConnHandle),
    Discover(ConnHandle, BleUuid),
    Read(ConnHandle, u16),
    Write(ConnHandle, u16, Vec<u8>, WriteKind),
}

/// Records accepted requests. One GATT operation may be outstanding per
/// link; further ones are refused with `Busy` until `complete`.
#[derive(Default)]
struct Recorder {
    ops: Vec<Op>,
    in_flight: Vec<ConnHandle>,
    next_vendor: u8,
}

impl Recorder {
    fn complete(&mut self, link: ConnHandle) {
        self.in_flight.retain(|l| *l != link);
    }

    fn writes(&self) -> Vec<&Op> {
        self.ops.iter().filter(|op| matches!(op, Op::Write(..))).collect()
    }

    fn connects(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, Op::Connect(_))).count()
    }

    fn gatt(&mut self, link: ConnHandle, op: Op) -> Result<(), TransportError> {
        if self.in_flight.contains(&link) {
            return Err(TransportError::Busy);
        }
        self.in_flight.push(link);
        self.ops.push(op);
        Ok(())
    }
}

impl Transport for Recorder {
    fn scan_start(&mut self, _params: &ScanParams) -> Result<(), TransportError> {
        self.ops.push(Op::ScanStart);
        Ok(())
    }

    fn scan_stop(&mut self) -> Result<(), TransportError> {
        self.ops.push(Op::ScanStop);
        Ok(())
    }

    fn connect(&mut self, peer: &PeerAddress, _scan: &ScanParams, _params: &ConnParams) -> Result<(), TransportError> {
        self.ops.push(Op::Connect(*peer));
        Ok(())
    }

    fn disconnect(&mut self, link: ConnHandle) -> Result<(), TransportError> {
        self.ops.push(Op::Disconnect(link));
        Ok(())
    }

    fn discovery_start(&mut self, link: ConnHandle, service: BleUuid) -> Result<(), TransportError> {
        self.ops.push(Op::Discover(link, service));
        Ok(())
    }

    fn gatt_read(&mut self, link: ConnHandle, handle: u16) -> Result<(), TransportError> {
        self.gatt(link, Op::Read(link, handle))
    }

    fn gatt_write(&mut self, link: ConnHandle, handle: u16, value: &[u8], kind: WriteKind) -> Result<(), TransportError> {
        self.gatt(link, Op::Write(link, handle, value.to_vec(), kind))
    }

    fn conn_param_update(&mut self, _link: ConnHandle, _params: &ConnParams) -> Result<(), TransportError> {
        Ok(())
    }

    fn register_vendor_uuid(&mut self, _base: &[u8; 16]) -> Result<u8, TransportError> {
        self.next_vendor += 1;
        Ok(self.next_vendor + 1)
    }

    fn register_service(&mut self, _service: BleUuid) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Default)]
struct Events(Vec<AppEvent>);

impl EventSink for Events {
    fn publish(&mut self, event: AppEvent) {
        self.0.push(event);
    }
}

type Gateway = CentralManager<Recorder, Events>;

// Vendor bases are registered in order and get namespaces 2 and 3.
const ENV: BleUuid = BleUuid::vendor(ENVIRONMENT_SERVICE_UUID, 2);
const REMOTE: BleUuid = BleUuid::vendor(BUTTON_SERVICE_UUID, 3);
const LIGHT: BleUuid = BleUuid::sig(LIGHT_SERVICE_UUID);
const CCCD_ON: [u8; 2] = [0x01, 0x00];

fn gateway(config: GatewayConfig) -> Gateway {
    let mut g = CentralManager::new(config, Recorder::default(), Events::default(), PeerClients::new());
    g.init().unwrap();
    g.start_scan().unwrap();
    g
}

fn addr(n: u8) -> PeerAddress {
    PeerAddress {
        addr_type: 1,
        bytes: [n, 0x11, 0x22, 0x33, 0x44, 0xC5],
    }
}

fn adv(n: u8, name: &str) -> TransportEvent {
    let mut data = heapless::Vec::new();
    data.extend_from_slice(&[0x02, 0x01, 0x06]).unwrap();
    data.push(name.len() as u8 + 1).unwrap();
    data.push(0x09).unwrap();
    data.extend_from_slice(name.as_bytes()).unwrap();
    TransportEvent::Advertisement(AdvReport {
        peer: addr(n),
        rssi: -55,
        data,
    })
}

fn payload(bytes: &[u8]) -> Payload {
    let mut p = Payload::new();
    p.extend_from_slice(bytes).unwrap();
    p
}

fn env_found(link: ConnHandle, temp: u16, humidity: u16) -> TransportEvent {
    TransportEvent::DiscoveryComplete(
        DiscoveryResult::new(link, ENV)
            .with(TEMPERATURE_CHAR_UUID, temp, Some(temp + 1))
            .with(HUMIDITY_CHAR_UUID, humidity, Some(humidity + 1)),
    )
}

/// Connect a "Thingy" on `link` and report its environment service.
fn pair_thingy(g: &mut Gateway, n: u8, link: ConnHandle) {
    g.handle(adv(n, "Thingy"));
    g.handle(TransportEvent::Connected { link, peer: addr(n) });
    g.handle(env_found(link, 0x20, 0x26));
}

fn write_response(g: &mut Gateway, link: ConnHandle) {
    g.transport_mut().complete(link);
    g.handle(TransportEvent::WriteResponse { link });
}

#[test]
fn thingy_is_paired_and_subscribed_one_write_at_a_time() {
    let mut g = gateway(GatewayConfig::default());
    let link = ConnHandle(1);

    g.handle(adv(1, "Thingy"));
    assert_eq!(g.transport().connects(), 1);
    assert!(g.is_connecting());

    g.handle(TransportEvent::Connected { link, peer: addr(1) });
    assert!(g.transport().ops.contains(&Op::Discover(link, ENV)));
    assert_eq!(g.slot(PeerKind::Environment), SlotState::Discovering(link));

    g.handle(env_found(link, 0x20, 0x26));
    assert_eq!(g.slot(PeerKind::Environment), SlotState::Ready(link));
    assert!(g.sink().0.contains(&AppEvent::PeerReady {
        peer: PeerKind::Environment,
        link
    }));
    assert_eq!(
        g.transport().writes(),
        [&Op::Write(link, 0x21, CCCD_ON.to_vec(), WriteKind::Request)]
    );

    write_response(&mut g, link);
    assert_eq!(
        g.transport().writes(),
        [
            &Op::Write(link, 0x21, CCCD_ON.to_vec(), WriteKind::Request),
            &Op::Write(link, 0x27, CCCD_ON.to_vec(), WriteKind::Request),
        ]
    );

    g.handle(TransportEvent::Notification {
        link,
        handle: 0x20,
        data: payload(&[23, 50]),
    });
    g.handle(TransportEvent::Notification {
        link,
        handle: 0x26,
        data: payload(&[41]),
    });
    assert!(g.sink().0.contains(&AppEvent::Temperature {
        peer: PeerKind::Environment,
        integer: 23,
        decimal: 50
    }));
    assert!(g.sink().0.contains(&AppEvent::Humidity {
        peer: PeerKind::Environment,
        percent: 41
    }));
}

#[test]
fn scanning_stops_at_link_capacity() {
    let config = GatewayConfig {
        max_links: 1,
        ..GatewayConfig::default()
    };
    let mut g = gateway(config);
    pair_thingy(&mut g, 1, ConnHandle(1));

    // Two identities are still vacant, but the only link is used.
    assert!(!g.is_scanning());
    let last_scan = g.sink().0.iter().rev().find(|e| matches!(e, AppEvent::Scanning(_)));
    assert_eq!(last_scan, Some(&AppEvent::Scanning(false)));

    g.handle(adv(2, "Remote"));
    assert_eq!(g.transport().connects(), 1);
    assert!(!g.is_connecting());
}

#[test]
fn matching_advertiser_is_ignored_once_every_identity_is_ready() {
    let mut g = gateway(GatewayConfig::default());
    let (thingy, remote, bulb) = (ConnHandle(1), ConnHandle(2), ConnHandle(3));
    pair_thingy(&mut g, 1, thingy);

    g.handle(adv(2, "Remote"));
    g.handle(TransportEvent::Connected {
        link: remote,
        peer: addr(2),
    });
    g.handle(TransportEvent::DiscoveryComplete(
        DiscoveryResult::new(remote, REMOTE)
            .with(BUTTON_ON_CHAR_UUID, 0x10, Some(0x11))
            .with(BUTTON_OFF_CHAR_UUID, 0x13, Some(0x14)),
    ));

    g.handle(adv(3, "PLAYBULB"));
    g.handle(TransportEvent::Connected { link: bulb, peer: addr(3) });
    g.handle(TransportEvent::DiscoveryComplete(
        DiscoveryResult::new(bulb, LIGHT).with(COLOR_SETTING_CHAR_UUID, 0x30, None),
    ));

    assert_eq!(g.slot(PeerKind::Environment), SlotState::Ready(thingy));
    assert_eq!(g.slot(PeerKind::RemoteControl), SlotState::Ready(remote));
    assert_eq!(g.slot(PeerKind::Light), SlotState::Ready(bulb));
    assert_eq!(g.transport().connects(), 3);

    // A second sensor advertising the same name is not connected.
    g.handle(adv(4, "Thingy"));
    assert_eq!(g.transport().connects(), 3);
    assert!(!g.is_connecting());
    assert!(!g.is_scanning());
    let last_scan = g.sink().0.iter().rev().find(|e| matches!(e, AppEvent::Scanning(_)));
    assert_eq!(last_scan, Some(&AppEvent::Scanning(false)));
}

#[test]
fn scanning_resumes_when_a_link_frees_up() {
    let config = GatewayConfig {
        max_links: 1,
        ..GatewayConfig::default()
    };
    let mut g = gateway(config);
    let link = ConnHandle(1);
    pair_thingy(&mut g, 1, link);
    assert!(!g.is_scanning());

    g.handle(TransportEvent::Disconnected { link, reason: 0x13 });
    assert!(g.is_scanning());
    assert_eq!(g.sink().0.last(), Some(&AppEvent::Scanning(true)));
}

#[test]
fn queued_writes_for_a_lost_link_are_dropped() {
    let mut g = gateway(GatewayConfig::default());
    let link = ConnHandle(2);
    pair_thingy(&mut g, 2, link);
    // The first CCCD write is on the air, the second is queued.
    assert_eq!(g.transport().writes().len(), 1);

    g.handle(TransportEvent::Disconnected { link, reason: 0x08 });
    g.transport_mut().complete(link);
    g.handle(TransportEvent::WriteResponse { link });

    assert_eq!(g.transport().writes().len(), 1);
    assert!(g.clients().environment.handles_unassigned());
    assert_eq!(g.clients().environment.link(), None);
    assert!(g.sink().0.contains(&AppEvent::PeerLost {
        peer: PeerKind::Environment,
        link
    }));
}

#[test]
fn reconnect_uses_the_new_link_and_fresh_handles() {
    let mut g = gateway(GatewayConfig::default());
    let first = ConnHandle(1);
    pair_thingy(&mut g, 1, first);
    write_response(&mut g, first);
    g.handle(TransportEvent::Disconnected { link: first, reason: 0x08 });
    assert_eq!(g.slot(PeerKind::Environment), SlotState::Vacant);

    let second = ConnHandle(5);
    g.handle(adv(1, "Thingy"));
    g.handle(TransportEvent::Connected {
        link: second,
        peer: addr(1),
    });
    g.handle(env_found(second, 0x30, 0x36));

    assert_eq!(g.slot(PeerKind::Environment), SlotState::Ready(second));
    assert_eq!(g.clients().environment.temperature(), CharHandles::new(0x30, Some(0x31)));
    assert_eq!(
        g.transport().writes().last(),
        Some(&&Op::Write(second, 0x31, CCCD_ON.to_vec(), WriteKind::Request))
    );

    // Notifications on the old link mean nothing any more.
    let before = g.sink().0.len();
    g.handle(TransportEvent::Notification {
        link: first,
        handle: 0x20,
        data: payload(&[20, 0]),
    });
    assert_eq!(g.sink().0.len(), before);
}

#[test]
fn handle_assignment_is_idempotent_and_never_overwrites() {
    let mut client = EnvironmentClient::new();
    let link = ConnHandle(3);
    let full = ServiceHandles::Environment {
        temperature: CharHandles::new(0x20, Some(0x21)),
        humidity: CharHandles::new(0x26, Some(0x27)),
    };

    client.handles_assign(link, &full);
    client.handles_assign(link, &full);
    assert_eq!(client.temperature(), CharHandles::new(0x20, Some(0x21)));
    assert_eq!(client.humidity(), CharHandles::new(0x26, Some(0x27)));

    let other = ServiceHandles::Environment {
        temperature: CharHandles::new(0x50, Some(0x51)),
        humidity: CharHandles::UNASSIGNED,
    };
    client.handles_assign(link, &other);
    assert_eq!(client.temperature(), CharHandles::new(0x20, Some(0x21)));
    assert_eq!(client.humidity(), CharHandles::new(0x26, Some(0x27)));
}

#[test]
fn light_commands_leave_in_order_after_busy_retries() {
    let mut g = gateway(GatewayConfig::default());
    let link = ConnHandle(4);
    g.handle(adv(4, "PLAYBULB"));
    g.handle(TransportEvent::Connected { link, peer: addr(4) });
    g.handle(TransportEvent::DiscoveryComplete(
        DiscoveryResult::new(link, LIGHT).with(COLOR_SETTING_CHAR_UUID, 0x30, None),
    ));

    g.set_light(true).unwrap();
    g.set_light(false).unwrap();
    g.set_light(true).unwrap();
    assert_eq!(g.transport().writes().len(), 1);

    write_response(&mut g, link);
    write_response(&mut g, link);
    assert_eq!(
        g.transport().writes(),
        [
            &Op::Write(link, 0x30, vec![0xFF, 0, 0, 0], WriteKind::Command),
            &Op::Write(link, 0x30, vec![0, 0, 0, 0], WriteKind::Command),
            &Op::Write(link, 0x30, vec![0xFF, 0, 0, 0], WriteKind::Command),
        ]
    );
}

#[test]
fn battery_service_is_looked_up_once_the_peer_is_ready() {
    let mut g = gateway(GatewayConfig::default());
    let link = ConnHandle(1);
    pair_thingy(&mut g, 1, link);
    assert!(g.transport().ops.contains(&Op::Discover(link, BATTERY_SERVICE)));
}
