//! Central connection manager.
//!
//! Tracks up to [`MAX_LINKS`] links and one identity slot per [`PeerKind`].
//! Reconnection is scan-driven: whenever an identity is not ready, no
//! connect request is outstanding and there is link capacity left, the
//! manager scans; as soon as one of those stops holding it stops scanning.
//!
//! Slot lifecycle:
//!
//! ```text
//! Vacant --discovery_start on a link--> Discovering(link)
//! Discovering --primary service found--> Ready(link)
//! Discovering --service not found / link lost--> Vacant
//! Ready --link lost--> Vacant
//! ```
//!
//! Only `Ready` closes a slot. While an identity is merely being probed on
//! one link, another advertiser for it may still connect and be probed too.

use heapless::Vec;

use crate::ble::adv_parser::{extract_device_name, find_target};
use crate::ble::clients::battery::BATTERY_SERVICE;
use crate::ble::clients::{GattClient, PeerClients};
use crate::ble::discovery::{self, ServiceRole};
use crate::ble::transport::{AdvReport, ConnParams, DiscoveryResult, PeerAddress, Transport, TransportEvent};
use crate::ble::{AppEvent, BleUuid, Button, ConnHandle, EventSink, PeerKind, ServiceHandles};
use crate::config::{GatewayConfig, MAX_LINKS};
use crate::error::{Error, TransportError};

/// State of one target identity slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotState {
    Vacant,
    /// Discovery of the slot's primary service is running on this link.
    Discovering(ConnHandle),
    /// The peer is connected and its client is bound to this link.
    Ready(ConnHandle),
}

impl SlotState {
    pub const fn link(self) -> Option<ConnHandle> {
        match self {
            SlotState::Vacant => None,
            SlotState::Discovering(link) | SlotState::Ready(link) => Some(link),
        }
    }
}

const fn bit(kind: PeerKind) -> u8 {
    1 << kind.index()
}

#[derive(Clone, Copy, Debug)]
struct LinkEntry {
    link: ConnHandle,
    peer: PeerAddress,
    /// Bit per [`PeerKind::index`]: discovery of that service was requested.
    attempted: u8,
    /// Bit per [`PeerKind::index`]: that discovery has not answered yet.
    probing: u8,
    /// Battery discovery still has to be started.
    battery_pending: bool,
}

impl LinkEntry {
    const fn new(link: ConnHandle, peer: PeerAddress) -> Self {
        Self {
            link,
            peer,
            attempted: 0,
            probing: 0,
            battery_pending: false,
        }
    }

    const fn attempted(&self, kind: PeerKind) -> bool {
        self.attempted & bit(kind) != 0
    }

    const fn probing(&self, kind: PeerKind) -> bool {
        self.probing & bit(kind) != 0
    }

    fn mark(&mut self, kind: PeerKind) {
        self.attempted |= bit(kind);
    }

    fn start_probe(&mut self, kind: PeerKind) {
        self.attempted |= bit(kind);
        self.probing |= bit(kind);
    }

    fn end_probe(&mut self, kind: PeerKind) {
        self.probing &= !bit(kind);
    }
}

/// Sink wrapper noting remote button presses on the way through.
struct ButtonTap<'a> {
    inner: &'a mut dyn EventSink,
    pressed: Option<Button>,
}

impl EventSink for ButtonTap<'_> {
    fn publish(&mut self, event: AppEvent) {
        if let AppEvent::Button {
            button,
            pressed: true,
            ..
        } = event
        {
            self.pressed = Some(button);
        }
        self.inner.publish(event);
    }
}

pub struct CentralManager<T: Transport, S: EventSink> {
    config: GatewayConfig,
    transport: T,
    sink: S,
    clients: PeerClients,
    links: Vec<LinkEntry, MAX_LINKS>,
    /// Link each identity is ready on.
    ready: [Option<ConnHandle>; 3],
    connecting: Option<PeerAddress>,
    scanning: bool,
}

impl<T: Transport, S: EventSink> CentralManager<T, S> {
    pub fn new(config: GatewayConfig, transport: T, sink: S, clients: PeerClients) -> Self {
        Self {
            config,
            transport,
            sink,
            clients,
            links: Vec::new(),
            ready: [None; 3],
            connecting: None,
            scanning: false,
        }
    }

    /// Register every client's service with the discovery engine. A failure
    /// here is a configuration bug and should abort startup.
    pub fn init(&mut self) -> Result<(), Error> {
        self.clients.init(&mut self.transport)
    }

    /// (Re)issue a scan request. "Already scanning" counts as success.
    pub fn start_scan(&mut self) -> Result<(), Error> {
        match self.transport.scan_start(&self.config.scan) {
            Ok(()) | Err(TransportError::InvalidState) => {}
            Err(e) => return Err(Error::Scan(e)),
        }
        if !self.scanning {
            info!("scanning");
        }
        self.set_scanning(true);
        Ok(())
    }

    /// Feed one transport event through the manager.
    pub fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement(report) => self.on_advertisement(&report),
            TransportEvent::Connected { link, peer } => self.on_connected(link, peer),
            TransportEvent::Disconnected { link, reason } => self.on_disconnected(link, reason),
            TransportEvent::DiscoveryComplete(result) => self.on_discovery_complete(&result),
            TransportEvent::DiscoveryFailed { link, service } => self.on_discovery_failed(link, service),
            TransportEvent::Notification { link, handle, data } => self.on_notification(link, handle, &data),
            TransportEvent::WriteResponse { link } => self.on_write_response(link),
            TransportEvent::ReadResponse { link, handle, data } => self.on_read_response(link, handle, &data),
            TransportEvent::ConnectionTimeout => self.on_connection_timeout(),
            TransportEvent::GattTimeout { link } => self.on_gatt_timeout(link),
            TransportEvent::ConnParamUpdateRequest { link, params } => {
                self.on_conn_param_update_request(link, &params)
            }
        }
    }

    pub fn on_advertisement(&mut self, report: &AdvReport) {
        if !self.wants_scan() {
            return;
        }
        let Some(index) = find_target(&report.data, &self.config.targets) else {
            return;
        };
        let peer = self.config.targets[index].peer;
        if self.ready[peer.index()].is_some() {
            return;
        }
        if self.links.iter().any(|l| l.peer == report.peer) {
            return;
        }

        info!(
            "found {} ({:?}), rssi {}",
            extract_device_name(&report.data).as_str(),
            peer,
            report.rssi
        );
        match self.transport.connect(&report.peer, &self.config.scan, &self.config.conn) {
            Ok(()) => {
                // The stack stops scanning while it connects.
                self.connecting = Some(report.peer);
                self.set_scanning(false);
            }
            Err(e) => warn!("connect request failed: {:?}", e),
        }
    }

    pub fn on_connected(&mut self, link: ConnHandle, peer: PeerAddress) {
        self.connecting = None;
        if self.links.push(LinkEntry::new(link, peer)).is_err() {
            warn!("no room for {:?} - disconnecting", link);
            if let Err(e) = self.transport.disconnect(link) {
                warn!("disconnect of {:?} failed: {:?}", link, e);
            }
            return;
        }

        info!("connected {:?} ({} links)", link, self.links.len());
        self.start_discovery(link);
        self.settle(link);
        self.update_scanning();
    }

    pub fn on_disconnected(&mut self, link: ConnHandle, reason: u8) {
        info!("disconnected {:?}, reason {:#x}", link, reason);
        self.links.retain(|l| l.link != link);

        for kind in PeerKind::ALL {
            if self.ready[kind.index()] == Some(link) {
                self.ready[kind.index()] = None;
                self.sink.publish(AppEvent::PeerLost { peer: kind, link });
            }
        }
        for client in self.clients.all_mut() {
            client.on_disconnected(link);
        }

        self.retry_discoveries();
        self.update_scanning();
    }

    pub fn on_discovery_complete(&mut self, result: &DiscoveryResult) {
        self.assert_known(result.link);
        self.end_probes(result.link, result.service);
        let accepted = discovery::dispatch(result, &mut self.clients, &mut self.sink);
        for d in accepted {
            match d.role {
                ServiceRole::Primary => self.on_primary_ready(result.link, d.peer, &d.handles),
                ServiceRole::Battery => self.on_battery_ready(result.link, d.peer, &d.handles),
            }
        }
        self.retry_discoveries();
        self.update_scanning();
    }

    /// The service is not on the peer. Either way a discovery engine is free
    /// again, so postponed discoveries get another go.
    pub fn on_discovery_failed(&mut self, link: ConnHandle, service: BleUuid) {
        self.assert_known(link);
        if service == BATTERY_SERVICE {
            debug!("no battery service on {:?}", link);
        } else {
            debug!("{:?} not on {:?}", service, link);
            self.end_probes(link, service);
        }
        self.retry_discoveries();
        self.update_scanning();
    }

    pub fn on_notification(&mut self, link: ConnHandle, handle: u16, data: &[u8]) {
        let mut tap = ButtonTap {
            inner: &mut self.sink,
            pressed: None,
        };
        for client in self.clients.all_mut() {
            client.on_notification(link, handle, data, &mut tap);
        }
        let pressed = tap.pressed;
        if let Some(button) = pressed {
            self.bridge(button);
        }
    }

    pub fn on_write_response(&mut self, link: ConnHandle) {
        for client in self.clients.all_mut() {
            client.on_write_response(link, &mut self.transport, &mut self.sink);
        }
    }

    pub fn on_read_response(&mut self, link: ConnHandle, handle: u16, data: &[u8]) {
        for client in self.clients.all_mut() {
            client.on_read_response(link, handle, data, &mut self.transport, &mut self.sink);
        }
    }

    /// A connect attempt timed out; scanning itself never does.
    pub fn on_connection_timeout(&mut self) {
        info!("connection attempt timed out");
        self.connecting = None;
        self.update_scanning();
    }

    pub fn on_gatt_timeout(&mut self, link: ConnHandle) {
        warn!("GATT procedure timed out on {:?} - disconnecting", link);
        if let Err(e) = self.transport.disconnect(link) {
            warn!("disconnect of {:?} failed: {:?}", link, e);
        }
    }

    /// Accept whatever the peer asks for.
    pub fn on_conn_param_update_request(&mut self, link: ConnHandle, params: &ConnParams) {
        debug!("{:?} requests {:?}", link, params);
        if let Err(e) = self.transport.conn_param_update(link, params) {
            warn!("connection parameter update on {:?} failed: {:?}", link, e);
        }
    }

    /// Switch the light, if one is connected.
    pub fn set_light(&mut self, on: bool) -> Result<(), Error> {
        if self.ready[PeerKind::Light.index()].is_none() {
            return Err(Error::UnknownPeer);
        }
        self.clients.light.set(&mut self.transport, &mut self.sink, on)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.is_some()
    }

    /// `Discovering` reports the first link probing for `kind`.
    pub fn slot(&self, kind: PeerKind) -> SlotState {
        if let Some(link) = self.ready[kind.index()] {
            return SlotState::Ready(link);
        }
        match self.links.iter().find(|l| l.probing(kind)) {
            Some(entry) => SlotState::Discovering(entry.link),
            None => SlotState::Vacant,
        }
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn clients(&self) -> &PeerClients {
        &self.clients
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn targeted(&self, kind: PeerKind) -> bool {
        self.config.targets.iter().any(|t| t.peer == kind)
    }

    /// Identity served on `link`, if any.
    fn served_on(&self, link: ConnHandle) -> Option<PeerKind> {
        PeerKind::ALL
            .into_iter()
            .find(|k| self.ready[k.index()] == Some(link))
    }

    fn has_open_identity(&self) -> bool {
        PeerKind::ALL
            .iter()
            .any(|k| self.targeted(*k) && self.ready[k.index()].is_none())
    }

    fn wants_scan(&self) -> bool {
        self.connecting.is_none()
            && self.links.len() < self.config.max_links.min(MAX_LINKS)
            && self.has_open_identity()
    }

    fn update_scanning(&mut self) {
        if self.wants_scan() {
            if !self.scanning {
                if let Err(e) = self.start_scan() {
                    error!("failed to resume scanning: {:?}", e);
                }
            }
        } else if self.scanning {
            info!("scanning stopped");
            if let Err(e) = self.transport.scan_stop() {
                debug!("scan stop: {:?}", e);
            }
            self.set_scanning(false);
        }
    }

    fn set_scanning(&mut self, on: bool) {
        if self.scanning != on {
            self.scanning = on;
            self.sink.publish(AppEvent::Scanning(on));
        }
    }

    /// Start what is still owed on `link`: the battery lookup of a ready
    /// peer, or else a probe for every open identity not yet tried there,
    /// in priority order. A busy discovery engine leaves the request for a
    /// later call.
    fn start_discovery(&mut self, link: ConnHandle) {
        let Some(index) = self.links.iter().position(|l| l.link == link) else {
            return;
        };

        if self.links[index].battery_pending {
            match self.transport.discovery_start(link, BATTERY_SERVICE) {
                Err(TransportError::Busy) => debug!("discovery engine busy for battery on {:?}", link),
                result => {
                    if let Err(e) = result {
                        debug!("battery discovery on {:?} not started: {:?}", link, e);
                    }
                    self.links[index].battery_pending = false;
                }
            }
        }

        // A device is one kind of peer: once it serves one, stop probing it.
        if self.served_on(link).is_some() {
            return;
        }

        for kind in PeerKind::ALL {
            if !self.targeted(kind) || self.ready[kind.index()].is_some() || self.links[index].attempted(kind) {
                continue;
            }

            let service = self.clients.primary(kind).service();
            match self.transport.discovery_start(link, service) {
                Ok(()) => {
                    debug!("discovering {:?} service on {:?}", kind, link);
                    self.links[index].start_probe(kind);
                }
                Err(TransportError::Busy) => {
                    debug!("discovery engine busy for {:?} - trying next slot", kind);
                }
                Err(e) => {
                    warn!("discovery of {:?} on {:?} failed: {:?}", kind, link, e);
                    self.links[index].mark(kind);
                }
            }
        }
    }

    fn retry_discoveries(&mut self) {
        let links: Vec<ConnHandle, MAX_LINKS> = self.links.iter().map(|l| l.link).collect();
        for link in links {
            self.start_discovery(link);
            self.settle(link);
        }
    }

    fn end_probes(&mut self, link: ConnHandle, service: BleUuid) {
        let Some(index) = self.links.iter().position(|l| l.link == link) else {
            return;
        };
        for kind in PeerKind::ALL {
            if self.clients.primary(kind).service() == service {
                self.links[index].end_probe(kind);
            }
        }
    }

    /// Drop a link that serves no identity and has nothing left to try.
    fn settle(&mut self, link: ConnHandle) {
        let Some(entry) = self.links.iter().find(|l| l.link == link).copied() else {
            return;
        };
        if entry.probing != 0 || self.served_on(link).is_some() {
            return;
        }
        let pending = PeerKind::ALL.iter().any(|k| {
            self.targeted(*k) && self.ready[k.index()].is_none() && !entry.attempted(*k)
        });
        if pending {
            return;
        }

        info!("no served service on {:?} - disconnecting", link);
        if let Err(e) = self.transport.disconnect(link) {
            warn!("disconnect of {:?} failed: {:?}", link, e);
        }
    }

    fn on_primary_ready(&mut self, link: ConnHandle, peer: PeerKind, handles: &ServiceHandles) {
        if let Some(served) = self.served_on(link) {
            if served != peer {
                debug!("{:?} already serves {:?} - ignoring {:?}", link, served, peer);
            }
            return;
        }

        self.ready[peer.index()] = Some(link);
        if let Some(entry) = self.links.iter_mut().find(|l| l.link == link) {
            // Late answers for the other probes are ignored from here on.
            entry.probing = 0;
            entry.battery_pending = true;
        }

        let client = self.clients.primary_mut(peer);
        client.handles_assign(link, handles);
        if let Err(e) = client.on_ready(&mut self.transport) {
            warn!("{:?}: enabling notifications failed: {:?}", peer, e);
        }
        info!("{:?} ready on {:?}", peer, link);
        self.sink.publish(AppEvent::PeerReady { peer, link });
    }

    fn on_battery_ready(&mut self, link: ConnHandle, peer: PeerKind, handles: &ServiceHandles) {
        let battery = self.clients.battery_mut(peer);
        battery.handles_assign(link, handles);
        if let Err(e) = battery.on_ready(&mut self.transport) {
            debug!("{:?} battery: {:?}", peer, e);
        }
    }

    fn bridge(&mut self, button: Button) {
        if !self.config.remote_controls_light {
            return;
        }
        if let Err(e) = self.set_light(button == Button::On) {
            debug!("remote {:?} not forwarded to light: {:?}", button, e);
        }
    }

    fn assert_known(&self, link: ConnHandle) {
        debug_assert!(
            self.links.iter().any(|l| l.link == link),
            "discovery event before connection"
        );
    }
}
