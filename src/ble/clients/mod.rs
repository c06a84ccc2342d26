//! Per-peer GATT clients.
//!
//! Every client follows the same pattern: it registers its service UUID
//! with the discovery engine at init, picks its characteristic handles out
//! of a discovery result, enables notifications through its own
//! [`CommandQueue`], and decodes notifications on its link into typed
//! [`AppEvent`]s. The clients differ only in UUIDs and payload decoding.
//!
//! [`AppEvent`]: crate::ble::AppEvent

pub mod battery;
pub mod environment;
pub mod light;
pub mod remote_control;

pub use battery::BatteryClient;
pub use environment::EnvironmentClient;
pub use light::LightClient;
pub use remote_control::RemoteControlClient;

use crate::ble::command_queue::{CommandQueue, DrainOutcome, PendingCommand};
use crate::ble::transport::{DiscoveryResult, Transport, WriteKind};
use crate::ble::{BleUuid, CharHandles, ConnHandle, EventSink, PeerKind, ServiceHandles};
use crate::error::Error;

/// CCCD value enabling notifications (little-endian 0x0001).
pub const CCCD_ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];

/// State every client carries: identity, link association and queue.
pub struct ClientCore {
    peer: PeerKind,
    service: BleUuid,
    link: Option<ConnHandle>,
    queue: CommandQueue,
}

impl ClientCore {
    /// `service` is provisional for vendor UUIDs until [`ClientCore::register`]
    /// learns the namespace index.
    pub fn new(peer: PeerKind, service: BleUuid) -> Self {
        Self {
            peer,
            service,
            link: None,
            queue: CommandQueue::new(),
        }
    }

    pub fn peer(&self) -> PeerKind {
        self.peer
    }

    pub fn service(&self) -> BleUuid {
        self.service
    }

    pub fn link(&self) -> Option<ConnHandle> {
        self.link
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn owns(&self, link: ConnHandle) -> bool {
        self.link == Some(link)
    }

    /// Register the service with the discovery engine, adding the vendor
    /// base UUID first when there is one.
    pub fn register(
        &mut self,
        transport: &mut dyn Transport,
        vendor_base: Option<&[u8; 16]>,
    ) -> Result<(), Error> {
        if let Some(base) = vendor_base {
            let index = transport
                .register_vendor_uuid(base)
                .map_err(Error::UuidRegistration)?;
            self.service = BleUuid::vendor(self.service.uuid, index);
        }
        transport
            .register_service(self.service)
            .map_err(Error::DiscoveryRegistration)
    }

    /// Whether a discovery result is for this client's link. Results for a
    /// different link are refused while a link is associated.
    pub fn accepts(&self, result: &DiscoveryResult) -> bool {
        match self.link {
            None => true,
            Some(link) if link == result.link => true,
            Some(link) => {
                warn!(
                    "{:?} client already bound to {:?} - ignoring discovery on {:?}",
                    self.peer, link, result.link
                );
                false
            }
        }
    }

    /// Associate with `link`. Returns `true` when the link changed, in which
    /// case the caller must reset its handles before merging.
    pub fn associate(&mut self, link: ConnHandle) -> bool {
        let changed = self.link != Some(link);
        self.link = Some(link);
        changed
    }

    /// Queue a CCCD write enabling notifications for `handles`.
    pub fn notify_enable(
        &mut self,
        transport: &mut dyn Transport,
        handles: &CharHandles,
    ) -> Result<(), Error> {
        let link = self.link.ok_or(Error::NotConnected)?;
        let cccd = handles.cccd.ok_or(Error::HandleUnassigned)?;
        debug!("configuring CCCD {} on {:?}", cccd, link);
        self.submit(
            transport,
            PendingCommand::write(link, cccd, &CCCD_ENABLE_NOTIFICATION, WriteKind::Request),
        );
        Ok(())
    }

    /// Queue a read of the characteristic value.
    pub fn read(&mut self, transport: &mut dyn Transport, handles: &CharHandles) -> Result<(), Error> {
        let link = self.link.ok_or(Error::NotConnected)?;
        let value = handles.value.ok_or(Error::HandleUnassigned)?;
        self.submit(transport, PendingCommand::read(link, value));
        Ok(())
    }

    /// Queue a write of the characteristic value.
    pub fn write(
        &mut self,
        transport: &mut dyn Transport,
        handles: &CharHandles,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), Error> {
        let link = self.link.ok_or(Error::NotConnected)?;
        let handle = handles.value.ok_or(Error::HandleUnassigned)?;
        self.submit(transport, PendingCommand::write(link, handle, value, kind));
        Ok(())
    }

    pub fn submit(&mut self, transport: &mut dyn Transport, command: PendingCommand) -> DrainOutcome {
        self.queue.enqueue(command);
        self.queue.process(transport, self.link)
    }

    /// Drain after a read/write response on our link.
    pub fn on_response(&mut self, link: ConnHandle, transport: &mut dyn Transport) {
        if self.owns(link) {
            self.queue.process(transport, self.link);
        }
    }

    /// Drop the association with `link`. Returns `true` if it was ours.
    pub fn disconnect(&mut self, link: ConnHandle) -> bool {
        if !self.owns(link) {
            return false;
        }
        self.link = None;
        let purged = self.queue.purge(link);
        if purged > 0 {
            debug!("{:?} client dropped {} queued commands", self.peer, purged);
        }
        true
    }
}

/// Every client the gateway runs, one primary client per [`PeerKind`] plus
/// a battery client for each.
pub struct PeerClients {
    pub environment: EnvironmentClient,
    pub remote_control: RemoteControlClient,
    pub light: LightClient,
    pub batteries: [BatteryClient; 3],
}

impl Default for PeerClients {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerClients {
    pub fn new() -> Self {
        Self {
            environment: EnvironmentClient::new(),
            remote_control: RemoteControlClient::new(),
            light: LightClient::new(),
            batteries: PeerKind::ALL.map(BatteryClient::new),
        }
    }

    /// Register every service with the discovery engine.
    pub fn init(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        for kind in PeerKind::ALL {
            self.primary_mut(kind).init(transport)?;
        }
        // The battery clients share one service UUID.
        self.batteries[0].init(transport)
    }

    pub fn primary(&self, kind: PeerKind) -> &dyn GattClient {
        match kind {
            PeerKind::Environment => &self.environment,
            PeerKind::RemoteControl => &self.remote_control,
            PeerKind::Light => &self.light,
        }
    }

    pub fn primary_mut(&mut self, kind: PeerKind) -> &mut dyn GattClient {
        match kind {
            PeerKind::Environment => &mut self.environment,
            PeerKind::RemoteControl => &mut self.remote_control,
            PeerKind::Light => &mut self.light,
        }
    }

    pub fn battery(&self, kind: PeerKind) -> &BatteryClient {
        &self.batteries[kind.index()]
    }

    pub fn battery_mut(&mut self, kind: PeerKind) -> &mut BatteryClient {
        &mut self.batteries[kind.index()]
    }

    /// Primary clients first, then battery clients.
    pub fn all_mut(&mut self) -> [&mut dyn GattClient; 6] {
        let [env_battery, remote_battery, light_battery] = &mut self.batteries;
        [
            &mut self.environment,
            &mut self.remote_control,
            &mut self.light,
            env_battery,
            remote_battery,
            light_battery,
        ]
    }
}

/// Handles of `uuid` in a discovery result, or unassigned.
pub fn find_handles(result: &DiscoveryResult, uuid: u16) -> CharHandles {
    result
        .find(uuid)
        .map(|c| CharHandles::new(c.value_handle, c.cccd_handle))
        .unwrap_or(CharHandles::UNASSIGNED)
}

/// Common interface the central manager and discovery dispatcher drive.
pub trait GattClient {
    fn core(&self) -> &ClientCore;

    fn core_mut(&mut self) -> &mut ClientCore;

    /// Register the service UUID (and vendor base, if any).
    fn init(&mut self, transport: &mut dyn Transport) -> Result<(), Error>;

    /// Pick our characteristics out of `result`, merge them into the
    /// current handles if we are already bound to the same link, and report
    /// the discovered set upstream.
    fn on_discovery_complete(
        &mut self,
        result: &DiscoveryResult,
        sink: &mut dyn EventSink,
    ) -> Option<ServiceHandles>;

    /// Bind to `link` and fill in unassigned handles from `handles`.
    /// Already assigned handles are never overwritten on the same link.
    fn handles_assign(&mut self, link: ConnHandle, handles: &ServiceHandles);

    /// Work to do once the service is ready: enable notifications and
    /// queue any initial reads.
    fn on_ready(&mut self, transport: &mut dyn Transport) -> Result<(), Error>;

    fn on_notification(&mut self, link: ConnHandle, handle: u16, data: &[u8], sink: &mut dyn EventSink);

    /// Clear every handle to unassigned.
    fn clear_handles(&mut self);

    /// Whether every handle is unassigned.
    fn handles_unassigned(&self) -> bool;

    fn on_read_response(
        &mut self,
        link: ConnHandle,
        handle: u16,
        data: &[u8],
        transport: &mut dyn Transport,
        sink: &mut dyn EventSink,
    ) {
        if self.core().owns(link) {
            self.on_notification(link, handle, data, sink);
        }
        self.core_mut().on_response(link, transport);
    }

    fn on_write_response(&mut self, link: ConnHandle, transport: &mut dyn Transport, _sink: &mut dyn EventSink) {
        self.core_mut().on_response(link, transport);
    }

    fn on_disconnected(&mut self, link: ConnHandle) {
        if self.core_mut().disconnect(link) {
            self.clear_handles();
        }
    }

    fn peer(&self) -> PeerKind {
        self.core().peer()
    }

    fn service(&self) -> BleUuid {
        self.core().service()
    }

    fn link(&self) -> Option<ConnHandle> {
        self.core().link()
    }
}
