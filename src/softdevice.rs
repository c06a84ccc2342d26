//! SoftDevice S140 implementation of [`Transport`].
//!
//! The central manager is synchronous, the SoftDevice API is async. The
//! transport bridges the two with channels: every request is posted with
//! `try_send` to either the radio task (scan / connect) or the task that
//! owns the link, and every completion comes back through [`EVENTS`].
//!
//! The transport also keeps the stack's flow-control rules the manager
//! relies on: one GATT read/write in flight per link and at most
//! [`DISCOVERY_ENGINES`] discoveries at a time, both reported as `Busy`.

use core::cell::Cell;
use core::marker::PhantomData;

use ble_gateway::ble::clients::battery::{BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID};
use ble_gateway::ble::clients::environment::{ENVIRONMENT_BASE_UUID, ENVIRONMENT_SERVICE_UUID};
use ble_gateway::ble::clients::light::LIGHT_SERVICE_UUID;
use ble_gateway::ble::clients::remote_control::{BUTTON_BASE_UUID, BUTTON_SERVICE_UUID};
use ble_gateway::ble::transport::{
    AdvReport, ConnParams, DiscoveredCharacteristic, DiscoveryResult, Payload, PeerAddress, ScanParams,
    Transport, TransportEvent, WriteKind,
};
use ble_gateway::ble::{BleUuid, ConnHandle, UuidKind};
use ble_gateway::config::{ADV_DATA_MAX_LEN, ATT_PAYLOAD_MAX_LEN, CONNECT_TIMEOUT, DISCOVERY_ENGINES, MAX_DISCOVERED_CHARS, MAX_LINKS};
use ble_gateway::TransportError;
use defmt::{debug, info, warn};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use heapless::Vec;
use nrf_softdevice::ble::gatt_client::{self, Characteristic, Descriptor, DiscoverError};
use nrf_softdevice::ble::{central, Address, Connection, HvxType, Uuid};
use nrf_softdevice::{raw, RawError, Softdevice};

/// Everything the radio and link tasks observe, in order.
pub static EVENTS: Channel<CriticalSectionRawMutex, TransportEvent, 16> = Channel::new();

static RADIO_REQUESTS: Channel<CriticalSectionRawMutex, RadioRequest, 4> = Channel::new();

static LINK_REQUESTS: [Channel<CriticalSectionRawMutex, LinkRequest, 8>; MAX_LINKS] =
    [const { Channel::new() }; MAX_LINKS];

static ATTACH: [Channel<CriticalSectionRawMutex, Connection, 1>; MAX_LINKS] =
    [const { Channel::new() }; MAX_LINKS];

/// Connection handle served by each link task.
static LINK_TABLE: Mutex<CriticalSectionRawMutex, Cell<[Option<u16>; MAX_LINKS]>> =
    Mutex::new(Cell::new([None; MAX_LINKS]));

const CCCD_UUID: u16 = 0x2902;

enum RadioRequest {
    ScanStart(ScanParams),
    ScanStop,
    Connect {
        peer: PeerAddress,
        scan: ScanParams,
        params: ConnParams,
    },
}

enum LinkOp {
    Discover(BleUuid),
    Read(u16),
    Write { handle: u16, value: Payload, kind: WriteKind },
    Disconnect,
    ConnParams(ConnParams),
}

struct LinkRequest {
    link: ConnHandle,
    op: LinkOp,
}

pub struct SoftdeviceTransport {
    gatt_in_flight: Vec<ConnHandle, MAX_LINKS>,
    discovering: Vec<ConnHandle, DISCOVERY_ENGINES>,
}

impl SoftdeviceTransport {
    pub const fn new() -> Self {
        Self {
            gatt_in_flight: Vec::new(),
            discovering: Vec::new(),
        }
    }

    /// Update flow-control state from an event before the manager sees it.
    pub fn observe(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::WriteResponse { link } | TransportEvent::ReadResponse { link, .. } => {
                self.gatt_in_flight.retain(|l| l != link);
            }
            TransportEvent::DiscoveryComplete(result) => self.discovery_done(result.link),
            TransportEvent::DiscoveryFailed { link, .. } => self.discovery_done(*link),
            TransportEvent::Disconnected { link, .. } => {
                self.gatt_in_flight.retain(|l| l != link);
                self.discovering.retain(|l| l != link);
            }
            _ => {}
        }
    }

    fn discovery_done(&mut self, link: ConnHandle) {
        if let Some(i) = self.discovering.iter().position(|l| *l == link) {
            self.discovering.swap_remove(i);
        }
    }

    fn post(&mut self, link: ConnHandle, op: LinkOp) -> Result<(), TransportError> {
        let slot = slot_of(link).ok_or(TransportError::Disconnected)?;
        LINK_REQUESTS[slot]
            .try_send(LinkRequest { link, op })
            .map_err(|_| TransportError::NoResources)
    }

    fn post_gatt(&mut self, link: ConnHandle, op: LinkOp) -> Result<(), TransportError> {
        if self.gatt_in_flight.contains(&link) {
            return Err(TransportError::Busy);
        }
        self.post(link, op)?;
        let _ = self.gatt_in_flight.push(link);
        Ok(())
    }
}

impl Transport for SoftdeviceTransport {
    fn scan_start(&mut self, params: &ScanParams) -> Result<(), TransportError> {
        RADIO_REQUESTS
            .try_send(RadioRequest::ScanStart(*params))
            .map_err(|_| TransportError::Busy)
    }

    fn scan_stop(&mut self) -> Result<(), TransportError> {
        RADIO_REQUESTS
            .try_send(RadioRequest::ScanStop)
            .map_err(|_| TransportError::Busy)
    }

    fn connect(&mut self, peer: &PeerAddress, scan: &ScanParams, params: &ConnParams) -> Result<(), TransportError> {
        RADIO_REQUESTS
            .try_send(RadioRequest::Connect {
                peer: *peer,
                scan: *scan,
                params: *params,
            })
            .map_err(|_| TransportError::Busy)
    }

    fn disconnect(&mut self, link: ConnHandle) -> Result<(), TransportError> {
        self.post(link, LinkOp::Disconnect)
    }

    fn discovery_start(&mut self, link: ConnHandle, service: BleUuid) -> Result<(), TransportError> {
        if self.discovering.is_full() {
            return Err(TransportError::Busy);
        }
        self.post(link, LinkOp::Discover(service))?;
        let _ = self.discovering.push(link);
        Ok(())
    }

    fn gatt_read(&mut self, link: ConnHandle, handle: u16) -> Result<(), TransportError> {
        self.post_gatt(link, LinkOp::Read(handle))
    }

    fn gatt_write(&mut self, link: ConnHandle, handle: u16, value: &[u8], kind: WriteKind) -> Result<(), TransportError> {
        let mut payload = Payload::new();
        payload
            .extend_from_slice(value)
            .map_err(|_| TransportError::InvalidState)?;
        self.post_gatt(
            link,
            LinkOp::Write {
                handle,
                value: payload,
                kind,
            },
        )
    }

    fn conn_param_update(&mut self, link: ConnHandle, params: &ConnParams) -> Result<(), TransportError> {
        self.post(link, LinkOp::ConnParams(*params))
    }

    fn register_vendor_uuid(&mut self, base: &[u8; 16]) -> Result<u8, TransportError> {
        let uuid = raw::ble_uuid128_t { uuid128: *base };
        let mut uuid_type: u8 = 0;
        let ret = unsafe { raw::sd_ble_uuid_vs_add(&uuid, &mut uuid_type) };
        RawError::convert(ret).map_err(transport_error)?;
        Ok(uuid_type)
    }

    /// The SoftDevice discovers by UUID on demand; nothing to prepare.
    fn register_service(&mut self, service: BleUuid) -> Result<(), TransportError> {
        debug!("discovery registered for {:?}", service);
        Ok(())
    }
}

fn transport_error(e: RawError) -> TransportError {
    match e {
        RawError::Busy => TransportError::Busy,
        RawError::InvalidState => TransportError::InvalidState,
        RawError::NoMem => TransportError::NoResources,
        RawError::Timeout => TransportError::Timeout,
        other => TransportError::Raw(other as u32),
    }
}

fn slot_of(link: ConnHandle) -> Option<usize> {
    LINK_TABLE.lock(|table| table.get().iter().position(|h| *h == Some(link.0)))
}

fn claim_slot(handle: u16) -> Option<usize> {
    LINK_TABLE.lock(|table| {
        let mut t = table.get();
        let slot = t.iter().position(Option::is_none)?;
        t[slot] = Some(handle);
        table.set(t);
        Some(slot)
    })
}

fn release_slot(slot: usize) {
    LINK_TABLE.lock(|table| {
        let mut t = table.get();
        t[slot] = None;
        table.set(t);
    })
}

fn raw_conn_params(params: &ConnParams) -> raw::ble_gap_conn_params_t {
    raw::ble_gap_conn_params_t {
        min_conn_interval: params.min_interval,
        max_conn_interval: params.max_interval,
        slave_latency: params.slave_latency,
        conn_sup_timeout: params.sup_timeout,
    }
}

fn scan_config<'a>(params: &ScanParams, whitelist: Option<&'a [&'a Address]>) -> central::ScanConfig<'a> {
    central::ScanConfig {
        whitelist,
        active: params.active,
        interval: u32::from(params.interval),
        window: u32::from(params.window),
        timeout: params.timeout,
        ..Default::default()
    }
}

fn payload(data: &[u8]) -> Payload {
    let mut p = Payload::new();
    let n = data.len().min(ATT_PAYLOAD_MAX_LEN);
    let _ = p.extend_from_slice(&data[..n]);
    p
}

// Service probes

/// UUID of a service the gateway knows how to discover.
pub trait KnownService {
    fn uuid() -> Uuid;
}

pub struct EnvironmentService;
pub struct ButtonService;
pub struct LightService;
pub struct BatteryService;

impl KnownService for EnvironmentService {
    fn uuid() -> Uuid {
        vendor_uuid(&ENVIRONMENT_BASE_UUID, ENVIRONMENT_SERVICE_UUID)
    }
}

impl KnownService for ButtonService {
    fn uuid() -> Uuid {
        vendor_uuid(&BUTTON_BASE_UUID, BUTTON_SERVICE_UUID)
    }
}

impl KnownService for LightService {
    fn uuid() -> Uuid {
        Uuid::new_16(LIGHT_SERVICE_UUID)
    }
}

impl KnownService for BatteryService {
    fn uuid() -> Uuid {
        Uuid::new_16(BATTERY_SERVICE_UUID)
    }
}

/// Full 128-bit UUID: vendor base with bytes 12..14 replaced by `uuid`.
fn vendor_uuid(base: &[u8; 16], uuid: u16) -> Uuid {
    let mut full = *base;
    full[12..14].copy_from_slice(&uuid.to_le_bytes());
    Uuid::new_128(&full)
}

/// 16-bit part of a UUID in its namespace.
fn short_uuid(uuid: &Uuid) -> u16 {
    unsafe { (*uuid.as_raw_ptr()).uuid }
}

/// Generic GATT client that records every characteristic of one service
/// and hands notifications through unparsed.
pub struct Probe<S> {
    characteristics: Vec<DiscoveredCharacteristic, MAX_DISCOVERED_CHARS>,
    _service: PhantomData<S>,
}

impl<S: KnownService> gatt_client::Client for Probe<S> {
    type Event = (u16, Payload);

    fn on_hvx(&self, _conn: &Connection, _type: HvxType, handle: u16, data: &[u8]) -> Option<Self::Event> {
        Some((handle, payload(data)))
    }

    fn uuid() -> Uuid {
        S::uuid()
    }

    fn new_undiscovered(_conn: Connection) -> Self {
        Self {
            characteristics: Vec::new(),
            _service: PhantomData,
        }
    }

    fn discovered_characteristic(&mut self, characteristic: &Characteristic, descriptors: &[Descriptor]) {
        let Some(uuid) = characteristic.uuid.as_ref() else {
            return;
        };
        let cccd = Uuid::new_16(CCCD_UUID);
        let cccd_handle = descriptors
            .iter()
            .find(|d| d.uuid.as_ref() == Some(&cccd))
            .map(|d| d.handle);
        let found = DiscoveredCharacteristic {
            uuid: short_uuid(uuid),
            value_handle: characteristic.handle_value,
            cccd_handle,
        };
        if self.characteristics.push(found).is_err() {
            warn!("too many characteristics - ignoring {:?}", found);
        }
    }

    fn discovery_complete(&mut self) -> Result<(), DiscoverError> {
        Ok(())
    }
}

async fn probe<S: KnownService>(
    conn: &Connection,
) -> Result<Vec<DiscoveredCharacteristic, MAX_DISCOVERED_CHARS>, DiscoverError> {
    let probe: Probe<S> = gatt_client::discover(conn).await?;
    Ok(probe.characteristics)
}

async fn discover(conn: &Connection, link: ConnHandle, service: BleUuid) -> TransportEvent {
    let found = match (service.kind, service.uuid) {
        (UuidKind::Vendor(_), ENVIRONMENT_SERVICE_UUID) => probe::<EnvironmentService>(conn).await,
        (UuidKind::Vendor(_), BUTTON_SERVICE_UUID) => probe::<ButtonService>(conn).await,
        (UuidKind::Sig, LIGHT_SERVICE_UUID) => probe::<LightService>(conn).await,
        (UuidKind::Sig, BATTERY_SERVICE_UUID) => probe::<BatteryService>(conn).await,
        _ => Err(DiscoverError::ServiceNotFound),
    };

    match found {
        Ok(characteristics) => {
            let mut result = DiscoveryResult::new(link, service);
            result.characteristics = characteristics;
            if service.uuid == BATTERY_SERVICE_UUID && result.find(BATTERY_LEVEL_CHAR_UUID).is_none() {
                debug!("battery service without level characteristic on {:?}", link);
            }
            TransportEvent::DiscoveryComplete(result)
        }
        Err(e) => {
            debug!("discovery of {:?} on {:?}: {:?}", service, link, e);
            TransportEvent::DiscoveryFailed { link, service }
        }
    }
}

// Radio task body

/// Scan and connect on request. A new request aborts a running scan; the
/// SoftDevice scan is stopped when its future is dropped.
pub async fn run_radio(sd: &'static Softdevice) -> ! {
    let mut pending: Option<RadioRequest> = None;

    loop {
        let request = match pending.take() {
            Some(request) => request,
            None => RADIO_REQUESTS.receive().await,
        };

        match request {
            RadioRequest::ScanStart(params) => {
                let config = scan_config(&params, None);
                let scan = central::scan(sd, &config, |report| {
                    on_advertisement(report);
                    None::<()>
                });
                match select(RADIO_REQUESTS.receive(), scan).await {
                    Either::First(next) => pending = Some(next),
                    Either::Second(Err(e)) => warn!("scan ended: {:?}", e),
                    Either::Second(Ok(())) => {}
                }
            }
            // Stopped when the scan future was dropped.
            RadioRequest::ScanStop => {}
            RadioRequest::Connect { peer, scan, params } => connect(sd, peer, &scan, &params).await,
        }
    }
}

fn on_advertisement(report: &raw::ble_gap_evt_adv_report_t) {
    let data = unsafe { core::slice::from_raw_parts(report.data.p_data, report.data.len as usize) };
    let mut adv = Vec::new();
    let n = data.len().min(ADV_DATA_MAX_LEN);
    let _ = adv.extend_from_slice(&data[..n]);

    let event = TransportEvent::Advertisement(AdvReport {
        peer: PeerAddress {
            addr_type: report.peer_addr.addr_type(),
            bytes: report.peer_addr.addr,
        },
        rssi: report.rssi,
        data: adv,
    });
    // Advertisements repeat; dropping one under load is harmless.
    let _ = EVENTS.try_send(event);
}

async fn connect(sd: &'static Softdevice, peer: PeerAddress, scan: &ScanParams, params: &ConnParams) {
    let address = Address::from_raw(raw::ble_gap_addr_t {
        _bitfield_1: raw::ble_gap_addr_t::new_bitfield_1(0, peer.addr_type),
        addr: peer.bytes,
    });
    let whitelist = [&address];
    let mut scan_config = scan_config(scan, Some(&whitelist));
    scan_config.timeout = CONNECT_TIMEOUT;

    let config = central::ConnectConfig {
        scan_config,
        conn_params: raw_conn_params(params),
        ..Default::default()
    };

    match central::connect(sd, &config).await {
        Ok(conn) => attach(conn, peer).await,
        Err(e) => {
            warn!("connect failed: {:?}", e);
            EVENTS.send(TransportEvent::ConnectionTimeout).await;
        }
    }
}

async fn attach(conn: Connection, peer: PeerAddress) {
    let Some(handle) = conn.handle() else {
        warn!("link dropped before it could be served");
        EVENTS.send(TransportEvent::ConnectionTimeout).await;
        return;
    };
    let Some(slot) = claim_slot(handle) else {
        warn!("no free link slot - disconnecting");
        let _ = conn.disconnect();
        EVENTS.send(TransportEvent::ConnectionTimeout).await;
        return;
    };

    EVENTS
        .send(TransportEvent::Connected {
            link: ConnHandle(handle),
            peer,
        })
        .await;
    ATTACH[slot].send(conn).await;
}

// Link task body

/// Serve connections handed to `slot`: run queued requests and forward
/// notifications until the peer goes away.
pub async fn run_link(slot: usize) -> ! {
    let requests = &LINK_REQUESTS[slot];

    loop {
        let conn = ATTACH[slot].receive().await;
        let Some(handle) = conn.handle() else {
            release_slot(slot);
            continue;
        };
        let link = ConnHandle(handle);
        info!("slot {} serving {:?}", slot, link);

        let watcher: Probe<BatteryService> = gatt_client::Client::new_undiscovered(conn.clone());
        let notifications = gatt_client::run(&conn, &watcher, |(handle, data)| {
            if EVENTS
                .try_send(TransportEvent::Notification { link, handle, data })
                .is_err()
            {
                warn!("event channel full - dropping notification");
            }
        });
        let work = async {
            loop {
                let request = requests.receive().await;
                if request.link != link {
                    debug!("dropping request for stale {:?}", request.link);
                    continue;
                }
                execute(&conn, link, request.op).await;
            }
        };
        select(notifications, work).await;

        release_slot(slot);
        // The wrapper does not surface the HCI reason.
        EVENTS.send(TransportEvent::Disconnected { link, reason: 0 }).await;
    }
}

async fn execute(conn: &Connection, link: ConnHandle, op: LinkOp) {
    match op {
        LinkOp::Discover(service) => {
            let event = discover(conn, link, service).await;
            EVENTS.send(event).await;
        }
        LinkOp::Read(handle) => {
            let mut buf = [0u8; ATT_PAYLOAD_MAX_LEN];
            let data = match gatt_client::read(conn, handle, &mut buf).await {
                Ok(n) => payload(&buf[..n]),
                Err(e) => {
                    warn!("read of {} on {:?} failed: {:?}", handle, link, e);
                    Payload::new()
                }
            };
            EVENTS.send(TransportEvent::ReadResponse { link, handle, data }).await;
        }
        LinkOp::Write { handle, value, kind } => {
            let result = match kind {
                WriteKind::Request => gatt_client::write(conn, handle, &value).await,
                WriteKind::Command => gatt_client::write_without_response(conn, handle, &value).await,
            };
            if let Err(e) = result {
                warn!("write of {} on {:?} failed: {:?}", handle, link, e);
            }
            EVENTS.send(TransportEvent::WriteResponse { link }).await;
        }
        LinkOp::Disconnect => {
            if conn.disconnect().is_err() {
                debug!("{:?} already disconnected", link);
            }
        }
        LinkOp::ConnParams(params) => {
            if conn.set_conn_params(raw_conn_params(&params)).is_err() {
                warn!("connection parameter update on {:?} refused", link);
            }
        }
    }
}
