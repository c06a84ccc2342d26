//! nRF52840 BLE gateway firmware.
//!
//! Tasks:
//!   - `softdevice_task`: runs the SoftDevice event loop
//!   - `radio_task`: scanning and connection establishment
//!   - `link_task` (one per link slot): discovery, GATT I/O, notifications
//!   - `gateway_task`: owns the [`CentralManager`] and feeds it every event
//!
//! Board: nRF52840-DK. LED1 shows scanning, LED2 lights while at least one
//! peer is ready.

#![no_std]
#![no_main]

mod softdevice;

use defmt::{info, unwrap};
use embassy_executor::Spawner;
use embassy_nrf::gpio::{Level, Output, OutputDrive};
use embassy_nrf::interrupt::Priority;
use nrf_softdevice::{raw, Softdevice};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use ble_gateway::config::MAX_LINKS;
use ble_gateway::{AppEvent, CentralManager, EventSink, GatewayConfig, PeerClients};

use crate::softdevice::{SoftdeviceTransport, EVENTS};

type Gateway = CentralManager<SoftdeviceTransport, LedSink>;

static GATEWAY: StaticCell<Gateway> = StaticCell::new();

/// Status LEDs (active low on the DK).
struct LedSink {
    scanning: Output<'static>,
    connected: Output<'static>,
    ready: u8,
}

impl LedSink {
    fn new(scanning: Output<'static>, connected: Output<'static>) -> Self {
        Self {
            scanning,
            connected,
            ready: 0,
        }
    }
}

fn set_led(led: &mut Output<'static>, on: bool) {
    if on {
        led.set_low();
    } else {
        led.set_high();
    }
}

impl EventSink for LedSink {
    fn publish(&mut self, event: AppEvent) {
        match event {
            AppEvent::Scanning(on) => set_led(&mut self.scanning, on),
            AppEvent::PeerReady { peer, .. } => {
                info!("{:?} ready", peer);
                self.ready = self.ready.saturating_add(1);
                set_led(&mut self.connected, true);
            }
            AppEvent::PeerLost { peer, .. } => {
                info!("{:?} lost", peer);
                self.ready = self.ready.saturating_sub(1);
                set_led(&mut self.connected, self.ready > 0);
            }
            other => info!("{:?}", other),
        }
    }
}

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn radio_task(sd: &'static Softdevice) -> ! {
    softdevice::run_radio(sd).await
}

#[embassy_executor::task(pool_size = MAX_LINKS)]
async fn link_task(slot: usize) -> ! {
    softdevice::run_link(slot).await
}

#[embassy_executor::task]
async fn gateway_task(gateway: &'static mut Gateway) -> ! {
    unwrap!(gateway.init());
    unwrap!(gateway.start_scan());
    info!("gateway running");

    loop {
        let event = EVENTS.receive().await;
        gateway.transport_mut().observe(&event);
        gateway.handle(event);
    }
}

fn softdevice_config() -> nrf_softdevice::Config {
    nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_XTAL as u8,
            rc_ctiv: 0,
            rc_temp_ctiv: 0,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_20_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: MAX_LINKS as u8,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: 23 }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 0,
            periph_role_count: 0,
            central_role_count: MAX_LINKS as u8,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        common_vs_uuid: Some(raw::ble_common_cfg_vs_uuid_t { vs_uuid_count: 4 }),
        ..Default::default()
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("ble-gateway starting");

    // SoftDevice reserves interrupt priorities 0, 1 and 4.
    let mut nrf_config = embassy_nrf::config::Config::default();
    nrf_config.gpiote_interrupt_priority = Priority::P2;
    nrf_config.time_interrupt_priority = Priority::P2;
    let p = embassy_nrf::init(nrf_config);

    let sd = Softdevice::enable(&softdevice_config());
    unwrap!(spawner.spawn(softdevice_task(sd)));
    unwrap!(spawner.spawn(radio_task(sd)));
    for slot in 0..MAX_LINKS {
        unwrap!(spawner.spawn(link_task(slot)));
    }

    let sink = LedSink::new(
        Output::new(p.P0_13, Level::High, OutputDrive::Standard),
        Output::new(p.P0_14, Level::High, OutputDrive::Standard),
    );
    let gateway = GATEWAY.init(CentralManager::new(
        GatewayConfig::default(),
        SoftdeviceTransport::new(),
        sink,
        PeerClients::new(),
    ));
    unwrap!(spawner.spawn(gateway_task(gateway)));
}
