//! GATT-server adapter (C5): advertises the standard Heart Rate service
//! (`180d`) with three characteristics, and converts local BLE
//! reads/writes into events consumed by the relay orchestrator.
//!
//! Built with `trouble_host`'s `#[gatt_server]`/`#[gatt_service]` macros,
//! the same mechanism the reference crate's `ble.rs` uses for its
//! (differently-shaped, two-characteristic) custom service.

use embassy_futures::join::join;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Receiver, Sender};
use embassy_time::{Duration, Timer};
use trouble_host::prelude::*;
use trouble_host::{
    Address,
    gatt::{GattConnection, GattConnectionEvent, GattEvent},
    prelude::{AdStructure, gatt_service},
};

use crate::config;
use crate::pb::{self, DeviceInfo};
use crate::types::BleAddr;

const CONNECTIONS_MAX: usize = 4;
const L2CAP_CHANNELS_MAX: usize = 2;
/// Max encoded size of a `DeviceInfo` protobuf value: 1+1+6 (mac field)
/// + 1+1+31 (name field, worst case).
const DEVICE_VALUE_LEN: usize = 41;
const WHITELIST_VALUE_LEN: usize = 9;

#[gatt_server]
struct Server {
    heart_rate_service: HeartRateService,
}

#[gatt_service(uuid = "180d")]
struct HeartRateService {
    /// HR echo: most recent raw HR-measurement payload (spec.md §4.5).
    #[characteristic(uuid = "2a37", read, notify, value = [0u8; 32])]
    hr_measurement: [u8; 32],
    /// Whitelist: paired address, protobuf-encoded; writes retarget C4.
    #[characteristic(uuid = "048b8928-d0a5-43e2-ada9-b925ec62ba27", read, write, notify, value = [0u8; WHITELIST_VALUE_LEN])]
    whitelist: [u8; WHITELIST_VALUE_LEN],
    /// Device: last discovered device, protobuf-encoded, name ≤ 31 bytes.
    #[characteristic(uuid = "12a481f0-9384-413d-b002-f8660566d3b0", read, notify, value = [0u8; DEVICE_VALUE_LEN])]
    device: [u8; DEVICE_VALUE_LEN],
}

/// Events the adapter hands to the relay orchestrator.
#[derive(Debug, Clone, defmt::Format)]
pub enum GattInbound {
    /// Whitelist characteristic write, already decoded: `None` is an
    /// explicit unpair.
    AddressWrite(Option<BleAddr>),
    Disconnected,
}

/// Commands the relay orchestrator sends to keep local characteristics
/// current.
#[derive(Debug, Clone, defmt::Format)]
pub enum GattOutbound {
    HrEcho(heapless::Vec<u8, 32>),
    Device(DeviceInfo),
    Address(Option<BleAddr>),
}

/// Pure decode step for an incoming whitelist write, split out from the
/// connection-handling loop so it is unit-testable without a live GATT
/// stack.
fn decode_whitelist_write(data: &[u8]) -> Option<GattInbound> {
    pb::decode_whitelist(data).map(GattInbound::AddressWrite)
}

#[embassy_executor::task]
pub async fn gatt_task(
    radio: &'static esp_radio::Controller<'static>,
    bt_peripheral: esp_hal::peripherals::BT<'static>,
    to_relay: Sender<'static, CriticalSectionRawMutex, GattInbound, 8>,
    from_relay: Receiver<'static, CriticalSectionRawMutex, GattOutbound, 8>,
) {
    defmt::info!("GATT task starting...");

    let transport = match esp_radio::ble::controller::BleConnector::new(radio, bt_peripheral, Default::default()) {
        Ok(t) => t,
        Err(e) => {
            defmt::error!("Failed to create BLE connector: {:?}", defmt::Debug2Format(&e));
            return;
        }
    };
    let controller = bt_hci::controller::ExternalController::<_, 20>::new(transport);
    let address = Address::random([0xff, 0x8f, 0x1a, 0x05, 0xe4, 0xff]);
    let mut resources: HostResources<DefaultPacketPool, CONNECTIONS_MAX, L2CAP_CHANNELS_MAX> = HostResources::new();
    let stack = trouble_host::new(controller, &mut resources).set_random_address(address);
    let Host { mut peripheral, runner, .. } = stack.build();

    let server = match Server::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name: config::BLE_LOCAL_NAME,
        appearance: &appearance::generic_heart_rate_sensor::HEART_RATE_SENSOR,
    })) {
        Ok(s) => s,
        Err(e) => {
            defmt::error!("Failed to create GATT server: {:?}", defmt::Debug2Format(&e));
            return;
        }
    };

    let mut adv_data = [0; 31];
    let adv_data_len = match AdStructure::encode_slice(
        &[
            AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
            AdStructure::ServiceUuids16(&[[0x0d, 0x18]]),
            AdStructure::CompleteLocalName(config::BLE_LOCAL_NAME.as_bytes()),
        ],
        &mut adv_data[..],
    ) {
        Ok(len) => len,
        Err(e) => {
            defmt::error!("Failed to encode advertising data: {:?}", defmt::Debug2Format(&e));
            return;
        }
    };

    join(ble_runner(runner), async {
        loop {
            let acceptor = match peripheral
                .advertise(
                    &Default::default(),
                    Advertisement::ConnectableScannableUndirected {
                        adv_data: &adv_data[..adv_data_len],
                        scan_data: &[],
                    },
                )
                .await
            {
                Ok(a) => a,
                Err(e) => {
                    defmt::error!("Failed to start advertising: {:?}", defmt::Debug2Format(&e));
                    Timer::after(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let conn = match acceptor.accept().await {
                Ok(c) => c,
                Err(e) => {
                    defmt::error!("Failed to accept connection: {:?}", defmt::Debug2Format(&e));
                    continue;
                }
            };
            let conn = match conn.with_attribute_server(&server) {
                Ok(c) => c,
                Err(e) => {
                    defmt::error!("Failed to attach GATT server: {:?}", defmt::Debug2Format(&e));
                    continue;
                }
            };
            gatt_events_task(&server, &conn, &to_relay, &from_relay).await;
            let _ = to_relay.try_send(GattInbound::Disconnected);
        }
    })
    .await;
}

async fn ble_runner(
    runner: Runner<'_, bt_hci::controller::ExternalController<esp_radio::ble::controller::BleConnector<'static>, 20>, DefaultPacketPool>,
) {
    let mut runner = runner;
    let _ = runner.run().await;
}

async fn gatt_events_task(
    server: &Server<'_>,
    conn: &GattConnection<'_, '_, DefaultPacketPool>,
    to_relay: &Sender<'static, CriticalSectionRawMutex, GattInbound, 8>,
    from_relay: &Receiver<'static, CriticalSectionRawMutex, GattOutbound, 8>,
) {
    loop {
        match select(conn.next(), from_relay.receive()).await {
            Either::First(GattConnectionEvent::Disconnected { .. }) => break,
            Either::First(GattConnectionEvent::Gatt { event }) => {
                if let GattEvent::Write(write_event) = &event {
                    if write_event.handle() == server.heart_rate_service.whitelist.handle {
                        if let Some(inbound) = decode_whitelist_write(write_event.data()) {
                            let _ = to_relay.try_send(inbound);
                        } else {
                            defmt::warn!("Malformed whitelist write, {} bytes", write_event.data().len());
                        }
                    }
                }
            }
            Either::First(_) => {}
            Either::Second(GattOutbound::HrEcho(bytes)) => {
                let mut buf = [0u8; 32];
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                let _ = server.heart_rate_service.hr_measurement.notify(conn, &buf).await;
            }
            Either::Second(GattOutbound::Device(info)) => {
                let mut buf = [0u8; DEVICE_VALUE_LEN];
                if info.encode(&mut buf).is_some() {
                    let _ = server.heart_rate_service.device.notify(conn, &buf).await;
                }
            }
            Either::Second(GattOutbound::Address(addr)) => {
                let mut buf = [0u8; WHITELIST_VALUE_LEN];
                if pb::encode_whitelist(addr, &mut buf).is_some() {
                    let _ = server.heart_rate_service.whitelist.notify(conn, &buf).await;
                }
            }
        }
    }
}
