//! Relay orchestrator (C6): the coordination core. Wires the radio
//! controller, scan manager, and GATT adapter together, and owns the
//! in-memory `name_map_key` plus the persistent config store.
//!
//! Runs as the single cooperative task described in spec §5: the HR-
//! notification path, the LoRa-receive path, and the whitelist-write
//! path are all driven from [`run`], so none of them need their own
//! synchronization beyond what the radio, scan manager, and store
//! already provide internally.

use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Receiver, Sender};
use embedded_storage_async::nor_flash::NorFlash;

use crate::codec::{HrData, Message, QueryDeviceByMac, QueryDeviceByMacResponse, ResponseDevice};
use crate::gatt::{GattInbound, GattOutbound};
use crate::pb::DeviceInfo;
use crate::radio::{Radio, RECV_EVT};
use crate::scan::{ScanEvent, ScanManager};
use crate::store::ConfigStore;
use crate::types::{BleAddr, DiscoveredDevice};

/// Parses a raw Heart Rate Measurement GATT value per the Bluetooth GATT
/// Specification Supplement §3.103: bit 0 of byte 0 is the format flag.
/// Returns `(hr, clamped)`, or `None` for a too-short payload.
fn parse_hr_bytes(bytes: &[u8]) -> Option<(u8, bool)> {
    if bytes.len() < 2 {
        return None;
    }
    if bytes[0] & 1 == 0 {
        Some((bytes[1], false))
    } else {
        if bytes.len() < 3 {
            return None;
        }
        let raw = u16::from_le_bytes([bytes[1], bytes[2]]);
        if raw > u8::MAX as u16 {
            Some((u8::MAX, true))
        } else {
            Some((raw as u8, false))
        }
    }
}

/// Builds the response to a `QueryDeviceByMac` request, or `None` if it
/// is not addressed to this node (neither `BROADCAST` nor `my_addr`).
fn build_query_response(
    req_addr: BleAddr,
    my_addr: BleAddr,
    name_map_key: u8,
    device: Option<&DiscoveredDevice>,
) -> Option<QueryDeviceByMacResponse> {
    if !(req_addr.is_broadcast() || req_addr == my_addr) {
        return None;
    }
    Some(QueryDeviceByMacResponse {
        repeater_addr: my_addr,
        key: name_map_key,
        device: device.map(|d| ResponseDevice {
            addr: d.addr,
            name: d.name.clone(),
        }),
    })
}

pub struct Relay<'a, F: NorFlash, R: Radio> {
    store: ConfigStore<F>,
    radio: &'a R,
    scan: &'a ScanManager,
    gatt_out: Sender<'a, CriticalSectionRawMutex, GattOutbound, 8>,
    my_addr: BleAddr,
    name_map_key: u8,
}

impl<'a, F: NorFlash, R: Radio> Relay<'a, F, R> {
    pub fn new(
        store: ConfigStore<F>,
        radio: &'a R,
        scan: &'a ScanManager,
        gatt_out: Sender<'a, CriticalSectionRawMutex, GattOutbound, 8>,
        my_addr: BleAddr,
        name_map_key: u8,
    ) -> Self {
        Self {
            store,
            radio,
            scan,
            gatt_out,
            my_addr,
            name_map_key,
        }
    }

    /// HR-notification path (spec §4.6): a notification arrived from the
    /// currently subscribed monitor.
    pub async fn handle_hr_data(&mut self, bytes: &[u8]) {
        let Some((hr, clamped)) = parse_hr_bytes(bytes) else {
            defmt::warn!("HR notification too short ({} bytes), dropping", bytes.len());
            return;
        };
        if clamped {
            defmt::warn!("HR value clamped to 255");
        }

        let msg = HrData {
            key: self.name_map_key,
            hr,
        };
        let mut buf = [0u8; 16];
        if let Some(len) = msg.marshal(&mut buf) {
            if let Err(e) = self.radio.try_transmit(&buf[..len]).await {
                defmt::warn!("HR transmit failed: {:?}", e);
            }
        }

        if let Ok(echo) = heapless::Vec::from_slice(bytes) {
            let _ = self.gatt_out.try_send(GattOutbound::HrEcho(echo));
        }
    }

    /// LoRa-receive path (spec §4.6). Each variant handles and returns
    /// independently; none falls through into the next.
    pub async fn handle_lora_frame(&mut self, buf: &[u8]) {
        match Message::unmarshal_any(buf) {
            Some(Message::QueryDeviceByMac(QueryDeviceByMac { addr })) => {
                let device = self.scan.get_device().await;
                if let Some(resp) =
                    build_query_response(addr, self.my_addr, self.name_map_key, device.as_ref())
                {
                    let mut out = [0u8; 64];
                    if let Some(len) = resp.marshal(&mut out) {
                        if let Err(e) = self.radio.try_transmit(&out[..len]).await {
                            defmt::warn!("Query response transmit failed: {:?}", e);
                        }
                    }
                }
            }
            Some(Message::SetNameMapKey(m)) => {
                self.name_map_key = m.key;
                if let Err(e) = self.store.set_name_map_key(m.key).await {
                    defmt::warn!("Failed to persist name_map_key: {:?}", e);
                }
            }
            Some(Message::HrData(_)) | Some(Message::QueryDeviceByMacResponse(_)) => {
                // Originated by a peer repeater, not addressed to us.
            }
            None => {
                defmt::warn!("Dropping LoRa frame with unknown magic or bad length");
            }
        }
    }

    /// Whitelist-write path (spec §4.6/§9): retargets the scan manager and
    /// persists the new pairing (or its absence) immediately.
    pub async fn handle_whitelist_write(&mut self, addr: Option<BleAddr>) {
        self.scan.set_target_addr(addr).await;
        let result = match addr {
            Some(a) => self.store.set_addr(a.0).await,
            None => self.store.clear_addr().await,
        };
        if let Err(e) = result {
            defmt::warn!("Failed to persist pairing change: {:?}", e);
        }
        let _ = self.gatt_out.try_send(GattOutbound::Address(addr));
    }

    async fn notify_device(&self, device: &DiscoveredDevice) {
        let info = DeviceInfo {
            mac: device.addr,
            name: device.name.clone(),
        };
        let _ = self.gatt_out.try_send(GattOutbound::Device(info));
    }

    /// The relay task's main loop: selects over LoRa-packet-received,
    /// scan-manager events, and local GATT writes, dispatching each to
    /// the corresponding path above.
    pub async fn run(
        &mut self,
        scan_events: Receiver<'a, CriticalSectionRawMutex, ScanEvent, 10>,
        gatt_in: Receiver<'a, CriticalSectionRawMutex, GattInbound, 8>,
    ) -> ! {
        let mut rx_buf = [0u8; 64];
        loop {
            match select3(RECV_EVT.wait(), scan_events.receive(), gatt_in.receive()).await {
                Either3::First(()) => {
                    let len = self.radio.receive_into(&mut rx_buf).await;
                    if len == 0 {
                        defmt::warn!("Packet-received signal with no pending frame");
                        continue;
                    }
                    self.handle_lora_frame(&rx_buf[..len]).await;
                }
                Either3::Second(ScanEvent::Result { device }) => {
                    self.notify_device(&device).await;
                }
                Either3::Second(ScanEvent::Data { bytes, .. }) => {
                    self.handle_hr_data(&bytes).await;
                }
                Either3::Third(GattInbound::AddressWrite(addr)) => {
                    self.handle_whitelist_write(addr).await;
                }
                Either3::Third(GattInbound::Disconnected) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::fake::FakeRadio;
    use crate::store::ConfigStore;
    use embassy_sync::channel::Channel;
    use embedded_storage_async::nor_flash::{ErrorType, NorFlashError, NorFlashErrorKind, ReadNorFlash};
    use heapless::String;

    #[test]
    fn hr_parse_format_flag_zero() {
        assert_eq!(parse_hr_bytes(&[0x00, 0x42]), Some((0x42, false)));
    }

    #[test]
    fn hr_parse_format_flag_one_clamped() {
        assert_eq!(parse_hr_bytes(&[0x01, 0x34, 0x01]), Some((0xFF, true)));
    }

    #[test]
    fn hr_parse_too_short_is_dropped() {
        assert_eq!(parse_hr_bytes(&[0x00]), None);
    }

    #[test]
    fn query_response_answers_broadcast() {
        let my_addr = BleAddr::new([1; 6]);
        let resp = build_query_response(BleAddr::BROADCAST, my_addr, 7, None).unwrap();
        assert_eq!(resp.repeater_addr, my_addr);
        assert_eq!(resp.key, 7);
        assert_eq!(resp.device, None);
    }

    #[test]
    fn query_response_answers_own_address_with_device() {
        let my_addr = BleAddr::new([1; 6]);
        let device = DiscoveredDevice {
            addr: BleAddr::new([9; 6]),
            name: String::try_from("Polar H10").unwrap(),
        };
        let resp = build_query_response(my_addr, my_addr, 3, Some(&device)).unwrap();
        assert_eq!(resp.device.unwrap().addr, device.addr);
    }

    #[test]
    fn query_ignores_request_for_other_repeater() {
        let my_addr = BleAddr::new([1; 6]);
        let other = BleAddr::new([2; 6]);
        assert_eq!(build_query_response(other, my_addr, 3, None), None);
    }

    struct MockFlash {
        data: [u8; 4096],
    }
    #[derive(Debug)]
    struct MockError;
    impl NorFlashError for MockError {
        fn kind(&self) -> NorFlashErrorKind {
            NorFlashErrorKind::Other
        }
    }
    impl ErrorType for MockFlash {
        type Error = MockError;
    }
    impl ReadNorFlash for MockFlash {
        const READ_SIZE: usize = 1;
        async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
            Ok(())
        }
        fn capacity(&self) -> usize {
            self.data.len()
        }
    }
    impl NorFlash for MockFlash {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = 4096;
        async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            for b in &mut self.data[from as usize..to as usize] {
                *b = 0xFF;
            }
            Ok(())
        }
        async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    fn fresh_relay<'a>(
        radio: &'a FakeRadio,
        scan: &'a ScanManager,
        gatt_out: &'a Channel<CriticalSectionRawMutex, GattOutbound, 8>,
    ) -> Relay<'a, MockFlash, FakeRadio> {
        let store = ConfigStore::new(MockFlash { data: [0xFFu8; 4096] });
        Relay::new(store, radio, scan, gatt_out.sender(), BleAddr::new([1; 6]), 0)
    }

    #[test]
    fn hr_data_transmits_and_echoes() {
        pollster::block_on(async {
            let radio = FakeRadio::new();
            let scan = ScanManager::new();
            let gatt_out = Channel::new();
            let mut relay = fresh_relay(&radio, &scan, &gatt_out);
            relay.handle_hr_data(&[0x00, 0x42]).await;
            let sent = radio.sent_frames().await;
            assert_eq!(sent.len(), 1);
            assert_eq!(&sent[0][..], &[0x63, 0x00, 0x42]);
        });
    }

    #[test]
    fn too_short_hr_data_does_not_transmit() {
        pollster::block_on(async {
            let radio = FakeRadio::new();
            let scan = ScanManager::new();
            let gatt_out = Channel::new();
            let mut relay = fresh_relay(&radio, &scan, &gatt_out);
            relay.handle_hr_data(&[0x00]).await;
            assert!(radio.sent_frames().await.is_empty());
        });
    }

    #[test]
    fn set_name_map_key_updates_and_persists() {
        pollster::block_on(async {
            let radio = FakeRadio::new();
            let scan = ScanManager::new();
            let gatt_out = Channel::new();
            let mut relay = fresh_relay(&radio, &scan, &gatt_out);

            let mut buf = [0u8; 8];
            let msg = crate::codec::SetNameMapKey { key: 42 };
            let len = msg.marshal(&mut buf).unwrap();
            relay.handle_lora_frame(&buf[..len]).await;

            assert_eq!(relay.name_map_key, 42);
            assert_eq!(relay.store.get_name_map_key().await, Ok(42));

            relay.handle_hr_data(&[0x00, 0x10]).await;
            let sent = radio.sent_frames().await;
            assert_eq!(sent[0][1], 42);
        });
    }

    #[test]
    fn broadcast_query_with_no_device_transmits_response_without_device() {
        pollster::block_on(async {
            let radio = FakeRadio::new();
            let scan = ScanManager::new();
            let gatt_out = Channel::new();
            let mut relay = fresh_relay(&radio, &scan, &gatt_out);

            let mut buf = [0u8; 8];
            let msg = QueryDeviceByMac {
                addr: BleAddr::BROADCAST,
            };
            let len = msg.marshal(&mut buf).unwrap();
            relay.handle_lora_frame(&buf[..len]).await;

            let sent = radio.sent_frames().await;
            assert_eq!(sent.len(), 1);
            let resp = QueryDeviceByMacResponse::unmarshal(&sent[0]).unwrap();
            assert_eq!(resp.repeater_addr, BleAddr::new([1; 6]));
            assert_eq!(resp.device, None);
        });
    }

    #[test]
    fn query_for_other_repeater_is_silently_ignored() {
        pollster::block_on(async {
            let radio = FakeRadio::new();
            let scan = ScanManager::new();
            let gatt_out = Channel::new();
            let mut relay = fresh_relay(&radio, &scan, &gatt_out);

            let mut buf = [0u8; 8];
            let msg = QueryDeviceByMac {
                addr: BleAddr::new([99; 6]),
            };
            let len = msg.marshal(&mut buf).unwrap();
            relay.handle_lora_frame(&buf[..len]).await;

            assert!(radio.sent_frames().await.is_empty());
        });
    }

    #[test]
    fn unknown_magic_is_dropped_without_transmit() {
        pollster::block_on(async {
            let radio = FakeRadio::new();
            let scan = ScanManager::new();
            let gatt_out = Channel::new();
            let mut relay = fresh_relay(&radio, &scan, &gatt_out);
            relay.handle_lora_frame(&[0xAA, 0, 0, 0]).await;
            assert!(radio.sent_frames().await.is_empty());
        });
    }

    #[test]
    fn peer_originated_frames_are_ignored() {
        pollster::block_on(async {
            let radio = FakeRadio::new();
            let scan = ScanManager::new();
            let gatt_out = Channel::new();
            let mut relay = fresh_relay(&radio, &scan, &gatt_out);

            let mut buf = [0u8; 16];
            let resp = QueryDeviceByMacResponse {
                repeater_addr: BleAddr::new([5; 6]),
                key: 1,
                device: None,
            };
            let len = resp.marshal(&mut buf).unwrap();
            relay.handle_lora_frame(&buf[..len]).await;
            assert!(radio.sent_frames().await.is_empty());
        });
    }

    #[test]
    fn whitelist_write_retargets_scan_and_persists() {
        pollster::block_on(async {
            let radio = FakeRadio::new();
            let scan = ScanManager::new();
            let gatt_out = Channel::new();
            let mut relay = fresh_relay(&radio, &scan, &gatt_out);

            let addr = BleAddr::new([7; 6]);
            relay.handle_whitelist_write(Some(addr)).await;
            assert_eq!(scan.get_target_addr().await, Some(addr));
            assert_eq!(relay.store.get_addr().await, Ok(addr.0));

            relay.handle_whitelist_write(None).await;
            assert_eq!(scan.get_target_addr().await, None);
            assert_eq!(
                relay.store.get_addr().await,
                Err(crate::store::ConfigError::NotFound)
            );
        });
    }
}
