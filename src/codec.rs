//! Wire codec for the four LoRa message frames (C1).
//!
//! No I/O, no heap allocation: every `marshal`/`unmarshal` operates on
//! caller-provided byte slices. Integers are little-endian; strings are
//! length-prefixed UTF-8 capped at [`MAX_NAME_LEN`].

use heapless::String;

use crate::types::{BleAddr, MAX_NAME_LEN};

pub const MAGIC_HR_DATA: u8 = 0x63;
pub const MAGIC_QUERY_DEVICE_BY_MAC: u8 = 0x71;
pub const MAGIC_QUERY_DEVICE_BY_MAC_RESPONSE: u8 = 0x72;
pub const MAGIC_SET_NAME_MAP_KEY: u8 = 0x73;

const HR_DATA_SIZE: usize = 3;
const SET_NAME_MAP_KEY_SIZE: usize = 2;
const QUERY_DEVICE_BY_MAC_SIZE: usize = 7;
const QUERY_RESPONSE_BASE_SIZE: usize = 8;

/// Device block carried by `QueryDeviceByMacResponse` when a device is
/// currently discovered.
#[derive(Debug, Clone, PartialEq, defmt::Format)]
pub struct ResponseDevice {
    pub addr: BleAddr,
    pub name: String<MAX_NAME_LEN>,
}

#[derive(Debug, Clone, Copy, PartialEq, defmt::Format)]
pub struct HrData {
    pub key: u8,
    pub hr: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, defmt::Format)]
pub struct QueryDeviceByMac {
    pub addr: BleAddr,
}

#[derive(Debug, Clone, PartialEq, defmt::Format)]
pub struct QueryDeviceByMacResponse {
    pub repeater_addr: BleAddr,
    pub key: u8,
    pub device: Option<ResponseDevice>,
}

#[derive(Debug, Clone, Copy, PartialEq, defmt::Format)]
pub struct SetNameMapKey {
    pub key: u8,
}

/// Tagged union of all four LoRa frame types.
#[derive(Debug, Clone, PartialEq, defmt::Format)]
pub enum Message {
    HrData(HrData),
    QueryDeviceByMac(QueryDeviceByMac),
    QueryDeviceByMacResponse(QueryDeviceByMacResponse),
    SetNameMapKey(SetNameMapKey),
}

impl Message {
    /// Marshals `self` into `buf`, returning the number of bytes written,
    /// or `None` if `buf` is shorter than the variant's required size.
    pub fn marshal(&self, buf: &mut [u8]) -> Option<usize> {
        match self {
            Message::HrData(m) => m.marshal(buf),
            Message::QueryDeviceByMac(m) => m.marshal(buf),
            Message::QueryDeviceByMacResponse(m) => m.marshal(buf),
            Message::SetNameMapKey(m) => m.marshal(buf),
        }
    }

    /// Dispatches on `buf[0]` and decodes the matching variant. Returns
    /// `None` for an empty buffer, a too-short buffer, or an unrecognized
    /// magic byte.
    pub fn unmarshal_any(buf: &[u8]) -> Option<Message> {
        let magic = *buf.first()?;
        match magic {
            MAGIC_HR_DATA => HrData::unmarshal(buf).map(Message::HrData),
            MAGIC_QUERY_DEVICE_BY_MAC => QueryDeviceByMac::unmarshal(buf).map(Message::QueryDeviceByMac),
            MAGIC_QUERY_DEVICE_BY_MAC_RESPONSE => {
                QueryDeviceByMacResponse::unmarshal(buf).map(Message::QueryDeviceByMacResponse)
            }
            MAGIC_SET_NAME_MAP_KEY => SetNameMapKey::unmarshal(buf).map(Message::SetNameMapKey),
            _ => None,
        }
    }
}

impl HrData {
    pub fn marshal(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < HR_DATA_SIZE {
            return None;
        }
        buf[0] = MAGIC_HR_DATA;
        buf[1] = self.key;
        buf[2] = self.hr;
        Some(HR_DATA_SIZE)
    }

    pub fn unmarshal(buf: &[u8]) -> Option<Self> {
        if buf.len() < HR_DATA_SIZE || buf[0] != MAGIC_HR_DATA {
            return None;
        }
        Some(HrData {
            key: buf[1],
            hr: buf[2],
        })
    }
}

impl SetNameMapKey {
    pub fn marshal(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < SET_NAME_MAP_KEY_SIZE {
            return None;
        }
        buf[0] = MAGIC_SET_NAME_MAP_KEY;
        buf[1] = self.key;
        Some(SET_NAME_MAP_KEY_SIZE)
    }

    pub fn unmarshal(buf: &[u8]) -> Option<Self> {
        if buf.len() < SET_NAME_MAP_KEY_SIZE || buf[0] != MAGIC_SET_NAME_MAP_KEY {
            return None;
        }
        Some(SetNameMapKey { key: buf[1] })
    }
}

impl QueryDeviceByMac {
    pub fn marshal(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < QUERY_DEVICE_BY_MAC_SIZE {
            return None;
        }
        buf[0] = MAGIC_QUERY_DEVICE_BY_MAC;
        buf[1..7].copy_from_slice(&self.addr.0);
        Some(QUERY_DEVICE_BY_MAC_SIZE)
    }

    pub fn unmarshal(buf: &[u8]) -> Option<Self> {
        if buf.len() < QUERY_DEVICE_BY_MAC_SIZE || buf[0] != MAGIC_QUERY_DEVICE_BY_MAC {
            return None;
        }
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&buf[1..7]);
        Some(QueryDeviceByMac {
            addr: BleAddr::new(addr),
        })
    }
}

impl QueryDeviceByMacResponse {
    /// `8 base bytes` (magic + 6 repeater addr + key) `+ 1 length byte +`
    /// device block when present, or a single trailing zero length byte
    /// when absent.
    fn size_needed(&self) -> usize {
        QUERY_RESPONSE_BASE_SIZE
            + match &self.device {
                Some(d) => 1 + 6 + d.name.len(),
                None => 1,
            }
    }

    pub fn marshal(&self, buf: &mut [u8]) -> Option<usize> {
        let needed = self.size_needed();
        if buf.len() < needed {
            return None;
        }
        buf[0] = MAGIC_QUERY_DEVICE_BY_MAC_RESPONSE;
        buf[1..7].copy_from_slice(&self.repeater_addr.0);
        buf[7] = self.key;
        match &self.device {
            None => buf[8] = 0,
            Some(d) => {
                buf[8] = (6 + d.name.len()) as u8;
                buf[9..15].copy_from_slice(&d.addr.0);
                buf[15..15 + d.name.len()].copy_from_slice(d.name.as_bytes());
            }
        }
        Some(needed)
    }

    pub fn unmarshal(buf: &[u8]) -> Option<Self> {
        if buf.len() < QUERY_RESPONSE_BASE_SIZE + 1 || buf[0] != MAGIC_QUERY_DEVICE_BY_MAC_RESPONSE {
            return None;
        }
        let mut repeater_addr = [0u8; 6];
        repeater_addr.copy_from_slice(&buf[1..7]);
        let key = buf[7];
        let len = buf[8] as usize;
        let device = if len == 0 {
            None
        } else {
            if len < 6 || buf.len() < 9 + len {
                return None;
            }
            let mut addr = [0u8; 6];
            addr.copy_from_slice(&buf[9..15]);
            let name_bytes = &buf[15..9 + len];
            let name_str = core::str::from_utf8(name_bytes).ok()?;
            let name = String::try_from(name_str).ok()?;
            Some(ResponseDevice {
                addr: BleAddr::new(addr),
                name,
            })
        };
        Some(QueryDeviceByMacResponse {
            repeater_addr: BleAddr::new(repeater_addr),
            key,
            device,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hr_data_round_trip_and_hex_example() {
        let msg = HrData { key: 5, hr: 72 };
        let mut buf = [0u8; 16];
        let len = msg.marshal(&mut buf).unwrap();
        assert_eq!(len, 3);
        assert_eq!(&buf[..3], &[0x63, 0x05, 0x48]);
        assert_eq!(HrData::unmarshal(&buf[..3]), Some(msg));
    }

    #[test]
    fn set_name_map_key_round_trip() {
        let msg = SetNameMapKey { key: 9 };
        let mut buf = [0u8; 16];
        let len = msg.marshal(&mut buf).unwrap();
        assert_eq!(len, 2);
        assert_eq!(&buf[..2], &[MAGIC_SET_NAME_MAP_KEY, 0x09]);
        assert_eq!(SetNameMapKey::unmarshal(&buf[..2]), Some(msg));
    }

    #[test]
    fn query_device_by_mac_round_trip() {
        let msg = QueryDeviceByMac {
            addr: BleAddr::BROADCAST,
        };
        let mut buf = [0u8; 16];
        let len = msg.marshal(&mut buf).unwrap();
        assert_eq!(len, 7);
        assert_eq!(QueryDeviceByMac::unmarshal(&buf[..7]), Some(msg));
    }

    #[test]
    fn query_response_round_trip_without_device() {
        let msg = QueryDeviceByMacResponse {
            repeater_addr: BleAddr::new([1, 2, 3, 4, 5, 6]),
            key: 3,
            device: None,
        };
        let mut buf = [0u8; 32];
        let len = msg.marshal(&mut buf).unwrap();
        assert_eq!(len, 9);
        assert_eq!(buf[8], 0);
        assert_eq!(QueryDeviceByMacResponse::unmarshal(&buf[..len]), Some(msg));
    }

    #[test]
    fn query_response_round_trip_with_device() {
        let msg = QueryDeviceByMacResponse {
            repeater_addr: BleAddr::new([1, 2, 3, 4, 5, 6]),
            key: 3,
            device: Some(ResponseDevice {
                addr: BleAddr::new([9, 8, 7, 6, 5, 4]),
                name: String::try_from("Polar H10").unwrap(),
            }),
        };
        let mut buf = [0u8; 64];
        let len = msg.marshal(&mut buf).unwrap();
        assert_eq!(len, 8 + 1 + 6 + "Polar H10".len());
        assert_eq!(QueryDeviceByMacResponse::unmarshal(&buf[..len]), Some(msg));
    }

    #[test]
    fn marshal_returns_none_when_buffer_too_small() {
        let msg = HrData { key: 1, hr: 2 };
        let mut buf = [0u8; 2];
        assert_eq!(msg.marshal(&mut buf), None);

        let resp = QueryDeviceByMacResponse {
            repeater_addr: BleAddr::new([0; 6]),
            key: 0,
            device: Some(ResponseDevice {
                addr: BleAddr::new([0; 6]),
                name: String::try_from("abc").unwrap(),
            }),
        };
        let mut small = [0u8; 10];
        assert_eq!(resp.marshal(&mut small), None);
    }

    #[test]
    fn unmarshal_returns_none_for_short_buffer() {
        assert_eq!(HrData::unmarshal(&[0x63, 0x01]), None);
        assert_eq!(SetNameMapKey::unmarshal(&[0x73]), None);
        assert_eq!(QueryDeviceByMac::unmarshal(&[0x71, 0, 0]), None);
    }

    #[test]
    fn unmarshal_returns_none_for_wrong_magic() {
        assert_eq!(HrData::unmarshal(&[0x01, 0x05, 0x48]), None);
    }

    #[test]
    fn unmarshal_any_dispatches_on_magic() {
        let buf = [0x63, 0x05, 0x48];
        assert_eq!(
            Message::unmarshal_any(&buf),
            Some(Message::HrData(HrData { key: 5, hr: 72 }))
        );
    }

    #[test]
    fn unmarshal_any_rejects_unknown_magic() {
        assert_eq!(Message::unmarshal_any(&[0xAA, 0, 0, 0]), None);
        assert_eq!(Message::unmarshal_any(&[]), None);
    }
}
