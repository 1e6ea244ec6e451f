//! Minimal protobuf wire encode/decode for the device-info message used by
//! the `Device` and `Whitelist` GATT characteristics (C5).
//!
//! Wire-compatible with `message DeviceInfo { bytes mac = 1; string name =
//! 2; }`, hand-rolled rather than pulled in via a full codegen-based
//! protobuf crate: both fields are fixed-shape (a 6-byte MAC, a name
//! capped at [`MAX_NAME_LEN`] bytes), so the complete wire surface is two
//! length-delimited fields and a handful of varints — not worth a build.rs
//! dependency in a `no_std` firmware image. No I/O, no heap allocation.

use heapless::String;

use crate::types::{BleAddr, MAX_NAME_LEN};

const TAG_MAC: u8 = (1 << 3) | 2; // field 1, wire type 2 (length-delimited)
const TAG_NAME: u8 = (2 << 3) | 2; // field 2, wire type 2

/// `{ bytes mac = 1; string name = 2; }`
#[derive(Debug, Clone, PartialEq, defmt::Format)]
pub struct DeviceInfo {
    pub mac: BleAddr,
    pub name: String<MAX_NAME_LEN>,
}

fn write_varint(buf: &mut [u8], pos: &mut usize, mut value: u32) -> Option<()> {
    loop {
        if *pos >= buf.len() {
            return None;
        }
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf[*pos] = byte;
        *pos += 1;
        if value == 0 {
            return Some(());
        }
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Option<u32> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        value |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift >= 32 {
            return None;
        }
    }
}

impl DeviceInfo {
    /// Encodes this message into `buf`, returning the number of bytes
    /// written, or `None` if `buf` is too small.
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let mut pos = 0;
        if pos >= buf.len() {
            return None;
        }
        buf[pos] = TAG_MAC;
        pos += 1;
        write_varint(buf, &mut pos, 6)?;
        if pos + 6 > buf.len() {
            return None;
        }
        buf[pos..pos + 6].copy_from_slice(&self.mac.0);
        pos += 6;

        if pos >= buf.len() {
            return None;
        }
        buf[pos] = TAG_NAME;
        pos += 1;
        let name_bytes = self.name.as_bytes();
        write_varint(buf, &mut pos, name_bytes.len() as u32)?;
        if pos + name_bytes.len() > buf.len() {
            return None;
        }
        buf[pos..pos + name_bytes.len()].copy_from_slice(name_bytes);
        pos += name_bytes.len();
        Some(pos)
    }

    /// Decodes a `DeviceInfo` from `buf`. Unknown fields are skipped (not
    /// expected on this link, but tolerated rather than rejected, matching
    /// typical protobuf forward-compatibility).
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut pos = 0;
        let mut mac = [0u8; 6];
        let mut name = String::new();
        while pos < buf.len() {
            let tag = buf[pos];
            pos += 1;
            match tag {
                TAG_MAC => {
                    let len = read_varint(buf, &mut pos)? as usize;
                    if len != 6 || pos + len > buf.len() {
                        return None;
                    }
                    mac.copy_from_slice(&buf[pos..pos + len]);
                    pos += len;
                }
                TAG_NAME => {
                    let len = read_varint(buf, &mut pos)? as usize;
                    if pos + len > buf.len() {
                        return None;
                    }
                    let s = core::str::from_utf8(&buf[pos..pos + len]).ok()?;
                    name = String::try_from(s).ok()?;
                    pos += len;
                }
                _ => {
                    // Unknown field: skip a length-delimited or varint value.
                    if tag & 0x07 == 2 {
                        let len = read_varint(buf, &mut pos)? as usize;
                        pos += len;
                    } else {
                        read_varint(buf, &mut pos)?;
                    }
                }
            }
        }
        Some(DeviceInfo {
            mac: BleAddr::new(mac),
            name,
        })
    }
}

/// Encodes just the whitelist address (the `mac` field with an empty
/// name), or an empty buffer for "no target paired".
pub fn encode_whitelist(addr: Option<BleAddr>, buf: &mut [u8]) -> Option<usize> {
    match addr {
        None => Some(0),
        Some(mac) => DeviceInfo {
            mac,
            name: String::new(),
        }
        .encode(buf),
    }
}

/// Decodes a whitelist write: an empty payload means "clear", otherwise
/// the `mac` field is extracted.
pub fn decode_whitelist(buf: &[u8]) -> Option<Option<BleAddr>> {
    if buf.is_empty() {
        return Some(None);
    }
    DeviceInfo::decode(buf).map(|d| Some(d.mac))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_round_trip() {
        let info = DeviceInfo {
            mac: BleAddr::new([1, 2, 3, 4, 5, 6]),
            name: String::try_from("Polar H10").unwrap(),
        };
        let mut buf = [0u8; 64];
        let len = info.encode(&mut buf).unwrap();
        assert_eq!(DeviceInfo::decode(&buf[..len]), Some(info));
    }

    #[test]
    fn device_info_empty_name_round_trip() {
        let info = DeviceInfo {
            mac: BleAddr::new([9; 6]),
            name: String::new(),
        };
        let mut buf = [0u8; 32];
        let len = info.encode(&mut buf).unwrap();
        assert_eq!(DeviceInfo::decode(&buf[..len]), Some(info));
    }

    #[test]
    fn whitelist_empty_write_clears() {
        assert_eq!(decode_whitelist(&[]), Some(None));
    }

    #[test]
    fn whitelist_round_trip() {
        let addr = BleAddr::new([1, 2, 3, 4, 5, 6]);
        let mut buf = [0u8; 32];
        let len = encode_whitelist(Some(addr), &mut buf).unwrap();
        assert_eq!(decode_whitelist(&buf[..len]), Some(Some(addr)));

        let len = encode_whitelist(None, &mut buf).unwrap();
        assert_eq!(len, 0);
        assert_eq!(decode_whitelist(&buf[..0]), Some(None));
    }

    #[test]
    fn encode_fails_on_too_small_buffer() {
        let info = DeviceInfo {
            mac: BleAddr::new([1; 6]),
            name: String::try_from("longer name here").unwrap(),
        };
        let mut tiny = [0u8; 4];
        assert_eq!(info.encode(&mut tiny), None);
    }
}
