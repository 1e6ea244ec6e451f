//! Persistent config (C2): the paired BLE address and the name-map key,
//! both surviving reboot.
//!
//! Backed by [`sequential_storage`]'s key/value map over a raw flash
//! region exposed through [`embedded_storage_async::nor_flash::NorFlash`]
//! (on-target: `esp-storage`'s `FlashStorage`, matching how
//! `embedded-storage`/`embedded-storage-async` are used elsewhere in this
//! corpus to persist small records without a filesystem). `NotFound` is
//! folded into the caller-facing API as a default substitution, per
//! spec.md §4.2: it is not an error surfaced to the user.

use embedded_storage_async::nor_flash::NorFlash;
use sequential_storage::cache::NoCache;
use sequential_storage::map::{fetch_item, store_item, SerializationError, Value};

/// Flash region reserved for the config store. One erase sector is ample
/// for two small records plus `sequential_storage`'s wear-leveling log.
pub const STORE_RANGE: core::ops::Range<u32> = 0x0000..0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum ConfigError {
    /// Requested key has never been written. Not surfaced past this
    /// module — callers substitute a default.
    NotFound,
    /// Unrecoverable flash I/O error.
    Io,
}

/// Keys used in the `sequential_storage` map. Mirrors the NVS key names
/// `paired_addr`/`name_map_key` from spec.md §6, encoded as small integers
/// because `sequential_storage`'s `Key` trait is implemented for integer
/// types rather than arbitrary byte strings.
const KEY_PAIRED_ADDR: u8 = 1;
const KEY_NAME_MAP_KEY: u8 = 2;

#[derive(Clone, Copy, PartialEq, Eq)]
struct AddrRecord([u8; 6]);

impl<'a> Value<'a> for AddrRecord {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        if buffer.len() < 6 {
            return Err(SerializationError::BufferTooSmall);
        }
        buffer[..6].copy_from_slice(&self.0);
        Ok(6)
    }

    fn deserialize_from(buffer: &'a [u8]) -> Result<Self, SerializationError> {
        if buffer.len() < 6 {
            return Err(SerializationError::BufferTooSmall);
        }
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&buffer[..6]);
        Ok(AddrRecord(bytes))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct KeyRecord(u8);

impl<'a> Value<'a> for KeyRecord {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        if buffer.is_empty() {
            return Err(SerializationError::BufferTooSmall);
        }
        buffer[0] = self.0;
        Ok(1)
    }

    fn deserialize_from(buffer: &'a [u8]) -> Result<Self, SerializationError> {
        buffer
            .first()
            .copied()
            .map(KeyRecord)
            .ok_or(SerializationError::BufferTooSmall)
    }
}

/// Owns the flash handle and the wear-leveling cache used by every
/// operation against the config store.
pub struct ConfigStore<F: NorFlash> {
    flash: F,
    range: core::ops::Range<u32>,
    cache: NoCache,
    buf: [u8; 32],
}

impl<F: NorFlash> ConfigStore<F> {
    /// Wraps `flash`, using the fixed [`STORE_RANGE`]. Idempotent: does
    /// not erase or reformat existing data.
    pub fn new(flash: F) -> Self {
        Self {
            flash,
            range: STORE_RANGE,
            cache: NoCache::new(),
            buf: [0u8; 32],
        }
    }

    /// Prepares the backing store. Fails only on an unrecoverable medium
    /// error (spec.md §7: fatal at boot).
    pub async fn init(&mut self) -> Result<(), ConfigError> {
        // A zero-length probe read validates the partition is addressable
        // without disturbing any stored record.
        let mut probe = [0u8; 1];
        match self.flash.read(self.range.start, &mut probe[..0]).await {
            Ok(()) => Ok(()),
            Err(_) => Err(ConfigError::Io),
        }
    }

    pub async fn get_addr(&mut self) -> Result<[u8; 6], ConfigError> {
        let item: Option<AddrRecord> = fetch_item(
            &mut self.flash,
            self.range.clone(),
            &mut self.cache,
            &mut self.buf,
            &KEY_PAIRED_ADDR,
        )
        .await
        .map_err(|_| ConfigError::Io)?;
        item.map(|r| r.0).ok_or(ConfigError::NotFound)
    }

    pub async fn set_addr(&mut self, addr: [u8; 6]) -> Result<(), ConfigError> {
        store_item(
            &mut self.flash,
            self.range.clone(),
            &mut self.cache,
            &mut self.buf,
            &KEY_PAIRED_ADDR,
            &AddrRecord(addr),
        )
        .await
        .map_err(|_| ConfigError::Io)
    }

    pub async fn clear_addr(&mut self) -> Result<(), ConfigError> {
        sequential_storage::map::remove_item(
            &mut self.flash,
            self.range.clone(),
            &mut self.cache,
            &mut self.buf,
            &KEY_PAIRED_ADDR,
        )
        .await
        .map_err(|_| ConfigError::Io)
    }

    pub async fn get_name_map_key(&mut self) -> Result<u8, ConfigError> {
        let item: Option<KeyRecord> = fetch_item(
            &mut self.flash,
            self.range.clone(),
            &mut self.cache,
            &mut self.buf,
            &KEY_NAME_MAP_KEY,
        )
        .await
        .map_err(|_| ConfigError::Io)?;
        item.map(|r| r.0).ok_or(ConfigError::NotFound)
    }

    pub async fn set_name_map_key(&mut self, key: u8) -> Result<(), ConfigError> {
        store_item(
            &mut self.flash,
            self.range.clone(),
            &mut self.cache,
            &mut self.buf,
            &KEY_NAME_MAP_KEY,
            &KeyRecord(key),
        )
        .await
        .map_err(|_| ConfigError::Io)
    }
}

/// Loads `paired_addr`/`name_map_key` at boot, substituting the spec's
/// first-boot defaults (`None`, `0`) when the key has never been written.
pub async fn load_defaults<F: NorFlash>(
    store: &mut ConfigStore<F>,
) -> (Option<[u8; 6]>, u8) {
    let addr = match store.get_addr().await {
        Ok(a) => Some(a),
        Err(ConfigError::NotFound) => None,
        Err(ConfigError::Io) => None,
    };
    let key = match store.get_name_map_key().await {
        Ok(k) => k,
        Err(_) => 0,
    };
    (addr, key)
}
