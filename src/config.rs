//! Compile-time configuration constants: LoRa modulation parameters, SPI
//! pin assignments, and BLE advertised identity (spec.md §6). These are
//! deployment constants, not the reboot-surviving key/value store — see
//! [`crate::store`] for that.

/// LoRa center frequency, Hz.
pub const LORA_FREQUENCY_HZ: u32 = 434_000_000;
/// LoRa bandwidth, kHz.
pub const LORA_BANDWIDTH_KHZ: u32 = 500;
/// LoRa spreading factor.
pub const LORA_SPREADING_FACTOR: u8 = 7;
/// LoRa coding rate, as the `4/N` denominator.
pub const LORA_CODING_RATE_DENOM: u8 = 7;
/// Private (non-public) LoRa sync word used by this deployment so this
/// node's traffic does not mix with public-network LoRa traffic on the
/// same band.
pub const LORA_SYNC_WORD: u8 = 0x12;
/// TX output power, dBm.
pub const LORA_TX_POWER_DBM: i32 = 22;
/// Preamble length, symbols.
pub const LORA_PREAMBLE_SYMBOLS: u16 = 8;
/// TCXO startup delay.
pub const LORA_TCXO_DELAY_MS: u32 = 1_600 / 100; // expressed in the driver's 100us ticks below
/// TCXO startup delay, in the 15.625 us ticks `lora-phy` expects.
pub const LORA_TCXO_DELAY_TICKS: u32 = 1_600 * 1000 / 15_625;

// SPI + transceiver control pin assignments (spec.md §6: SCK=8, MOSI=9,
// MISO=10, CS=3, BUSY=19, RST=18, DIO1=1, DIO2=2) are applied directly at
// the `peripherals.GPIOn` field-selection site in `src/bin/main.rs` — esp-hal
// gives each pin its own field/type on the generated `Peripherals` struct,
// so there is no runtime constant to route through here.

/// Advertised BLE local name.
pub const BLE_LOCAL_NAME: &str = "LoRA-Adapter";

/// Service/characteristic UUIDs (spec.md §4.5/§6).
pub mod uuid {
    pub const HEART_RATE_SERVICE: &str = "180d";
    pub const HR_MEASUREMENT: &str = "2a37";
    pub const WHITELIST: &str = "048b8928-d0a5-43e2-ada9-b925ec62ba27";
    pub const DEVICE: &str = "12a481f0-9384-413d-b002-f8660566d3b0";
}

/// Active-scan cadence (spec.md §4.4): scan for `SCAN_WINDOW_MS`, sleep
/// for `SCAN_SLEEP_MS`, repeat — so scanning does not starve other radio
/// activity.
pub const SCAN_WINDOW_MS: u32 = 750;
pub const SCAN_SLEEP_MS: u32 = 250;
pub const SCAN_INTERVAL_MS: u32 = SCAN_WINDOW_MS + SCAN_SLEEP_MS;

// Persistent store keys: spec.md §6 names them `paired_addr`/`name_map_key`,
// but `sequential_storage::map`'s `Key` trait is implemented for integer
// types, not arbitrary byte strings — see `store::KEY_PAIRED_ADDR`/
// `store::KEY_NAME_MAP_KEY` for the small-integer encoding actually used on
// the wire, and DESIGN.md for why that substitution is sound (the mapping
// is private to this crate; nothing outside it observes the raw key bytes).
