//! Radio controller (C3): owns the half-duplex LoRa transceiver and its
//! `{Idle, Receiving, Transmitting}` state machine.
//!
//! Half-duplex invariant (spec.md §4.3/§5): every transition is funneled
//! through a single `embassy_sync::mutex::Mutex`, so no two contexts can
//! ever drive the transceiver at once, and TX/RX transitions always pass
//! through `Idle`. The "packet-received ISR" of spec.md is a real
//! hardware interrupt on `DIO1`; it touches nothing but a single
//! [`Signal`] (lock-free, reentrant-free, exactly the ISR contract
//! spec.md requires) — the relay task wakes on that signal and only then
//! calls into the mutex-guarded radio to actually read the packet.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::Delay;
use embedded_hal_async::spi::SpiDevice;
use lora_phy::iv::GenericSx126xInterfaceVariant;
use lora_phy::mod_params::{Bandwidth, CodingRate, ModulationParams, RxPacketParams, SpreadingFactor, TxPacketParams};
use lora_phy::sx126x::{Config as Sx126xConfig, Sx1262, Sx126x, TcxoCtrlVoltage};
use lora_phy::{LoRa, RxMode};

use crate::config;

/// Signaled by the DIO1 packet-received interrupt; awaited by the relay
/// task. A single slot is sufficient: only "a packet arrived, go look"
/// needs to cross the ISR/task boundary, never a payload.
pub static RECV_EVT: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Touches only the signal — safe to call directly from interrupt
/// context. Registered as the DIO1 GPIO interrupt handler at startup
/// (spec.md §4.6 step 5).
#[inline]
pub fn on_packet_received_isr() {
    RECV_EVT.signal(());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum RadioState {
    Idle,
    Receiving,
    Transmitting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum RadioError {
    TxTimeout,
    HwError,
}

/// The half-duplex radio operations the relay orchestrator (C6) drives.
/// Exists as a seam so C6's half-duplex logic can be exercised against an
/// in-memory fake in tests instead of real `lora-phy`/SPI hardware.
pub trait Radio {
    async fn standby(&self) -> Result<(), RadioError>;
    async fn start_receive(&self) -> Result<(), RadioError>;
    async fn try_transmit(&self, buf: &[u8]) -> Result<(), RadioError>;
    async fn receive_into(&self, buf: &mut [u8]) -> usize;
    async fn state(&self) -> RadioState;
}

/// Deployment-fixed modulation parameters (spec.md §6). Compile-time
/// constants, not user configuration.
#[derive(Debug, Clone, Copy)]
pub struct RadioParams {
    pub frequency_hz: u32,
    pub bandwidth: Bandwidth,
    pub spreading_factor: SpreadingFactor,
    pub coding_rate: CodingRate,
    pub tx_power_dbm: i32,
    pub preamble_symbols: u16,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            frequency_hz: config::LORA_FREQUENCY_HZ,
            bandwidth: Bandwidth::_500KHz,
            spreading_factor: SpreadingFactor::_7,
            coding_rate: CodingRate::_4_7,
            tx_power_dbm: config::LORA_TX_POWER_DBM,
            preamble_symbols: config::LORA_PREAMBLE_SYMBOLS,
        }
    }
}

type Sx1262Radio<SPI> = LoRa<
    Sx126x<SPI, GenericSx126xInterfaceVariant<esp_hal::gpio::Output<'static>, esp_hal::gpio::Input<'static>>, Sx1262>,
    Delay,
>;

struct Inner<SPI: SpiDevice> {
    lora: Sx1262Radio<SPI>,
    modulation_params: Option<ModulationParams>,
    rx_packet_params: Option<RxPacketParams>,
    tx_packet_params: Option<TxPacketParams>,
    state: RadioState,
}

/// Serializes all access to the transceiver behind a single mutex
/// (spec.md §5: "the implementation MUST serialize radio access").
pub struct RadioController<SPI: SpiDevice> {
    inner: Mutex<CriticalSectionRawMutex, Inner<SPI>>,
}

impl<SPI: SpiDevice> RadioController<SPI> {
    pub fn new(radio: Sx1262Radio<SPI>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lora: radio,
                modulation_params: None,
                rx_packet_params: None,
                tx_packet_params: None,
                state: RadioState::Idle,
            }),
        }
    }

    /// Configures modulation parameters and prepares the transceiver for
    /// continuous receive. Mismatch with the peer ⇒ silently no traffic;
    /// these are compile-time constants of the deployment (spec.md §4.3).
    pub async fn begin(&self, params: RadioParams) -> Result<(), RadioError> {
        let mut g = self.inner.lock().await;
        let modulation_params = g
            .lora
            .create_modulation_params(
                params.spreading_factor,
                params.bandwidth,
                params.coding_rate,
                params.frequency_hz,
            )
            .map_err(|_| RadioError::HwError)?;

        let rx_packet_params = g
            .lora
            .create_rx_packet_params(
                params.preamble_symbols as u8,
                false,
                255,
                true,
                false,
                &modulation_params,
            )
            .map_err(|_| RadioError::HwError)?;

        let tx_packet_params = g
            .lora
            .create_tx_packet_params(params.preamble_symbols as u8, false, true, false, &modulation_params)
            .map_err(|_| RadioError::HwError)?;

        g.modulation_params = Some(modulation_params);
        g.rx_packet_params = Some(rx_packet_params);
        g.tx_packet_params = Some(tx_packet_params);
        drop(g);
        self.start_receive().await
    }

    /// Transitions to `Idle`.
    pub async fn standby(&self) -> Result<(), RadioError> {
        let mut g = self.inner.lock().await;
        g.lora.sleep(false).await.map_err(|_| RadioError::HwError)?;
        g.state = RadioState::Idle;
        Ok(())
    }

    /// `Idle -> Receiving`. Arms the packet-received interrupt path.
    pub async fn start_receive(&self) -> Result<(), RadioError> {
        let mut g = self.inner.lock().await;
        let modulation_params = g.modulation_params.clone().ok_or(RadioError::HwError)?;
        let rx_packet_params = g.rx_packet_params.clone().ok_or(RadioError::HwError)?;
        g.lora
            .prepare_for_rx(RxMode::Continuous, &modulation_params, &rx_packet_params)
            .await
            .map_err(|_| RadioError::HwError)?;
        g.state = RadioState::Receiving;
        Ok(())
    }

    /// Requires current state `Idle` or `Receiving`. Blocks until the
    /// transceiver signals completion or the driver-level TX timeout
    /// fires, then returns to `Idle` and re-arms `Receiving`.
    pub async fn try_transmit(&self, buf: &[u8]) -> Result<(), RadioError> {
        let mut g = self.inner.lock().await;
        if g.state == RadioState::Transmitting {
            return Err(RadioError::HwError);
        }
        let modulation_params = g.modulation_params.clone().ok_or(RadioError::HwError)?;
        let mut tx_packet_params = g.tx_packet_params.clone().ok_or(RadioError::HwError)?;

        g.state = RadioState::Transmitting;
        let prepared = g
            .lora
            .prepare_for_tx(&modulation_params, &mut tx_packet_params, config::LORA_TX_POWER_DBM, buf)
            .await;
        let result = match prepared {
            Ok(()) => match g.lora.tx().await {
                Ok(()) => Ok(()),
                Err(_) => Err(RadioError::TxTimeout),
            },
            Err(_) => Err(RadioError::HwError),
        };
        g.tx_packet_params = Some(tx_packet_params);
        g.state = RadioState::Idle;
        drop(g);
        // Re-arm receive regardless of TX outcome (spec.md §7: TxTimeout
        // is logged and receive resumes).
        self.start_receive().await?;
        result
    }

    /// Reads the pending packet into `buf`. Returns its length, or `0` if
    /// none is currently available (spec.md §4.3).
    pub async fn receive_into(&self, buf: &mut [u8]) -> usize {
        let mut g = self.inner.lock().await;
        let rx_packet_params = match g.rx_packet_params.clone() {
            Some(p) => p,
            None => return 0,
        };
        match g.lora.rx(&rx_packet_params, buf).await {
            Ok((len, _status)) => len as usize,
            Err(_) => 0,
        }
    }

    pub async fn state(&self) -> RadioState {
        self.inner.lock().await.state
    }
}

impl<SPI: SpiDevice> Radio for RadioController<SPI> {
    async fn standby(&self) -> Result<(), RadioError> {
        RadioController::standby(self).await
    }
    async fn start_receive(&self) -> Result<(), RadioError> {
        RadioController::start_receive(self).await
    }
    async fn try_transmit(&self, buf: &[u8]) -> Result<(), RadioError> {
        RadioController::try_transmit(self, buf).await
    }
    async fn receive_into(&self, buf: &mut [u8]) -> usize {
        RadioController::receive_into(self, buf).await
    }
    async fn state(&self) -> RadioState {
        RadioController::state(self).await
    }
}

/// Builds the `sx126x::Config` for this deployment: private sync word,
/// TCXO enabled at the configured startup voltage (spec.md §6).
pub fn sx126x_config() -> Sx126xConfig {
    Sx126xConfig {
        chip: Sx1262,
        tcxo_ctrl: Some(TcxoCtrlVoltage::Ctrl1V7),
        use_dcdc: true,
        rx_boost: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_match_the_deployment_constants() {
        let p = RadioParams::default();
        assert_eq!(p.frequency_hz, 434_000_000);
        assert_eq!(p.tx_power_dbm, 22);
        assert_eq!(p.preamble_symbols, 8);
    }

    #[test]
    fn radio_states_are_distinct() {
        assert_ne!(RadioState::Idle, RadioState::Receiving);
        assert_ne!(RadioState::Idle, RadioState::Transmitting);
        assert_ne!(RadioState::Receiving, RadioState::Transmitting);
    }

    // try_transmit/start_receive/receive_into drive a real lora-phy
    // Sx126x handle over SPI and are exercised on-target; the half-duplex
    // "no TX while RX" property (spec.md §8) is verified against
    // `fake::FakeRadio` from the relay orchestrator's own tests.
}
