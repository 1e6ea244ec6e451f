#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

use embassy_embedded_hal::shared_bus::asynch::spi::SpiDevice as SharedSpiDevice;
use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, NoopRawMutex};
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embassy_time::{Delay, Duration, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::handler;
use esp_hal::interrupt::InterruptConfigurable;
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use lora_phy::iv::GenericSx126xInterfaceVariant;
use lora_phy::sx126x::Sx126x;
use lora_phy::LoRa;
use lora_hr_repeater::gatt::{gatt_task, GattInbound, GattOutbound};
use lora_hr_repeater::radio::{self, Radio, RadioController, RadioParams};
use lora_hr_repeater::relay::Relay;
use lora_hr_repeater::scan::{ScanEvent, ScanManager};
use lora_hr_repeater::store::{load_defaults, ConfigStore};
use lora_hr_repeater::types::BleAddr;
use static_cell::StaticCell;

#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

type SpiBus = AsyncMutex<NoopRawMutex, Spi<'static, esp_hal::Async>>;

static SPI_BUS: StaticCell<SpiBus> = StaticCell::new();
static RADIO_CTRL: StaticCell<RadioController<SharedSpiDevice<'static, NoopRawMutex, Spi<'static, esp_hal::Async>, Output<'static>>>> =
    StaticCell::new();
static SCAN_MANAGER: StaticCell<ScanManager> = StaticCell::new();
static SCAN_EVENTS: StaticCell<Channel<CriticalSectionRawMutex, ScanEvent, 10>> = StaticCell::new();
static GATT_IN: StaticCell<Channel<CriticalSectionRawMutex, GattInbound, 8>> = StaticCell::new();
static GATT_OUT: StaticCell<Channel<CriticalSectionRawMutex, GattOutbound, 8>> = StaticCell::new();

#[handler]
fn on_dio1() {
    radio::on_packet_received_isr();
}

/// Six-step startup sequence (spec §4.6): store, radio, BLE/GATT/scan,
/// ISR, receive task, then the main task parks forever.
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    esp_alloc::heap_allocator!(#[unsafe(link_section = ".dram2_uninit")] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // Step 1: persistent store.
    let flash = esp_storage::FlashStorage::new();
    let mut store = ConfigStore::new(flash);
    if store.init().await.is_err() {
        defmt::error!("Config store init failed, rebooting");
        Timer::after(Duration::from_secs(1)).await;
        esp_hal::system::software_reset();
    }
    let (paired_addr, name_map_key) = load_defaults(&mut store).await;

    // Step 2: radio.
    let sck = Output::new(peripherals.GPIO8, Level::Low, OutputConfig::default());
    let mosi = Output::new(peripherals.GPIO9, Level::Low, OutputConfig::default());
    let miso = Input::new(peripherals.GPIO10, InputConfig::default().with_pull(Pull::None));
    let cs = Output::new(peripherals.GPIO3, Level::High, OutputConfig::default());
    let reset = Output::new(peripherals.GPIO18, Level::High, OutputConfig::default());
    let busy = Input::new(peripherals.GPIO19, InputConfig::default().with_pull(Pull::None));
    let mut dio1 = Input::new(peripherals.GPIO1, InputConfig::default().with_pull(Pull::Down));
    dio1.set_interrupt_handler(on_dio1);

    let spi = Spi::new(
        peripherals.SPI2,
        SpiConfig::default().with_frequency(Rate::from_mhz(2)).with_mode(esp_hal::spi::Mode::_0),
    )
    .unwrap()
    .with_sck(sck)
    .with_mosi(mosi)
    .with_miso(miso)
    .into_async();
    let spi_bus = SPI_BUS.init(AsyncMutex::new(spi));
    let spi_device = SharedSpiDevice::new(spi_bus, cs);

    let iv = GenericSx126xInterfaceVariant::new(reset, dio1, busy, None, None).unwrap();
    let sx126x = Sx126x::new(spi_device, iv, radio::sx126x_config());
    let lora = match LoRa::new(sx126x, true, Delay).await {
        Ok(lora) => lora,
        Err(_) => {
            defmt::error!("LoRa init failed, rebooting");
            Timer::after(Duration::from_secs(1)).await;
            esp_hal::system::software_reset()
        }
    };
    let radio_ctrl = RADIO_CTRL.init(RadioController::new(lora));
    if radio_ctrl.begin(RadioParams::default()).await.is_err() {
        defmt::error!("Radio begin failed, rebooting");
        Timer::after(Duration::from_secs(1)).await;
        esp_hal::system::software_reset();
    }

    // Step 3+4: BLE stack / GATT server / scan manager.
    let radio_init = esp_radio::init().expect("Failed to initialize Wi-Fi/BLE controller");
    static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
    let ble_radio = RADIO.init(radio_init);

    let scan_manager = SCAN_MANAGER.init(ScanManager::new());
    scan_manager.set_target_addr(paired_addr.map(BleAddr::new)).await;

    let scan_events = SCAN_EVENTS.init(Channel::new());
    let gatt_in = GATT_IN.init(Channel::new());
    let gatt_out = GATT_OUT.init(Channel::new());

    spawner
        .spawn(gatt_task(ble_radio, peripherals.BT, gatt_in.sender(), gatt_out.receiver()))
        .unwrap();

    // `scan::run` (the BLE central-role scanning loop: advertisement
    // reports, connect, HR-characteristic subscription) is deliberately
    // not spawned here. It is written and tested against the
    // `CentralDriver` seam, but no concrete `trouble_host` central-role
    // binding exists: see SPEC_FULL.md §5 and DESIGN.md's `scan.rs`
    // entry for why this is an explicit, narrowly-scoped non-goal rather
    // than an oversight.

    // Step 5: install ISR, arm receive.
    radio_ctrl.start_receive().await.ok();

    // Step 6: spawn the relay task; main task parks (here: never returns,
    // since the relay loop itself is the task's body).
    let my_addr = BleAddr::new([0xff, 0x8f, 0x1a, 0x05, 0xe4, 0xff]);
    let mut relay = Relay::new(store, radio_ctrl, scan_manager, gatt_out.sender(), my_addr, name_map_key);

    relay.run(scan_events.receiver(), gatt_in.receiver()).await
}
