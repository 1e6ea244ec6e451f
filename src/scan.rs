//! Scan manager (C4): discovers, connects to, and subscribes the paired
//! heart-rate monitor over the BLE central role; publishes advertisement
//! and HR-notification events to the relay orchestrator.
//!
//! The state machine (spec.md §4.4) is kept free of any BLE I/O so it can
//! be driven and asserted against directly in tests; [`run`] is the
//! thin, untestable-without-hardware loop that turns real
//! `trouble_host` central-role events into calls against it.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use embassy_sync::mutex::Mutex;
use heapless::Vec;

use crate::types::{BleAddr, DiscoveredDevice};

#[derive(Debug, Clone, PartialEq, defmt::Format)]
pub enum ScanState {
    NoTarget,
    Scanning(BleAddr),
    Connecting(BleAddr),
    Subscribed(BleAddr, DiscoveredDevice),
}

/// Event published to the relay orchestrator (C6) in place of the
/// spec's `on_result`/`on_data` function-pointer callbacks — the
/// idiomatic Embassy equivalent of registering a callback is handing the
/// producer a channel sender (see DESIGN.md).
#[derive(Debug, Clone, defmt::Format)]
pub enum ScanEvent {
    /// Emitted once per transition into `Subscribed`.
    Result { device: DiscoveredDevice },
    /// Emitted on each Heart Rate Measurement notification. `bytes` is
    /// the raw GATT value; the orchestrator parses it per spec.md §4.6.
    Data {
        device: DiscoveredDevice,
        bytes: Vec<u8, 32>,
    },
}

/// The pure state machine half of C4: holds the paired-target state and
/// the discovered-device record, with no BLE I/O of its own. `run`
/// (below) drives it from real advertisement/connection/notification
/// events.
pub struct ScanManager {
    state: Mutex<CriticalSectionRawMutex, ScanState>,
}

impl ScanManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScanState::NoTarget),
        }
    }

    /// Idempotent: a no-op if `addr` already equals the current target.
    /// Otherwise tears down any connection and enters `Scanning` (or
    /// `NoTarget` when `addr` is `None`).
    pub async fn set_target_addr(&self, addr: Option<BleAddr>) {
        let mut g = self.state.lock().await;
        let current = current_target(&g);
        if current == addr {
            return;
        }
        *g = match addr {
            Some(a) => ScanState::Scanning(a),
            None => ScanState::NoTarget,
        };
    }

    pub async fn get_target_addr(&self) -> Option<BleAddr> {
        current_target(&*self.state.lock().await)
    }

    pub async fn get_device(&self) -> Option<DiscoveredDevice> {
        match &*self.state.lock().await {
            ScanState::Subscribed(_, d) => Some(d.clone()),
            _ => None,
        }
    }

    /// `Scanning(a) -> Connecting(a)` when the paired target is found
    /// over the air. No-op if the target has since changed or cleared.
    pub async fn on_found(&self, addr: BleAddr) {
        let mut g = self.state.lock().await;
        if let ScanState::Scanning(a) = &*g {
            if *a == addr {
                *g = ScanState::Connecting(addr);
            }
        }
    }

    /// `Connecting(a) -> Subscribed(a, device)`.
    pub async fn on_connected(&self, device: DiscoveredDevice) -> bool {
        let mut g = self.state.lock().await;
        if let ScanState::Connecting(a) = &*g {
            if *a == device.addr {
                *g = ScanState::Subscribed(device.addr, device);
                return true;
            }
        }
        false
    }

    /// `Connecting(a) -> Scanning(a)` on a failed connection attempt.
    pub async fn on_connect_failed(&self, addr: BleAddr) {
        let mut g = self.state.lock().await;
        if let ScanState::Connecting(a) = &*g {
            if *a == addr {
                *g = ScanState::Scanning(addr);
            }
        }
    }

    /// `Subscribed(a, _) -> Scanning(a)` on disconnect.
    pub async fn on_disconnected(&self) {
        let mut g = self.state.lock().await;
        if let ScanState::Subscribed(a, _) = &*g {
            *g = ScanState::Scanning(*a);
        }
    }

    pub async fn snapshot(&self) -> ScanState {
        self.state.lock().await.clone()
    }
}

fn current_target(state: &ScanState) -> Option<BleAddr> {
    match state {
        ScanState::NoTarget => None,
        ScanState::Scanning(a) | ScanState::Connecting(a) => Some(*a),
        ScanState::Subscribed(a, _) => Some(*a),
    }
}

/// Active-scan cadence driver: runs `scan 750ms / sleep 250ms` forever,
/// handing discovered advertisements to `manager` and forwarding HR
/// notifications to `events`. This is the seam into real `trouble_host`
/// central-role APIs (advertisement reports, `connect`, GATT-client
/// discovery/subscription against service `180d` / characteristic
/// `2a37`); it is not unit-tested here because it requires a live
/// `Central` and radio, exactly like `radio.rs`'s hardware path.
pub async fn run<C>(
    manager: &ScanManager,
    mut central: C,
    events: Sender<'static, CriticalSectionRawMutex, ScanEvent, 10>,
) where
    C: CentralDriver,
{
    loop {
        let target = manager.get_target_addr().await;
        let Some(target) = target else {
            // NoTarget: idle with respect to monitor scanning.
            central.idle_tick().await;
            continue;
        };

        match central.scan_window(target, crate::config::SCAN_WINDOW_MS).await {
            Some(found_addr) if found_addr == target => {
                manager.on_found(target).await;
                match central.connect_and_subscribe(target).await {
                    Ok(device) => {
                        if manager.on_connected(device.clone()).await {
                            let _ = events.try_send(ScanEvent::Result { device: device.clone() });
                            central.run_notifications(&device, manager, &events).await;
                            manager.on_disconnected().await;
                        }
                    }
                    Err(()) => manager.on_connect_failed(target).await,
                }
            }
            _ => {}
        }
        central.sleep(crate::config::SCAN_SLEEP_MS).await;
    }
}

/// The subset of BLE central-role operations `run` needs, kept behind a
/// trait so the cadence/dispatch logic above can be exercised against a
/// fake in tests without a real BLE stack.
pub trait CentralDriver {
    async fn idle_tick(&mut self);
    async fn sleep(&mut self, millis: u32);
    /// Scans for up to `window_ms`; returns the address of an advertising
    /// device matching `target`, if seen.
    async fn scan_window(&mut self, target: BleAddr, window_ms: u32) -> Option<BleAddr>;
    async fn connect_and_subscribe(&mut self, target: BleAddr) -> Result<DiscoveredDevice, ()>;
    async fn run_notifications(
        &mut self,
        device: &DiscoveredDevice,
        manager: &ScanManager,
        events: &Sender<'static, CriticalSectionRawMutex, ScanEvent, 10>,
    );
}
