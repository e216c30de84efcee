// Four-wheel software PWM driver
//
// Owns the pin capability and a timing thread that turns the current duty
// frame into pin toggles. Writers replace the whole frame with one atomic
// store, so the timing loop never sees a half-updated set of wheels.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::pins::{Level, OutputPins, PinError};
use super::pwm::{self, CyclePlan};
use crate::config::{PIN_FAILURE_LIMIT, PinMap};

/// The four omni wheels, in frame order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WheelId {
    FrontLeft,
    FrontRight,
    BackLeft,
    BackRight,
}

impl WheelId {
    pub const ALL: [WheelId; 4] = [
        WheelId::FrontLeft,
        WheelId::FrontRight,
        WheelId::BackLeft,
        WheelId::BackRight,
    ];

    pub fn index(self) -> usize {
        match self {
            WheelId::FrontLeft => 0,
            WheelId::FrontRight => 1,
            WheelId::BackLeft => 2,
            WheelId::BackRight => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            WheelId::FrontLeft => "FL",
            WheelId::FrontRight => "FR",
            WheelId::BackLeft => "BL",
            WheelId::BackRight => "BR",
        }
    }
}

impl fmt::Display for WheelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Duty targets for one wheel. At most one direction is ever nonzero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WheelCommand {
    forward_duty: u8,
    reverse_duty: u8,
}

impl WheelCommand {
    pub const STOP: WheelCommand = WheelCommand {
        forward_duty: 0,
        reverse_duty: 0,
    };

    /// Build from a signed speed in -100..=100 (out of range values are clamped)
    pub fn from_signed(speed: i16) -> Self {
        let speed = speed.clamp(-100, 100);
        if speed > 0 {
            Self {
                forward_duty: speed as u8,
                reverse_duty: 0,
            }
        } else {
            Self {
                forward_duty: 0,
                reverse_duty: speed.unsigned_abs() as u8,
            }
        }
    }

    pub fn forward_duty(&self) -> u8 {
        self.forward_duty
    }

    pub fn reverse_duty(&self) -> u8 {
        self.reverse_duty
    }

    /// Signed speed, positive = forward
    pub fn signed(&self) -> i16 {
        i16::from(self.forward_duty) - i16::from(self.reverse_duty)
    }

    pub fn is_stopped(&self) -> bool {
        self.forward_duty == 0 && self.reverse_duty == 0
    }
}

/// All four wheel targets packed into one atomic word (one signed byte each)
#[derive(Debug, Default)]
pub struct DutyFrame {
    packed: AtomicU32,
}

impl DutyFrame {
    pub fn store(&self, frame: [WheelCommand; 4]) {
        let mut bytes = [0u8; 4];
        for (byte, command) in bytes.iter_mut().zip(frame.iter()) {
            *byte = (command.signed() as i8) as u8;
        }
        self.packed.store(u32::from_le_bytes(bytes), Ordering::Release);
    }

    pub fn load(&self) -> [WheelCommand; 4] {
        let bytes = self.packed.load(Ordering::Acquire).to_le_bytes();
        bytes.map(|b| WheelCommand::from_signed(i16::from(b as i8)))
    }
}

/// Errors from the wheel driver
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Failed to claim wheel pins: {0}")]
    Claim(#[source] PinError),

    #[error("Failed to start PWM thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Wheel {wheel} is faulted; commands refused")]
    Faulted { wheel: WheelId },
}

const NO_FAULT: u8 = u8::MAX;

/// Latched hardware fault, shared with the timing thread
#[derive(Debug)]
struct FaultLatch(AtomicU8);

impl FaultLatch {
    fn new() -> Self {
        Self(AtomicU8::new(NO_FAULT))
    }

    fn latch(&self, wheel: WheelId) {
        let _ = self.0.compare_exchange(
            NO_FAULT,
            wheel.index() as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn get(&self) -> Option<WheelId> {
        WheelId::ALL.get(usize::from(self.0.load(Ordering::Acquire))).copied()
    }
}

type SharedPins = Arc<Mutex<Box<dyn OutputPins>>>;

fn lock_pins(pins: &SharedPins) -> MutexGuard<'_, Box<dyn OutputPins>> {
    pins.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drive every mapped pin low, logging (not propagating) failures
fn force_all_low(pins: &mut dyn OutputPins, map: &PinMap) {
    for pin in map.all_pins() {
        if let Err(e) = pins.write(pin, Level::Low) {
            warn!("Failed to drive pin {} low: {}", pin, e);
        }
    }
}

/// Software PWM driver for the four wheels
pub struct WheelDriver {
    frame: Arc<DutyFrame>,
    pins: SharedPins,
    map: PinMap,
    running: Arc<AtomicBool>,
    fault: Arc<FaultLatch>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WheelDriver {
    /// Claim the mapped pins and start the timing loop at `pwm_hz`.
    ///
    /// Failing to claim the pins is the one fatal hardware condition.
    pub fn start(
        mut pins: Box<dyn OutputPins>,
        map: PinMap,
        pwm_hz: u32,
    ) -> Result<Self, DriverError> {
        let all = map.all_pins();
        pins.claim(&all).map_err(DriverError::Claim)?;
        for &pin in &all {
            pins.write(pin, Level::Low).map_err(DriverError::Claim)?;
        }

        for wheel in WheelId::ALL {
            let p = map.pins(wheel);
            info!("Wheel {}: forward pin {}, reverse pin {}", wheel, p.forward, p.reverse);
        }

        let frame = Arc::new(DutyFrame::default());
        let pins: SharedPins = Arc::new(Mutex::new(pins));
        let running = Arc::new(AtomicBool::new(true));
        let fault = Arc::new(FaultLatch::new());
        let period = Duration::from_secs(1) / pwm_hz.max(1);

        let timing = TimingLoop {
            frame: Arc::clone(&frame),
            pins: Arc::clone(&pins),
            map: map.clone(),
            running: Arc::clone(&running),
            fault: Arc::clone(&fault),
            period,
        };
        let handle = thread::Builder::new()
            .name("wheel-pwm".into())
            .spawn(move || timing.run())?;

        info!("Wheel driver started: {}Hz software PWM", pwm_hz);

        Ok(Self {
            frame,
            pins,
            map,
            running,
            fault,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Replace all four wheel targets at once
    pub fn apply(&self, commands: [WheelCommand; 4]) -> Result<(), DriverError> {
        if let Some(wheel) = self.fault.get() {
            return Err(DriverError::Faulted { wheel });
        }
        debug!(
            "Applying duties: FL={}, FR={}, BL={}, BR={}",
            commands[0].signed(),
            commands[1].signed(),
            commands[2].signed(),
            commands[3].signed()
        );
        self.frame.store(commands);
        Ok(())
    }

    /// Zero every duty and drive every pin low right away
    pub fn stop_all(&self) {
        self.frame.store([WheelCommand::STOP; 4]);
        let mut pins = lock_pins(&self.pins);
        force_all_low(&mut **pins, &self.map);
    }

    /// Current duty frame
    pub fn snapshot(&self) -> [WheelCommand; 4] {
        self.frame.load()
    }

    /// Wheel whose pins failed repeatedly, if any
    pub fn fault(&self) -> Option<WheelId> {
        self.fault.get()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the timing loop, force every pin low and release the pins.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("PWM thread panicked");
            }
        }

        self.frame.store([WheelCommand::STOP; 4]);
        let mut pins = lock_pins(&self.pins);
        force_all_low(&mut **pins, &self.map);
        if let Err(e) = pins.release(&self.map.all_pins()) {
            warn!("Failed to release wheel pins: {}", e);
        }
        info!("Wheel driver shut down");
    }
}

impl Drop for WheelDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State moved into the timing thread
struct TimingLoop {
    frame: Arc<DutyFrame>,
    pins: SharedPins,
    map: PinMap,
    running: Arc<AtomicBool>,
    fault: Arc<FaultLatch>,
    period: Duration,
}

impl TimingLoop {
    fn run(self) {
        let mut failures = [0u32; 4];
        let mut period_start = Instant::now();

        while self.running.load(Ordering::Acquire) {
            let mut failed = [false; 4];

            // Snapshot and opening edges happen under the pin lock, so a
            // concurrent stop_all either precedes the snapshot or follows the writes.
            let plan = {
                let mut pins = lock_pins(&self.pins);
                let plan = CyclePlan::new(&pwm::channels(&self.map, &self.frame.load()));
                for edge in plan.edges().iter().take_while(|e| e.at_percent == 0) {
                    write_edge(&mut **pins, edge, &mut failed);
                }
                plan
            };

            for edge in plan.edges().iter().skip_while(|e| e.at_percent == 0) {
                sleep_until(period_start + pwm::edge_offset(self.period, edge.at_percent));
                let mut pins = lock_pins(&self.pins);
                write_edge(&mut **pins, edge, &mut failed);
            }

            for wheel in WheelId::ALL {
                let i = wheel.index();
                failures[i] = if failed[i] { failures[i] + 1 } else { 0 };
                if failures[i] == 1 {
                    warn!("PWM writes failing on wheel {}", wheel);
                }
                if failures[i] >= PIN_FAILURE_LIMIT && self.fault.get().is_none() {
                    self.escalate(wheel, failures[i]);
                }
            }

            period_start += self.period;
            let now = Instant::now();
            if period_start < now {
                // Overran a whole period; resynchronize instead of bursting
                period_start = now;
            } else {
                sleep_until(period_start);
            }
        }
        debug!("PWM loop exited");
    }

    fn escalate(&self, wheel: WheelId, count: u32) {
        error!(
            "Wheel {} failed {} consecutive PWM cycles; stopping all wheels",
            wheel, count
        );
        self.fault.latch(wheel);
        self.frame.store([WheelCommand::STOP; 4]);
        let mut pins = lock_pins(&self.pins);
        force_all_low(&mut **pins, &self.map);
    }
}

fn write_edge(pins: &mut dyn OutputPins, edge: &pwm::Edge, failed: &mut [bool; 4]) {
    for channel in &edge.channels {
        if let Err(e) = pins.write(channel.pin, edge.level) {
            debug!("PWM write to pin {} ({}) failed: {}", channel.pin, channel.wheel, e);
            failed[channel.wheel.index()] = true;
        }
    }
}

fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        thread::sleep(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::pins::SimulatedPins;

    fn start_sim() -> (WheelDriver, SimulatedPins) {
        let sim = SimulatedPins::new();
        let driver = WheelDriver::start(Box::new(sim.clone()), PinMap::default(), 100).unwrap();
        (driver, sim)
    }

    #[test]
    fn test_wheel_command_is_exclusive() {
        let fwd = WheelCommand::from_signed(40);
        assert_eq!((fwd.forward_duty(), fwd.reverse_duty()), (40, 0));
        let rev = WheelCommand::from_signed(-65);
        assert_eq!((rev.forward_duty(), rev.reverse_duty()), (0, 65));
        let clamped = WheelCommand::from_signed(250);
        assert_eq!(clamped.forward_duty(), 100);
        assert!(WheelCommand::from_signed(0).is_stopped());
    }

    #[test]
    fn test_duty_frame_round_trips_signs() {
        let frame = DutyFrame::default();
        let commands = [
            WheelCommand::from_signed(-100),
            WheelCommand::from_signed(100),
            WheelCommand::from_signed(-1),
            WheelCommand::STOP,
        ];
        frame.store(commands);
        assert_eq!(frame.load(), commands);
    }

    #[test]
    fn test_claim_failure_is_fatal() {
        let sim = SimulatedPins::new();
        sim.refuse_claims();
        let result = WheelDriver::start(Box::new(sim), PinMap::default(), 100);
        assert!(matches!(result, Err(DriverError::Claim(_))));
    }

    #[test]
    fn test_timing_loop_toggles_active_pins_only() {
        let (driver, sim) = start_sim();
        let map = PinMap::default();
        let mut commands = [WheelCommand::STOP; 4];
        commands[WheelId::FrontLeft.index()] = WheelCommand::from_signed(50);
        commands[WheelId::BackRight.index()] = WheelCommand::from_signed(-50);
        driver.apply(commands).unwrap();

        thread::sleep(Duration::from_millis(100));

        let fl = map.pins(WheelId::FrontLeft);
        let br = map.pins(WheelId::BackRight);
        let fr = map.pins(WheelId::FrontRight);
        assert!(sim.rising_edges(fl.forward) >= 3);
        assert!(sim.rising_edges(br.reverse) >= 3);
        assert_eq!(sim.rising_edges(fl.reverse), 0);
        assert_eq!(sim.rising_edges(br.forward), 0);
        assert_eq!(sim.rising_edges(fr.forward), 0);
        driver.shutdown();
    }

    #[test]
    fn test_stop_all_twice_is_idempotent() {
        let (driver, sim) = start_sim();
        driver.apply([WheelCommand::from_signed(70); 4]).unwrap();
        thread::sleep(Duration::from_millis(30));

        driver.stop_all();
        let once = driver.snapshot();
        driver.stop_all();
        assert_eq!(driver.snapshot(), once);
        assert!(once.iter().all(WheelCommand::is_stopped));

        // Give the loop one period to finish any cycle planned before the stop
        thread::sleep(Duration::from_millis(25));
        for pin in PinMap::default().all_pins() {
            assert_eq!(sim.level(pin), Some(Level::Low));
        }
        driver.shutdown();
    }

    #[test]
    fn test_repeated_write_failures_latch_fault() {
        let (driver, sim) = start_sim();
        let pins = PinMap::default().pins(WheelId::FrontRight);
        sim.fail_pin(pins.forward);
        driver.apply([WheelCommand::from_signed(40); 4]).unwrap();

        thread::sleep(Duration::from_millis(120));

        assert_eq!(driver.fault(), Some(WheelId::FrontRight));
        assert!(driver.snapshot().iter().all(WheelCommand::is_stopped));
        assert!(matches!(
            driver.apply([WheelCommand::from_signed(10); 4]),
            Err(DriverError::Faulted {
                wheel: WheelId::FrontRight
            })
        ));
        driver.shutdown();
    }

    #[test]
    fn test_shutdown_releases_pins_low() {
        let (driver, sim) = start_sim();
        driver.apply([WheelCommand::from_signed(100); 4]).unwrap();
        thread::sleep(Duration::from_millis(30));
        driver.shutdown();
        driver.shutdown();

        assert!(!driver.is_running());
        for pin in PinMap::default().all_pins() {
            assert_eq!(sim.level(pin), Some(Level::Low));
            assert!(!sim.is_claimed(pin));
        }
    }
}
