// Digital output pin capability for the wheel driver
//
// The driver only needs to claim a fixed set of outputs, drive each one high
// or low, and release them again. Two backends:
// - SimulatedPins: in-memory levels with fault injection (tests, --backend sim)
// - SysfsPins: Linux /sys/class/gpio line control

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Pin identifier in whatever numbering the backend uses
pub type PinId = u16;

/// Default sysfs GPIO root
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Output level of a digital pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Error types for pin access
#[derive(Debug, thiserror::Error)]
pub enum PinError {
    #[error("GPIO I/O error on pin {pin}: {source}")]
    Io {
        pin: PinId,
        #[source]
        source: std::io::Error,
    },

    #[error("Pin {pin} has not been claimed")]
    NotClaimed { pin: PinId },

    #[error("Pin {pin} is unavailable")]
    Unavailable { pin: PinId },

    #[error("Write to pin {pin} failed")]
    WriteFailed { pin: PinId },
}

/// Capability to own and drive a set of digital outputs.
///
/// Implementations are moved into the wheel driver, which serializes access,
/// so `&mut self` is enough.
pub trait OutputPins: Send + 'static {
    /// Claim `pins` as outputs, initially low
    fn claim(&mut self, pins: &[PinId]) -> Result<(), PinError>;

    /// Drive a claimed pin to `level`
    fn write(&mut self, pin: PinId, level: Level) -> Result<(), PinError>;

    /// Give `pins` back to the system
    fn release(&mut self, pins: &[PinId]) -> Result<(), PinError>;
}

// === Simulated backend ===

#[derive(Debug, Default)]
struct SimState {
    claimed: HashSet<PinId>,
    levels: HashMap<PinId, Level>,
    rising_edges: HashMap<PinId, u64>,
    failing: HashSet<PinId>,
    refuse_claims: bool,
    writes: u64,
}

/// In-memory pins. Clones share state, so a test can keep one handle for
/// inspection while the driver owns another.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPins {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPins {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current level of a pin, `None` if it was never claimed
    pub fn level(&self, pin: PinId) -> Option<Level> {
        self.lock().levels.get(&pin).copied()
    }

    pub fn is_claimed(&self, pin: PinId) -> bool {
        self.lock().claimed.contains(&pin)
    }

    /// Number of low-to-high transitions seen on `pin`
    pub fn rising_edges(&self, pin: PinId) -> u64 {
        self.lock().rising_edges.get(&pin).copied().unwrap_or(0)
    }

    /// Total successful writes across all pins
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    /// Make every subsequent write to `pin` fail
    pub fn fail_pin(&self, pin: PinId) {
        self.lock().failing.insert(pin);
    }

    pub fn heal_pin(&self, pin: PinId) {
        self.lock().failing.remove(&pin);
    }

    /// Make every subsequent claim fail, as if the GPIO controller were gone
    pub fn refuse_claims(&self) {
        self.lock().refuse_claims = true;
    }
}

impl OutputPins for SimulatedPins {
    fn claim(&mut self, pins: &[PinId]) -> Result<(), PinError> {
        let mut state = self.lock();
        if state.refuse_claims {
            return Err(PinError::Unavailable {
                pin: pins.first().copied().unwrap_or_default(),
            });
        }
        for &pin in pins {
            state.claimed.insert(pin);
            state.levels.insert(pin, Level::Low);
        }
        Ok(())
    }

    fn write(&mut self, pin: PinId, level: Level) -> Result<(), PinError> {
        let mut state = self.lock();
        if !state.claimed.contains(&pin) {
            return Err(PinError::NotClaimed { pin });
        }
        if state.failing.contains(&pin) {
            return Err(PinError::WriteFailed { pin });
        }
        let previous = state.levels.insert(pin, level);
        if level == Level::High && previous != Some(Level::High) {
            *state.rising_edges.entry(pin).or_default() += 1;
        }
        state.writes += 1;
        Ok(())
    }

    fn release(&mut self, pins: &[PinId]) -> Result<(), PinError> {
        let mut state = self.lock();
        for pin in pins {
            state.claimed.remove(pin);
        }
        Ok(())
    }
}

// === sysfs backend ===

/// GPIO lines driven through the legacy sysfs interface
pub struct SysfsPins {
    root: PathBuf,
    values: HashMap<PinId, File>,
}

impl SysfsPins {
    pub fn new() -> Self {
        Self::with_root(SYSFS_GPIO_ROOT)
    }

    /// Use a different sysfs root (e.g. a mounted test tree)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            values: HashMap::new(),
        }
    }

    fn line_dir(&self, pin: PinId) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    fn write_file(path: &Path, pin: PinId, contents: &str) -> Result<(), PinError> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|source| PinError::Io { pin, source })?;
        file.write_all(contents.as_bytes())
            .map_err(|source| PinError::Io { pin, source })
    }
}

impl Default for SysfsPins {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputPins for SysfsPins {
    fn claim(&mut self, pins: &[PinId]) -> Result<(), PinError> {
        for &pin in pins {
            let dir = self.line_dir(pin);
            if !dir.exists() {
                debug!("Exporting GPIO {}", pin);
                Self::write_file(&self.root.join("export"), pin, &pin.to_string())?;
            }
            // "low" sets the direction to output with an initial low level
            Self::write_file(&dir.join("direction"), pin, "low")?;
            let value = OpenOptions::new()
                .write(true)
                .open(dir.join("value"))
                .map_err(|source| PinError::Io { pin, source })?;
            self.values.insert(pin, value);
        }
        Ok(())
    }

    fn write(&mut self, pin: PinId, level: Level) -> Result<(), PinError> {
        let file = self
            .values
            .get_mut(&pin)
            .ok_or(PinError::NotClaimed { pin })?;
        let byte: &[u8] = match level {
            Level::High => b"1",
            Level::Low => b"0",
        };
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(byte))
            .map_err(|source| PinError::Io { pin, source })
    }

    fn release(&mut self, pins: &[PinId]) -> Result<(), PinError> {
        for &pin in pins {
            if self.values.remove(&pin).is_some() {
                Self::write_file(&self.root.join("unexport"), pin, &pin.to_string())?;
            }
        }
        Ok(())
    }
}
