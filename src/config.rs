// Timeouts, speeds, pin wiring and zenoh topics
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motor::driver::WheelId;
use crate::motor::pins::PinId;

// Wheel driver
pub const PWM_HZ: u32 = 100;
/// Consecutive failed PWM cycles on one wheel before the driver latches a fault
pub const PIN_FAILURE_LIMIT: u32 = 3;

// Motion safety
pub const DEFAULT_SPEED: u8 = 50;
pub const MAX_SAFE_SPEED: u8 = 70;
pub const MOVEMENT_TIMEOUT: Duration = Duration::from_secs(10);
pub const EMERGENCY_COOLDOWN: Duration = Duration::from_secs(2);
pub const MIN_MOVEMENT_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_MOVEMENT_TIMEOUT: Duration = Duration::from_secs(30);
pub const HISTORY_CAPACITY: usize = 50;

// Per-action defaults
pub const SPIN_SPEED_OFFSET: u8 = 10;
pub const SPIN_DURATION: Duration = Duration::from_secs(2);
pub const APPROACH_SPEED: u8 = 30;
pub const APPROACH_DURATION: Duration = Duration::from_secs(2);

// Spoken speed classes
pub const SLOW_SPEED: u8 = 30;
pub const NORMAL_SPEED: u8 = 50;
pub const FAST_SPEED: u8 = 65;
pub const COMMAND_LOG_CAPACITY: usize = 20;

// Robot state machine
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);
pub const GREETING_COOLDOWN: Duration = Duration::from_secs(3);
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(10);
pub const SPEECH_TIMEOUT: Duration = Duration::from_secs(15);
pub const THINKING_TIMEOUT: Duration = Duration::from_secs(5);
pub const LEARNING_DELAY: Duration = Duration::from_secs(3);

// Zenoh topics
pub const TOPIC_SPEECH_HEARD: &str = "ellee/speech/heard"; // utterances in
pub const TOPIC_PRESENCE: &str = "ellee/vision/presence"; // person detection
pub const TOPIC_SPEECH_BUSY: &str = "ellee/speech/busy"; // TTS activity
pub const TOPIC_CHAT_REPLY: &str = "ellee/chat/reply"; // conversational replies
pub const TOPIC_SPEECH_SAY: &str = "ellee/speech/say"; // text to vocalize
pub const TOPIC_CHAT_REQUEST: &str = "ellee/chat/request"; // non-movement utterances
pub const TOPIC_STATE: &str = "ellee/state/robot"; // status report
pub const TOPIC_MOVEMENT_HISTORY: &str = "ellee/memory/movement";
pub const TOPIC_CONVERSATION: &str = "ellee/memory/conversation";

/// Errors from loading or validating the runtime configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Pin {pin} is assigned more than once")]
    DuplicatePin { pin: PinId },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Durations as fractional seconds in the config file
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Forward and reverse output pins of one wheel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelPins {
    pub forward: PinId,
    pub reverse: PinId,
}

/// Pin assignment for all four wheels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinMap {
    pub front_left: WheelPins,
    pub front_right: WheelPins,
    pub back_left: WheelPins,
    pub back_right: WheelPins,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            front_left: WheelPins { forward: 11, reverse: 13 },
            front_right: WheelPins { forward: 15, reverse: 16 },
            back_left: WheelPins { forward: 29, reverse: 31 },
            back_right: WheelPins { forward: 18, reverse: 22 },
        }
    }
}

impl PinMap {
    pub fn pins(&self, wheel: WheelId) -> WheelPins {
        match wheel {
            WheelId::FrontLeft => self.front_left,
            WheelId::FrontRight => self.front_right,
            WheelId::BackLeft => self.back_left,
            WheelId::BackRight => self.back_right,
        }
    }

    /// Every mapped pin, forward before reverse, in wheel order
    pub fn all_pins(&self) -> Vec<PinId> {
        WheelId::ALL
            .iter()
            .flat_map(|&w| {
                let p = self.pins(w);
                [p.forward, p.reverse]
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub pwm_hz: u32,
    pub default_speed: u8,
    pub max_safe_speed: u8,
    #[serde(with = "seconds")]
    pub watchdog_timeout: Duration,
    #[serde(with = "seconds")]
    pub emergency_cooldown: Duration,
    pub history_capacity: usize,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            pwm_hz: PWM_HZ,
            default_speed: DEFAULT_SPEED,
            max_safe_speed: MAX_SAFE_SPEED,
            watchdog_timeout: MOVEMENT_TIMEOUT,
            emergency_cooldown: EMERGENCY_COOLDOWN,
            history_capacity: HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    #[serde(with = "seconds")]
    pub tick_interval: Duration,
    #[serde(with = "seconds")]
    pub greeting_cooldown: Duration,
    #[serde(with = "seconds")]
    pub presence_timeout: Duration,
    #[serde(with = "seconds")]
    pub speech_timeout: Duration,
    #[serde(with = "seconds")]
    pub thinking_timeout: Duration,
    #[serde(with = "seconds")]
    pub learning_delay: Duration,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            tick_interval: TICK_INTERVAL,
            greeting_cooldown: GREETING_COOLDOWN,
            presence_timeout: PRESENCE_TIMEOUT,
            speech_timeout: SPEECH_TIMEOUT,
            thinking_timeout: THINKING_TIMEOUT,
            learning_delay: LEARNING_DELAY,
        }
    }
}

/// Key expressions for every collaborator topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub speech_heard: String,
    pub presence: String,
    pub speech_busy: String,
    pub chat_reply: String,
    pub speech_say: String,
    pub chat_request: String,
    pub state: String,
    pub movement_history: String,
    pub conversation: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            speech_heard: TOPIC_SPEECH_HEARD.into(),
            presence: TOPIC_PRESENCE.into(),
            speech_busy: TOPIC_SPEECH_BUSY.into(),
            chat_reply: TOPIC_CHAT_REPLY.into(),
            speech_say: TOPIC_SPEECH_SAY.into(),
            chat_request: TOPIC_CHAT_REQUEST.into(),
            state: TOPIC_STATE.into(),
            movement_history: TOPIC_MOVEMENT_HISTORY.into(),
            conversation: TOPIC_CONVERSATION.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub motion: MotionConfig,
    pub brain: BrainConfig,
    pub pins: PinMap,
    pub topics: Topics,
}

impl RuntimeConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RuntimeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for pin in self.pins.all_pins() {
            if !seen.insert(pin) {
                return Err(ConfigError::DuplicatePin { pin });
            }
        }

        let motion = &self.motion;
        if motion.max_safe_speed > 100 {
            return Err(ConfigError::Invalid(format!(
                "max_safe_speed {} exceeds 100",
                motion.max_safe_speed
            )));
        }
        if motion.default_speed > motion.max_safe_speed {
            return Err(ConfigError::Invalid(format!(
                "default_speed {} exceeds max_safe_speed {}",
                motion.default_speed, motion.max_safe_speed
            )));
        }
        if motion.pwm_hz == 0 {
            return Err(ConfigError::Invalid("pwm_hz must be positive".into()));
        }
        if motion.watchdog_timeout.is_zero() {
            return Err(ConfigError::Invalid("watchdog_timeout must be positive".into()));
        }
        if self.brain.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick_interval must be positive".into()));
        }
        Ok(())
    }
}
