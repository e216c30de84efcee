// Motion intents produced by the command interpreter and consumed by the supervisor

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the robot has been asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Forward,
    Backward,
    TurnLeft,
    TurnRight,
    StrafeLeft,
    StrafeRight,
    SpinClockwise,
    #[serde(rename = "diagonal_fl")]
    DiagonalFL,
    #[serde(rename = "diagonal_fr")]
    DiagonalFR,
    Dance,
    ComeHere,
    Stop,
    EmergencyStop,
}

impl Action {
    /// Stop and emergency stop bypass normal movement handling
    pub fn is_stop(self) -> bool {
        matches!(self, Action::Stop | Action::EmergencyStop)
    }

    /// Short present-participle phrase used in logs, history and speech
    pub fn describe(self) -> &'static str {
        match self {
            Action::Forward => "moving forward",
            Action::Backward => "moving backward",
            Action::TurnLeft => "turning left",
            Action::TurnRight => "turning right",
            Action::StrafeLeft => "strafing left",
            Action::StrafeRight => "strafing right",
            Action::SpinClockwise => "spinning around",
            Action::DiagonalFL => "moving diagonally forward-left",
            Action::DiagonalFR => "moving diagonally forward-right",
            Action::Dance => "dancing",
            Action::ComeHere => "coming to you",
            Action::Stop => "stopping",
            Action::EmergencyStop => "emergency stopping",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// An action plus the optional modifiers heard with it.
/// Missing modifiers fall back to the supervisor's defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionIntent {
    pub action: Action,
    pub speed: Option<u8>,
    pub duration: Option<Duration>,
}

impl MotionIntent {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            speed: None,
            duration: None,
        }
    }

    pub fn with_speed(mut self, speed: u8) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}
