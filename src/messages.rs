// Message types exchanged with the speech, vision, chat and memory collaborators
//
// Text topics (heard, say, chat request/reply) carry a bare JSON string.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::brain::RobotState;
use crate::intent::Action;
use crate::motor::driver::WheelId;
use crate::supervisor::MovementStatus;

/// Person detection from vision -> runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceReport {
    pub person_detected: bool,
}

/// TTS playback activity from speech -> runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechActivity {
    pub speaking: bool,
}

/// Movement part of the status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementStatusReport {
    pub is_moving: bool,
    pub current_action: Option<Action>,
    pub current_speed: u8,
    /// Seconds since the current movement began
    pub movement_secs: Option<f64>,
    pub emergency_stop_active: bool,
    pub total_movements: u64,
    pub hardware_fault: bool,
    pub faulted_wheel: Option<WheelId>,
}

impl From<&MovementStatus> for MovementStatusReport {
    fn from(status: &MovementStatus) -> Self {
        Self {
            is_moving: status.is_moving,
            current_action: status.current_action,
            current_speed: status.current_speed,
            movement_secs: status.elapsed().map(|d| d.as_secs_f64()),
            emergency_stop_active: status.emergency_stop_active,
            total_movements: status.total_movements,
            hardware_fault: status.hardware_fault.is_some(),
            faulted_wheel: status.hardware_fault,
        }
    }
}

/// Status published by the runtime every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotStatusReport {
    pub state: RobotState,
    pub person_present: bool,
    pub conversation_active: bool,
    pub movement: MovementStatusReport,
    pub history_summary: String,
    pub command_summary: String,
}

/// A movement utterance heard during a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementCommandRecord {
    pub command: String,
    pub action: Action,
    pub success: bool,
    pub recorded_at: SystemTime,
}

/// Published to the memory collaborator when a conversation ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub started_at: SystemTime,
    pub duration_secs: f64,
    pub utterances: usize,
    pub movement_commands: Vec<MovementCommandRecord>,
}
