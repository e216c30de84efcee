// Omni-wheel kinematics for the four-wheel base
// Maps a motion intent, or a body-frame velocity, to signed wheel speeds in -100..=100.
//
// Wheel layout (top view, front up):
//
//   FL  FR
//   BL  BR
//
// Body velocity convention: vx positive = forward, vy positive = left,
// omega positive = counter-clockwise.

use std::time::Duration;

use super::driver::{WheelCommand, WheelId};
use crate::intent::Action;

/// Largest magnitude a wheel can be commanded
pub const MAX_WHEEL_SPEED: f32 = 100.0;

/// Signed speed per wheel (percent, positive = forward)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WheelSpeeds {
    pub front_left: i16,
    pub front_right: i16,
    pub back_left: i16,
    pub back_right: i16,
}

impl WheelSpeeds {
    pub fn new(front_left: i16, front_right: i16, back_left: i16, back_right: i16) -> Self {
        Self {
            front_left,
            front_right,
            back_left,
            back_right,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns speeds in `WheelId::ALL` order [FL, FR, BL, BR]
    pub fn as_array(&self) -> [i16; 4] {
        [
            self.front_left,
            self.front_right,
            self.back_left,
            self.back_right,
        ]
    }

    pub fn get(&self, wheel: WheelId) -> i16 {
        self.as_array()[wheel.index()]
    }

    /// Duty commands for the wheel driver
    pub fn to_commands(&self) -> [WheelCommand; 4] {
        self.as_array().map(WheelCommand::from_signed)
    }
}

/// Wheel speeds for a named action at `speed` percent.
///
/// `Stop`, `EmergencyStop` and `Dance` map to all-zero: a dance is a sequence
/// of other actions (see [`DANCE_ROUTINE`]), not a single wheel frame.
pub fn decompose(action: Action, speed: u8) -> WheelSpeeds {
    let s = i16::from(speed.min(100));
    match action {
        Action::Forward | Action::ComeHere => WheelSpeeds::new(s, s, s, s),
        Action::Backward => WheelSpeeds::new(-s, -s, -s, -s),
        // Tank turns: left and right sides opposite
        Action::TurnLeft => WheelSpeeds::new(-s, s, -s, s),
        Action::TurnRight | Action::SpinClockwise => WheelSpeeds::new(s, -s, s, -s),
        // Crab motion: diagonal pairs opposite
        Action::StrafeLeft => WheelSpeeds::new(-s, s, s, -s),
        Action::StrafeRight => WheelSpeeds::new(s, -s, -s, s),
        Action::DiagonalFL => WheelSpeeds::new(0, s, s, 0),
        Action::DiagonalFR => WheelSpeeds::new(s, 0, 0, s),
        Action::Dance | Action::Stop | Action::EmergencyStop => WheelSpeeds::zero(),
    }
}

/// Convert a body-frame velocity (each component in -100..=100) to wheel speeds
///
/// If any wheel would exceed [`MAX_WHEEL_SPEED`], all four are scaled down by
/// the same factor so the heading is preserved.
pub fn body_to_wheels(vx: f32, vy: f32, omega: f32) -> WheelSpeeds {
    let mut wheels = [
        vx - vy - omega, // FL
        vx + vy + omega, // FR
        vx + vy - omega, // BL
        vx - vy + omega, // BR
    ];

    let max_computed = wheels.iter().map(|w| w.abs()).fold(0.0f32, f32::max);
    if max_computed > MAX_WHEEL_SPEED {
        let scale = MAX_WHEEL_SPEED / max_computed;
        for w in &mut wheels {
            *w *= scale;
        }
    }

    let [fl, fr, bl, br] = wheels.map(|w| w.round().clamp(-MAX_WHEEL_SPEED, MAX_WHEEL_SPEED) as i16);
    WheelSpeeds::new(fl, fr, bl, br)
}

/// One step of a scripted gait sequence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DanceStep {
    pub label: &'static str,
    pub action: Action,
    pub speed: u8,
    pub duration: Duration,
}

const fn step(label: &'static str, action: Action, speed: u8, millis: u64) -> DanceStep {
    DanceStep {
        label,
        action,
        speed,
        duration: Duration::from_millis(millis),
    }
}

/// The dance routine, run in order
pub const DANCE_ROUTINE: [DanceStep; 8] = [
    step("forward wiggle", Action::Forward, 40, 1000),
    step("backward wiggle", Action::Backward, 40, 1000),
    step("left slide", Action::StrafeLeft, 35, 1500),
    step("right slide", Action::StrafeRight, 35, 1500),
    step("spin left", Action::TurnLeft, 45, 2000),
    step("spin right", Action::TurnRight, 45, 2000),
    step("diagonal move", Action::DiagonalFL, 30, 1000),
    step("final spin", Action::SpinClockwise, 50, 3000),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_backward_are_uniform() {
        assert_eq!(decompose(Action::Forward, 50), WheelSpeeds::new(50, 50, 50, 50));
        assert_eq!(
            decompose(Action::Backward, 30),
            WheelSpeeds::new(-30, -30, -30, -30)
        );
    }

    #[test]
    fn test_turn_left_fast() {
        // "turn left quickly" resolves to the fast class
        let wheels = decompose(Action::TurnLeft, 65);
        assert_eq!(wheels.as_array(), [-65, 65, -65, 65]);
    }

    #[test]
    fn test_strafe_left() {
        let wheels = decompose(Action::StrafeLeft, 50);
        assert_eq!(wheels.get(WheelId::FrontLeft), -50);
        assert_eq!(wheels.get(WheelId::FrontRight), 50);
        assert_eq!(wheels.get(WheelId::BackLeft), 50);
        assert_eq!(wheels.get(WheelId::BackRight), -50);
    }

    #[test]
    fn test_spin_matches_turn_right() {
        assert_eq!(
            decompose(Action::SpinClockwise, 40),
            decompose(Action::TurnRight, 40)
        );
    }

    #[test]
    fn test_diagonals_drive_two_wheels() {
        assert_eq!(decompose(Action::DiagonalFL, 30).as_array(), [0, 30, 30, 0]);
        assert_eq!(decompose(Action::DiagonalFR, 30).as_array(), [30, 0, 0, 30]);
    }

    #[test]
    fn test_stop_like_actions_are_zero() {
        for action in [Action::Stop, Action::EmergencyStop, Action::Dance] {
            assert_eq!(decompose(action, 70), WheelSpeeds::zero());
        }
    }

    #[test]
    fn test_decompose_stays_in_range() {
        for speed in [0u8, 1, 50, 100, 255] {
            for action in [
                Action::Forward,
                Action::TurnRight,
                Action::StrafeRight,
                Action::DiagonalFR,
            ] {
                assert!(decompose(action, speed)
                    .as_array()
                    .iter()
                    .all(|w| (-100..=100).contains(w)));
            }
        }
    }

    #[test]
    fn test_body_velocity_matches_named_gaits() {
        assert_eq!(body_to_wheels(0.0, 50.0, 0.0), decompose(Action::StrafeLeft, 50));
        assert_eq!(body_to_wheels(0.0, 0.0, 40.0), decompose(Action::TurnLeft, 40));
        assert_eq!(body_to_wheels(25.0, 0.0, 0.0), decompose(Action::Forward, 25));
    }

    #[test]
    fn test_body_velocity_scales_proportionally() {
        // Unscaled: FL=-20, FR=180, BL=100, BR=60
        let wheels = body_to_wheels(80.0, 60.0, 40.0);
        assert_eq!(wheels.as_array(), [-11, 100, 56, 33]);
        // Ratios survive: FR/BL = 180/100
        let ratio = f32::from(wheels.front_right) / f32::from(wheels.back_left);
        assert!((ratio - 1.8).abs() < 0.05);
    }

    #[test]
    fn test_body_velocity_zero() {
        assert_eq!(body_to_wheels(0.0, 0.0, 0.0), WheelSpeeds::zero());
    }

    #[test]
    fn test_to_commands_keep_direction() {
        let commands = decompose(Action::StrafeRight, 35).to_commands();
        assert_eq!(commands[WheelId::FrontLeft.index()].forward_duty(), 35);
        assert_eq!(commands[WheelId::FrontRight.index()].reverse_duty(), 35);
    }

    #[test]
    fn test_dance_routine_shape() {
        let total: Duration = DANCE_ROUTINE.iter().map(|s| s.duration).sum();
        assert_eq!(total, Duration::from_millis(13_000));
        assert!(DANCE_ROUTINE.iter().all(|s| !s.action.is_stop() && s.action != Action::Dance));
    }
}
