// Motor control for the four-wheel omni base
//
// Provides:
// - Digital output pin capability (simulated and sysfs backends)
// - Software PWM wheel driver with a dedicated timing thread
// - Omni-wheel kinematics (named gaits and body velocity -> wheel speeds)

pub mod driver;
pub mod kinematics;
pub mod pins;
pub mod pwm;

pub use driver::{DriverError, WheelCommand, WheelDriver, WheelId};
pub use kinematics::{DANCE_ROUTINE, DanceStep, WheelSpeeds, body_to_wheels, decompose};
pub use pins::{Level, OutputPins, PinError, PinId, SimulatedPins, SysfsPins};
