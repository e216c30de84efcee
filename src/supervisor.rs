// Safety supervisor: owns the wheel driver and gates every movement
//
// One lock guards the movement status. Admission, timer arming, stopping and
// history appends all happen under it, so at most one movement (and one
// timer) is ever live and an emergency stop always wins a race with begin.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{
    APPROACH_DURATION, APPROACH_SPEED, MAX_MOVEMENT_TIMEOUT, MIN_MOVEMENT_TIMEOUT, MotionConfig,
    SPIN_DURATION, SPIN_SPEED_OFFSET,
};
use crate::history::{MovementHistory, MovementHistoryEntry, MovementOutcome};
use crate::intent::{Action, MotionIntent};
use crate::motor::driver::{DriverError, WheelCommand, WheelDriver, WheelId};
use crate::motor::kinematics::{self, DANCE_ROUTINE, DanceStep};

/// Buffered history entries per subscriber before it starts lagging
const HISTORY_FEED_CAPACITY: usize = 64;

/// Why a movement was not admitted. Display text is meant to be spoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("Cannot move - emergency stop active")]
    EmergencyActive,

    #[error("Cannot move - wheel {wheel} has a hardware fault")]
    HardwareFault { wheel: WheelId },

    #[error("Cannot move - shutting down")]
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Motion supervisor must be created inside a Tokio runtime")]
    NoRuntime,
}

/// Snapshot of the supervisor's movement state
#[derive(Debug, Clone, PartialEq)]
pub struct MovementStatus {
    pub is_moving: bool,
    pub current_action: Option<Action>,
    pub current_speed: u8,
    pub started_at: Option<Instant>,
    pub emergency_stop_active: bool,
    pub total_movements: u64,
    pub hardware_fault: Option<WheelId>,
    pub default_speed: u8,
    pub watchdog_timeout: Duration,
}

impl MovementStatus {
    /// Time since the current movement began
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// The requested duration elapsed
    Completed,
    Watchdog,
}

struct ActiveMovement {
    id: u64,
    action: Action,
    speed: u8,
    started_at: Instant,
    timer: JoinHandle<()>,
    routine: Option<JoinHandle<()>>,
}

impl ActiveMovement {
    fn cancel(&self) {
        self.timer.abort();
        if let Some(routine) = &self.routine {
            routine.abort();
        }
    }
}

struct MotionState {
    current: Option<ActiveMovement>,
    next_id: u64,
    total_movements: u64,
    emergency_active: bool,
    emergency_epoch: u64,
    history: MovementHistory,
    default_speed: u8,
    watchdog_timeout: Duration,
    shutting_down: bool,
}

struct Shared {
    driver: WheelDriver,
    max_safe_speed: u8,
    emergency_cooldown: Duration,
    state: Mutex<MotionState>,
    history_tx: broadcast::Sender<MovementHistoryEntry>,
    runtime: Handle,
}

/// Cheaply cloneable handle to the safety supervisor
#[derive(Clone)]
pub struct MotionSupervisor {
    shared: Arc<Shared>,
}

impl MotionSupervisor {
    /// Take ownership of a started driver. Timers run as Tokio tasks, so this
    /// must be called from within a runtime.
    pub fn new(driver: WheelDriver, config: &MotionConfig) -> Result<Self, SupervisorError> {
        let runtime = Handle::try_current().map_err(|_| SupervisorError::NoRuntime)?;
        let (history_tx, _) = broadcast::channel(HISTORY_FEED_CAPACITY);

        info!(
            "Motion supervisor ready: default {}%, max {}%, watchdog {:.1}s, cooldown {:.1}s",
            config.default_speed,
            config.max_safe_speed,
            config.watchdog_timeout.as_secs_f64(),
            config.emergency_cooldown.as_secs_f64()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                driver,
                max_safe_speed: config.max_safe_speed,
                emergency_cooldown: config.emergency_cooldown,
                state: Mutex::new(MotionState {
                    current: None,
                    next_id: 0,
                    total_movements: 0,
                    emergency_active: false,
                    emergency_epoch: 0,
                    history: MovementHistory::new(config.history_capacity),
                    default_speed: config.default_speed.min(config.max_safe_speed),
                    watchdog_timeout: config.watchdog_timeout,
                    shutting_down: false,
                }),
                history_tx,
                runtime,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MotionState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a movement that runs until stopped or the watchdog fires.
    ///
    /// Returns the effective speed after capping. Stop actions are routed to
    /// `end`/`emergency_stop` and report 0.
    pub fn begin(&self, action: Action, requested_speed: u8) -> Result<u8, Rejected> {
        match action {
            Action::Stop => {
                self.end();
                Ok(0)
            }
            Action::EmergencyStop => {
                self.emergency_stop();
                Ok(0)
            }
            Action::Dance => self.execute_routine(DANCE_ROUTINE.to_vec()),
            _ => {
                let mut state = self.lock();
                self.start_locked(&mut state, action, requested_speed, None)
            }
        }
    }

    /// Carry out a parsed intent and return the status line to speak
    pub fn execute(&self, intent: &MotionIntent) -> Result<String, Rejected> {
        let action = intent.action;
        match action {
            Action::Stop => return Ok(self.stop_all_safe()),
            Action::EmergencyStop => return Ok(self.emergency_stop()),
            Action::Dance => {
                self.execute_routine(DANCE_ROUTINE.to_vec())?;
                return Ok("Let me show you my moves! Starting dance mode!".to_string());
            }
            _ => {}
        }

        let mut state = self.lock();
        let default_speed = state.default_speed;
        match action {
            Action::SpinClockwise => {
                let requested = intent
                    .speed
                    .unwrap_or(default_speed.saturating_sub(SPIN_SPEED_OFFSET));
                let run_for = intent.duration.unwrap_or(SPIN_DURATION);
                let speed = self.start_locked(&mut state, action, requested, Some(run_for))?;
                Ok(format!(
                    "Spinning around at {}% speed for {} seconds",
                    speed,
                    format_secs(run_for)
                ))
            }
            Action::ComeHere => {
                let requested = intent.speed.map_or(APPROACH_SPEED, |s| s.min(APPROACH_SPEED));
                let run_for = intent.duration.unwrap_or(APPROACH_DURATION);
                self.start_locked(&mut state, action, requested, Some(run_for))?;
                Ok(format!(
                    "Coming to you at safe speed for {} seconds",
                    format_secs(run_for)
                ))
            }
            _ => {
                let requested = intent.speed.unwrap_or(default_speed);
                let speed = self.start_locked(&mut state, action, requested, intent.duration)?;
                let verb = movement_verb(action);
                Ok(match intent.duration {
                    Some(d) => format!("{} at {}% speed for {} seconds", verb, speed, format_secs(d)),
                    None => format!("{} at {}% speed", verb, speed),
                })
            }
        }
    }

    /// Admission check plus start, with the movement lock held.
    ///
    /// A movement already in flight is superseded: its timer is canceled and
    /// it is recorded before the new frame is applied.
    fn start_locked(
        &self,
        state: &mut MotionState,
        action: Action,
        requested_speed: u8,
        run_for: Option<Duration>,
    ) -> Result<u8, Rejected> {
        if state.shutting_down {
            return Err(Rejected::ShuttingDown);
        }
        if state.emergency_active {
            warn!("Emergency stop active! Refusing {}", action);
            return Err(Rejected::EmergencyActive);
        }
        if let Some(wheel) = self.shared.driver.fault() {
            warn!("Wheel {} faulted! Refusing {}", wheel, action);
            return Err(Rejected::HardwareFault { wheel });
        }

        if let Some(prior) = state.current.take() {
            prior.cancel();
            self.record_locked(state, &prior, MovementOutcome::Superseded);
        }

        let speed = requested_speed.min(self.shared.max_safe_speed);
        let frame = kinematics::decompose(action, speed).to_commands();
        if let Err(DriverError::Faulted { wheel }) = self.shared.driver.apply(frame) {
            return Err(Rejected::HardwareFault { wheel });
        }

        state.next_id += 1;
        state.total_movements += 1;
        let id = state.next_id;

        let limit = state.watchdog_timeout;
        let (delay, reason) = match run_for {
            Some(d) if d <= limit => (d, StopReason::Completed),
            _ => (limit, StopReason::Watchdog),
        };
        let timer = self.arm_timer(id, delay, reason);

        state.current = Some(ActiveMovement {
            id,
            action,
            speed,
            started_at: Instant::now(),
            timer,
            routine: None,
        });

        info!("Starting movement: {} at {}% speed", action, speed);
        Ok(speed)
    }

    fn arm_timer(&self, id: u64, delay: Duration, reason: StopReason) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        self.shared.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                MotionSupervisor { shared }.expire(id, reason);
            }
        })
    }

    /// Timer callback. Ignores timers left over from a finished movement.
    fn expire(&self, id: u64, reason: StopReason) {
        let mut state = self.lock();
        let movement = match state.current.take() {
            Some(m) if m.id == id => m,
            other => {
                debug!("Ignoring stale timer for movement {}", id);
                state.current = other;
                return;
            }
        };

        self.shared.driver.stop_all();
        let outcome = match reason {
            StopReason::Completed => MovementOutcome::Completed,
            StopReason::Watchdog => {
                warn!(
                    "Movement timeout after {:.1}s - auto stopping {}",
                    state.watchdog_timeout.as_secs_f64(),
                    movement.action
                );
                MovementOutcome::TimedOut
            }
        };
        movement.cancel();
        self.record_locked(&mut state, &movement, outcome);
    }

    fn record_locked(
        &self,
        state: &mut MotionState,
        movement: &ActiveMovement,
        outcome: MovementOutcome,
    ) {
        let duration = movement.started_at.elapsed();
        info!(
            "Completed movement: {} ({:.1}s, {:?})",
            movement.action,
            duration.as_secs_f64(),
            outcome
        );
        let entry = MovementHistoryEntry {
            action: movement.action,
            duration_secs: duration.as_secs_f64(),
            speed: movement.speed,
            outcome,
            recorded_at: SystemTime::now(),
        };
        state.history.push(entry.clone());
        // No subscribers is fine
        let _ = self.shared.history_tx.send(entry);
    }

    /// Run a scripted sequence of steps as one movement.
    ///
    /// One watchdog covers the whole routine from admission. Each step first
    /// checks that its movement is still the live one, so a stop, a newer
    /// command or the watchdog aborts it.
    pub fn execute_routine(&self, steps: Vec<DanceStep>) -> Result<u8, Rejected> {
        let mut state = self.lock();
        let first_speed = steps.first().map_or(0, |s| s.speed);
        let speed = self.start_locked(&mut state, Action::Dance, first_speed, None)?;
        let id = state.next_id;

        info!("Starting routine with {} steps", steps.len());
        let weak = Arc::downgrade(&self.shared);
        let routine = self.shared.runtime.spawn(async move {
            for step in steps {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let live = MotionSupervisor { shared }.advance_routine(id, &step);
                if !live {
                    return;
                }
                tokio::time::sleep(step.duration).await;
            }
            if let Some(shared) = weak.upgrade() {
                MotionSupervisor { shared }.expire(id, StopReason::Completed);
            }
        });

        if let Some(movement) = state.current.as_mut() {
            movement.routine = Some(routine);
        }
        Ok(speed)
    }

    fn advance_routine(&self, id: u64, step: &DanceStep) -> bool {
        let mut state = self.lock();
        let Some(movement) = state.current.as_mut().filter(|m| m.id == id) else {
            debug!("Routine for movement {} is no longer live", id);
            return false;
        };

        let speed = step.speed.min(self.shared.max_safe_speed);
        let frame = kinematics::decompose(step.action, speed).to_commands();
        if let Err(e) = self.shared.driver.apply(frame) {
            warn!("Routine step '{}' refused: {}", step.label, e);
            return false;
        }

        movement.speed = speed;
        info!("Routine step: {} ({} at {}%)", step.label, step.action, speed);
        true
    }

    /// Stop the current movement normally. Safe to call when idle.
    pub fn end(&self) {
        let mut state = self.lock();
        self.shared.driver.stop_all();
        if let Some(movement) = state.current.take() {
            movement.cancel();
            self.record_locked(&mut state, &movement, MovementOutcome::Completed);
        }
    }

    pub fn stop_all_safe(&self) -> String {
        self.end();
        "Stopping all movement".to_string()
    }

    /// Zero all wheels immediately and refuse new movement for the cooldown
    pub fn emergency_stop(&self) -> String {
        let mut state = self.lock();
        self.shared.driver.stop_all();
        if let Some(movement) = state.current.take() {
            movement.cancel();
            self.record_locked(&mut state, &movement, MovementOutcome::EmergencyStopped);
        }

        state.emergency_active = true;
        state.emergency_epoch += 1;
        let epoch = state.emergency_epoch;
        let cooldown = self.shared.emergency_cooldown;
        warn!(
            "Emergency stop activated! Movement disarmed for {:.1}s",
            cooldown.as_secs_f64()
        );

        let weak = Arc::downgrade(&self.shared);
        self.shared.runtime.spawn(async move {
            tokio::time::sleep(cooldown).await;
            if let Some(shared) = weak.upgrade() {
                MotionSupervisor { shared }.clear_emergency(epoch);
            }
        });

        "Emergency stop activated! All movement halted.".to_string()
    }

    fn clear_emergency(&self, epoch: u64) {
        let mut state = self.lock();
        // A later emergency stop owns the flag now
        if state.emergency_epoch == epoch && state.emergency_active {
            state.emergency_active = false;
            info!("Emergency stop cleared - ready to move");
        }
    }

    /// Current movement status.
    ///
    /// A movement cut short by a latched wheel fault is closed out here, since
    /// the driver has already zeroed every wheel.
    pub fn status(&self) -> MovementStatus {
        let mut state = self.lock();
        let hardware_fault = self.shared.driver.fault();
        if hardware_fault.is_some() {
            if let Some(movement) = state.current.take() {
                movement.cancel();
                self.record_locked(&mut state, &movement, MovementOutcome::Faulted);
            }
        }

        let current = state.current.as_ref();
        MovementStatus {
            is_moving: current.is_some(),
            current_action: current.map(|m| m.action),
            current_speed: current.map_or(0, |m| m.speed),
            started_at: current.map(|m| m.started_at),
            emergency_stop_active: state.emergency_active,
            total_movements: state.total_movements,
            hardware_fault,
            default_speed: state.default_speed,
            watchdog_timeout: state.watchdog_timeout,
        }
    }

    /// Change the default speed (capped) and the watchdog timeout (5..=30 s)
    pub fn set_preferences(&self, default_speed: u8, watchdog_timeout: Duration) {
        let mut state = self.lock();
        state.default_speed = default_speed.min(self.shared.max_safe_speed);
        state.watchdog_timeout = watchdog_timeout.clamp(MIN_MOVEMENT_TIMEOUT, MAX_MOVEMENT_TIMEOUT);
        info!(
            "Movement preferences updated: speed={}%, timeout={:.1}s",
            state.default_speed,
            state.watchdog_timeout.as_secs_f64()
        );
    }

    pub fn history(&self) -> Vec<MovementHistoryEntry> {
        self.lock().history.to_vec()
    }

    pub fn history_summary(&self) -> String {
        let state = self.lock();
        state.history.summary(state.total_movements)
    }

    /// Feed of every finished movement
    pub fn subscribe_history(&self) -> broadcast::Receiver<MovementHistoryEntry> {
        self.shared.history_tx.subscribe()
    }

    /// Duty frame currently applied by the driver
    pub fn wheel_commands(&self) -> [WheelCommand; 4] {
        self.shared.driver.snapshot()
    }

    /// Refuse further movement, stop the wheels and shut the driver down
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            if let Some(movement) = state.current.take() {
                movement.cancel();
                self.record_locked(&mut state, &movement, MovementOutcome::Completed);
            }
        }
        self.shared.driver.shutdown();
        info!("Motion supervisor shut down");
    }
}

fn movement_verb(action: Action) -> &'static str {
    match action {
        Action::Forward => "Moving forward",
        Action::Backward => "Moving backward",
        Action::TurnLeft => "Turning left",
        Action::TurnRight => "Turning right",
        Action::StrafeLeft => "Moving left sideways",
        Action::StrafeRight => "Moving right sideways",
        Action::DiagonalFL => "Moving diagonally forward-left",
        Action::DiagonalFR => "Moving diagonally forward-right",
        Action::SpinClockwise => "Spinning around",
        Action::ComeHere => "Coming to you",
        Action::Dance => "Dancing",
        Action::Stop | Action::EmergencyStop => "Stopping",
    }
}

/// "3" for whole seconds, "1.5" otherwise
fn format_secs(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{:.1}", duration.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PinMap;
    use crate::motor::pins::SimulatedPins;

    fn fast_config() -> MotionConfig {
        MotionConfig {
            watchdog_timeout: Duration::from_millis(300),
            emergency_cooldown: Duration::from_millis(200),
            ..MotionConfig::default()
        }
    }

    fn supervisor() -> (MotionSupervisor, SimulatedPins) {
        let sim = SimulatedPins::new();
        let driver = WheelDriver::start(Box::new(sim.clone()), PinMap::default(), 100).unwrap();
        (MotionSupervisor::new(driver, &fast_config()).unwrap(), sim)
    }

    fn signed(sup: &MotionSupervisor) -> [i16; 4] {
        sup.wheel_commands().map(|c| c.signed())
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_speed_is_capped() {
        let (sup, _) = supervisor();
        for requested in [0u8, 40, 70, 71, 100, 255] {
            let speed = sup.begin(Action::Forward, requested).unwrap();
            assert!(speed <= 70);
            assert_eq!(speed, requested.min(70));
            assert_eq!(sup.status().current_speed, speed);
        }
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_begin_applies_kinematics() {
        let (sup, _) = supervisor();
        sup.begin(Action::TurnLeft, 65).unwrap();
        assert_eq!(signed(&sup), [-65, 65, -65, 65]);
        let status = sup.status();
        assert!(status.is_moving);
        assert_eq!(status.current_action, Some(Action::TurnLeft));
        assert_eq!(status.total_movements, 1);
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_records_realized_duration() {
        let (sup, _) = supervisor();
        sup.begin(Action::Backward, 50).unwrap();
        sleep_ms(120).await;
        sup.end();

        let history = sup.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, Action::Backward);
        assert_eq!(history[0].outcome, MovementOutcome::Completed);
        assert!(history[0].duration_secs >= 0.12 && history[0].duration_secs < 0.25);
        assert!(!sup.status().is_moving);
        assert_eq!(signed(&sup), [0; 4]);
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watchdog_stops_unended_movement() {
        let (sup, sim) = supervisor();
        sup.begin(Action::StrafeRight, 50).unwrap();
        sleep_ms(200).await;
        assert!(sup.status().is_moving);

        sleep_ms(250).await;
        let status = sup.status();
        assert!(!status.is_moving);
        assert_eq!(signed(&sup), [0; 4]);
        let last = sup.history().pop().unwrap();
        assert_eq!(last.outcome, MovementOutcome::TimedOut);

        sleep_ms(30).await;
        let rising: u64 = PinMap::default().all_pins().iter().map(|&p| sim.rising_edges(p)).sum();
        sleep_ms(50).await;
        let later: u64 = PinMap::default().all_pins().iter().map(|&p| sim.rising_edges(p)).sum();
        assert_eq!(rising, later);
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_movement_completes() {
        let (sup, _) = supervisor();
        let intent = MotionIntent::new(Action::Forward).with_duration(Duration::from_millis(100));
        let message = sup.execute(&intent).unwrap();
        assert_eq!(message, "Moving forward at 50% speed for 0.1 seconds");

        sleep_ms(200).await;
        assert!(!sup.status().is_moving);
        let history = sup.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, MovementOutcome::Completed);
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_emergency_stop_blocks_until_cooldown() {
        let (sup, _) = supervisor();
        sup.begin(Action::Forward, 50).unwrap();

        let message = sup.emergency_stop();
        assert_eq!(message, "Emergency stop activated! All movement halted.");
        let status = sup.status();
        assert!(!status.is_moving);
        assert!(status.emergency_stop_active);
        assert_eq!(signed(&sup), [0; 4]);
        assert_eq!(sup.begin(Action::Forward, 50), Err(Rejected::EmergencyActive));
        assert_eq!(
            sup.history().pop().map(|e| e.outcome),
            Some(MovementOutcome::EmergencyStopped)
        );

        sleep_ms(300).await;
        assert!(!sup.status().emergency_stop_active);
        assert_eq!(sup.begin(Action::Forward, 50), Ok(50));
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_emergency_extends_cooldown() {
        let (sup, _) = supervisor();
        sup.emergency_stop();
        sleep_ms(150).await;
        sup.emergency_stop();
        sleep_ms(100).await;
        // First cooldown has elapsed but the second still holds
        assert!(sup.status().emergency_stop_active);
        sleep_ms(200).await;
        assert!(!sup.status().emergency_stop_active);
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_emergency_wins_race_with_begin() {
        let (sup, _) = supervisor();
        let racer = sup.clone();
        let begin = tokio::task::spawn_blocking(move || racer.begin(Action::Forward, 60));
        sup.emergency_stop();
        let _ = begin.await.unwrap();

        let status = sup.status();
        assert!(!status.is_moving);
        assert!(status.emergency_stop_active);
        assert_eq!(signed(&sup), [0; 4]);
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_movement_supersedes_current() {
        let (sup, _) = supervisor();
        sup.begin(Action::Forward, 50).unwrap();
        sup.begin(Action::TurnRight, 40).unwrap();

        let status = sup.status();
        assert_eq!(status.current_action, Some(Action::TurnRight));
        assert_eq!(status.total_movements, 2);
        let history = sup.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, MovementOutcome::Superseded);

        // The first movement's timer must not stop the second early
        sleep_ms(200).await;
        assert!(sup.status().is_moving);
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_twice_is_idempotent() {
        let (sup, _) = supervisor();
        sup.begin(Action::DiagonalFR, 50).unwrap();
        assert_eq!(sup.stop_all_safe(), "Stopping all movement");
        let once = sup.status();
        sup.stop_all_safe();
        let twice = sup.status();
        assert_eq!(once, twice);
        assert!(!twice.is_moving);
        assert_eq!(signed(&sup), [0; 4]);
        assert_eq!(sup.history().len(), 1);
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_action_defaults_and_messages() {
        let (sup, _) = supervisor();

        let spin = sup.execute(&MotionIntent::new(Action::SpinClockwise)).unwrap();
        assert_eq!(spin, "Spinning around at 40% speed for 2 seconds");

        let come = sup
            .execute(&MotionIntent::new(Action::ComeHere).with_speed(65))
            .unwrap();
        assert_eq!(come, "Coming to you at safe speed for 2 seconds");
        assert_eq!(sup.status().current_speed, 30);
        assert_eq!(signed(&sup), [30; 4]);

        let strafe = sup
            .execute(&MotionIntent::new(Action::StrafeLeft).with_speed(30))
            .unwrap();
        assert_eq!(strafe, "Moving left sideways at 30% speed");

        let fast = sup
            .execute(&MotionIntent::new(Action::Forward).with_speed(90))
            .unwrap();
        assert_eq!(fast, "Moving forward at 70% speed");

        let stop = sup.execute(&MotionIntent::new(Action::Stop)).unwrap();
        assert_eq!(stop, "Stopping all movement");
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_routine_runs_steps_then_stops() {
        let (sup, _) = supervisor();
        let steps = vec![
            DanceStep {
                label: "wiggle",
                action: Action::Forward,
                speed: 40,
                duration: Duration::from_millis(120),
            },
            DanceStep {
                label: "slide",
                action: Action::StrafeLeft,
                speed: 90,
                duration: Duration::from_millis(120),
            },
        ];
        assert_eq!(sup.execute_routine(steps), Ok(40));

        sleep_ms(60).await;
        assert_eq!(signed(&sup), [40; 4]);
        assert_eq!(sup.status().current_action, Some(Action::Dance));

        sleep_ms(120).await;
        // Step speed is capped too
        assert_eq!(signed(&sup), [-70, 70, 70, -70]);

        sleep_ms(200).await;
        assert!(!sup.status().is_moving);
        assert_eq!(signed(&sup), [0; 4]);
        let history = sup.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, Action::Dance);
        assert_eq!(history[0].outcome, MovementOutcome::Completed);
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watchdog_bounds_whole_routine() {
        let (sup, _) = supervisor();
        let actions = [Action::TurnLeft, Action::TurnRight, Action::Forward, Action::Backward];
        let steps: Vec<DanceStep> = actions
            .into_iter()
            .map(|action| DanceStep {
                label: "step",
                action,
                speed: 40,
                duration: Duration::from_millis(200),
            })
            .collect();
        sup.execute_routine(steps).unwrap();

        // Routine totals 800 ms against a 300 ms watchdog
        sleep_ms(450).await;
        let status = sup.status();
        assert!(!status.is_moving);
        assert_eq!(signed(&sup), [0; 4]);
        assert_eq!(
            sup.history().pop().map(|e| e.outcome),
            Some(MovementOutcome::TimedOut)
        );

        // Later steps must not restart the wheels
        sleep_ms(400).await;
        assert_eq!(signed(&sup), [0; 4]);
        assert!(!sup.status().is_moving);
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dance_begin_stops_within_watchdog() {
        let (sup, _) = supervisor();
        sup.begin(Action::Dance, 50).unwrap();
        sleep_ms(450).await;
        assert!(!sup.status().is_moving);
        assert_eq!(signed(&sup), [0; 4]);
        assert_eq!(
            sup.history().pop().map(|e| e.outcome),
            Some(MovementOutcome::TimedOut)
        );
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_aborts_routine() {
        let (sup, _) = supervisor();
        let steps = vec![
            DanceStep {
                label: "first",
                action: Action::TurnLeft,
                speed: 45,
                duration: Duration::from_millis(100),
            },
            DanceStep {
                label: "second",
                action: Action::TurnRight,
                speed: 45,
                duration: Duration::from_millis(100),
            },
        ];
        sup.execute_routine(steps).unwrap();
        sleep_ms(40).await;
        sup.end();

        sleep_ms(150).await;
        assert_eq!(signed(&sup), [0; 4]);
        assert!(!sup.status().is_moving);
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hardware_fault_rejects_admission() {
        let (sup, sim) = supervisor();
        let fr = PinMap::default().pins(WheelId::FrontRight);
        sup.begin(Action::Forward, 40).unwrap();
        sim.fail_pin(fr.forward);

        sleep_ms(100).await;
        let status = sup.status();
        assert_eq!(status.hardware_fault, Some(WheelId::FrontRight));
        assert!(!status.is_moving);
        assert_eq!(
            sup.history().pop().map(|e| e.outcome),
            Some(MovementOutcome::Faulted)
        );
        assert_eq!(
            sup.begin(Action::Forward, 40),
            Err(Rejected::HardwareFault {
                wheel: WheelId::FrontRight
            })
        );
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_preferences_are_clamped() {
        let (sup, _) = supervisor();
        sup.set_preferences(95, Duration::from_secs(60));
        let status = sup.status();
        assert_eq!(status.default_speed, 70);
        assert_eq!(status.watchdog_timeout, Duration::from_secs(30));

        sup.set_preferences(20, Duration::from_secs(1));
        let status = sup.status();
        assert_eq!(status.default_speed, 20);
        assert_eq!(status.watchdog_timeout, Duration::from_secs(5));

        let message = sup.execute(&MotionIntent::new(Action::Backward)).unwrap();
        assert_eq!(message, "Moving backward at 20% speed");
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_history_feed_and_summary() {
        let (sup, _) = supervisor();
        let mut feed = sup.subscribe_history();
        assert_eq!(sup.history_summary(), "No movement history yet");

        sup.begin(Action::TurnLeft, 50).unwrap();
        sup.end();
        let entry = feed.recv().await.unwrap();
        assert_eq!(entry.action, Action::TurnLeft);
        assert!(sup.history_summary().starts_with("Total movements: 1, Total time: "));
        assert!(sup.history_summary().ends_with("Favorite move: turning left, Recent moves: 1"));
        sup.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_refuses_movement() {
        let (sup, sim) = supervisor();
        sup.begin(Action::Forward, 50).unwrap();
        sup.shutdown();
        assert_eq!(sup.begin(Action::Forward, 50), Err(Rejected::ShuttingDown));
        for pin in PinMap::default().all_pins() {
            assert!(!sim.is_claimed(pin));
        }
    }

    #[test]
    fn test_requires_tokio_runtime() {
        let driver =
            WheelDriver::start(Box::new(SimulatedPins::new()), PinMap::default(), 100).unwrap();
        assert!(matches!(
            MotionSupervisor::new(driver, &MotionConfig::default()),
            Err(SupervisorError::NoRuntime)
        ));
    }
}
