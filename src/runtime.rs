// Tick loop wiring the robot state machine to its collaborators over zenoh
//
// Inputs are drained without blocking once per tick, the state machine is
// advanced, and its outputs plus a status report are published. Ctrl-C or a
// publish failure ends the loop, and the wheels are always stopped on the way out.

use std::mem;
use std::path::Path;
use std::time::Instant;

use serde::de::DeserializeOwned;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::brain::{Brain, Output, TickInput};
use crate::config::RuntimeConfig;
use crate::history::MovementHistoryEntry;
use crate::messages::{PresenceReport, RobotStatusReport, SpeechActivity};
use crate::motor::driver::WheelDriver;
use crate::motor::pins::{OutputPins, SimulatedPins, SysfsPins};
use crate::supervisor::MotionSupervisor;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where wheel pin writes go
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// In-memory pins, nothing is driven
    Sim,
    /// Linux sysfs GPIO
    Sysfs,
}

impl Backend {
    pub fn open(self, gpio_root: Option<&Path>) -> Box<dyn OutputPins> {
        match (self, gpio_root) {
            (Backend::Sim, _) => Box::new(SimulatedPins::new()),
            (Backend::Sysfs, Some(root)) => Box::new(SysfsPins::with_root(root)),
            (Backend::Sysfs, None) => Box::new(SysfsPins::new()),
        }
    }
}

/// Collects collaborator input between ticks and feeds it to the state machine
pub struct Runtime {
    brain: Brain,
    pending: TickInput,
    speech_busy: bool,
    history_feed: broadcast::Receiver<MovementHistoryEntry>,
}

impl Runtime {
    pub fn new(brain: Brain) -> Self {
        let history_feed = brain.supervisor().subscribe_history();
        Self {
            brain,
            pending: TickInput::default(),
            speech_busy: false,
            history_feed,
        }
    }

    fn on_utterance(&mut self, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        info!("Heard: {}", text);
        self.pending.utterances.push(text.to_string());
    }

    fn on_presence(&mut self, report: PresenceReport) {
        if report.person_detected {
            self.pending.person_seen = true;
        }
    }

    fn on_speech_activity(&mut self, activity: SpeechActivity) {
        self.speech_busy = activity.speaking;
    }

    fn on_reply(&mut self, text: String) {
        if self.pending.reply.replace(text).is_some() {
            debug!("Replacing an unspoken reply with a newer one");
        }
    }

    /// Advance the state machine with everything gathered since the last step
    fn step(&mut self, now: Instant) -> Vec<Output> {
        let mut input = mem::take(&mut self.pending);
        input.speech_busy = self.speech_busy;
        self.brain.tick(now, input)
    }

    /// Movement history entries finished since the last call
    fn finished_movements(&mut self) -> Vec<MovementHistoryEntry> {
        let mut entries = Vec::new();
        loop {
            match self.history_feed.try_recv() {
                Ok(entry) => entries.push(entry),
                Err(TryRecvError::Lagged(n)) => {
                    warn!("Movement history feed lagged, {} entries dropped", n)
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return entries,
            }
        }
    }

    fn report(&self, now: Instant) -> RobotStatusReport {
        self.brain.snapshot(now)
    }

    pub fn shutdown(&mut self) {
        self.brain.shutdown();
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8], topic: &str) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to parse message on {}: {}", topic, e);
            None
        }
    }
}

/// Start the wheels, connect to the collaborators and run until Ctrl-C
pub async fn run(config: RuntimeConfig, pins: Box<dyn OutputPins>) -> Result<(), BoxError> {
    config.validate()?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    let driver = WheelDriver::start(pins, config.pins.clone(), config.motion.pwm_hz)?;
    let supervisor = MotionSupervisor::new(driver, &config.motion)?;
    let brain = Brain::new(config.brain.clone(), supervisor, Instant::now());
    let mut runtime = Runtime::new(brain);

    let result = serve(&session, &config, &mut runtime).await;
    runtime.shutdown();
    if let Err(e) = session.close().await {
        warn!("Failed to close Zenoh session: {}", e);
    }
    result
}

async fn serve(
    session: &zenoh::Session,
    config: &RuntimeConfig,
    runtime: &mut Runtime,
) -> Result<(), BoxError> {
    let topics = &config.topics;

    info!("Setting up publishers and subscribers...");
    let sub_heard = session.declare_subscriber(topics.speech_heard.as_str()).await?;
    let sub_presence = session.declare_subscriber(topics.presence.as_str()).await?;
    let sub_busy = session.declare_subscriber(topics.speech_busy.as_str()).await?;
    let sub_reply = session.declare_subscriber(topics.chat_reply.as_str()).await?;

    let pub_say = session.declare_publisher(topics.speech_say.as_str()).await?;
    let pub_chat = session.declare_publisher(topics.chat_request.as_str()).await?;
    let pub_state = session.declare_publisher(topics.state.as_str()).await?;
    let pub_history = session.declare_publisher(topics.movement_history.as_str()).await?;
    let pub_conversation = session.declare_publisher(topics.conversation.as_str()).await?;

    let mut tick = interval(config.brain.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "Runtime started: {:.0}ms tick, {:.1}s movement watchdog",
        config.brain.tick_interval.as_secs_f64() * 1000.0,
        config.motion.watchdog_timeout.as_secs_f64()
    );
    info!(
        "Subscribed to: {}, {}, {}, {}",
        topics.speech_heard, topics.presence, topics.speech_busy, topics.chat_reply
    );
    info!(
        "Publishing to: {}, {}, {}, {}, {}",
        topics.speech_say,
        topics.chat_request,
        topics.state,
        topics.movement_history,
        topics.conversation
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res?;
                info!("Ctrl-C received, stopping");
                return Ok(());
            }
            _ = tick.tick() => {}
        }

        // 1. Drain everything that arrived since the last tick
        while let Ok(Some(sample)) = sub_heard.try_recv() {
            if let Some(text) = decode(&sample.payload().to_bytes(), &topics.speech_heard) {
                runtime.on_utterance(text);
            }
        }
        while let Ok(Some(sample)) = sub_presence.try_recv() {
            if let Some(report) = decode(&sample.payload().to_bytes(), &topics.presence) {
                runtime.on_presence(report);
            }
        }
        while let Ok(Some(sample)) = sub_busy.try_recv() {
            if let Some(activity) = decode(&sample.payload().to_bytes(), &topics.speech_busy) {
                runtime.on_speech_activity(activity);
            }
        }
        while let Ok(Some(sample)) = sub_reply.try_recv() {
            if let Some(text) = decode(&sample.payload().to_bytes(), &topics.chat_reply) {
                runtime.on_reply(text);
            }
        }

        // 2. Advance the state machine
        let now = Instant::now();
        for output in runtime.step(now) {
            match output {
                Output::Say(text) => pub_say.put(serde_json::to_string(&text)?).await?,
                Output::Converse(text) => pub_chat.put(serde_json::to_string(&text)?).await?,
                Output::ConversationEnded(record) => {
                    pub_conversation.put(serde_json::to_string(&record)?).await?
                }
            }
        }

        // 3. Forward finished movements to memory
        for entry in runtime.finished_movements() {
            pub_history.put(serde_json::to_string(&entry)?).await?;
        }

        // 4. Publish status
        let status_json = serde_json::to_string(&runtime.report(now))?;
        pub_state.put(status_json).await?;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::brain::RobotState;
    use crate::config::{BrainConfig, MotionConfig, PinMap};
    use crate::intent::Action;

    fn runtime() -> Runtime {
        let driver = WheelDriver::start(Backend::Sim.open(None), PinMap::default(), 100).unwrap();
        let supervisor = MotionSupervisor::new(driver, &MotionConfig::default()).unwrap();
        Runtime::new(Brain::new(BrainConfig::default(), supervisor, Instant::now()))
    }

    #[test]
    fn test_decode_text_and_reports() {
        let text: Option<String> = decode(br#""move forward""#, "heard");
        assert_eq!(text.as_deref(), Some("move forward"));

        let presence: Option<PresenceReport> = decode(br#"{"person_detected":true}"#, "presence");
        assert_eq!(presence, Some(PresenceReport { person_detected: true }));

        let bad: Option<SpeechActivity> = decode(b"not json", "busy");
        assert_eq!(bad, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inputs_are_consumed_by_step() {
        let mut rt = runtime();
        let t0 = Instant::now();

        rt.on_presence(PresenceReport { person_detected: true });
        rt.on_utterance("   ".to_string());
        assert!(rt.pending.utterances.is_empty());
        assert!(rt.step(t0).is_empty());
        assert_eq!(rt.brain.state(), RobotState::Engaging);
        assert!(!rt.pending.person_seen);

        // Greeting
        let out = rt.step(t0 + Duration::from_millis(100));
        assert_eq!(out.len(), 1);
        assert_eq!(rt.brain.state(), RobotState::Listening);

        rt.on_utterance("  move left ".to_string());
        let out = rt.step(t0 + Duration::from_millis(200));
        assert_eq!(out, vec![Output::Say("Moving left sideways at 50% speed".to_string())]);
        assert_eq!(rt.report(t0).movement.current_action, Some(Action::StrafeLeft));
        rt.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_speech_activity_is_sticky() {
        let mut rt = runtime();
        rt.on_speech_activity(SpeechActivity { speaking: true });
        rt.step(Instant::now());
        assert!(rt.speech_busy);
        rt.on_speech_activity(SpeechActivity { speaking: false });
        assert!(!rt.speech_busy);
        rt.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_latest_reply_wins() {
        let mut rt = runtime();
        rt.on_reply("first".to_string());
        rt.on_reply("second".to_string());
        assert_eq!(rt.pending.reply.as_deref(), Some("second"));
        rt.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_finished_movements_are_forwarded() {
        let mut rt = runtime();
        assert!(rt.finished_movements().is_empty());

        let supervisor = rt.brain.supervisor().clone();
        supervisor.begin(Action::Forward, 40).unwrap();
        supervisor.end();
        supervisor.begin(Action::TurnLeft, 40).unwrap();
        supervisor.emergency_stop();

        let actions: Vec<Action> = rt.finished_movements().iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![Action::Forward, Action::TurnLeft]);
        assert!(rt.finished_movements().is_empty());
        rt.shutdown();
    }
}
