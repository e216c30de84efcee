// Robot state machine: arbitrates between conversation and movement
//
// Owned by a single task and advanced by `tick` at a fixed interval. Inputs
// collected since the previous tick arrive in a `TickInput`; everything the
// robot wants said, forwarded or persisted comes back as `Output`s.

use std::fmt;
use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::{CommandInterpreter, CommandLog};
use crate::config::BrainConfig;
use crate::intent::MotionIntent;
use crate::messages::{
    ConversationRecord, MovementCommandRecord, MovementStatusReport, RobotStatusReport,
};
use crate::supervisor::MotionSupervisor;

const GREETING: &str = "Hello! I'm Ellee, your smart electronics assistant robot. \
    I can help with projects and components, and I can move around too - \
    just ask me to move forward, turn, or even dance!";

const GOODBYES: &[&str] = &[
    "Thanks for the great conversation! Feel free to come back anytime for more electronics help!",
    "See you later! I'll be here whenever you need electronics assistance!",
    "Goodbye! Come back soon - I love talking about electronics and helping with projects!",
    "Take care! I'm always ready to help with your next electronics adventure!",
];

const PROMPTS: &[&str] = &[
    "Is there anything else you'd like to know about electronics?",
    "Feel free to ask me more questions or show me your components!",
    "Want to try some movement commands? Just say 'move forward' or 'dance'!",
    "Would you like to work on a project or learn about specific components?",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotState {
    Idle,
    Engaging,
    Listening,
    Thinking,
    Speaking,
    Moving,
    Learning,
}

impl RobotState {
    pub fn as_str(self) -> &'static str {
        match self {
            RobotState::Idle => "idle",
            RobotState::Engaging => "engaging",
            RobotState::Listening => "listening",
            RobotState::Thinking => "thinking",
            RobotState::Speaking => "speaking",
            RobotState::Moving => "moving",
            RobotState::Learning => "learning",
        }
    }
}

impl fmt::Display for RobotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything observed since the previous tick
#[derive(Debug, Clone, Default)]
pub struct TickInput {
    /// A person was detected at least once
    pub person_seen: bool,
    pub utterances: Vec<String>,
    /// Conversational reply to vocalize
    pub reply: Option<String>,
    /// Latest TTS activity
    pub speech_busy: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Text for the speech collaborator to vocalize
    Say(String),
    /// Non-movement utterance for the conversational collaborator
    Converse(String),
    ConversationEnded(ConversationRecord),
}

struct Conversation {
    started_at: SystemTime,
    started: Instant,
    utterances: usize,
    movement_commands: Vec<MovementCommandRecord>,
}

pub struct Brain {
    config: BrainConfig,
    supervisor: MotionSupervisor,
    interpreter: CommandInterpreter,
    commands: CommandLog,
    state: RobotState,
    state_since: Instant,
    last_seen: Option<Instant>,
    last_greeting: Option<Instant>,
    last_speech: Instant,
    conversation: Option<Conversation>,
    goodbye_index: usize,
    prompt_index: usize,
    stopped: bool,
}

impl Brain {
    pub fn new(config: BrainConfig, supervisor: MotionSupervisor, now: Instant) -> Self {
        Self {
            config,
            supervisor,
            interpreter: CommandInterpreter::new(),
            commands: CommandLog::default(),
            state: RobotState::Idle,
            state_since: now,
            last_seen: None,
            last_greeting: None,
            last_speech: now,
            conversation: None,
            goodbye_index: 0,
            prompt_index: 0,
            stopped: false,
        }
    }

    pub fn state(&self) -> RobotState {
        self.state
    }

    pub fn supervisor(&self) -> &MotionSupervisor {
        &self.supervisor
    }

    pub fn commands(&self) -> &CommandLog {
        &self.commands
    }

    /// Person counts as present while a detection was seen within the presence timeout
    pub fn is_present(&self, now: Instant) -> bool {
        self.last_seen
            .is_some_and(|t| now.saturating_duration_since(t) <= self.config.presence_timeout)
    }

    pub fn tick(&mut self, now: Instant, input: TickInput) -> Vec<Output> {
        let mut out = Vec::new();
        if self.stopped {
            return out;
        }

        if input.person_seen {
            self.last_seen = Some(now);
        }
        let present = self.is_present(now);

        if let Some(reply) = input.reply {
            match self.state {
                RobotState::Idle | RobotState::Engaging => {
                    debug!("Dropping reply outside a conversation")
                }
                _ => self.say(now, reply, &mut out),
            }
        }

        self.advance(now, present, input.speech_busy, &mut out);

        let heard = !input.utterances.is_empty();
        for text in &input.utterances {
            self.hear(now, text, &mut out);
        }

        if !heard
            && self.state == RobotState::Listening
            && now.saturating_duration_since(self.last_speech) > self.config.speech_timeout
        {
            let prompt = PROMPTS[self.prompt_index % PROMPTS.len()];
            self.prompt_index += 1;
            self.last_speech = now;
            out.push(Output::Say(prompt.to_string()));
        }

        out
    }

    /// Transitions driven by presence, timers and collaborator activity
    fn advance(&mut self, now: Instant, present: bool, speech_busy: bool, out: &mut Vec<Output>) {
        let in_state = now.saturating_duration_since(self.state_since);
        match self.state {
            RobotState::Idle => {
                if present {
                    self.start_conversation(now);
                    let cooled = self.last_greeting.is_none_or(|t| {
                        now.saturating_duration_since(t) >= self.config.greeting_cooldown
                    });
                    if cooled {
                        self.last_greeting = Some(now);
                        self.transition(now, RobotState::Engaging);
                    } else {
                        self.transition(now, RobotState::Listening);
                    }
                }
            }
            RobotState::Engaging => {
                if present {
                    out.push(Output::Say(GREETING.to_string()));
                    self.last_speech = now;
                    self.transition(now, RobotState::Listening);
                } else {
                    self.conversation = None;
                    self.transition(now, RobotState::Idle);
                }
            }
            RobotState::Listening => {
                if !present {
                    self.person_left(now, out);
                }
            }
            RobotState::Thinking => {
                if in_state > self.config.thinking_timeout {
                    info!("No reply after {:.1}s", in_state.as_secs_f64());
                    self.resume(now, present, out);
                }
            }
            RobotState::Speaking => {
                if !speech_busy && in_state >= self.config.tick_interval {
                    self.resume(now, present, out);
                }
            }
            RobotState::Moving => {
                if !self.supervisor.status().is_moving {
                    self.resume(now, present, out);
                }
            }
            RobotState::Learning => {
                if in_state >= self.config.learning_delay {
                    self.resume(now, present, out);
                }
            }
        }
    }

    fn hear(&mut self, now: Instant, text: &str, out: &mut Vec<Output>) {
        self.last_speech = now;
        if let Some(conversation) = self.conversation.as_mut() {
            conversation.utterances += 1;
        }

        match (self.state, self.interpreter.parse(text)) {
            (RobotState::Listening | RobotState::Speaking, Some(intent)) => {
                self.run_movement(now, text, intent, out)
            }
            (RobotState::Listening | RobotState::Speaking, None) => {
                out.push(Output::Converse(text.to_string()));
                self.transition(now, RobotState::Thinking);
            }
            // Stop phrases are honored in every state
            (_, Some(intent)) if intent.action.is_stop() => self.run_movement(now, text, intent, out),
            // Speech and movement may overlap
            (RobotState::Moving, None) => out.push(Output::Converse(text.to_string())),
            (state, _) => info!("Ignoring '{}' while {}", text, state),
        }
    }

    fn run_movement(&mut self, now: Instant, text: &str, intent: MotionIntent, out: &mut Vec<Output>) {
        let result = self.supervisor.execute(&intent);
        let success = result.is_ok();
        self.commands.record(text, success.then_some(intent.action));
        if let Some(conversation) = self.conversation.as_mut() {
            conversation.movement_commands.push(MovementCommandRecord {
                command: text.trim().to_string(),
                action: intent.action,
                success,
                recorded_at: SystemTime::now(),
            });
        }

        match result {
            // Nobody to hear it
            Ok(message) if intent.action.is_stop() && self.state == RobotState::Idle => {
                info!("{}", message)
            }
            Ok(message) if intent.action.is_stop() => self.say(now, message, out),
            Ok(message) => {
                self.transition(now, RobotState::Moving);
                out.push(Output::Say(message));
            }
            Err(rejected) => self.say(
                now,
                format!("Sorry, I couldn't execute that movement command: {}", rejected),
                out,
            ),
        }
    }

    /// Speak without blocking. Moving is kept so speech and movement overlap.
    fn say(&mut self, now: Instant, text: impl Into<String>, out: &mut Vec<Output>) {
        out.push(Output::Say(text.into()));
        if self.state != RobotState::Moving {
            self.transition(now, RobotState::Speaking);
        }
    }

    /// Back to Listening if the person is still here, else end the conversation
    fn resume(&mut self, now: Instant, present: bool, out: &mut Vec<Output>) {
        if present {
            self.transition(now, RobotState::Listening);
        } else {
            self.person_left(now, out);
        }
    }

    fn start_conversation(&mut self, now: Instant) {
        if self.conversation.is_none() {
            info!("Conversation started");
            self.conversation = Some(Conversation {
                started_at: SystemTime::now(),
                started: now,
                utterances: 0,
                movement_commands: Vec::new(),
            });
        }
        self.last_speech = now;
    }

    fn person_left(&mut self, now: Instant, out: &mut Vec<Output>) {
        if let Some(conversation) = self.conversation.take() {
            let goodbye = GOODBYES[self.goodbye_index % GOODBYES.len()];
            self.goodbye_index += 1;
            out.push(Output::Say(goodbye.to_string()));

            let record = ConversationRecord {
                started_at: conversation.started_at,
                duration_secs: now.saturating_duration_since(conversation.started).as_secs_f64(),
                utterances: conversation.utterances,
                movement_commands: conversation.movement_commands,
            };
            info!(
                "Conversation ended ({:.1}s, {} movement commands)",
                record.duration_secs,
                record.movement_commands.len()
            );
            out.push(Output::ConversationEnded(record));
        }
        self.transition(now, RobotState::Idle);
    }

    fn transition(&mut self, now: Instant, to: RobotState) {
        if self.state != to {
            info!("State: {} -> {}", self.state, to);
            self.state = to;
            self.state_since = now;
        }
    }

    /// Short bookkeeping pause; returns to Listening or Idle after the learning delay
    pub fn enter_learning(&mut self, now: Instant) {
        if !self.stopped {
            self.transition(now, RobotState::Learning);
        }
    }

    pub fn snapshot(&self, now: Instant) -> RobotStatusReport {
        RobotStatusReport {
            state: self.state,
            person_present: self.is_present(now),
            conversation_active: self.conversation.is_some(),
            movement: MovementStatusReport::from(&self.supervisor.status()),
            history_summary: self.supervisor.history_summary(),
            command_summary: self.commands.summary(),
        }
    }

    /// Stop all state machine activity and shut the wheels down
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.supervisor.shutdown();
        info!("Robot state machine stopped in state {}", self.state);
    }
}
