// Command interpreter: free text -> motion intent
//
// Utterances are lowercased and split into word tokens. Each phrase is a
// sequence of slots, and a slot matches any one of its alternatives, so
// "move|go|walk forward|ahead" is one phrase. A phrase matches when its
// slots line up with consecutive tokens anywhere in the utterance.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::config::{COMMAND_LOG_CAPACITY, FAST_SPEED, NORMAL_SPEED, SLOW_SPEED};
use crate::intent::{Action, MotionIntent};

type Phrase = &'static [&'static [&'static str]];

const EMERGENCY_PHRASES: &[Phrase] = &[
    &[&["emergency"], &["stop"]],
    &[&["stop"], &["now", "immediately"]],
    &[&["e"], &["stop"]],
    &[&["estop"]],
];

const STOP_PHRASES: &[Phrase] = &[
    &[&["stop"]],
    &[&["stop"], &["moving"]],
    &[&["halt"]],
    &[&["freeze"]],
];

/// Directional phrases, checked in order after stop and emergency phrases
const MOVEMENT_PHRASES: &[(Action, &[Phrase])] = &[
    (
        Action::DiagonalFL,
        &[&[&["diagonal", "diagonally"], &["left"]]],
    ),
    (
        Action::DiagonalFR,
        &[&[&["diagonal", "diagonally"], &["right"]]],
    ),
    (
        Action::Forward,
        &[
            &[&["move", "go", "walk"], &["forward", "ahead", "straight"]],
            &[&["forward"]],
        ],
    ),
    (
        Action::Backward,
        &[
            &[&["move", "go", "walk"], &["backward", "back", "backwards"]],
            &[&["backward"]],
            &[&["reverse"]],
        ],
    ),
    (
        Action::TurnLeft,
        &[
            &[&["turn", "go", "rotate"], &["left"]],
            &[&["left"], &["turn"]],
        ],
    ),
    (
        Action::TurnRight,
        &[
            &[&["turn", "go", "rotate"], &["right"]],
            &[&["right"], &["turn"]],
        ],
    ),
    (
        Action::StrafeLeft,
        &[&[&["move", "strafe", "slide", "sideway", "sideways", "step"], &["left"]]],
    ),
    (
        Action::StrafeRight,
        &[&[&["move", "strafe", "slide", "sideway", "sideways", "step"], &["right"]]],
    ),
    (
        Action::SpinClockwise,
        &[
            &[&["spin"]],
            &[&["turn"], &["around"]],
            &[&["rotate"], &["around", "full"]],
        ],
    ),
    (
        Action::Dance,
        &[
            &[&["dance"]],
            &[&["show"], &["me"], &["your"], &["moves"]],
        ],
    ),
    (
        Action::ComeHere,
        &[
            &[&["come"], &["here"]],
            &[&["come"], &["to"], &["me"]],
            &[&["come"], &["over"]],
            &[&["approach"]],
        ],
    ),
];

const SLOW_WORDS: &[&str] = &["slow", "slowly", "carefully"];
const FAST_WORDS: &[&str] = &["fast", "quick", "quickly", "rapid"];
const NORMAL_WORDS: &[&str] = &["normal", "regular", "medium"];

const SECOND_WORDS: &[&str] = &["second", "seconds", "sec", "secs"];

/// Vague durations, in seconds
const VAGUE_DURATIONS: &[(Phrase, u64)] = &[
    (&[&["a"], &["bit"]], 1),
    (&[&["a"], &["little"]], 1),
    (&[&["a"], &["moment"]], 2),
    (&[&["a"], &["while"]], 3),
];

const NUMBER_WORDS: &[(&str, f64)] = &[
    ("one", 1.0),
    ("two", 2.0),
    ("three", 3.0),
    ("four", 4.0),
    ("five", 5.0),
    ("six", 6.0),
    ("seven", 7.0),
    ("eight", 8.0),
    ("nine", 9.0),
    ("ten", 10.0),
    ("fifteen", 15.0),
    ("twenty", 20.0),
    ("thirty", 30.0),
];

/// Spoken speed modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedClass {
    Slow,
    Normal,
    Fast,
}

impl SpeedClass {
    pub fn speed(self) -> u8 {
        match self {
            SpeedClass::Slow => SLOW_SPEED,
            SpeedClass::Normal => NORMAL_SPEED,
            SpeedClass::Fast => FAST_SPEED,
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace('\u{2019}', "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '.'))
        .map(|t| t.trim_matches(|c| c == '.' || c == '\''))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn matches_at(tokens: &[String], start: usize, phrase: Phrase) -> bool {
    phrase.len() <= tokens.len() - start
        && phrase
            .iter()
            .zip(&tokens[start..])
            .all(|(slot, token)| slot.contains(&token.as_str()))
}

fn contains_phrase(tokens: &[String], phrase: Phrase) -> bool {
    (0..tokens.len()).any(|start| matches_at(tokens, start, phrase))
}

fn contains_any(tokens: &[String], phrases: &[Phrase]) -> bool {
    phrases.iter().any(|&p| contains_phrase(tokens, p))
}

fn has_word(tokens: &[String], words: &[&str]) -> bool {
    tokens.iter().any(|t| words.contains(&t.as_str()))
}

fn parse_number(token: &str) -> Option<f64> {
    let value = NUMBER_WORDS
        .iter()
        .find(|(word, _)| *word == token)
        .map(|&(_, n)| n)
        .or_else(|| {
            token
                .chars()
                .all(|c| c.is_ascii_digit() || c == '.')
                .then(|| token.parse::<f64>().ok())
                .flatten()
        })?;
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Turns recognized speech into motion intents
#[derive(Debug, Clone, Default)]
pub struct CommandInterpreter;

impl CommandInterpreter {
    pub fn new() -> Self {
        Self
    }

    pub fn is_movement_command(&self, text: &str) -> bool {
        self.parse(text).is_some()
    }

    /// Parse an utterance. `None` means it is not a movement command.
    ///
    /// Emergency phrases win over stop phrases, which win over every
    /// directional phrase.
    pub fn parse(&self, text: &str) -> Option<MotionIntent> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return None;
        }

        if contains_any(&tokens, EMERGENCY_PHRASES) {
            return Some(MotionIntent::new(Action::EmergencyStop));
        }
        if contains_any(&tokens, STOP_PHRASES) {
            return Some(MotionIntent::new(Action::Stop));
        }

        let (action, _) = MOVEMENT_PHRASES
            .iter()
            .find(|(_, phrases)| contains_any(&tokens, phrases))?;

        Some(MotionIntent {
            action: *action,
            speed: self.speed_class(&tokens).map(SpeedClass::speed),
            duration: self.duration(&tokens),
        })
    }

    fn speed_class(&self, tokens: &[String]) -> Option<SpeedClass> {
        if has_word(tokens, SLOW_WORDS) {
            Some(SpeedClass::Slow)
        } else if has_word(tokens, FAST_WORDS) {
            Some(SpeedClass::Fast)
        } else if has_word(tokens, NORMAL_WORDS) {
            Some(SpeedClass::Normal)
        } else {
            None
        }
    }

    /// "for 3 seconds", "2.5 sec", "three seconds", or a vague phrase
    fn duration(&self, tokens: &[String]) -> Option<Duration> {
        let explicit = tokens.windows(2).find_map(|pair| {
            if !SECOND_WORDS.contains(&pair[1].as_str()) {
                return None;
            }
            parse_number(&pair[0]).and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        });
        explicit.or_else(|| {
            VAGUE_DURATIONS
                .iter()
                .find(|&&(phrase, _)| contains_phrase(tokens, phrase))
                .map(|&(_, secs)| Duration::from_secs(secs))
        })
    }
}

/// Help listing, grouped by kind
pub fn available_commands() -> &'static [(&'static str, &'static [&'static str])] {
    &[
        (
            "Basic Movement",
            &["move forward", "move backward", "turn left", "turn right"],
        ),
        (
            "Advanced Movement",
            &["strafe left", "strafe right", "spin around", "diagonal left", "diagonal right"],
        ),
        ("Fun Commands", &["dance", "come here"]),
        ("Control", &["stop", "emergency stop"]),
        ("Speed Modifiers", &["slow", "fast", "normal"]),
        (
            "Duration Examples",
            &["for 3 seconds", "for a moment", "a little bit"],
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandLogEntry {
    pub text: String,
    /// Action that was carried out, `None` if the command failed
    pub action: Option<Action>,
    pub recorded_at: SystemTime,
}

/// Recent movement utterances and whether they were carried out
#[derive(Debug, Clone)]
pub struct CommandLog {
    entries: VecDeque<CommandLogEntry>,
    capacity: usize,
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new(COMMAND_LOG_CAPACITY)
    }
}

impl CommandLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, text: &str, action: Option<Action>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(CommandLogEntry {
            text: text.trim().to_lowercase(),
            action,
            recorded_at: SystemTime::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CommandLogEntry> {
        self.entries.iter()
    }

    pub fn summary(&self) -> String {
        if self.entries.is_empty() {
            return "No movement commands used yet".to_string();
        }

        let mut counts: Vec<(Action, usize)> = Vec::new();
        for action in self.entries.iter().filter_map(|e| e.action) {
            match counts.iter_mut().find(|(a, _)| *a == action) {
                Some((_, n)) => *n += 1,
                None => counts.push((action, 1)),
            }
        }
        let succeeded: usize = counts.iter().map(|&(_, n)| n).sum();
        let most_used = counts
            .iter()
            .map(|&(_, n)| n)
            .max()
            .and_then(|best| counts.iter().find(|&&(_, n)| n == best))
            .map_or("none".to_string(), |(a, _)| a.to_string());

        format!(
            "Total commands: {}, Success rate: {:.1}%, Most used: {}",
            self.entries.len(),
            succeeded as f64 / self.entries.len() as f64 * 100.0,
            most_used
        )
    }
}
