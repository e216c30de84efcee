// Voice teleop: keys stand in for spoken phrases, Q quits
//
// Publishes utterances the way the speech recognizer would, keeps a presence
// heartbeat going so the robot stays engaged, and logs what the robot says.
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::info;

use ellee_runtime::config::{TOPIC_PRESENCE, TOPIC_SPEECH_HEARD, TOPIC_SPEECH_SAY};
use ellee_runtime::messages::PresenceReport;

const HEARTBEAT: Duration = Duration::from_secs(1);
const MODIFIERS: [&str; 3] = ["slowly", "", "quickly"];

/// Key -> phrase. Phrases marked true accept a speed modifier.
const PHRASES: &[(char, &str, bool)] = &[
    ('w', "move forward", true),
    ('s', "move backward", true),
    ('a', "strafe left", true),
    ('d', "strafe right", true),
    ('z', "turn left", true),
    ('x', "turn right", true),
    ('o', "spin around", true),
    ('e', "diagonal left", true),
    ('t', "diagonal right", true),
    ('c', "come here", false),
    ('p', "dance", false),
    ('y', "what is a resistor", false),
    (' ', "stop", false),
    ('!', "emergency stop", false),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let pub_heard = session.declare_publisher(TOPIC_SPEECH_HEARD).await?;
    let pub_presence = session.declare_publisher(TOPIC_PRESENCE).await?;
    let sub_say = session.declare_subscriber(TOPIC_SPEECH_SAY).await?;

    info!("Controls: WASD=move/strafe, Z/X=turn, O=spin, E/T=diagonal, C=come here, P=dance");
    info!("          SPACE=stop, !=emergency stop, Y=ask a question, R/F=speed, H=presence, Q=quit");

    enable_raw_mode()?;
    let result = run_teleop(&pub_heard, &pub_presence, &sub_say).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    pub_heard: &zenoh::pubsub::Publisher<'_>,
    pub_presence: &zenoh::pubsub::Publisher<'_>,
    sub_say: &zenoh::pubsub::Subscriber<zenoh::handlers::FifoChannelHandler<zenoh::sample::Sample>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 1;
    let mut present = true;
    let mut last_heartbeat: Option<Instant> = None;

    loop {
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                if kind != KeyEventKind::Press {
                    continue;
                }
                match code {
                    KeyCode::Char('q') | KeyCode::Esc => break,
                    KeyCode::Char('r') => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('h') => {
                        present = !present;
                        info!("Presence: {}", if present { "here" } else { "away" });
                    }
                    KeyCode::Char(key) => {
                        if let Some(&(_, phrase, modifiable)) =
                            PHRASES.iter().find(|(k, _, _)| *k == key)
                        {
                            let modifier = MODIFIERS[speed_idx];
                            let text = if modifiable && !modifier.is_empty() {
                                format!("{} {}", phrase, modifier)
                            } else {
                                phrase.to_string()
                            };
                            info!("You: {}", text);
                            pub_heard.put(serde_json::to_string(&text)?).await?;
                        }
                    }
                    _ => {}
                }
            }
        }

        if present && last_heartbeat.is_none_or(|t| t.elapsed() >= HEARTBEAT) {
            let report = PresenceReport { person_detected: true };
            pub_presence.put(serde_json::to_string(&report)?).await?;
            last_heartbeat = Some(Instant::now());
        }

        while let Ok(Some(sample)) = sub_say.try_recv() {
            if let Ok(text) = serde_json::from_slice::<String>(&sample.payload().to_bytes()) {
                info!("Ellee: {}", text);
            }
        }
    }

    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["SLOW", "NORMAL", "FAST"][idx];
    info!("Speed: {}", label);
}
