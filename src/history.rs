// Bounded record of finished movements

use std::collections::VecDeque;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::intent::Action;

/// How a movement ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementOutcome {
    /// Stopped on request or when its requested duration elapsed
    Completed,
    /// Replaced by a newer movement before it finished
    Superseded,
    /// Forced to a stop by the watchdog
    TimedOut,
    EmergencyStopped,
    /// Cut short by a latched wheel fault
    Faulted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementHistoryEntry {
    pub action: Action,
    /// Realized duration in fractional seconds
    pub duration_secs: f64,
    pub speed: u8,
    pub outcome: MovementOutcome,
    pub recorded_at: SystemTime,
}

/// Most recent movements, oldest first. Appending past capacity drops the oldest.
#[derive(Debug, Clone)]
pub struct MovementHistory {
    entries: VecDeque<MovementHistoryEntry>,
    capacity: usize,
}

impl MovementHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: MovementHistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MovementHistoryEntry> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<MovementHistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&MovementHistoryEntry> {
        self.entries.back()
    }

    /// Most frequent action among retained entries; ties go to the one seen first
    pub fn favorite(&self) -> Option<Action> {
        let mut counts: Vec<(Action, usize)> = Vec::new();
        for entry in &self.entries {
            match counts.iter_mut().find(|(a, _)| *a == entry.action) {
                Some((_, n)) => *n += 1,
                None => counts.push((entry.action, 1)),
            }
        }
        let best = counts.iter().map(|&(_, n)| n).max()?;
        counts.into_iter().find(|&(_, n)| n == best).map(|(a, _)| a)
    }

    /// One-line summary for speech or monitoring
    pub fn summary(&self, total_movements: u64) -> String {
        let Some(favorite) = self.favorite() else {
            return "No movement history yet".to_string();
        };
        let total_time: f64 = self.entries.iter().map(|e| e.duration_secs).sum();
        format!(
            "Total movements: {}, Total time: {:.1}s, Favorite move: {}, Recent moves: {}",
            total_movements,
            total_time,
            favorite,
            self.entries.len()
        )
    }
}
