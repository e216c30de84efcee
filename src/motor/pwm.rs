// Software PWM cycle planning
//
// Each period starts by raising every pin with a nonzero duty (and lowering
// every idle pin), then lowers each active pin once the elapsed fraction of
// the period reaches its duty. Planning is pure so it can be tested without
// a timing thread.

use std::time::Duration;

use super::driver::{WheelCommand, WheelId};
use super::pins::{Level, PinId};
use crate::config::PinMap;

/// A pin together with the wheel it belongs to and its duty for this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub wheel: WheelId,
    pub pin: PinId,
    pub duty: u8,
}

/// Writes to perform at one point of the period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Offset into the period, in percent
    pub at_percent: u8,
    pub level: Level,
    pub channels: Vec<Channel>,
}

/// Ordered edges for one period, planned from a consistent duty snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePlan {
    edges: Vec<Edge>,
}

/// Expand a duty snapshot into per-pin channels, forward pin first
pub fn channels(map: &PinMap, frame: &[WheelCommand; 4]) -> Vec<Channel> {
    WheelId::ALL
        .iter()
        .flat_map(|&wheel| {
            let pins = map.pins(wheel);
            let command = frame[wheel.index()];
            [
                Channel {
                    wheel,
                    pin: pins.forward,
                    duty: command.forward_duty(),
                },
                Channel {
                    wheel,
                    pin: pins.reverse,
                    duty: command.reverse_duty(),
                },
            ]
        })
        .collect()
}

impl CyclePlan {
    pub fn new(channels: &[Channel]) -> Self {
        let mut edges = Vec::new();

        let (active, idle): (Vec<Channel>, Vec<Channel>) =
            channels.iter().copied().partition(|c| c.duty > 0);

        if !idle.is_empty() {
            edges.push(Edge {
                at_percent: 0,
                level: Level::Low,
                channels: idle,
            });
        }
        if !active.is_empty() {
            edges.push(Edge {
                at_percent: 0,
                level: Level::High,
                channels: active.clone(),
            });
        }

        // Falling edges in ascending duty order; full duty never falls
        let mut falling: Vec<Channel> = active.into_iter().filter(|c| c.duty < 100).collect();
        falling.sort_by_key(|c| c.duty);
        for channel in falling {
            let shared = edges
                .last()
                .is_some_and(|e| e.level == Level::Low && e.at_percent == channel.duty);
            match edges.last_mut() {
                Some(edge) if shared => edge.channels.push(channel),
                _ => edges.push(Edge {
                    at_percent: channel.duty,
                    level: Level::Low,
                    channels: vec![channel],
                }),
            }
        }

        Self { edges }
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Level of `pin` once `fraction` (0.0..1.0) of the period has elapsed
    pub fn level_at(&self, pin: PinId, fraction: f32) -> Level {
        let percent = fraction * 100.0;
        let mut level = Level::Low;
        for edge in &self.edges {
            if f32::from(edge.at_percent) > percent {
                break;
            }
            if edge.channels.iter().any(|c| c.pin == pin) {
                level = edge.level;
            }
        }
        level
    }
}

/// Offset of a `percent` edge into a period
pub fn edge_offset(period: Duration, percent: u8) -> Duration {
    period.mul_f64(f64::from(percent.min(100)) / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(pin: PinId, duty: u8) -> Channel {
        Channel {
            wheel: WheelId::FrontLeft,
            pin,
            duty,
        }
    }

    #[test]
    fn test_pin_high_while_elapsed_below_duty() {
        let plan = CyclePlan::new(&[channel(11, 30), channel(13, 0)]);
        assert_eq!(plan.level_at(11, 0.0), Level::High);
        assert_eq!(plan.level_at(11, 0.29), Level::High);
        assert_eq!(plan.level_at(11, 0.30), Level::Low);
        assert_eq!(plan.level_at(11, 0.99), Level::Low);
        assert_eq!(plan.level_at(13, 0.0), Level::Low);
        assert_eq!(plan.level_at(13, 0.5), Level::Low);
    }

    #[test]
    fn test_full_duty_never_falls() {
        let plan = CyclePlan::new(&[channel(11, 100)]);
        assert_eq!(plan.edges().len(), 1);
        assert_eq!(plan.level_at(11, 0.999), Level::High);
    }

    #[test]
    fn test_falling_edges_are_ordered_and_merged() {
        let plan = CyclePlan::new(&[
            channel(11, 65),
            channel(15, 20),
            channel(18, 65),
            channel(29, 0),
        ]);
        let offsets: Vec<(u8, Level)> = plan
            .edges()
            .iter()
            .map(|e| (e.at_percent, e.level))
            .collect();
        assert_eq!(
            offsets,
            vec![
                (0, Level::Low),
                (0, Level::High),
                (20, Level::Low),
                (65, Level::Low)
            ]
        );
        assert_eq!(plan.edges()[3].channels.len(), 2);
    }

    #[test]
    fn test_all_idle_plan_only_lowers() {
        let plan = CyclePlan::new(&[channel(11, 0), channel(13, 0)]);
        assert_eq!(plan.edges().len(), 1);
        assert_eq!(plan.edges()[0].level, Level::Low);
    }

    #[test]
    fn test_channels_follow_pin_map() {
        let map = PinMap::default();
        let mut frame = [WheelCommand::STOP; 4];
        frame[WheelId::FrontLeft.index()] = WheelCommand::from_signed(-40);
        let chans = channels(&map, &frame);
        assert_eq!(chans.len(), 8);
        let fl = map.pins(WheelId::FrontLeft);
        assert!(chans.contains(&Channel {
            wheel: WheelId::FrontLeft,
            pin: fl.reverse,
            duty: 40
        }));
        assert!(chans.contains(&Channel {
            wheel: WheelId::FrontLeft,
            pin: fl.forward,
            duty: 0
        }));
    }

    #[test]
    fn test_edge_offset() {
        let period = Duration::from_millis(10);
        assert_eq!(edge_offset(period, 50), Duration::from_millis(5));
        assert_eq!(edge_offset(period, 100), period);
        assert_eq!(edge_offset(period, 0), Duration::ZERO);
    }
}
