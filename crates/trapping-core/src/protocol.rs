//! Piecewise-constant pacing protocols.
//!
//! A protocol is a list of scheduled events, each holding a level for a
//! duration and optionally repeating with a period. Voltage-clamp protocols
//! use the level as the membrane potential; pacing protocols use it as a
//! stimulus amplitude. Outside every event the level is zero.

use crate::{Result, Time, TrappingError};
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-9;

/// One scheduled protocol event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    /// Level held while the event is active
    pub level: f64,
    /// First start time
    pub start: Time,
    /// Time the level is held
    pub duration: Time,
    /// Repeat period; zero for a one-off event
    pub period: Time,
}

impl ProtocolEvent {
    fn is_active(&self, t: Time) -> bool {
        if t + EPS < self.start {
            return false;
        }
        let local = if self.period > 0.0 {
            (t - self.start).rem_euclid(self.period)
        } else {
            t - self.start
        };
        // Snap values that sit on a period boundary up to a rounding error
        let local = if self.period > 0.0 && (self.period - local) < EPS {
            0.0
        } else {
            local
        };
        local >= -EPS && local < self.duration - EPS
    }

    /// Earliest start or end of this event strictly after `t`
    fn next_change(&self, t: Time) -> Option<Time> {
        if self.period <= 0.0 {
            return [self.start, self.start + self.duration]
                .into_iter()
                .find(|&x| x > t + EPS);
        }
        let k = ((t - self.start) / self.period).floor().max(0.0);
        (0..3)
            .flat_map(|j| {
                let s = self.start + (k + j as f64) * self.period;
                [s, s + self.duration]
            })
            .filter(|&x| x > t + EPS)
            .reduce(f64::min)
    }
}

/// Scheduled pacing protocol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    events: Vec<ProtocolEvent>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a new event
    pub fn schedule(&mut self, level: f64, start: Time, duration: Time, period: Time) -> Result<()> {
        if !level.is_finite() || !start.is_finite() || start < 0.0 {
            return Err(TrappingError::InvalidConfig(format!(
                "malformed protocol event: level {} start {}",
                level, start
            )));
        }
        if !(duration > 0.0) {
            return Err(TrappingError::InvalidConfig(format!(
                "protocol event duration must be positive, got {}",
                duration
            )));
        }
        if !period.is_finite() || period < 0.0 || (period > 0.0 && duration > period + EPS) {
            return Err(TrappingError::InvalidConfig(format!(
                "protocol event of duration {} does not fit period {}",
                duration, period
            )));
        }
        let event = ProtocolEvent { level, start, duration, period };
        if self.events.iter().any(|e| overlaps(e, &event)) {
            return Err(TrappingError::InvalidConfig(format!(
                "protocol event at {} overlaps an existing event",
                start
            )));
        }
        self.events.push(event);
        Ok(())
    }

    /// Builder form of [`Protocol::schedule`]
    pub fn with_event(mut self, level: f64, start: Time, duration: Time, period: Time) -> Result<Self> {
        self.schedule(level, start, duration, period)?;
        Ok(self)
    }

    pub fn events(&self) -> &[ProtocolEvent] {
        &self.events
    }

    /// Length of one protocol cycle: the longest event period, or the end of
    /// the last event when nothing repeats.
    pub fn characteristic_time(&self) -> Time {
        let period = self.events.iter().map(|e| e.period).fold(0.0, f64::max);
        if period > 0.0 {
            period
        } else {
            self.events
                .iter()
                .map(|e| e.start + e.duration)
                .fold(0.0, f64::max)
        }
    }

    /// Protocol level at time `t`
    pub fn level_at(&self, t: Time) -> f64 {
        self.events
            .iter()
            .find(|e| e.is_active(t))
            .map(|e| e.level)
            .unwrap_or(0.0)
    }

    /// Next time after `t` at which the level may change
    pub fn next_change(&self, t: Time) -> Option<Time> {
        self.events
            .iter()
            .filter_map(|e| e.next_change(t))
            .reduce(f64::min)
    }
}

fn overlaps(a: &ProtocolEvent, b: &ProtocolEvent) -> bool {
    let horizon = a.period.max(b.period).max(a.start + a.duration).max(b.start + b.duration);
    let starts_inside = |e: &ProtocolEvent, other: &ProtocolEvent| {
        // Event starts are the only places an overlap can begin
        let mut s = e.start;
        while s < e.start + horizon + EPS {
            if other.is_active(s) {
                return true;
            }
            if e.period <= 0.0 {
                break;
            }
            s += e.period;
        }
        false
    };
    starts_inside(a, b) || starts_inside(b, a)
}
