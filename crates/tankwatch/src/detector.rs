//! Significance test for new readings.

use serde::Serialize;

use crate::reading::Reading;

/// A reading worth telling subscribers about.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    /// Reading the change is measured against; `None` for the first reading.
    pub previous: Option<Reading>,
    pub current: Reading,
    /// `current.value - previous.value`, or zero for the first reading.
    pub delta: f64,
}

impl ChangeEvent {
    pub fn is_first(&self) -> bool {
        self.previous.is_none()
    }

    pub fn direction(&self) -> Direction {
        if self.delta > 0.0 {
            Direction::Rising
        } else if self.delta < 0.0 {
            Direction::Falling
        } else {
            Direction::Steady
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rising,
    Falling,
    Steady,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Rising => "rising",
            Direction::Falling => "falling",
            Direction::Steady => "steady",
        }
    }
}

/// Threshold-based change detector.
///
/// Stateless: the caller decides what `previous` means (the session passes the
/// last reading it notified about).
#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    threshold: f64,
}

impl ChangeDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Emit an event for the first reading, or when `|delta| >= threshold`.
    pub fn evaluate(&self, previous: Option<&Reading>, current: &Reading) -> Option<ChangeEvent> {
        let Some(previous) = previous else {
            return Some(ChangeEvent {
                previous: None,
                current: current.clone(),
                delta: 0.0,
            });
        };

        let delta = current.value - previous.value;
        if delta.abs() >= self.threshold {
            Some(ChangeEvent {
                previous: Some(previous.clone()),
                current: current.clone(),
                delta,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(value: f64, sequence: u64) -> Reading {
        Reading::new(value, Utc::now(), sequence)
    }

    #[test]
    fn first_reading_always_emits() {
        let detector = ChangeDetector::new(5.0);
        for value in [0.0, 50.0, 100.0, -3.0] {
            let event = detector.evaluate(None, &reading(value, 1)).unwrap();
            assert!(event.is_first());
            assert_eq!(event.delta, 0.0);
            assert_eq!(event.current.value, value);
        }
    }

    #[test]
    fn below_threshold_is_silent() {
        let detector = ChangeDetector::new(5.0);
        assert_eq!(detector.evaluate(Some(&reading(50.0, 1)), &reading(50.5, 2)), None);
        assert_eq!(detector.evaluate(Some(&reading(50.0, 1)), &reading(45.1, 2)), None);
    }

    #[test]
    fn threshold_is_inclusive() {
        let detector = ChangeDetector::new(0.5);
        let event = detector
            .evaluate(Some(&reading(10.0, 1)), &reading(10.5, 2))
            .unwrap();
        assert_eq!(event.delta, 0.5);
    }

    #[test]
    fn emits_signed_delta_and_direction() {
        let detector = ChangeDetector::new(5.0);

        let up = detector
            .evaluate(Some(&reading(50.0, 1)), &reading(60.0, 3))
            .unwrap();
        assert_eq!(up.delta, 10.0);
        assert_eq!(up.direction(), Direction::Rising);
        assert_eq!(up.previous.as_ref().unwrap().value, 50.0);

        let down = detector
            .evaluate(Some(&reading(60.0, 3)), &reading(48.0, 4))
            .unwrap();
        assert_eq!(down.delta, -12.0);
        assert_eq!(down.direction(), Direction::Falling);
    }

    #[test]
    fn emits_iff_delta_reaches_threshold() {
        let detector = ChangeDetector::new(1.0);
        let base = reading(20.0, 1);
        for step in 0..40 {
            let value = 18.0 + step as f64 * 0.1;
            let emitted = detector.evaluate(Some(&base), &reading(value, 2)).is_some();
            assert_eq!(emitted, (value - 20.0).abs() >= 1.0, "value {value}");
        }
    }
}
