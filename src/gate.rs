//! Forwarding rate gate
//!
//! Per-bridge minimum-interval filter. The gate drops messages, it does not
//! buffer or coalesce them: whatever sample arrives once the window has
//! elapsed is the one that gets forwarded.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Minimum-interval forwarding gate.
///
/// Check-and-record is atomic under the internal lock, so two
/// near-simultaneous callers cannot both pass the same window.
#[derive(Debug)]
pub struct RateGate {
    min_interval: Option<Duration>,
    last_forward: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Option<Duration>) -> Self {
        Self {
            min_interval,
            last_forward: Mutex::new(None),
        }
    }

    /// Unlimited gate: every message forwards.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Decide whether `now` is eligible to forward, recording it if so.
    ///
    /// The first call always forwards. Later calls forward exactly when the
    /// configured interval has fully elapsed since the last forward.
    pub fn should_forward(&self, now: Instant) -> bool {
        let Some(min_interval) = self.min_interval else {
            return true;
        };

        let mut last = self.last_forward.lock();
        match *last {
            Some(prev) if now.duration_since(prev) < min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_gate_always_forwards() {
        let gate = RateGate::unlimited();
        let now = Instant::now();
        for _ in 0..10 {
            assert!(gate.should_forward(now));
        }
    }

    #[test]
    fn interval_gate_drops_within_window() {
        let gate = RateGate::new(Some(Duration::from_secs(5)));
        let base = Instant::now();
        let at = |secs: f64| base + Duration::from_secs_f64(secs);

        let decisions: Vec<bool> = [0.0, 1.0, 2.0, 5.0, 5.5, 10.0]
            .iter()
            .map(|&t| gate.should_forward(at(t)))
            .collect();
        assert_eq!(decisions, [true, false, false, true, false, true]);
    }

    #[test]
    fn first_message_always_forwards() {
        let gate = RateGate::new(Some(Duration::from_secs(3600)));
        assert!(gate.should_forward(Instant::now()));
    }

    #[test]
    fn dropped_message_does_not_reset_window() {
        let gate = RateGate::new(Some(Duration::from_secs(10)));
        let base = Instant::now();
        assert!(gate.should_forward(base));
        // A drop at t=9 must not push the next eligible time past t=10.
        assert!(!gate.should_forward(base + Duration::from_secs(9)));
        assert!(gate.should_forward(base + Duration::from_secs(10)));
    }

    #[test]
    fn concurrent_callers_forward_once_per_window() {
        use std::sync::Arc;

        let gate = Arc::new(RateGate::new(Some(Duration::from_secs(5))));
        let now = Instant::now();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.should_forward(now))
            })
            .collect();

        let forwarded = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|&forwarded| forwarded)
            .count();
        assert_eq!(forwarded, 1);
    }
}
