use std::time::{Duration, Instant};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const RESET_INTERVAL: Duration = Duration::from_secs(60);

/// Exponential reconnect delay with jitter.
///
/// Each consecutive failure doubles the delay up to the cap, and the actual wait is randomized
/// to between half and one and a half times that value. A connection that stayed up for at
/// least a minute resets the sequence.
#[derive(Debug)]
pub(crate) struct Backoff {
    initial_delay: Duration,
    attempts: u32,
    connected_at: Option<Instant>,
}

impl Backoff {
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            attempts: 0,
            connected_at: None,
        }
    }

    /// Records that a connection was established.
    pub fn connected(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    pub fn next_delay(&mut self) -> Duration {
        if let Some(connected_at) = self.connected_at.take() {
            if connected_at.elapsed() >= RESET_INTERVAL {
                self.attempts = 0;
            }
        }

        let base = self.base_delay();
        self.attempts = self.attempts.saturating_add(1);

        let jitter = 0.5 + rand::random::<f64>();
        Duration::from_secs_f64(base.as_secs_f64() * jitter).min(MAX_RECONNECT_DELAY)
    }

    fn base_delay(&self) -> Duration {
        let factor = 2f64.powi(self.attempts.min(31) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(MAX_RECONNECT_DELAY.as_secs_f64()))
    }
}
