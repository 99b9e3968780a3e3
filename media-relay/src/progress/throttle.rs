//! Emission rate limiting for progress samples.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::ThrottleConfig;

/// Lets a sample through if enough time passed since the last one, if the
/// percentage jumped by at least the configured step, or if it marks a stage
/// change.
#[derive(Debug, Clone)]
pub struct EmitThrottle {
    interval: Duration,
    min_percent_step: Option<f64>,
    last_emit: Option<Instant>,
    last_percent: Option<f64>,
}

impl EmitThrottle {
    pub fn new(interval: Duration, min_percent_step: Option<f64>) -> Self {
        Self {
            interval,
            min_percent_step,
            last_emit: None,
            last_percent: None,
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(config.min_interval, config.min_percent_step)
    }

    pub fn should_emit(&self, now: Instant, percent: Option<f64>, transition: bool) -> bool {
        if transition {
            return true;
        }
        let Some(last) = self.last_emit else {
            return true;
        };
        if now.saturating_duration_since(last) >= self.interval {
            return true;
        }
        match (self.min_percent_step, percent, self.last_percent) {
            (Some(step), Some(p), Some(prev)) => p - prev >= step,
            (Some(_), Some(_), None) => true,
            _ => false,
        }
    }

    pub fn mark_emitted(&mut self, now: Instant, percent: Option<f64>) {
        self.last_emit = Some(now);
        if percent.is_some() {
            self.last_percent = percent;
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reset(&mut self) {
        self.last_emit = None;
        self.last_percent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interval_gate() {
        let mut throttle = EmitThrottle::new(Duration::from_secs(2), None);
        let start = Instant::now();
        assert!(throttle.should_emit(start, None, false));
        throttle.mark_emitted(start, None);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!throttle.should_emit(Instant::now(), Some(50.0), false));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(throttle.should_emit(Instant::now(), None, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_percent_step_gate() {
        let mut throttle = EmitThrottle::new(Duration::from_secs(1), Some(1.0));
        let now = Instant::now();
        throttle.mark_emitted(now, Some(10.0));

        assert!(!throttle.should_emit(now, Some(10.9), false));
        assert!(throttle.should_emit(now, Some(11.0), false));
        assert!(!throttle.should_emit(now, None, false));
        assert!(throttle.should_emit(now, None, true));
    }

    #[test]
    fn test_reset() {
        let mut throttle = EmitThrottle::new(Duration::from_secs(60), None);
        let now = Instant::now();
        throttle.mark_emitted(now, Some(1.0));
        assert!(!throttle.should_emit(now, Some(2.0), false));
        throttle.reset();
        assert!(throttle.should_emit(now, Some(2.0), false));
    }
}
