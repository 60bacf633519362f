// Wall-clock source for edit timestamps and debounce decisions.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Clock {
    #[default]
    System,
    /// Wall time that advances with the tokio clock, so paused-time tests
    /// can move it with `tokio::time::advance`.
    Tokio { origin: DateTime<Utc>, started: Instant },
}

impl Clock {
    pub fn tokio() -> Self {
        Self::Tokio { origin: Utc::now(), started: Instant::now() }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Tokio { origin, started } => {
                let elapsed = chrono::Duration::from_std(started.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                *origin + elapsed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = Clock::tokio();
        let before = clock.now();

        tokio::time::advance(Duration::from_secs(90)).await;

        assert_eq!(clock.now() - before, chrono::Duration::seconds(90));
    }
}
