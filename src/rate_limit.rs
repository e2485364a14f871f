// Sliding-window rate limiter for the upstream content API.
//
// Every poller task and the filter-rule manager share one limiter through
// Arc<RateLimiter>, so the aggregate request rate stays under the upstream
// ceiling no matter how many accounts are polled concurrently.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

/// Tracks request timestamps in a sliding window and pauses callers when
/// the window is full. Interior mutability so callers only need `&self`.
pub struct RateLimiter {
    /// Timestamps of recent requests within the current window.
    requests: Mutex<VecDeque<Instant>>,
    /// Maximum number of requests allowed per window.
    max_requests: u32,
    /// Duration of the sliding window.
    window: Duration,
}

impl RateLimiter {
    /// `max_requests` per `window`. A zero ceiling is treated as one.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Mutex::new(VecDeque::new()),
            max_requests: max_requests.max(1),
            window,
        }
    }

    /// Effectively unlimited; used by tests and dry runs.
    pub fn unlimited() -> Self {
        Self::new(u32::MAX, Duration::from_secs(1))
    }

    /// Wait until a request slot is free, then claim it.
    pub async fn acquire(&self) {
        loop {
            // Decide under the lock, sleep without it.
            let wait = {
                let now = Instant::now();
                let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);

                while let Some(&oldest) = requests.front() {
                    if now.duration_since(oldest) >= self.window {
                        requests.pop_front();
                    } else {
                        break;
                    }
                }

                if (requests.len() as u64) < u64::from(self.max_requests) {
                    requests.push_back(now);
                    None
                } else {
                    requests
                        .front()
                        .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
                }
            };

            match wait {
                None => return,
                Some(wait) => {
                    debug!(delay_ms = wait.as_millis() as u64, "Upstream rate ceiling reached, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Requests currently counted against the window.
    pub fn in_flight_window(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
