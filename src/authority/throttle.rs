//! Cross-bucket throttle state: the API-wide halt and the invalid-request
//! accounting window.

use crate::protocol::InvalidRequestSnapshot;

/// The API-wide throttle. While active it overrides all per-bucket
/// throttling.
///
/// The read path self-corrects: once `resume_at` elapses the throttle
/// reports inactive without any timer having to fire.
#[derive(Debug, Default)]
pub struct GlobalThrottle {
    /// When requests may resume, in ms; 0 when inactive.
    resume_at: i64,
}

impl GlobalThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Halt all requests for `after_ms` from `now`.
    pub fn activate(&mut self, now: i64, after_ms: i64) {
        self.resume_at = now + after_ms.max(0);
    }

    /// Milliseconds until requests may resume, 0 when inactive. Never
    /// negative.
    pub fn remaining(&mut self, now: i64) -> i64 {
        if self.resume_at == 0 {
            return 0;
        }
        let remaining = self.resume_at - now;
        if remaining <= 0 {
            self.resume_at = 0;
            return 0;
        }
        remaining
    }
}

/// Rolling window counting requests that drew 401/403/429 responses.
///
/// Purely advisory: the authority surfaces the count so workers can
/// self-throttle before the API imposes a hard ban, but never blocks
/// requests on its own account.
#[derive(Debug)]
pub struct InvalidRequestWindow {
    /// Window length in milliseconds.
    window: i64,
    count: u64,
    reset_at: i64,
}

impl InvalidRequestWindow {
    pub fn new(window: i64) -> Self {
        Self {
            window,
            count: 0,
            reset_at: 0,
        }
    }

    /// Record one invalid request, starting a fresh window if the previous
    /// one expired.
    pub fn record(&mut self, now: i64) -> InvalidRequestSnapshot {
        if now >= self.reset_at {
            self.count = 0;
            self.reset_at = now + self.window;
        }
        self.count += 1;
        InvalidRequestSnapshot {
            count: self.count,
            reset: self.reset_at,
        }
    }

    /// The current count and remaining window, without recording anything.
    /// Returns `(0, 0)` once the window has expired.
    pub fn snapshot(&self, now: i64) -> (u64, i64) {
        if self.count == 0 || now >= self.reset_at {
            return (0, 0);
        }
        (self.count, self.reset_at - now)
    }
}
