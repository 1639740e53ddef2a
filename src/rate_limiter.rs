use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::util::origin_key;

/// Built-in ceilings (requests per window) for sports APIs we
/// commonly poll. Configuration overrides always win.
static KNOWN_ORIGIN_CEILINGS: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    HashMap::from([
        ("https://site.api.espn.com", 60),
        ("https://api.the-odds-api.com", 10),
        ("https://api.sportsdata.io", 30),
        ("https://statsapi.mlb.com", 60),
        ("https://api-web.nhle.com", 60),
        ("https://api.openweathermap.org", 60),
    ])
});

/// Window state for one origin.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub reset_at: Instant,
    pub count: u32,
    pub ceiling: u32,
    pub backoff_multiplier: f64,
    pub max_retries: u32,
}

/// Read-only view of an origin's current window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitSnapshot {
    pub origin: String,
    pub count: u32,
    pub ceiling: u32,
    pub remaining: u32,
    pub resets_in_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retries: u32,
}

/// Fixed-window rate limiter keyed by origin.
///
/// Behavior:
/// - One window per origin, shared by every source on that origin
/// - `allow` is a single check-and-increment under one lock
/// - A denied request is refused, never queued or delayed
///
/// Callers treat `false` as "skip this tick".
///
pub struct RateLimiter {
    window: Duration,
    default_ceiling: u32,
    backoff_multiplier: f64,
    max_retries: u32,
    overrides: Mutex<HashMap<String, u32>>,
    states: Mutex<HashMap<String, RateLimitState>>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        let overrides = cfg
            .origins
            .iter()
            .map(|(origin, ceiling)| (origin_key(origin), *ceiling))
            .collect();

        Self {
            window: cfg.window(),
            default_ceiling: cfg.default_ceiling,
            backoff_multiplier: cfg.backoff_multiplier,
            max_retries: cfg.max_retries,
            overrides: Mutex::new(overrides),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Ceiling that applies to `origin`.
    pub fn ceiling_for(&self, origin: &str) -> u32 {
        if let Some(ceiling) = lock(&self.overrides).get(origin) {
            return *ceiling;
        }
        KNOWN_ORIGIN_CEILINGS
            .get(origin)
            .copied()
            .unwrap_or(self.default_ceiling)
    }

    /// Override the ceiling of an origin at runtime.
    ///
    /// An existing window keeps its count; the new ceiling applies
    /// from the next call on.
    pub fn set_ceiling(&self, origin: &str, ceiling: u32) {
        let origin = origin_key(origin);
        lock(&self.overrides).insert(origin.clone(), ceiling);
        if let Some(state) = lock(&self.states).get_mut(&origin) {
            state.ceiling = ceiling;
        }
    }

    /// Returns true and consumes one slot if the origin is under
    /// its ceiling for the current window.
    pub fn allow(&self, origin: &str) -> bool {
        self.allow_at(origin, Instant::now())
    }

    pub(crate) fn allow_at(&self, origin: &str, now: Instant) -> bool {
        let ceiling = self.ceiling_for(origin);
        let mut states = lock(&self.states);

        let state = states
            .entry(origin.to_string())
            .or_insert_with(|| RateLimitState {
                reset_at: now + self.window,
                count: 0,
                ceiling,
                backoff_multiplier: self.backoff_multiplier,
                max_retries: self.max_retries,
            });

        if now > state.reset_at {
            state.count = 0;
            state.reset_at = now + self.window;
        }

        if state.count >= state.ceiling {
            return false;
        }

        state.count += 1;
        true
    }

    /// Current window of `origin`, if it has been used at least once.
    pub fn snapshot(&self, origin: &str) -> Option<RateLimitSnapshot> {
        let now = Instant::now();
        let states = lock(&self.states);
        let state = states.get(origin)?;

        // An elapsed window is reported as fresh without mutating it.
        let (count, resets_in) = if now > state.reset_at {
            (0, self.window)
        } else {
            (state.count, state.reset_at - now)
        };

        Some(RateLimitSnapshot {
            origin: origin.to_string(),
            count,
            ceiling: state.ceiling,
            remaining: state.ceiling.saturating_sub(count),
            resets_in_ms: resets_in.as_millis() as u64,
            backoff_multiplier: state.backoff_multiplier,
            max_retries: state.max_retries,
        })
    }
}

// The protected maps are always left consistent, so a poisoned
// lock is still safe to use.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
