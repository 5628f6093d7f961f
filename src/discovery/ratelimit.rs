/// Shared upstream request budget
///
/// A rolling-window ledger: every grant is remembered until it is `window`
/// old, and a new grant is only issued while fewer than the effective budget
/// are outstanding. No rolling window of length `window` ever contains more
/// grants than the configured budget, no matter how many workers ask at once.
///
/// Throttle signals from upstream raise a backoff level that halves the
/// budget per level (never below one request per window). Each full cooldown
/// without a new throttle restores one level.

use crate::config::RateLimitConfig;
use crate::logging::{self, LogSource};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct LedgerState {
    grants: VecDeque<Instant>,
    /// Backoff level as of `last_throttle`.
    level_at_throttle: u32,
    last_throttle: Option<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LedgerState>,
    capacity: u32,
    window: Duration,
    cooldown: Duration,
    max_backoff_level: u32,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration, cooldown: Duration, max_backoff_level: u32) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                grants: VecDeque::with_capacity(capacity as usize),
                level_at_throttle: 0,
                last_throttle: None,
            }),
            capacity: capacity.max(1),
            window,
            cooldown,
            max_backoff_level,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.requests_per_window,
            Duration::from_secs(config.window_secs),
            Duration::from_secs(config.cooldown_secs),
            config.max_backoff_level,
        )
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Block until a request slot is granted. Returns the grant instant.
    pub fn acquire(&self) -> Instant {
        loop {
            match self.try_acquire() {
                Ok(granted) => return granted,
                Err(wait) => std::thread::sleep(wait.max(Duration::from_millis(1))),
            }
        }
    }

    pub fn try_acquire(&self) -> Result<Instant, Duration> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Read the clock under the lock so the ledger stays in grant order.
        let now = Instant::now();
        self.grant(&mut state, now)
    }

    /// Grant a slot at `now`, or return how long until one frees up.
    ///
    /// `now` must not run backwards between calls.
    pub fn try_acquire_at(&self, now: Instant) -> Result<Instant, Duration> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.grant(&mut state, now)
    }

    fn grant(&self, state: &mut LedgerState, now: Instant) -> Result<Instant, Duration> {
        while let Some(&oldest) = state.grants.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                state.grants.pop_front();
            } else {
                break;
            }
        }

        let capacity = self.capacity_for(state, now) as usize;
        if state.grants.len() < capacity {
            state.grants.push_back(now);
            return Ok(now);
        }

        // After a backoff the ledger may hold more grants than the new
        // budget; the slot frees when enough of the oldest expire.
        let blocking = state.grants[state.grants.len() - capacity];
        Err(self.window - now.saturating_duration_since(blocking))
    }

    /// Record an upstream throttle signal.
    pub fn report_throttle(&self) {
        self.report_throttle_at(Instant::now());
    }

    pub fn report_throttle_at(&self, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.level_for(&state, now);
        let next = (current + 1).min(self.max_backoff_level);
        state.level_at_throttle = next;
        state.last_throttle = Some(now);
        drop(state);

        if next > current {
            logging::warn(
                LogSource::FloodHub,
                None,
                &format!(
                    "Throttled upstream: backoff level {} -> {} ({} requests per {:?})",
                    current,
                    next,
                    self.capacity_at_level(next),
                    self.window
                ),
            );
        }
    }

    pub fn backoff_level(&self) -> u32 {
        self.backoff_level_at(Instant::now())
    }

    pub fn backoff_level_at(&self, now: Instant) -> u32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.level_for(&state, now)
    }

    pub fn effective_capacity_at(&self, now: Instant) -> u32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.capacity_for(&state, now)
    }

    fn level_for(&self, state: &LedgerState, now: Instant) -> u32 {
        let Some(last) = state.last_throttle else {
            return 0;
        };
        if self.cooldown.is_zero() {
            return 0;
        }
        let elapsed = now.saturating_duration_since(last);
        let restored = (elapsed.as_nanos() / self.cooldown.as_nanos()).min(u32::MAX as u128) as u32;
        state.level_at_throttle.saturating_sub(restored)
    }

    fn capacity_for(&self, state: &LedgerState, now: Instant) -> u32 {
        self.capacity_at_level(self.level_for(state, now))
    }

    fn capacity_at_level(&self, level: u32) -> u32 {
        self.capacity.checked_shr(level).unwrap_or(0).max(1)
    }
}
