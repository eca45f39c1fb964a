//! Per-action counters with fixed hourly and daily windows.
//!
//! A window resets once `now` passes `window_start + length`. Admission
//! counts the action immediately; a refused action is not counted. Actions
//! admitted together are counted only when none of them is refused.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::config::RateLimit;
use crate::domain::{PipelineError, Result};

#[derive(Debug, Clone, Copy)]
struct Window {
    started: DateTime<Utc>,
    count: u32,
}

impl Window {
    fn new(now: DateTime<Utc>) -> Self {
        Self { started: now, count: 0 }
    }

    fn roll(&mut self, now: DateTime<Utc>, length: Duration) {
        if now - self.started >= length {
            *self = Window::new(now);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    hour: Window,
    day: Window,
}

/// Snapshot of one action's usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Usage {
    pub this_hour: u32,
    pub today: u32,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    limits: BTreeMap<String, RateLimit>,
    counters: Mutex<HashMap<String, Counters>>,
}

impl RateLimiter {
    pub fn new(limits: BTreeMap<String, RateLimit>) -> Self {
        Self {
            limits,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Admit `action` now or fail with `RateLimited`.
    pub fn admit(&self, action: &str) -> Result<()> {
        self.admit_all_at(&[action], Utc::now())
    }

    pub fn admit_at(&self, action: &str, now: DateTime<Utc>) -> Result<()> {
        self.admit_all_at(&[action], now)
    }

    /// Admit every action in `actions` together, or none of them.
    pub fn admit_all(&self, actions: &[&str]) -> Result<()> {
        self.admit_all_at(actions, Utc::now())
    }

    pub fn admit_all_at(&self, actions: &[&str], now: DateTime<Utc>) -> Result<()> {
        self.evaluate(actions, now, true)
    }

    /// Fail with `RateLimited` if any action is at its ceiling, counting nothing.
    pub fn check_all(&self, actions: &[&str]) -> Result<()> {
        self.evaluate(actions, Utc::now(), false)
    }

    fn evaluate(&self, actions: &[&str], now: DateTime<Utc>, commit: bool) -> Result<()> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| PipelineError::Task("rate limiter lock poisoned".into()))?;

        let exceeded = |ceiling: Option<u32>, count: u32| ceiling.filter(|max| count >= *max);
        for action in actions {
            let limit = self.limits.get(*action).copied().unwrap_or_default();
            let entry = counters.entry(action.to_string()).or_insert(Counters {
                hour: Window::new(now),
                day: Window::new(now),
            });
            entry.hour.roll(now, Duration::hours(1));
            entry.day.roll(now, Duration::days(1));

            if let Some(max) = exceeded(limit.per_hour, entry.hour.count) {
                return Err(PipelineError::RateLimited {
                    action: action.to_string(),
                    limit: max,
                    window: "hour".to_string(),
                });
            }
            if let Some(max) = exceeded(limit.per_day, entry.day.count) {
                return Err(PipelineError::RateLimited {
                    action: action.to_string(),
                    limit: max,
                    window: "day".to_string(),
                });
            }
        }
        if commit {
            for action in actions {
                if let Some(entry) = counters.get_mut(*action) {
                    entry.hour.count += 1;
                    entry.day.count += 1;
                }
            }
        }
        Ok(())
    }

    pub fn usage(&self, action: &str) -> Usage {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(action).copied())
            .map(|c| Usage {
                this_hour: c.hour.count,
                today: c.day.count,
            })
            .unwrap_or(Usage {
                this_hour: 0,
                today: 0,
            })
    }
}
