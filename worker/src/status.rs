//! Status record pushed to the notification surface, plus the
//! per-category rate limiter and error-threshold bookkeeping.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use num_bigint::BigUint;
use rand::Rng;
use thiserror::Error;

/// How many occurrences of one category trip the local-state reset.
pub const ERROR_RESET_THRESHOLD: u32 = 3;

/// Closed set of error/status categories. Each gets its own rate-limit
/// slot and threshold counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorCategory {
    #[error("api_offline")]
    ApiOffline,
    #[error("api_fetch_error")]
    ApiFetchError,
    #[error("no_range")]
    NoRange,
    #[error("post_error")]
    PostError,
    #[error("post_network_error")]
    PostNetworkError,
    #[error("post_server_error")]
    PostServerError,
    #[error("post_incompatible")]
    PostIncompatible,
    #[error("program_not_found")]
    ProgramNotFound,
    #[error("program_exception")]
    ProgramException,
    #[error("program_failed")]
    ProgramFailed,
    #[error("output_missing")]
    OutputMissing,
    #[error("output_parse_error")]
    OutputParseError,
    #[error("clear_out_error")]
    ClearOutError,
    #[error("no_addresses")]
    NoAddresses,
    #[error("missing_key_range")]
    MissingKeyRange,
    #[error("main_loop_exception")]
    MainLoopException,
}

/// One timestamp slot per category; an event is allowed through when
/// its category has been quiet for the given interval.
#[derive(Debug, Default)]
pub struct RateLimiter {
    last: HashMap<ErrorCategory, Instant>,
}

impl RateLimiter {
    pub fn allow(&mut self, category: ErrorCategory, min_interval: Duration) -> bool {
        let now = Instant::now();
        match self.last.get(&category) {
            Some(prev) if now.duration_since(*prev) < min_interval => false,
            _ => {
                self.last.insert(category, now);
                true
            }
        }
    }
}

/// Occurrences per category since the last reset.
#[derive(Debug, Default)]
pub struct ErrorCounter {
    counts: HashMap<ErrorCategory, u32>,
}

impl ErrorCounter {
    /// Record one occurrence and report the running count.
    pub fn record(&mut self, category: ErrorCategory) -> u32 {
        let count = self.counts.entry(category).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, category: ErrorCategory) {
        self.counts.remove(&category);
    }

    pub fn get(&self, category: ErrorCategory) -> u32 {
        self.counts.get(&category).copied().unwrap_or(0)
    }
}

/// Per-session observability counters. Reset only by process restart.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub id: String,
    pub started: Instant,
    pub blocks: u64,
    pub consecutive: u64,
    pub keyspace_total: BigUint,
}

impl SessionStats {
    pub fn new() -> SessionStats {
        let id: u32 = rand::thread_rng().gen();
        SessionStats {
            id: format!("{id:08x}"),
            started: Instant::now(),
            blocks: 0,
            consecutive: 0,
            keyspace_total: BigUint::from(0u32),
        }
    }

    pub fn active_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Flat status map rendered by the notification surface. The worker
/// only produces it; formatting and delivery live in the telegram
/// module.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub gpu: String,
    pub algorithm: String,
    pub arguments: String,
    pub range: String,
    pub addresses: usize,
    pub pending_keys: usize,
    pub last_batch: String,
    pub last_error: String,
    pub keyfound: String,
    pub all_blocks_solved: bool,
    pub next_fetch_in: u64,
    pub session: SessionStats,
}

impl WorkerStatus {
    pub fn new() -> WorkerStatus {
        WorkerStatus {
            gpu: "-".to_string(),
            algorithm: "-".to_string(),
            arguments: "-".to_string(),
            range: "".to_string(),
            addresses: 0,
            pending_keys: 0,
            last_batch: "-".to_string(),
            last_error: "-".to_string(),
            keyfound: "-".to_string(),
            all_blocks_solved: false,
            next_fetch_in: 0,
            session: SessionStats::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_resets_per_category() {
        let mut counter = ErrorCounter::default();
        assert_eq!(counter.record(ErrorCategory::PostError), 1);
        assert_eq!(counter.record(ErrorCategory::PostError), 2);
        assert_eq!(counter.record(ErrorCategory::NoRange), 1);
        counter.reset(ErrorCategory::PostError);
        assert_eq!(counter.get(ErrorCategory::PostError), 0);
        assert_eq!(counter.get(ErrorCategory::NoRange), 1);
    }

    #[test]
    fn rate_limiter_blocks_within_interval() {
        let mut rl = RateLimiter::default();
        assert!(rl.allow(ErrorCategory::NoRange, Duration::from_secs(60)));
        assert!(!rl.allow(ErrorCategory::NoRange, Duration::from_secs(60)));
        // other categories are independent
        assert!(rl.allow(ErrorCategory::PostError, Duration::from_secs(60)));
        // zero interval always passes
        assert!(rl.allow(ErrorCategory::NoRange, Duration::ZERO));
    }

    #[test]
    fn category_tags() {
        assert_eq!(ErrorCategory::ApiOffline.to_string(), "api_offline");
        assert_eq!(ErrorCategory::MainLoopException.to_string(), "main_loop_exception");
    }
}
