// Copyright 2020 Joyent, Inc.

//! Retry policies consulted by the client and pipelines when an operation
//! fails at the transport level.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use rand::Rng;

use crate::error::Error;
use crate::host::{Host, HostKey};

// Randomization factor applied to backoff intervals when jitter is enabled
const JITTER_FACTOR: f64 = 0.5;
// Upper bound for a single backoff interval in milliseconds
const MAX_BACKOFF_INTERVAL: u64 = 10_000;

/// Per-operation retry state.
#[derive(Clone, Debug, Default)]
pub struct RetryContext {
    /// The number of attempts made so far.
    pub attempts: u32,
    pub last_error: Option<Error>,
    /// Hosts an attempt has already been made against.
    pub tried: Vec<HostKey>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_attempt(&mut self, host: &Host) {
        self.attempts += 1;
        let key = host.key();
        if !self.tried.contains(&key) {
            self.tried.push(key);
        }
    }

    pub fn record_failure(&mut self, err: Error) {
        self.last_error = Some(err);
    }

    pub fn has_tried(&self, host: &Host) -> bool {
        self.tried.contains(&host.key())
    }

    /// The terminal error for an operation whose policy gave up.
    pub fn exhausted(&self) -> Error {
        let last = self
            .last_error
            .clone()
            .unwrap_or(Error::NoAvailableHost);
        Error::RetryExhausted {
            attempts: self.attempts,
            last: Box::new(last),
        }
    }
}

/// Decides whether, where, and when a failed operation is attempted again.
pub trait RetryPolicy: Send {
    /// Whether another attempt may be made given the attempts so far.
    fn allow_retry(&self, ctx: &RetryContext) -> bool;

    /// How long to wait before the next attempt.
    fn next_delay(&mut self, _ctx: &RetryContext) -> Duration {
        Duration::from_millis(0)
    }

    /// Whether a retry may move to a replica in another rack.
    fn allow_cross_zone_fallback(&self) -> bool;

    /// Whether untried replicas are picked at random rather than in
    /// preference order.
    fn randomize_host(&self) -> bool {
        false
    }

    /// Pick the host for the next attempt from a preference-ordered list of
    /// candidates.
    fn select_host(
        &self,
        candidates: &[Host],
        ctx: &RetryContext,
    ) -> Option<Host> {
        let first = candidates.first()?;
        if ctx.attempts == 0 || !self.allow_cross_zone_fallback() {
            return Some(first.clone());
        }

        let untried: Vec<&Host> =
            candidates.iter().filter(|h| !ctx.has_tried(h)).collect();
        if untried.is_empty() {
            return Some(first.clone());
        }
        if self.randomize_host() {
            let idx = rand::thread_rng().gen_range(0, untried.len());
            Some(untried[idx].clone())
        } else {
            Some(untried[0].clone())
        }
    }
}

/// Produces a fresh `RetryPolicy` for each logical operation.
pub trait RetryPolicyFactory: Send + Sync {
    fn policy(&self) -> Box<dyn RetryPolicy>;
}

/// Never retry.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunOnce;

impl RetryPolicy for RunOnce {
    fn allow_retry(&self, _ctx: &RetryContext) -> bool {
        false
    }

    fn allow_cross_zone_fallback(&self) -> bool {
        false
    }
}

/// Retry up to `retries` times, immediately. With cross-zone fallback each
/// retry goes to a randomly chosen replica that has not been tried yet.
#[derive(Clone, Copy, Debug)]
pub struct RetryNTimes {
    pub retries: u32,
    pub allow_cross_zone_fallback: bool,
}

impl RetryPolicy for RetryNTimes {
    fn allow_retry(&self, ctx: &RetryContext) -> bool {
        ctx.attempts <= self.retries
    }

    fn allow_cross_zone_fallback(&self) -> bool {
        self.allow_cross_zone_fallback
    }

    fn randomize_host(&self) -> bool {
        true
    }
}

/// Retry up to `retries` times, waiting an exponentially growing interval
/// between attempts.
pub struct ExponentialBackoffRetry {
    retries: u32,
    backoff: ExponentialBackoff,
}

impl ExponentialBackoffRetry {
    pub fn new(retries: u32, interval: Duration, jitter: bool) -> Self {
        let mut backoff = ExponentialBackoff::default();
        backoff.initial_interval = interval;
        backoff.max_interval = Duration::from_millis(MAX_BACKOFF_INTERVAL);
        backoff.randomization_factor = if jitter { JITTER_FACTOR } else { 0.0 };
        backoff.max_elapsed_time = None;
        backoff.reset();

        ExponentialBackoffRetry { retries, backoff }
    }
}

impl fmt::Debug for ExponentialBackoffRetry {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("ExponentialBackoffRetry")
            .field("retries", &self.retries)
            .field("initial_interval", &self.backoff.initial_interval)
            .field("randomization_factor", &self.backoff.randomization_factor)
            .finish()
    }
}

impl RetryPolicy for ExponentialBackoffRetry {
    fn allow_retry(&self, ctx: &RetryContext) -> bool {
        ctx.attempts <= self.retries
    }

    fn next_delay(&mut self, _ctx: &RetryContext) -> Duration {
        self.backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval)
    }

    fn allow_cross_zone_fallback(&self) -> bool {
        true
    }
}

/// The configuration form of a retry policy.
///
/// Parses from and renders to the strings `RunOnce`,
/// `RetryNTimes:<retries>:<cross_zone>` and
/// `ExponentialBackoff:<retries>:<interval_ms>:<jitter>`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryKind {
    RunOnce,
    RetryNTimes {
        retries: u32,
        allow_cross_zone_fallback: bool,
    },
    ExponentialBackoff {
        retries: u32,
        interval_ms: u64,
        jitter: bool,
    },
}

impl Default for RetryKind {
    fn default() -> Self {
        RetryKind::RunOnce
    }
}

impl RetryPolicyFactory for RetryKind {
    fn policy(&self) -> Box<dyn RetryPolicy> {
        match *self {
            RetryKind::RunOnce => Box::new(RunOnce),
            RetryKind::RetryNTimes {
                retries,
                allow_cross_zone_fallback,
            } => Box::new(RetryNTimes {
                retries,
                allow_cross_zone_fallback,
            }),
            RetryKind::ExponentialBackoff {
                retries,
                interval_ms,
                jitter,
            } => Box::new(ExponentialBackoffRetry::new(
                retries,
                Duration::from_millis(interval_ms),
                jitter,
            )),
        }
    }
}

fn parse_field<T: FromStr>(s: &str, field: &str, raw: &str) -> Result<T, Error> {
    s.parse().map_err(|_| {
        Error::InvalidConfiguration(format!(
            "invalid {} '{}' in retry policy '{}'",
            field, s, raw
        ))
    })
}

impl FromStr for RetryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            ["RunOnce"] => Ok(RetryKind::RunOnce),
            ["RetryNTimes", retries] => Ok(RetryKind::RetryNTimes {
                retries: parse_field(retries, "retry count", s)?,
                allow_cross_zone_fallback: false,
            }),
            ["RetryNTimes", retries, cross_zone] => {
                Ok(RetryKind::RetryNTimes {
                    retries: parse_field(retries, "retry count", s)?,
                    allow_cross_zone_fallback: parse_field(
                        cross_zone,
                        "cross zone flag",
                        s,
                    )?,
                })
            }
            ["ExponentialBackoff", retries, interval, jitter] => {
                Ok(RetryKind::ExponentialBackoff {
                    retries: parse_field(retries, "retry count", s)?,
                    interval_ms: parse_field(interval, "interval", s)?,
                    jitter: parse_field(jitter, "jitter flag", s)?,
                })
            }
            _ => Err(Error::InvalidConfiguration(format!(
                "unrecognized retry policy '{}'",
                s
            ))),
        }
    }
}

impl fmt::Display for RetryKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RetryKind::RunOnce => write!(fmt, "RunOnce"),
            RetryKind::RetryNTimes {
                retries,
                allow_cross_zone_fallback,
            } => write!(
                fmt,
                "RetryNTimes:{}:{}",
                retries, allow_cross_zone_fallback
            ),
            RetryKind::ExponentialBackoff {
                retries,
                interval_ms,
                jitter,
            } => write!(
                fmt,
                "ExponentialBackoff:{}:{}:{}",
                retries, interval_ms, jitter
            ),
        }
    }
}
