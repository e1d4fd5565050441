// Copyright 2019 Joyent, Inc.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::connection::Connection;
use crate::host::{Host, HostKey};
use crate::retry::RetryKind;

/// The connection counts for the connection pool or for one of its hosts.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionPoolStats {
    /// The total number of connections, idle and claimed
    pub total_connections: ConnectionCount,
    /// The count of idle connections in the pool
    pub idle_connections: ConnectionCount,
    /// The number of connections currently claimed by callers
    pub active_connections: ConnectionCount,
}

impl ConnectionPoolStats {
    /// Create a new instance of `ConnectionPoolStats`
    pub fn new() -> Self {
        ConnectionPoolStats {
            total_connections: ConnectionCount::from(0),
            idle_connections: ConnectionCount::from(0),
            active_connections: ConnectionCount::from(0),
        }
    }
}

impl Default for ConnectionPoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The configuration options for a dynopool connection pool. This is required
/// to instantiate a new connection pool or client.
#[derive(Debug, Default)]
pub struct ConnectionPoolOptions {
    /// An optional maximum number of connections to maintain for each host.
    /// If not specified the default is 10.
    pub max_connections_per_host: Option<u32>,
    /// An optional timeout in milliseconds for blocking calls (`claim`) to
    /// request a connection from the pool. If not specified the calls will
    /// block indefinitely.
    pub claim_timeout: Option<u64>,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
    /// The rack the client runs in. Hosts in this rack are preferred.
    pub local_rack: Option<String>,
    /// Route by token ownership (the default) or round-robin over the local
    /// rack when set to `false`.
    pub token_aware: Option<bool>,
    /// Optional number of consecutive connection failures after which a host
    /// is marked down. If not specified the default is 3.
    pub failure_threshold: Option<u32>,
    /// Optional health check interval in seconds. This represents the length
    /// of the period of the pool health check task. If not specified the
    /// default is 30 seconds.
    pub health_check_interval: Option<u64>,
    /// Optional topology refresh interval in seconds. If not specified the
    /// default is 30 seconds.
    pub topology_refresh_interval: Option<u64>,
    /// Optional retry policy for client operations. If not specified
    /// operations are attempted once.
    pub retry_policy: Option<RetryKind>,
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// The pool's view of a host's health. A host is marked down after repeated
/// connection failures or by an explicit `mark_down`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostHealth {
    Up,
    Down,
}

impl fmt::Display for HostHealth {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostHealth::Up => String::from("up").fmt(fmt),
            HostHealth::Down => String::from("down").fmt(fmt),
        }
    }
}

// The per-host state: idle connections, counts, and health.
#[doc(hidden)]
#[derive(Debug)]
pub struct HostEntry<C> {
    pub host: Host,
    // Distinguishes this entry from earlier entries for the same host, so
    // connections claimed before a host left and rejoined the topology are
    // not counted against the new entry.
    pub generation: u64,
    pub idle: VecDeque<C>,
    pub stats: ConnectionPoolStats,
    pub consecutive_failures: u32,
    pub health: HostHealth,
}

impl<C> HostEntry<C>
where
    C: Connection,
{
    pub fn new(host: Host, generation: u64) -> Self {
        HostEntry {
            host,
            generation,
            idle: VecDeque::new(),
            stats: ConnectionPoolStats::new(),
            consecutive_failures: 0,
            health: HostHealth::Up,
        }
    }

    pub fn is_down(&self) -> bool {
        self.health == HostHealth::Down
    }
}

// The internal data structures used to manage the connection pool.
#[doc(hidden)]
#[derive(Debug)]
pub struct ConnectionData<C> {
    pub entries: HashMap<HostKey, HostEntry<C>>,
    pub state: ConnectionPoolState,
    pub next_generation: u64,
}

impl<C> ConnectionData<C>
where
    C: Connection,
{
    #[doc(hidden)]
    pub fn new() -> Self {
        ConnectionData {
            entries: HashMap::new(),
            state: ConnectionPoolState::Running,
            next_generation: 0,
        }
    }

    /// The entry for `key` if it is the one a connection of `generation`
    /// was claimed from.
    pub fn entry_for(
        &mut self,
        key: &HostKey,
        generation: u64,
    ) -> Option<&mut HostEntry<C>> {
        self.entries
            .get_mut(key)
            .filter(|entry| entry.generation == generation)
    }

    // Pool-wide counts summed over every host entry.
    pub fn stats(&self) -> ConnectionPoolStats {
        self.entries
            .values()
            .fold(ConnectionPoolStats::new(), |mut acc, e| {
                acc.total_connections += e.stats.total_connections;
                acc.idle_connections += e.stats.idle_connections;
                acc.active_connections += e.stats.active_connections;
                acc
            })
    }
}

// Protected access to the internal connection pool data structures
#[doc(hidden)]
#[derive(Debug)]
pub struct ProtectedData<C>(Arc<(Mutex<ConnectionData<C>>, Condvar)>);

impl<C> ProtectedData<C>
where
    C: Connection,
{
    pub fn new(connection_data: ConnectionData<C>) -> Self {
        ProtectedData(Arc::new((Mutex::new(connection_data), Condvar::new())))
    }

    pub fn connection_data_lock(&self) -> MutexGuard<ConnectionData<C>> {
        (self.0).0.lock().unwrap()
    }

    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, ConnectionData<C>>,
        m_timeout: Option<Duration>,
    ) -> (MutexGuard<'a, ConnectionData<C>>, bool) {
        match m_timeout {
            Some(timeout) => {
                let wait_result = (self.0).1.wait_timeout(g, timeout).unwrap();
                (wait_result.0, wait_result.1.timed_out())
            }
            None => ((self.0).1.wait(g).unwrap(), false),
        }
    }

    // Waiters are parked per host but share one condvar, so wake all of them
    // and let each re-check its own host.
    pub fn condvar_notify(&self) {
        (self.0).1.notify_all()
    }
}

impl<C> Clone for ProtectedData<C>
where
    C: Connection,
{
    fn clone(&self) -> ProtectedData<C> {
        ProtectedData(Arc::clone(&self.0))
    }
}

/// Sum type representing the current state of the connection pool. Possible
/// states are running, stopping, or stopped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionPoolState {
    /// The pool is running and able to service connection claim requests.
    Running,
    /// The connection pool is performing cleanup and is no longer accepting
    /// connection claim requests.
    Stopping,
    /// The connection pool is stopped and is no longer accepting connection
    /// claim requests.
    Stopped,
}

impl fmt::Display for ConnectionPoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionPoolState::Running => String::from("running").fmt(fmt),
            ConnectionPoolState::Stopping => String::from("stopping").fmt(fmt),
            ConnectionPoolState::Stopped => String::from("stopped").fmt(fmt),
        }
    }
}
