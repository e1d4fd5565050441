// Copyright 2020 Joyent, Inc.

pub mod types;

use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration as StdDuration, Instant};

use chrono::Duration;
use slog::{debug, info, o, trace, warn, Drain, Logger};
use timer::Guard;

use crate::connection::Connection;
use crate::connection_pool::types::{
    ConnectionData, ConnectionPoolOptions, ConnectionPoolState,
    ConnectionPoolStats, HostEntry, HostHealth, ProtectedData,
};
use crate::error::Error;
use crate::host::{Host, HostKey};
use crate::supplier::HostSupplier;
use crate::token::Xxh32Partitioner;
use crate::topology::{Topology, TopologySnapshot};

// Default number of maximum connections per host
const DEFAULT_MAX_CONNECTIONS_PER_HOST: u32 = 10;
// Consecutive connection failures before a host is marked down
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
// Health check interval in seconds
const DEFAULT_HEALTH_CHECK_INTERVAL: u64 = 30;
// Topology refresh interval in seconds
const DEFAULT_TOPOLOGY_REFRESH_INTERVAL: u64 = 30;

/// A pool of connections to the hosts of a Dynomite cluster. Connections are
/// kept per host; callers claim a connection for a specific host, normally the
/// one the topology resolves their key to.
pub struct ConnectionPool<C, S, F>
where
    C: Connection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    protected_data: ProtectedData<C>,
    topology: Arc<Topology>,
    supplier: Arc<Mutex<S>>,
    create_connection: Arc<F>,
    max_connections_per_host: u32,
    claim_timeout: Option<u64>,
    failure_threshold: u32,
    log: Logger,
    topology_refresh_timer: Option<timer::Timer>,
    _topology_refresh_timer_guard: Option<Guard>,
    health_check_timer: Option<timer::Timer>,
    _health_check_timer_guard: Option<Guard>,
}

impl<C, S, F> Debug for ConnectionPool<C, S, F>
where
    C: Connection + Debug,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ConnectionPool")
            .field("protected_data", &self.protected_data)
            .field("topology", &self.topology)
            .field("max_connections_per_host", &self.max_connections_per_host)
            .field("claim_timeout", &self.claim_timeout)
            .field("failure_threshold", &self.failure_threshold)
            .field("log", &self.log)
            .finish()
    }
}

impl<C, S, F> Clone for ConnectionPool<C, S, F>
where
    C: Connection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn clone(&self) -> ConnectionPool<C, S, F> {
        ConnectionPool {
            protected_data: self.protected_data.clone(),
            topology: self.topology.clone(),
            supplier: self.supplier.clone(),
            create_connection: self.create_connection.clone(),
            max_connections_per_host: self.max_connections_per_host,
            claim_timeout: self.claim_timeout,
            failure_threshold: self.failure_threshold,
            log: self.log.clone(),
            topology_refresh_timer: None,
            _topology_refresh_timer_guard: None,
            health_check_timer: None,
            _health_check_timer_guard: None,
        }
    }
}

impl<C, S, F> ConnectionPool<C, S, F>
where
    C: Connection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    /// Create a connection pool. The supplier is polled once before this
    /// returns so the pool starts with the current topology; afterwards it is
    /// polled every `topology_refresh_interval` seconds.
    pub fn new(
        cpo: ConnectionPoolOptions,
        supplier: S,
        create_connection: F,
    ) -> Self {
        let max_connections_per_host = cpo
            .max_connections_per_host
            .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_HOST);
        let failure_threshold =
            cpo.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD);

        let logger = cpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let topology = Arc::new(Topology::new(
            cpo.local_rack,
            cpo.token_aware.unwrap_or(true),
            Arc::new(Xxh32Partitioner),
        ));
        let supplier = Arc::new(Mutex::new(supplier));
        let protected_data = ProtectedData::new(ConnectionData::new());
        let create_connection = Arc::new(create_connection);

        refresh_topology(
            &protected_data,
            topology.as_ref(),
            supplier.as_ref(),
            &logger,
        );

        let topology_refresh_interval = cpo
            .topology_refresh_interval
            .unwrap_or(DEFAULT_TOPOLOGY_REFRESH_INTERVAL);

        let topology_refresh_timer = timer::Timer::new();

        let topology_refresh_timer_guard = start_topology_refresh(
            &topology_refresh_timer,
            topology_refresh_interval,
            protected_data.clone(),
            topology.clone(),
            supplier.clone(),
            logger.clone(),
        );

        let health_check_interval = cpo
            .health_check_interval
            .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL);

        let health_check_timer = timer::Timer::new();

        let health_check_timer_guard = start_health_check(
            &health_check_timer,
            health_check_interval,
            protected_data.clone(),
            topology.clone(),
            create_connection.clone(),
            logger.clone(),
        );

        ConnectionPool {
            protected_data,
            topology,
            supplier,
            create_connection,
            max_connections_per_host,
            claim_timeout: cpo.claim_timeout,
            failure_threshold,
            log: logger,
            topology_refresh_timer: Some(topology_refresh_timer),
            _topology_refresh_timer_guard: Some(topology_refresh_timer_guard),
            health_check_timer: Some(health_check_timer),
            _health_check_timer_guard: Some(health_check_timer_guard),
        }
    }

    /// Stop the connection pool and close all idle connections. This function
    /// may only be called on the original ConnectionPool instance; clones
    /// receive `StopCalledByClone`. Connections claimed at the time of the
    /// call are closed when they are returned.
    pub fn stop(&mut self) -> Result<(), Error> {
        if self.topology_refresh_timer.is_none()
            || self.health_check_timer.is_none()
        {
            trace!(self.log, "stop called by pool clone");
            return Err(Error::StopCalledByClone);
        }

        trace!(self.log, "stop called by original pool");
        self.protected_data.connection_data_lock().state =
            ConnectionPoolState::Stopping;

        // Dropping the guards cancels the scheduled tasks
        drop(self._topology_refresh_timer_guard.take());
        drop(self._health_check_timer_guard.take());
        drop(self.topology_refresh_timer.take());
        drop(self.health_check_timer.take());

        let mut connection_data = self.protected_data.connection_data_lock();
        let mut closed = 0;
        connection_data.entries.values_mut().for_each(|entry| {
            closed += close_idle(entry, &self.log);
        });
        info!(self.log, "closed {} idle connections on stop", closed);

        connection_data.state = ConnectionPoolState::Stopped;
        drop(connection_data);
        self.protected_data.condvar_notify();
        Ok(())
    }

    /// Claim a connection to `host`. An idle connection is preferred; if
    /// there is none and the host is below its connection limit a new
    /// connection is established. Otherwise the call waits for a connection
    /// to be returned, up to the claim timeout.
    pub fn claim(&self, host: &Host) -> Result<PoolConnection<C, S, F>, Error> {
        let key = host.key();
        let deadline = self
            .claim_timeout
            .map(|ms| Instant::now() + StdDuration::from_millis(ms));

        let mut connection_data = self.protected_data.connection_data_lock();
        loop {
            if connection_data.state != ConnectionPoolState::Running {
                return Err(Error::PoolStopped);
            }

            let entry = match connection_data.entries.get_mut(&key) {
                Some(entry) => entry,
                None => return Err(Error::NoAvailableHost),
            };

            if entry.is_down() {
                return Err(Error::HostDown(key));
            }

            if let Some(conn) = pop_idle(entry, &self.log) {
                debug!(self.log, "found idle connection for host {}", &entry.host);
                let host = entry.host.clone();
                return Ok(PoolConnection::new(
                    self.clone(),
                    host,
                    entry.generation,
                    conn,
                ));
            }

            if entry.stats.total_connections
                < self.max_connections_per_host.into()
            {
                // Reserve the slot before releasing the lock so concurrent
                // claims cannot overshoot the limit.
                entry.stats.total_connections += 1.into();
                entry.stats.active_connections += 1.into();
                let host = entry.host.clone();
                let generation = entry.generation;
                drop(connection_data);
                return self.open_connection(host, generation);
            }

            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(
                            self.log,
                            "claim timed out waiting for host {}", host
                        );
                        return Err(Error::PoolExhausted(key));
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let wait_result =
                self.protected_data.condvar_wait(connection_data, timeout);
            connection_data = wait_result.0;
        }
    }

    /// Claim an idle connection to `host` without blocking and without
    /// establishing a new connection.
    pub fn try_claim(&self, host: &Host) -> Option<PoolConnection<C, S, F>> {
        let key = host.key();
        let mut connection_data = self.protected_data.connection_data_lock();
        if connection_data.state != ConnectionPoolState::Running {
            return None;
        }

        let entry = connection_data.entries.get_mut(&key)?;
        if entry.is_down() {
            return None;
        }

        pop_idle(entry, &self.log).map(|conn| {
            let host = entry.host.clone();
            PoolConnection::new(self.clone(), host, entry.generation, conn)
        })
    }

    /// Mark `host` down. Claims against it fail with `HostDown` until it is
    /// marked up by `mark_up`, a successful health check, or a topology
    /// refresh that lists it as up.
    pub fn mark_down(&self, host: &Host) -> Result<(), Error> {
        let mut connection_data = self.protected_data.connection_data_lock();
        let entry = connection_data
            .entries
            .get_mut(&host.key())
            .ok_or(Error::NoAvailableHost)?;
        set_down(entry, &self.log);
        drop(connection_data);
        self.protected_data.condvar_notify();
        Ok(())
    }

    pub fn mark_up(&self, host: &Host) -> Result<(), Error> {
        let mut connection_data = self.protected_data.connection_data_lock();
        let entry = connection_data
            .entries
            .get_mut(&host.key())
            .ok_or(Error::NoAvailableHost)?;
        set_up(entry, &self.log);
        Ok(())
    }

    /// The pool's view of `host`, or `None` if it is not in the topology.
    pub fn host_health(&self, host: &Host) -> Option<HostHealth> {
        let connection_data = self.protected_data.connection_data_lock();
        connection_data.entries.get(&host.key()).map(|e| e.health)
    }

    pub fn host_stats(&self, host: &Host) -> Option<ConnectionPoolStats> {
        let connection_data = self.protected_data.connection_data_lock();
        connection_data.entries.get(&host.key()).map(|e| e.stats)
    }

    /// Pool-wide connection counts, or `None` once the pool is stopped.
    pub fn get_stats(&self) -> Option<ConnectionPoolStats> {
        let connection_data = self.protected_data.connection_data_lock();
        match connection_data.state {
            ConnectionPoolState::Running => Some(connection_data.stats()),
            _ => None,
        }
    }

    pub fn get_state(&self) -> ConnectionPoolState {
        self.protected_data.connection_data_lock().state
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Resolve `key` against the current topology snapshot.
    pub fn resolve(&self, key: &[u8]) -> Result<Host, Error> {
        self.topology.snapshot().resolve(key)
    }

    /// Poll the host supplier now rather than waiting for the next refresh
    /// interval. Returns `false` if the supplier failed.
    pub fn refresh_topology(&self) -> bool {
        refresh_topology(
            &self.protected_data,
            self.topology.as_ref(),
            self.supplier.as_ref(),
            &self.log,
        )
    }

    /// Publish an explicit host list, bypassing the supplier.
    pub fn publish_hosts(&self, hosts: Vec<Host>) {
        let snapshot = self.topology.publish(hosts);
        reconcile_entries(&self.protected_data, &snapshot, &self.log);
    }

    /// Run the health check now rather than waiting for the next interval.
    pub fn check_health(&self) {
        check_health(
            &self.protected_data,
            self.topology.as_ref(),
            self.create_connection.as_ref(),
            &self.log,
        )
    }

    fn open_connection(
        &self,
        host: Host,
        generation: u64,
    ) -> Result<PoolConnection<C, S, F>, Error> {
        let mut conn = (self.create_connection)(&host);
        match conn.connect() {
            Ok(()) => {
                info!(self.log, "established connection to host {}", &host);
                Ok(PoolConnection::new(self.clone(), host, generation, conn))
            }
            Err(e) => {
                warn!(self.log, "failed to connect to host {}: {}", &host, e);
                let mut connection_data =
                    self.protected_data.connection_data_lock();
                if let Some(entry) =
                    connection_data.entry_for(&host.key(), generation)
                {
                    entry.stats.total_connections -= 1.into();
                    entry.stats.active_connections -= 1.into();
                    note_failure(entry, self.failure_threshold, &self.log);
                }
                drop(connection_data);
                self.protected_data.condvar_notify();
                Err(Error::ConnectionFailure(format!("{}: {}", host, e)))
            }
        }
    }

    // Return a claimed connection. It goes back to the idle queue unless it
    // is broken, its host is down or gone, or the pool is stopping.
    fn replace(&self, key: &HostKey, generation: u64, conn: C) {
        let mut connection_data = self.protected_data.connection_data_lock();
        let running = connection_data.state == ConnectionPoolState::Running;
        match connection_data.entry_for(key, generation) {
            Some(entry) => {
                entry.stats.active_connections -= 1.into();
                if conn.has_broken() {
                    warn!(
                        self.log,
                        "Found an invalid connection, not returning to the pool"
                    );
                    entry.stats.total_connections -= 1.into();
                    spawn_close(self.log.clone(), entry.host.name.clone(), conn);
                } else if !running || entry.is_down() {
                    entry.stats.total_connections -= 1.into();
                    spawn_close(self.log.clone(), entry.host.name.clone(), conn);
                } else {
                    entry.idle.push_back(conn);
                    entry.stats.idle_connections += 1.into();
                }
            }
            None => {
                debug!(
                    self.log,
                    "host {} left the topology since the connection was \
                     claimed, closing it",
                    key
                );
                spawn_close(self.log.clone(), key.to_string(), conn);
            }
        }
        drop(connection_data);
        self.protected_data.condvar_notify();
    }

    // Discard a claimed connection after a transport failure.
    fn connection_failed(&self, key: &HostKey, generation: u64, conn: C) {
        let mut connection_data = self.protected_data.connection_data_lock();
        if let Some(entry) = connection_data.entry_for(key, generation) {
            entry.stats.active_connections -= 1.into();
            entry.stats.total_connections -= 1.into();
            note_failure(entry, self.failure_threshold, &self.log);
            spawn_close(self.log.clone(), entry.host.name.clone(), conn);
        } else {
            spawn_close(self.log.clone(), key.to_string(), conn);
        }
        drop(connection_data);
        self.protected_data.condvar_notify();
    }

    fn record_success(&self, key: &HostKey, generation: u64) {
        let mut connection_data = self.protected_data.connection_data_lock();
        if let Some(entry) = connection_data.entry_for(key, generation) {
            entry.consecutive_failures = 0;
        }
    }
}

impl<C, S, F> Drop for ConnectionPool<C, S, F>
where
    C: Connection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Stop the pool and ignore the result. The returned Result will be an
        // Err if the pool instance going out of scope is a clone,
        // but there is not further error handling to be done here.
        let _ = self.stop();
    }
}

/// A connection claimed from the pool. It is returned to the pool when it
/// goes out of scope.
pub struct PoolConnection<C, S, F>
where
    C: Connection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    connection_pool: ConnectionPool<C, S, F>,
    host: Host,
    generation: u64,
    connection: Option<C>,
}

impl<C, S, F> PoolConnection<C, S, F>
where
    C: Connection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn new(
        connection_pool: ConnectionPool<C, S, F>,
        host: Host,
        generation: u64,
        conn: C,
    ) -> Self {
        PoolConnection {
            connection_pool,
            host,
            generation,
            connection: Some(conn),
        }
    }

    /// The host this connection is bound to.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Close the connection after a transport-level failure instead of
    /// returning it to the pool. Counts toward the host's failure threshold.
    pub fn fail(mut self) {
        if let Some(conn) = self.connection.take() {
            self.connection_pool.connection_failed(
                &self.host.key(),
                self.generation,
                conn,
            );
        }
    }

    /// Report a successful round trip, resetting the host's consecutive
    /// failure count.
    pub fn succeeded(&self) {
        self.connection_pool
            .record_success(&self.host.key(), self.generation);
    }
}

impl<C, S, F> Debug for PoolConnection<C, S, F>
where
    C: Connection + Debug,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("PoolConnection")
            .field("host", &self.host)
            .field("connection", &self.connection)
            .finish()
    }
}

impl<C, S, F> Drop for PoolConnection<C, S, F>
where
    C: Connection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.connection_pool
                .replace(&self.host.key(), self.generation, conn);
        }
    }
}

impl<C, S, F> Deref for PoolConnection<C, S, F>
where
    C: Connection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    type Target = C;

    fn deref(&self) -> &C {
        self.connection.as_ref().unwrap()
    }
}

impl<C, S, F> DerefMut for PoolConnection<C, S, F>
where
    C: Connection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn deref_mut(&mut self) -> &mut C {
        self.connection.as_mut().unwrap()
    }
}

fn close_connection<C>(log: Logger, host: String, mut conn: C)
where
    C: Connection,
{
    info!(log, "Closing connection for host {}", &host);
    if let Err(err) = conn.close() {
        warn!(
            log,
            "Failed to properly close \
             connection for host {}. Reason: {}",
            &host,
            err
        );
    }
}

// Connection close runs code outside the control of the pool, so isolate it
// in its own thread.
fn spawn_close<C>(log: Logger, host: String, conn: C)
where
    C: Connection,
{
    let _close_thread =
        thread::spawn(move || close_connection(log, host, conn));
}

// Take the first usable idle connection, closing broken ones along the way.
// The returned connection is counted as active.
fn pop_idle<C>(entry: &mut HostEntry<C>, log: &Logger) -> Option<C>
where
    C: Connection,
{
    while let Some(conn) = entry.idle.pop_front() {
        entry.stats.idle_connections -= 1.into();
        if conn.has_broken() {
            warn!(log, "found broken idle connection for host {}", &entry.host);
            entry.stats.total_connections -= 1.into();
            spawn_close(log.clone(), entry.host.name.clone(), conn);
            continue;
        }
        entry.stats.active_connections += 1.into();
        return Some(conn);
    }
    None
}

fn close_idle<C>(entry: &mut HostEntry<C>, log: &Logger) -> u32
where
    C: Connection,
{
    let mut closed = 0;
    while let Some(conn) = entry.idle.pop_front() {
        entry.stats.idle_connections -= 1.into();
        entry.stats.total_connections -= 1.into();
        spawn_close(log.clone(), entry.host.name.clone(), conn);
        closed += 1;
    }
    closed
}

fn note_failure<C>(entry: &mut HostEntry<C>, threshold: u32, log: &Logger)
where
    C: Connection,
{
    entry.consecutive_failures += 1;
    debug!(
        log,
        "host {} consecutive failures: {}",
        &entry.host,
        entry.consecutive_failures
    );
    if entry.consecutive_failures >= threshold && !entry.is_down() {
        set_down(entry, log);
    }
}

fn set_down<C>(entry: &mut HostEntry<C>, log: &Logger)
where
    C: Connection,
{
    if !entry.is_down() {
        warn!(log, "marking host {} down", &entry.host);
    }
    entry.health = HostHealth::Down;
    close_idle(entry, log);
}

fn set_up<C>(entry: &mut HostEntry<C>, log: &Logger)
where
    C: Connection,
{
    if entry.is_down() {
        info!(log, "marking host {} up", &entry.host);
    }
    entry.health = HostHealth::Up;
    entry.consecutive_failures = 0;
}

fn refresh_topology<C, S>(
    protected_data: &ProtectedData<C>,
    topology: &Topology,
    supplier: &Mutex<S>,
    log: &Logger,
) -> bool
where
    C: Connection,
    S: HostSupplier,
{
    let refreshed = {
        let mut supplier = supplier.lock().unwrap();
        topology.refresh(&mut *supplier, log)
    };
    match refreshed {
        Some(snapshot) => {
            reconcile_entries(protected_data, &snapshot, log);
            true
        }
        None => false,
    }
}

// Bring the host entries in line with a newly published snapshot: add new
// hosts, drop removed ones, and apply changes in the supplier's view of each
// host's status. A host the pool marked down itself stays down until the
// supplier reports a change, a health check succeeds, or mark_up is called.
fn reconcile_entries<C>(
    protected_data: &ProtectedData<C>,
    snapshot: &TopologySnapshot,
    log: &Logger,
) where
    C: Connection,
{
    let mut connection_data = protected_data.connection_data_lock();

    let removed: Vec<HostKey> = connection_data
        .entries
        .keys()
        .filter(|key| !snapshot.contains(key))
        .cloned()
        .collect();
    removed.iter().for_each(|key| {
        if let Some(mut entry) = connection_data.entries.remove(key) {
            info!(log, "host {} left the topology", &entry.host);
            close_idle(&mut entry, log);
        }
    });

    let data = &mut *connection_data;
    snapshot.hosts().iter().for_each(|host| {
        let key = host.key();
        let joined = !data.entries.contains_key(&key);
        if joined {
            info!(log, "host {} joined the topology", host);
            let entry = HostEntry::new(host.clone(), data.next_generation);
            data.next_generation += 1;
            data.entries.insert(key.clone(), entry);
        }
        let entry = match data.entries.get_mut(&key) {
            Some(entry) => entry,
            None => return,
        };
        let recovered = !entry.host.is_up() && host.is_up();
        entry.host = host.clone();
        if !host.is_up() {
            set_down(entry, log);
        } else if joined || recovered {
            set_up(entry, log);
        }
    });

    drop(connection_data);
    protected_data.condvar_notify();
}

/// Start a thread to poll the host supplier periodically
fn start_topology_refresh<C, S>(
    timer: &timer::Timer,
    refresh_interval: u64,
    protected_data: ProtectedData<C>,
    topology: Arc<Topology>,
    supplier: Arc<Mutex<S>>,
    log: Logger,
) -> Guard
where
    C: Connection,
    S: HostSupplier,
{
    debug!(
        log,
        "starting topology refresh task, interval {} seconds", refresh_interval
    );
    timer.schedule_repeating(
        Duration::seconds(refresh_interval as i64),
        move || {
            refresh_topology(
                &protected_data,
                topology.as_ref(),
                supplier.as_ref(),
                &log,
            );
        },
    )
}

/// Start a thread to run periodic health checks on the connection pool
fn start_health_check<C, F>(
    timer: &timer::Timer,
    health_check_interval: u64,
    protected_data: ProtectedData<C>,
    topology: Arc<Topology>,
    create_connection: Arc<F>,
    log: Logger,
) -> Guard
where
    C: Connection,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    debug!(
        log,
        "starting connection health task, interval {} seconds",
        health_check_interval
    );
    timer.schedule_repeating(
        Duration::seconds(health_check_interval as i64),
        move || {
            check_health(
                &protected_data,
                topology.as_ref(),
                create_connection.as_ref(),
                &log,
            )
        },
    )
}

// Prune broken idle connections, then check every host the pool has marked
// down but the topology still lists as up. A host that accepts a connection and
// validates is marked up again.
fn check_health<C, F>(
    protected_data: &ProtectedData<C>,
    topology: &Topology,
    create_connection: &F,
    log: &Logger,
) where
    C: Connection,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    let suspects: Vec<Host> = {
        let mut connection_data = protected_data.connection_data_lock();
        if connection_data.state != ConnectionPoolState::Running {
            return;
        }

        let mut removed = 0;
        connection_data.entries.values_mut().for_each(|entry| {
            let idle: Vec<C> = entry.idle.drain(..).collect();
            for conn in idle {
                if conn.has_broken() {
                    warn!(log, "found broken connection!");
                    entry.stats.idle_connections -= 1.into();
                    entry.stats.total_connections -= 1.into();
                    spawn_close(log.clone(), entry.host.name.clone(), conn);
                    removed += 1;
                } else {
                    entry.idle.push_back(conn);
                }
            }
        });
        debug!(log, "Removed {} from connection pool", removed);

        let snapshot = topology.snapshot();
        connection_data
            .entries
            .iter()
            .filter(|(key, entry)| {
                entry.is_down()
                    && snapshot.host(key).map_or(false, |h| h.is_up())
            })
            .map(|(_, entry)| entry.host.clone())
            .collect()
    };

    for host in suspects {
        debug!(log, "checking down host {}", &host);
        let mut conn = create_connection(&host);
        let healthy = match conn.connect() {
            Ok(()) => {
                let valid = conn.is_valid();
                if let Err(e) = conn.close() {
                    warn!(log, "failed to close health check connection for {}: {}", &host, e);
                }
                valid
            }
            Err(e) => {
                debug!(log, "health check of host {} failed: {}", &host, e);
                false
            }
        };

        if healthy {
            let mut connection_data = protected_data.connection_data_lock();
            if let Some(entry) = connection_data.entries.get_mut(&host.key()) {
                set_up(entry, log);
            }
        }
    }
}
