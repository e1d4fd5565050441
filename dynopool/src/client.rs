// Copyright 2020 Joyent, Inc.

use std::sync::Arc;
use std::thread;

use slog::{debug, error, o, warn, Drain, Logger};

use crate::connection::CommandConnection;
use crate::connection_pool::types::{ConnectionPoolOptions, HostHealth};
use crate::connection_pool::{ConnectionPool, PoolConnection};
use crate::counter::{CounterOptions, PipelineCounter};
use crate::error::Error;
use crate::host::Host;
use crate::operation::{Arg, OpName, OperationMetadata, OperationRegistry, Value};
use crate::pipeline::Pipeline;
use crate::retry::{RetryContext, RetryPolicy, RetryPolicyFactory};
use crate::supplier::HostSupplier;

/// A token-aware client for a Dynomite cluster.
///
/// Each operation is routed to the host owning its key, executed on a pooled
/// connection, and retried according to the configured retry policy when it
/// fails at the transport level. Clones share the same pool; only the
/// original instance stops it.
pub struct DynoClient<C, S, F>
where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    pool: ConnectionPool<C, S, F>,
    registry: Arc<OperationRegistry<C::Buffer>>,
    retry_policy: Arc<dyn RetryPolicyFactory>,
    log: Logger,
}

impl<C, S, F> Clone for DynoClient<C, S, F>
where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        DynoClient {
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            retry_policy: self.retry_policy.clone(),
            log: self.log.clone(),
        }
    }
}

impl<C, S, F> DynoClient<C, S, F>
where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    pub fn new(
        mut options: ConnectionPoolOptions,
        supplier: S,
        create_connection: F,
        registry: OperationRegistry<C::Buffer>,
    ) -> Self {
        let log = options
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        options.log = Some(log.new(o!("component" => "pool")));
        let retry_policy = options.retry_policy.unwrap_or_default();

        debug!(log, "creating client with retry policy {}", retry_policy);
        let pool = ConnectionPool::new(options, supplier, create_connection);

        DynoClient {
            pool,
            registry: Arc::new(registry),
            retry_policy: Arc::new(retry_policy),
            log,
        }
    }

    /// Replace the retry policy configured through the pool options.
    pub fn with_retry_policy<R>(mut self, factory: R) -> Self
    where
        R: RetryPolicyFactory + 'static,
    {
        self.retry_policy = Arc::new(factory);
        self
    }

    pub fn pool(&self) -> &ConnectionPool<C, S, F> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<OperationRegistry<C::Buffer>> {
        &self.registry
    }

    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicyFactory> {
        &self.retry_policy
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// The host `key` routes to in the current topology.
    pub fn resolve(&self, key: &[u8]) -> Result<Host, Error> {
        self.pool.resolve(key)
    }

    /// Execute a single operation on the host owning its key.
    pub fn execute(&self, op: OperationMetadata) -> Result<Value, Error> {
        let key = op.key()?;
        let mut policy = self.retry_policy.policy();
        let mut ctx = RetryContext::new();

        loop {
            let mut conn = self.claim_for_key(&key, policy.as_mut(), &mut ctx)?;
            let mut buffer = C::Buffer::default();
            self.registry.apply(&mut buffer, &op)?;

            let reply = conn.flush(&mut buffer).and_then(|results| {
                results.into_iter().next().ok_or_else(|| {
                    Error::ConnectionFailure(format!(
                        "no reply to {} from {}",
                        op.name,
                        conn.host()
                    ))
                })
            });

            match reply {
                Ok(result) => {
                    conn.succeeded();
                    return result;
                }
                Err(e) => {
                    warn!(
                        self.log,
                        "{} failed on host {}: {}",
                        op.name,
                        conn.host(),
                        e
                    );
                    // Only a transport failure says anything about the
                    // connection or its host.
                    if e.is_connection_failure() {
                        conn.fail();
                    }
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    ctx.record_failure(e);
                    self.backoff(policy.as_mut(), &mut ctx)?;
                }
            }
        }
    }

    pub fn get<K: Into<Arg>>(&self, key: K) -> Result<Value, Error> {
        self.execute(OperationMetadata::new(OpName::Get, vec![key.into()])?)
    }

    pub fn set<K, V>(&self, key: K, value: V) -> Result<Value, Error>
    where
        K: Into<Arg>,
        V: Into<Arg>,
    {
        self.execute(OperationMetadata::new(
            OpName::Set,
            vec![key.into(), value.into()],
        )?)
    }

    pub fn incr<K: Into<Arg>>(&self, key: K) -> Result<i64, Error> {
        let reply =
            self.execute(OperationMetadata::new(OpName::Incr, vec![key.into()])?)?;
        integer_reply(OpName::Incr, &reply)
    }

    pub fn incr_by<K: Into<Arg>>(&self, key: K, by: i64) -> Result<i64, Error> {
        let reply = self.execute(OperationMetadata::new(
            OpName::IncrBy,
            vec![key.into(), Arg::Int(by)],
        )?)?;
        integer_reply(OpName::IncrBy, &reply)
    }

    pub fn del<K: Into<Arg>>(&self, key: K) -> Result<i64, Error> {
        let reply =
            self.execute(OperationMetadata::new(OpName::Del, vec![key.into()])?)?;
        integer_reply(OpName::Del, &reply)
    }

    /// Start a pipeline. It binds to the host owning the first key appended.
    pub fn pipelined(&self) -> Pipeline<C, S, F> {
        Pipeline::new(self.clone())
    }

    /// Create a sharded counter stored under `key`. The counter must be
    /// initialized before use.
    pub fn counter(
        &self,
        key: &str,
        options: CounterOptions,
    ) -> PipelineCounter<C, S, F> {
        PipelineCounter::new(self.clone(), key, options)
    }

    /// Stop the underlying pool. Only the original client may do this.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.pool.stop()
    }

    /// Claim a connection to a host that can serve `key`, retrying across
    /// candidates as the policy allows. Each claim counts as an attempt in
    /// `ctx`.
    pub(crate) fn claim_for_key(
        &self,
        key: &[u8],
        policy: &mut dyn RetryPolicy,
        ctx: &mut RetryContext,
    ) -> Result<PoolConnection<C, S, F>, Error> {
        loop {
            let candidates: Vec<Host> = self
                .pool
                .topology()
                .snapshot()
                .replicas(key)?
                .into_iter()
                .filter(|h| self.pool.host_health(h) != Some(HostHealth::Down))
                .collect();

            let host = policy
                .select_host(&candidates, ctx)
                .ok_or(Error::NoAvailableHost)?;
            ctx.begin_attempt(&host);

            match self.pool.claim(&host) {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_retryable() => {
                    debug!(self.log, "claim on host {} failed: {}", &host, e);
                    ctx.record_failure(e);
                    self.backoff(policy, ctx)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait before the next attempt, or return the terminal error if the
    /// policy does not allow one.
    pub(crate) fn backoff(
        &self,
        policy: &mut dyn RetryPolicy,
        ctx: &mut RetryContext,
    ) -> Result<(), Error> {
        if !policy.allow_retry(ctx) {
            let err = ctx.exhausted();
            error!(self.log, "giving up: {}", err);
            return Err(err);
        }
        let delay = policy.next_delay(ctx);
        debug!(
            self.log,
            "retrying after {:?} (attempt {})",
            delay,
            ctx.attempts + 1
        );
        if delay.as_millis() > 0 {
            thread::sleep(delay);
        }
        Ok(())
    }
}

fn integer_reply(name: OpName, reply: &Value) -> Result<i64, Error> {
    reply.as_i64().ok_or_else(|| {
        Error::ApplicationError(format!(
            "unexpected reply to {}: {:?}",
            name, reply
        ))
    })
}
