// Copyright 2020 Joyent, Inc.

//! Pipelined execution with an operation ledger.
//!
//! Every command appended to a pipeline is recorded as `OperationMetadata`
//! before it is added to the connection's command buffer. If a flush fails at
//! the transport level the buffer is discarded, a new connection is claimed,
//! and the ledger is re-applied in its original order, so results keep their
//! positions and no command is lost or executed twice.

use std::fmt;

use slog::{debug, info, o, warn, Logger};

use crate::client::DynoClient;
use crate::connection::CommandConnection;
use crate::connection_pool::PoolConnection;
use crate::error::Error;
use crate::host::Host;
use crate::operation::{
    Arg, OpName, OperationMetadata, OperationResult, PendingResult,
};
use crate::retry::{RetryContext, RetryPolicy};
use crate::supplier::HostSupplier;

/// The lifecycle of a pipeline. `Closed` is terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PipelineState {
    Created,
    Open,
    Flushed,
    Closed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PipelineState::Created => String::from("created").fmt(fmt),
            PipelineState::Open => String::from("open").fmt(fmt),
            PipelineState::Flushed => String::from("flushed").fmt(fmt),
            PipelineState::Closed => String::from("closed").fmt(fmt),
        }
    }
}

/// A batch of commands executed against a single host. Not safe for
/// concurrent use; wrap it in something that serializes access.
pub struct Pipeline<C, S, F>
where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    client: DynoClient<C, S, F>,
    connection: Option<PoolConnection<C, S, F>>,
    host: Option<Host>,
    buffer: C::Buffer,
    ledger: Vec<(OperationMetadata, PendingResult)>,
    state: PipelineState,
    log: Logger,
}

impl<C, S, F> Pipeline<C, S, F>
where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    pub(crate) fn new(client: DynoClient<C, S, F>) -> Self {
        let log = client.log().new(o!("component" => "pipeline"));
        Pipeline {
            client,
            connection: None,
            host: None,
            buffer: C::Buffer::default(),
            ledger: Vec::new(),
            state: PipelineState::Created,
            log,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// The host the pipeline is bound to, once a command has been appended.
    pub fn host(&self) -> Option<&Host> {
        self.host.as_ref()
    }

    /// The number of commands appended since the last sync.
    pub fn pending(&self) -> usize {
        self.ledger.len()
    }

    /// Queue `op`. The first command binds the pipeline to the host owning
    /// its key; every later command must route to that same host.
    pub fn append(
        &mut self,
        op: OperationMetadata,
    ) -> Result<PendingResult, Error> {
        if self.state == PipelineState::Closed {
            return Err(Error::PipelineClosed);
        }

        let key = op.key()?;
        match self.host.clone() {
            None => self.bind(&key)?,
            Some(host) => {
                if !self.client.pool().topology().snapshot().owns(&host, &key) {
                    return Err(Error::KeyNotOnPipelineHost(host.key()));
                }
            }
        }

        let position = self.ledger.len();
        let pending = PendingResult::new(position);
        self.ledger.push((op, pending.clone()));
        let registry = self.client.registry();
        let applied = registry.apply(&mut self.buffer, &self.ledger[position].0);
        if let Err(e) = applied {
            self.ledger.pop();
            return Err(e);
        }

        self.state = PipelineState::Open;
        Ok(pending)
    }

    /// Flush every queued command and return the results in submission
    /// order. Each `PendingResult` handed out by `append` is filled as well.
    ///
    /// On a transport failure the pipeline moves to a new connection and
    /// replays its ledger, as far as the retry policy allows. If the policy
    /// gives up, every pending result receives the terminal error.
    pub fn sync(&mut self) -> Result<Vec<OperationResult>, Error> {
        if self.state == PipelineState::Closed {
            return Err(Error::PipelineClosed);
        }
        if self.ledger.is_empty() {
            self.state = PipelineState::Flushed;
            return Ok(Vec::new());
        }

        let mut policy = self.client.retry_policy().policy();
        let mut ctx = RetryContext::new();
        if self.connection.is_none() {
            // An earlier sync gave up its connection, so commands appended
            // since then still need one.
            if let Err(e) = self.reconnect(policy.as_mut(), &mut ctx) {
                self.fail_pending(&e);
                return Err(e);
            }
        } else if let Some(host) = &self.host {
            ctx.begin_attempt(host);
        }

        loop {
            let outcome = match self.connection.as_mut() {
                Some(conn) => conn.flush(&mut self.buffer),
                None => Err(Error::ConnectionFailure(String::from(
                    "pipeline has no connection",
                ))),
            };
            let outcome = outcome.and_then(|results| {
                if results.len() == self.ledger.len() {
                    Ok(results)
                } else {
                    Err(Error::ConnectionFailure(format!(
                        "expected {} replies, received {}",
                        self.ledger.len(),
                        results.len()
                    )))
                }
            });

            match outcome {
                Ok(results) => {
                    if let Some(conn) = &self.connection {
                        conn.succeeded();
                    }
                    debug!(self.log, "synced {} commands", results.len());
                    self.ledger
                        .drain(..)
                        .zip(results.iter())
                        .for_each(|((_, pending), result)| {
                            pending.fill(result.clone())
                        });
                    self.state = PipelineState::Flushed;
                    return Ok(results);
                }
                Err(e) => {
                    if let Some(conn) = self.connection.take() {
                        warn!(
                            self.log,
                            "pipeline flush on host {} failed: {}",
                            conn.host(),
                            e
                        );
                        if e.is_connection_failure() {
                            conn.fail();
                        }
                    }
                    self.buffer = C::Buffer::default();

                    if !e.is_retryable() {
                        self.fail_pending(&e);
                        return Err(e);
                    }
                    ctx.record_failure(e);

                    if let Err(e) = self.rebind_and_replay(
                        policy.as_mut(),
                        &mut ctx,
                    ) {
                        self.fail_pending(&e);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Return the connection to the pool. Commands appended since the last
    /// sync are discarded and their results fail with `PipelineClosed`.
    pub fn close(&mut self) {
        if self.state == PipelineState::Closed {
            return;
        }
        if !self.ledger.is_empty() {
            debug!(
                self.log,
                "closing pipeline with {} unsynced commands",
                self.ledger.len()
            );
            self.fail_pending(&Error::PipelineClosed);
        }
        self.buffer = C::Buffer::default();
        self.connection = None;
        self.state = PipelineState::Closed;
    }

    pub fn get<K: Into<Arg>>(&mut self, key: K) -> Result<PendingResult, Error> {
        self.append(OperationMetadata::new(OpName::Get, vec![key.into()])?)
    }

    pub fn set<K, V>(&mut self, key: K, value: V) -> Result<PendingResult, Error>
    where
        K: Into<Arg>,
        V: Into<Arg>,
    {
        self.append(OperationMetadata::new(
            OpName::Set,
            vec![key.into(), value.into()],
        )?)
    }

    pub fn incr<K: Into<Arg>>(&mut self, key: K) -> Result<PendingResult, Error> {
        self.append(OperationMetadata::new(OpName::Incr, vec![key.into()])?)
    }

    pub fn incr_by<K: Into<Arg>>(
        &mut self,
        key: K,
        by: i64,
    ) -> Result<PendingResult, Error> {
        self.append(OperationMetadata::new(
            OpName::IncrBy,
            vec![key.into(), Arg::Int(by)],
        )?)
    }

    pub fn decr<K: Into<Arg>>(&mut self, key: K) -> Result<PendingResult, Error> {
        self.append(OperationMetadata::new(OpName::Decr, vec![key.into()])?)
    }

    pub fn del<K: Into<Arg>>(&mut self, key: K) -> Result<PendingResult, Error> {
        self.append(OperationMetadata::new(OpName::Del, vec![key.into()])?)
    }

    pub fn hget<K, V>(&mut self, key: K, field: V) -> Result<PendingResult, Error>
    where
        K: Into<Arg>,
        V: Into<Arg>,
    {
        self.append(OperationMetadata::new(
            OpName::HGet,
            vec![key.into(), field.into()],
        )?)
    }

    pub fn hset<K, V, W>(
        &mut self,
        key: K,
        field: V,
        value: W,
    ) -> Result<PendingResult, Error>
    where
        K: Into<Arg>,
        V: Into<Arg>,
        W: Into<Arg>,
    {
        self.append(OperationMetadata::new(
            OpName::HSet,
            vec![key.into(), field.into(), value.into()],
        )?)
    }

    fn bind(&mut self, key: &[u8]) -> Result<(), Error> {
        let mut policy = self.client.retry_policy().policy();
        let mut ctx = RetryContext::new();
        let conn = self.client.claim_for_key(key, policy.as_mut(), &mut ctx)?;
        debug!(self.log, "pipeline bound to host {}", conn.host());
        self.host = Some(conn.host().clone());
        self.connection = Some(conn);
        Ok(())
    }

    fn rebind_and_replay(
        &mut self,
        policy: &mut dyn RetryPolicy,
        ctx: &mut RetryContext,
    ) -> Result<(), Error> {
        self.client.backoff(policy, ctx)?;
        self.reconnect(policy, ctx)
    }

    // Claim a new connection and re-apply the whole ledger to a fresh buffer.
    fn reconnect(
        &mut self,
        policy: &mut dyn RetryPolicy,
        ctx: &mut RetryContext,
    ) -> Result<(), Error> {
        self.buffer = C::Buffer::default();
        let key = match self.ledger.first() {
            Some((op, _)) => op.key()?,
            None => return Ok(()),
        };
        let conn = self.client.claim_for_key(&key, policy, ctx)?;

        info!(
            self.log,
            "replaying {} commands on host {}",
            self.ledger.len(),
            conn.host()
        );
        let registry = self.client.registry();
        for (op, _) in self.ledger.iter() {
            registry.apply(&mut self.buffer, op)?;
        }

        self.host = Some(conn.host().clone());
        self.connection = Some(conn);
        Ok(())
    }

    fn fail_pending(&mut self, err: &Error) {
        self.ledger
            .drain(..)
            .for_each(|(_, pending)| pending.fill(Err(err.clone())));
        self.buffer = C::Buffer::default();
    }
}

impl<C, S, F> Drop for Pipeline<C, S, F>
where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.close();
    }
}
