// Copyright 2020 Joyent, Inc.

//! A sharded counter whose increments are batched through pipelines.
//!
//! Producers enqueue commands on an unbounded channel and return immediately.
//! A single worker thread owns one pipeline per shard, applies increments to a
//! randomly chosen shard, and syncs all shards when asked to flush.
//!
//! `close` waits a bounded time for the worker to drain the queue. Anything
//! still queued or unflushed when that bound elapses is abandoned.

use std::fmt;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rand::Rng;
use slog::{debug, error, info, o, trace, warn, Logger};

use crate::client::DynoClient;
use crate::connection::CommandConnection;
use crate::error::Error;
use crate::host::Host;
use crate::pipeline::Pipeline;
use crate::supplier::HostSupplier;

// Default number of shard keys
const DEFAULT_SHARD_COUNT: usize = 3;
// Default time in milliseconds close waits for the worker to drain
const DEFAULT_SHUTDOWN_WAIT: u64 = 2000;

/// The configuration options for a `PipelineCounter`.
#[derive(Clone, Debug, Default)]
pub struct CounterOptions {
    /// Optional number of shard keys. If not specified the default is 3.
    pub shard_count: Option<usize>,
    /// Optional time in milliseconds `close` waits for queued commands to be
    /// processed. If not specified the default is 2000.
    pub shutdown_wait: Option<u64>,
    /// An optional `slog` logger instance. If none is provided the client's
    /// logger is used.
    pub log: Option<Logger>,
}

/// The lifecycle of a counter. `Closed` is terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CounterState {
    Created,
    Initialized,
    Closed,
}

impl fmt::Display for CounterState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CounterState::Created => String::from("created").fmt(fmt),
            CounterState::Initialized => String::from("initialized").fmt(fmt),
            CounterState::Closed => String::from("closed").fmt(fmt),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Command {
    Increment,
    Flush,
    Stop,
}

struct CounterInner<C, S, F>
where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    state: CounterState,
    client: DynoClient<C, S, F>,
    tx: Option<Sender<Command>>,
    done: Option<Receiver<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

/// A counter spread across `shard_count` keys named `<key>_<n>`. Its value is
/// the sum of the shard values.
pub struct PipelineCounter<C, S, F>
where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    key: String,
    shard_keys: Vec<String>,
    shutdown_wait: Duration,
    log: Logger,
    inner: Mutex<CounterInner<C, S, F>>,
}

impl<C, S, F> PipelineCounter<C, S, F>
where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    pub fn new(
        client: DynoClient<C, S, F>,
        key: &str,
        options: CounterOptions,
    ) -> Self {
        let shard_count =
            options.shard_count.unwrap_or(DEFAULT_SHARD_COUNT).max(1);
        let shutdown_wait = Duration::from_millis(
            options.shutdown_wait.unwrap_or(DEFAULT_SHUTDOWN_WAIT),
        );
        let log = options
            .log
            .unwrap_or_else(|| client.log().clone())
            .new(o!("counter" => key.to_string()));
        let shard_keys = (0..shard_count).map(|i| format!("{}_{}", key, i)).collect();

        PipelineCounter {
            key: key.to_string(),
            shard_keys,
            shutdown_wait,
            log,
            inner: Mutex::new(CounterInner {
                state: CounterState::Created,
                client,
                tx: None,
                done: None,
                worker: None,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn shard_keys(&self) -> &[String] {
        &self.shard_keys
    }

    pub fn state(&self) -> CounterState {
        self.inner.lock().unwrap().state
    }

    /// Start the worker thread. Calling this more than once has no effect.
    pub fn initialize(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CounterState::Initialized => return Ok(()),
            CounterState::Closed => return Err(Error::AlreadyClosed),
            CounterState::Created => (),
        }

        let (tx, rx) = channel();
        let (done_tx, done_rx) = channel();
        let client = inner.client.clone();
        let shard_keys = self.shard_keys.clone();
        let log = self.log.clone();
        let worker = thread::spawn(move || {
            run_worker(client, shard_keys, rx, done_tx, log)
        });

        inner.tx = Some(tx);
        inner.done = Some(done_rx);
        inner.worker = Some(worker);
        inner.state = CounterState::Initialized;
        info!(self.log, "counter initialized with {} shards", self.shard_keys.len());
        Ok(())
    }

    /// Queue an increment of one randomly chosen shard. Never blocks on the
    /// network.
    pub fn increment(&self) -> Result<(), Error> {
        self.send(Command::Increment)
    }

    /// Ask the worker to sync every shard with pending increments.
    pub fn flush(&self) -> Result<(), Error> {
        self.send(Command::Flush)
    }

    /// Stop accepting commands and wait up to the shutdown bound for the
    /// worker to process what is already queued.
    pub fn close(&self) -> Result<(), Error> {
        let (tx, done, worker) = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                CounterState::Closed => return Ok(()),
                CounterState::Created => {
                    inner.state = CounterState::Closed;
                    return Ok(());
                }
                CounterState::Initialized => (),
            }
            inner.state = CounterState::Closed;
            (inner.tx.take(), inner.done.take(), inner.worker.take())
        };

        if let Some(tx) = tx {
            if tx.send(Command::Stop).is_err() {
                warn!(self.log, "counter worker exited before stop");
            }
        }

        match done.map(|d| d.recv_timeout(self.shutdown_wait)) {
            Some(Ok(())) | Some(Err(RecvTimeoutError::Disconnected)) => {
                if let Some(worker) = worker {
                    let _ = worker.join();
                }
                debug!(self.log, "counter worker stopped");
            }
            Some(Err(RecvTimeoutError::Timeout)) => {
                warn!(
                    self.log,
                    "counter worker did not stop within {:?}, abandoning \
                     queued increments",
                    self.shutdown_wait
                );
            }
            None => (),
        }
        Ok(())
    }

    /// The counter's value: the sum of every shard key, read directly
    /// through the client.
    pub fn get_value(&self) -> Result<i64, Error> {
        let client = self.inner.lock().unwrap().client.clone();
        self.shard_keys.iter().try_fold(0i64, |sum, shard| {
            let reply = client.get(shard.as_str())?;
            if reply.is_nil() {
                return Ok(sum);
            }
            reply.as_i64().map(|v| sum + v).ok_or_else(|| {
                Error::ApplicationError(format!(
                    "shard {} does not hold an integer",
                    shard
                ))
            })
        })
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            CounterState::Created => Err(Error::NotInitialized),
            CounterState::Closed => Err(Error::AlreadyClosed),
            CounterState::Initialized => match &inner.tx {
                Some(tx) => tx.send(command).map_err(|_| Error::AlreadyClosed),
                None => Err(Error::AlreadyClosed),
            },
        }
    }
}

impl<C, S, F> Drop for PipelineCounter<C, S, F>
where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn open_pipelines<C, S, F>(
    client: &DynoClient<C, S, F>,
    count: usize,
) -> Vec<Pipeline<C, S, F>>
where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    (0..count).map(|_| client.pipelined()).collect()
}

fn run_worker<C, S, F>(
    client: DynoClient<C, S, F>,
    shard_keys: Vec<String>,
    rx: Receiver<Command>,
    done: Sender<()>,
    log: Logger,
) where
    C: CommandConnection,
    S: HostSupplier,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    trace!(log, "counter worker starting");
    let mut rng = rand::thread_rng();
    let mut pipelines = open_pipelines(&client, shard_keys.len());
    let mut pending: u64 = 0;

    for command in rx.iter() {
        match command {
            Command::Increment => {
                let shard = rng.gen_range(0, shard_keys.len());
                match pipelines[shard].incr(shard_keys[shard].as_str()) {
                    Ok(_) => pending += 1,
                    Err(e) => error!(
                        log,
                        "failed to queue increment of {}: {}",
                        shard_keys[shard],
                        e
                    ),
                }
            }
            Command::Flush => {
                if pending == 0 {
                    trace!(log, "flush with nothing pending");
                    continue;
                }
                debug!(log, "flushing {} increments", pending);
                for (pipeline, shard) in pipelines.iter_mut().zip(&shard_keys)
                {
                    match pipeline.sync() {
                        Ok(results) => results
                            .iter()
                            .filter_map(|r| r.as_ref().err())
                            .for_each(|e| {
                                warn!(log, "increment of {} failed: {}", shard, e)
                            }),
                        Err(e) => {
                            error!(log, "failed to sync {}: {}", shard, e)
                        }
                    }
                }
                pipelines = open_pipelines(&client, shard_keys.len());
                pending = 0;
            }
            Command::Stop => break,
        }
    }

    if pending > 0 {
        warn!(log, "counter worker stopping with {} unflushed increments", pending);
    }
    drop(pipelines);
    let _ = done.send(());
    trace!(log, "counter worker exiting");
}
