// Copyright 2020 Joyent, Inc.

// Not every test binary uses every helper
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::{Error as IOError, ErrorKind};
use std::mem;
use std::net::{IpAddr, Ipv4Addr};
use std::str;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use slog::{o, Drain, Logger};

use dynopool::client::DynoClient;
use dynopool::connection::{CommandConnection, Connection};
use dynopool::connection_pool::types::ConnectionPoolOptions;
use dynopool::error::Error;
use dynopool::host::{Host, HostPort};
use dynopool::operation::{Arg, OpName, OperationRegistry, OperationResult, Value};
use dynopool::supplier::HostSupplier;
use dynopool::token::Token;

pub const PORT: HostPort = 8102;

pub fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn host(octet: u8, rack: &str, token: u32) -> Host {
    Host::new(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, octet)), PORT, rack)
        .with_token(Token::from(token))
        .with_datacenter("dc")
}

/// Three hosts in one rack splitting the ring evenly.
pub fn one_rack() -> Vec<Host> {
    vec![
        host(1, "rack1", 1_431_655_765),
        host(2, "rack1", 2_863_311_530),
        host(3, "rack1", 4_294_967_295),
    ]
}

/// Two racks, each holding a full copy of a three-token ring.
pub fn two_racks() -> Vec<Host> {
    let mut hosts = one_rack();
    hosts.extend(vec![
        host(4, "rack2", 1_431_655_765),
        host(5, "rack2", 2_863_311_530),
        host(6, "rack2", 4_294_967_295),
    ]);
    hosts
}

/// A command as queued in a `MemoryConnection` buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryCommand {
    pub name: OpName,
    pub args: Vec<Arg>,
}

/// A command the store has executed, with the connection that sent it.
#[derive(Clone, Debug, PartialEq)]
pub struct Executed {
    pub host: String,
    pub connection: usize,
    pub name: OpName,
    pub key: Vec<u8>,
}

/// A single keyspace shared by every host, standing in for a fully
/// replicated cluster.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    executed: Mutex<Vec<Executed>>,
    failing_flushes: AtomicUsize,
    rejected_flushes: AtomicUsize,
    silent_flushes: AtomicUsize,
    refused: Mutex<HashSet<String>>,
    connects: AtomicUsize,
    next_id: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryStore::default())
    }

    /// Make the next `n` flushes fail before executing anything.
    pub fn fail_next_flushes(&self, n: usize) {
        self.failing_flushes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` flushes fail with a server error that is not tied
    /// to any one command. The connection stays usable.
    pub fn reject_next_flushes(&self, n: usize) {
        self.rejected_flushes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` flushes return no replies at all.
    pub fn drop_next_replies(&self, n: usize) {
        self.silent_flushes.store(n, Ordering::SeqCst);
    }

    /// Refuse new connections to `host`.
    pub fn refuse(&self, host: &Host) {
        self.refused.lock().unwrap().insert(host.name.clone());
    }

    pub fn accept(&self, host: &Host) {
        self.refused.lock().unwrap().remove(&host.name);
    }

    /// The number of connection attempts made so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.executed.lock().unwrap().clone()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.data
            .lock()
            .unwrap()
            .get(key.as_bytes())
            .map(|v| String::from_utf8_lossy(v).to_string())
    }

    fn is_refused(&self, host: &Host) -> bool {
        self.refused.lock().unwrap().contains(&host.name)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn execute(
        &self,
        host: &Host,
        connection: usize,
        cmd: &MemoryCommand,
    ) -> OperationResult {
        let key = cmd.args[0].to_bytes();
        self.executed.lock().unwrap().push(Executed {
            host: host.name.clone(),
            connection,
            name: cmd.name,
            key: key.clone(),
        });

        let mut data = self.data.lock().unwrap();
        match cmd.name {
            OpName::Get => Ok(data
                .get(&key)
                .map(|v| Value::Data(v.clone()))
                .unwrap_or(Value::Nil)),
            OpName::Set => {
                data.insert(key, cmd.args[1].to_bytes());
                Ok(Value::Status(String::from("OK")))
            }
            OpName::Incr | OpName::IncrBy | OpName::Decr | OpName::DecrBy => {
                let by = match cmd.name {
                    OpName::Incr => 1,
                    OpName::Decr => -1,
                    OpName::IncrBy => arg_i64(&cmd.args[1])?,
                    _ => -arg_i64(&cmd.args[1])?,
                };
                let current = match data.get(&key) {
                    Some(v) => bytes_i64(v)?,
                    None => 0,
                };
                let next = current + by;
                data.insert(key, next.to_string().into_bytes());
                Ok(Value::Int(next))
            }
            OpName::Del => {
                let removed = cmd
                    .args
                    .iter()
                    .filter(|a| data.remove(&a.to_bytes()).is_some())
                    .count();
                Ok(Value::Int(removed as i64))
            }
            OpName::Exists => Ok(Value::Int(
                cmd.args
                    .iter()
                    .filter(|a| data.contains_key(&a.to_bytes()))
                    .count() as i64,
            )),
            OpName::Append => {
                let entry = data.entry(key).or_insert_with(Vec::new);
                entry.extend(cmd.args[1].to_bytes());
                Ok(Value::Int(entry.len() as i64))
            }
            other => Err(Error::ApplicationError(format!(
                "ERR unknown command '{}'",
                other
            ))),
        }
    }
}

fn not_an_integer() -> Error {
    Error::ApplicationError(String::from(
        "ERR value is not an integer or out of range",
    ))
}

fn bytes_i64(bytes: &[u8]) -> Result<i64, Error> {
    str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(not_an_integer)
}

fn arg_i64(arg: &Arg) -> Result<i64, Error> {
    match arg {
        Arg::Int(i) => Ok(*i),
        other => bytes_i64(&other.to_bytes()),
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    host: Host,
    id: usize,
    store: Arc<MemoryStore>,
    connected: bool,
    broken: bool,
}

impl MemoryConnection {
    pub fn creator(
        store: Arc<MemoryStore>,
    ) -> impl Fn(&Host) -> MemoryConnection + Send + Sync + 'static {
        move |host: &Host| MemoryConnection {
            host: host.clone(),
            id: store.next_id.fetch_add(1, Ordering::SeqCst),
            store: store.clone(),
            connected: false,
            broken: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

impl Connection for MemoryConnection {
    type Error = IOError;

    fn connect(&mut self) -> Result<(), Self::Error> {
        self.store.connects.fetch_add(1, Ordering::SeqCst);
        if self.store.is_refused(&self.host) {
            return Err(IOError::new(
                ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        self.connected = true;
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        self.connected && !self.store.is_refused(&self.host)
    }

    fn has_broken(&self) -> bool {
        self.broken
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }
}

impl CommandConnection for MemoryConnection {
    type Buffer = Vec<MemoryCommand>;

    fn flush(
        &mut self,
        buffer: &mut Self::Buffer,
    ) -> Result<Vec<OperationResult>, Error> {
        let commands = mem::replace(buffer, Vec::new());
        if MemoryStore::take(&self.store.failing_flushes) {
            self.broken = true;
            return Err(Error::ConnectionFailure(String::from(
                "connection reset by peer",
            )));
        }
        if MemoryStore::take(&self.store.rejected_flushes) {
            return Err(Error::ApplicationError(String::from(
                "READONLY You can't write against a read only replica",
            )));
        }
        if MemoryStore::take(&self.store.silent_flushes) {
            return Ok(Vec::new());
        }
        Ok(commands
            .iter()
            .map(|cmd| self.store.execute(&self.host, self.id, cmd))
            .collect())
    }
}

pub fn memory_registry() -> OperationRegistry<Vec<MemoryCommand>> {
    OpName::ALL
        .iter()
        .fold(OperationRegistry::new(), |registry, name| {
            let name = *name;
            registry.register(
                name,
                move |buf: &mut Vec<MemoryCommand>, args: &[Arg]| {
                    buf.push(MemoryCommand {
                        name,
                        args: args.to_vec(),
                    });
                    Ok(())
                },
            )
        })
}

/// A supplier whose host list and availability can be changed by the test.
#[derive(Clone, Debug)]
pub struct SharedSupplier {
    hosts: Arc<Mutex<Vec<Host>>>,
    failing: Arc<AtomicBool>,
}

impl SharedSupplier {
    pub fn new(hosts: Vec<Host>) -> Self {
        SharedSupplier {
            hosts: Arc::new(Mutex::new(hosts)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_hosts(&self, hosts: Vec<Host>) {
        *self.hosts.lock().unwrap() = hosts;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl HostSupplier for SharedSupplier {
    fn list_hosts(&mut self) -> Result<Vec<Host>, Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::SupplierFailure(String::from(
                "discovery service unavailable",
            )));
        }
        Ok(self.hosts.lock().unwrap().clone())
    }
}

pub fn pool_options(max_connections_per_host: u32) -> ConnectionPoolOptions {
    ConnectionPoolOptions {
        max_connections_per_host: Some(max_connections_per_host),
        claim_timeout: Some(1000),
        log: Some(test_logger()),
        local_rack: Some(String::from("rack1")),
        ..Default::default()
    }
}

pub fn client_with(
    options: ConnectionPoolOptions,
    store: &Arc<MemoryStore>,
    supplier: SharedSupplier,
) -> DynoClient<
    MemoryConnection,
    SharedSupplier,
    impl Fn(&Host) -> MemoryConnection + Send + Sync + 'static,
> {
    DynoClient::new(
        options,
        supplier,
        MemoryConnection::creator(store.clone()),
        memory_registry(),
    )
}
