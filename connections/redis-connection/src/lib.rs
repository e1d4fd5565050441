// Copyright 2020 Joyent, Inc.

//! A dynopool connection speaking the Redis protocol to a Dynomite node,
//! built on the `redis` crate.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use redis::{ConnectionLike, RedisError};

use dynopool::connection::{CommandConnection, Connection};
use dynopool::error::Error;
use dynopool::host::Host;
use dynopool::operation::{
    Arg, OpName, OperationRegistry, OperationResult, Value,
};

// Default connect timeout in milliseconds
const DEFAULT_CONNECT_TIMEOUT: u64 = 5000;

/// Application level settings applied to every connection.
#[derive(Clone, Debug, Default)]
pub struct RedisConnectionOptions {
    /// The logical database to select. If not specified the default is 0.
    pub db: Option<i64>,
    pub password: Option<String>,
    /// Optional connect timeout in milliseconds. If not specified the default
    /// is 5000.
    pub connect_timeout: Option<u64>,
    /// Optional read and write timeout in milliseconds. If not specified
    /// reads and writes block indefinitely.
    pub io_timeout: Option<u64>,
}

/// Commands queued for one round trip.
pub struct CommandBuffer {
    pipeline: redis::Pipeline,
    count: usize,
}

impl CommandBuffer {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn push(&mut self, name: OpName, args: &[Arg]) {
        self.pipeline.cmd(name.command());
        args.iter().for_each(|arg| {
            self.pipeline.arg(arg.to_bytes());
        });
        self.count += 1;
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        CommandBuffer {
            pipeline: redis::pipe(),
            count: 0,
        }
    }
}

pub struct RedisConnection {
    url: String,
    options: RedisConnectionOptions,
    connection: Option<redis::Connection>,
}

impl RedisConnection {
    pub fn new(host: &Host, options: RedisConnectionOptions) -> Self {
        RedisConnection {
            url: connection_url(host, &options),
            options,
            connection: None,
        }
    }

    /// A connection factory for `ConnectionPool` that selects `db` on every
    /// connection.
    pub fn connection_creator(
        db: i64,
    ) -> impl Fn(&Host) -> RedisConnection + Send + Sync + 'static {
        Self::connection_creator_with(RedisConnectionOptions {
            db: Some(db),
            ..Default::default()
        })
    }

    pub fn connection_creator_with(
        options: RedisConnectionOptions,
    ) -> impl Fn(&Host) -> RedisConnection + Send + Sync + 'static {
        move |host: &Host| RedisConnection::new(host, options.clone())
    }

    fn not_connected() -> Error {
        Error::ConnectionFailure(String::from("not connected"))
    }
}

impl fmt::Debug for RedisConnection {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("RedisConnection")
            .field("db", &self.options.db.unwrap_or(0))
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

impl Connection for RedisConnection {
    type Error = RedisError;

    fn connect(&mut self) -> Result<(), Self::Error> {
        let client = redis::Client::open(self.url.as_str())?;
        let timeout = Duration::from_millis(
            self.options.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        );
        let connection = client.get_connection_with_timeout(timeout)?;
        if let Some(ms) = self.options.io_timeout {
            connection.set_read_timeout(Some(Duration::from_millis(ms)))?;
            connection.set_write_timeout(Some(Duration::from_millis(ms)))?;
        }
        self.connection = Some(connection);
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        match self.connection.as_mut() {
            Some(conn) => redis::cmd("PING").query::<String>(conn).is_ok(),
            None => false,
        }
    }

    fn has_broken(&self) -> bool {
        match &self.connection {
            Some(conn) => !conn.is_open(),
            None => true,
        }
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.connection = None;
        Ok(())
    }
}

impl CommandConnection for RedisConnection {
    type Buffer = CommandBuffer;

    fn flush(
        &mut self,
        buffer: &mut Self::Buffer,
    ) -> Result<Vec<OperationResult>, Error> {
        let queued = std::mem::replace(buffer, CommandBuffer::default());
        if queued.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self
            .connection
            .as_mut()
            .ok_or_else(RedisConnection::not_connected)?;
        let packed = queued.pipeline.get_packed_pipeline();
        let replies = conn
            .req_packed_commands(&packed, 0, queued.len())
            .map_err(transport_error)?;

        Ok(replies.into_iter().map(convert_value).collect())
    }
}

fn connection_url(host: &Host, options: &RedisConnectionOptions) -> String {
    let address = match host.address {
        IpAddr::V4(addr) => addr.to_string(),
        IpAddr::V6(addr) => format!("[{}]", addr),
    };
    let auth = match &options.password {
        Some(password) => format!(":{}@", password),
        None => String::new(),
    };
    format!(
        "redis://{}{}:{}/{}",
        auth,
        address,
        host.port,
        options.db.unwrap_or(0)
    )
}

fn transport_error(err: RedisError) -> Error {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        Error::ConnectionFailure(err.to_string())
    } else {
        Error::ApplicationError(err.to_string())
    }
}

/// Convert one reply. A server error for a single command becomes an
/// `ApplicationError` in that command's slot.
fn convert_value(value: redis::Value) -> OperationResult {
    match value {
        redis::Value::Nil => Ok(Value::Nil),
        redis::Value::Int(i) => Ok(Value::Int(i)),
        redis::Value::BulkString(data) => Ok(Value::Data(data)),
        redis::Value::SimpleString(s) => Ok(Value::Status(s)),
        redis::Value::Okay => Ok(Value::Status(String::from("OK"))),
        redis::Value::Array(items) | redis::Value::Set(items) => items
            .into_iter()
            .map(convert_value)
            .collect::<Result<Vec<Value>, Error>>()
            .map(Value::Bulk),
        redis::Value::Map(pairs) => pairs
            .into_iter()
            .flat_map(|(k, v)| vec![k, v])
            .map(convert_value)
            .collect::<Result<Vec<Value>, Error>>()
            .map(Value::Bulk),
        redis::Value::ServerError(err) => {
            Err(Error::ApplicationError(RedisError::from(err).to_string()))
        }
        other => Ok(Value::Data(format!("{:?}", other).into_bytes())),
    }
}

/// An operation registry covering every supported command.
pub fn redis_registry() -> OperationRegistry<CommandBuffer> {
    OpName::ALL
        .iter()
        .fold(OperationRegistry::new(), |registry, name| {
            let name = *name;
            registry.register(
                name,
                move |buffer: &mut CommandBuffer, args: &[Arg]| {
                    buffer.push(name, args);
                    Ok(())
                },
            )
        })
}
