// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::fmt;

use crate::host::HostKey;
use crate::operation::OpName;

/// The error type for every fallible dynopool operation.
///
/// Errors fall into three classes. Transport-level failures
/// (`ConnectionFailure`, `PoolExhausted`, `HostDown`) are retried according to
/// the configured retry policy. Store-level failures (`ApplicationError`) are
/// returned to the caller as-is. Everything else signals a programming or
/// configuration error and is always surfaced immediately.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The topology is empty or every candidate host is down.
    NoAvailableHost,
    /// The host has been marked down by the connection pool.
    HostDown(HostKey),
    /// No connection became available within the claim timeout.
    PoolExhausted(HostKey),
    /// The connection pool has been stopped.
    PoolStopped,
    /// A transport-level failure. The command was not executed.
    ConnectionFailure(String),
    /// The store executed the command and rejected it.
    ApplicationError(String),
    /// The retry policy gave up. Carries the last underlying error.
    RetryExhausted { attempts: u32, last: Box<Error> },
    /// The pipeline has been closed.
    PipelineClosed,
    /// A pipeline command's key is owned by a different host than the one the
    /// pipeline is bound to.
    KeyNotOnPipelineHost(HostKey),
    /// A pending pipeline result was read before the pipeline was synced.
    ResultNotReady,
    /// The counter has not been initialized.
    NotInitialized,
    /// The counter has already been closed.
    AlreadyClosed,
    /// No registry entry exists for the operation.
    UnknownOperation(OpName),
    InvalidArguments(String),
    InvalidConfiguration(String),
    /// The host supplier could not produce a host list.
    SupplierFailure(String),
    /// `stop` was invoked on a clone of the connection pool.
    StopCalledByClone,
}

impl Error {
    /// Whether the retry machinery may attempt the operation again, possibly
    /// against another host.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionFailure(_)
            | Error::PoolExhausted(_)
            | Error::HostDown(_) => true,
            _ => false,
        }
    }

    pub fn is_connection_failure(&self) -> bool {
        match self {
            Error::ConnectionFailure(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NoAvailableHost => {
                write!(fmt, "no available host in the topology")
            }
            Error::HostDown(key) => write!(fmt, "host {} is marked down", key),
            Error::PoolExhausted(key) => write!(
                fmt,
                "timed out claiming a connection for host {}",
                key
            ),
            Error::PoolStopped => write!(fmt, "connection pool is stopped"),
            Error::ConnectionFailure(msg) => {
                write!(fmt, "connection failure: {}", msg)
            }
            Error::ApplicationError(msg) => {
                write!(fmt, "application error: {}", msg)
            }
            Error::RetryExhausted { attempts, last } => write!(
                fmt,
                "retries exhausted after {} attempts: {}",
                attempts, last
            ),
            Error::PipelineClosed => write!(fmt, "pipeline is closed"),
            Error::KeyNotOnPipelineHost(key) => write!(
                fmt,
                "key is not owned by pipeline host {}",
                key
            ),
            Error::ResultNotReady => {
                write!(fmt, "pipeline result requested before sync")
            }
            Error::NotInitialized => {
                write!(fmt, "counter has not been initialized")
            }
            Error::AlreadyClosed => write!(fmt, "counter is already closed"),
            Error::UnknownOperation(name) => {
                write!(fmt, "no registered operation for {}", name)
            }
            Error::InvalidArguments(msg) => {
                write!(fmt, "invalid arguments: {}", msg)
            }
            Error::InvalidConfiguration(msg) => {
                write!(fmt, "invalid configuration: {}", msg)
            }
            Error::SupplierFailure(msg) => {
                write!(fmt, "host supplier failure: {}", msg)
            }
            Error::StopCalledByClone => {
                write!(fmt, "stop may only be called on the original pool")
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::RetryExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}
