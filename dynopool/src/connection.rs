// Copyright 2020 Joyent, Inc.

use std::error;

use crate::error::Error;
use crate::operation::OperationResult;

/// The `Connection` trait defines the interface that must be implemented in
/// order to participate in a dynopool connection pool. A connection is bound
/// to one host for its whole life.
pub trait Connection: Send + Sized + 'static {
    type Error: error::Error;

    /// Attempt to establish the connection to the host.
    fn connect(&mut self) -> Result<(), Self::Error>;

    /// Check that an established connection is usable, for example with a
    /// round trip to the host. Used when probing a host that is marked down.
    fn is_valid(&mut self) -> bool {
        true
    }

    /// A cheap check for a connection that is known to be unusable. Broken
    /// connections are never handed out or returned to the pool.
    fn has_broken(&self) -> bool {
        false
    }

    /// Close the connection to the host.
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// A connection that can execute a buffer of pipelined commands.
///
/// `Buffer` is the wire-protocol library's pipeline type. Commands are added
/// to it through an `OperationRegistry` and sent with `flush`.
pub trait CommandConnection: Connection {
    type Buffer: Default + Send + 'static;

    /// Send every command in `buffer` and collect one result per command, in
    /// submission order. `buffer` is left empty.
    ///
    /// An outer `Err` is a transport-level failure (`ConnectionFailure`) and
    /// means no command is known to have executed. A store-level rejection of
    /// a single command is returned as an inner `Err(ApplicationError)`.
    fn flush(
        &mut self,
        buffer: &mut Self::Buffer,
    ) -> Result<Vec<OperationResult>, Error>;
}
