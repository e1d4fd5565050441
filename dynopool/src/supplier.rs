// Copyright 2020 Joyent, Inc.

use crate::error::Error;
use crate::host::Host;

/// A source of cluster topology.
///
/// Implementors of `HostSupplier` are normally service discovery clients of
/// some form. The connection pool polls `list_hosts` on startup and then on
/// every topology refresh interval.
///
/// `list_hosts` must return within a bounded time. An empty list is a valid
/// answer and causes every resolution to fail with `NoAvailableHost`. An error
/// means "no update this cycle": the pool keeps routing against the last
/// snapshot it received.
pub trait HostSupplier: Send + 'static {
    fn list_hosts(&mut self) -> Result<Vec<Host>, Error>;
}
