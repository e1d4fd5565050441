// Copyright 2020 Joyent, Inc.

//! A token-aware connection pool and client for Dynomite clusters
//!
//! dynopool routes each operation to the host owning its key, keeps a bounded
//! set of live connections per host, and retries or fails over operations
//! that fail at the transport level according to a pluggable retry policy. On
//! top of that it offers pipelines that can be replayed on a new connection
//! after a failure, and a sharded counter that batches increments through
//! pipelines.
//!
//! The library relies on two primary traits supplied by its users. These are
//! the [`HostSupplier`](supplier/trait.HostSupplier.html) trait and the
//! [`Connection`](connection/trait.Connection.html) trait, together with its
//! extension [`CommandConnection`](connection/trait.CommandConnection.html).
//!
//! ## Host suppliers
//!
//! A *host supplier* is responsible for locating all of the nodes in the
//! cluster and reporting their address, rack, token, and status. This is
//! normally a service discovery client of some form. The pool polls the
//! supplier on startup and then periodically; each answer becomes a new
//! immutable [`TopologySnapshot`](topology/struct.TopologySnapshot.html) that
//! is swapped in atomically. A supplier that fails simply leaves the previous
//! snapshot in place.
//!
//! ## Routing
//!
//! Keys are hashed onto a ring of `u32` tokens, one ring per rack. The owner
//! of a key is the host holding the smallest token greater than or equal to
//! the key's hash, wrapping around to the first token. Hosts in the local rack
//! are preferred; when the local owner is down the owner of the same token in
//! another rack is used. Deployments without tokens can route round-robin over
//! the local rack instead.
//!
//! ## Connections
//!
//! A *connection* is anything that provides a logical connection to one host
//! and can execute a buffer of pipelined commands. Users provide the pool
//! with a function to create one:
//! ```rust,ignore
//! Fn(&Host) -> C + Send + Sync + 'static
//! where C: CommandConnection
//! ```
//! The function captures whatever application level configuration is needed
//! to connect, such as a database index or credentials.
//!
//! Commands reach a connection's buffer only through an
//! [`OperationRegistry`](operation/struct.OperationRegistry.html), which maps
//! each operation name to a function that appends it. Because every pipeline
//! records the name and arguments of what it queued, the same registry can
//! re-apply a whole pipeline to a fresh connection after a transport failure.
//!
//! ## Health
//!
//! A host that fails `failure_threshold` consecutive times is marked down and
//! claims against it fail fast. It is marked up again by a topology refresh
//! that lists it as up, by the periodic health check, or explicitly.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dynopool::client::DynoClient;
//! use dynopool::connection_pool::types::ConnectionPoolOptions;
//! use dynopool_redis_connection::{redis_registry, RedisConnection};
//! use dynopool_static_supplier::StaticHostSupplier;
//!
//! let supplier = StaticHostSupplier::from_seeds(
//!     "172.18.0.101:8102:rack1:dc:100|172.18.0.102:8102:rack2:dc:100",
//! )?;
//! let options = ConnectionPoolOptions {
//!     local_rack: Some(String::from("rack1")),
//!     retry_policy: Some("RetryNTimes:3:true".parse()?),
//!     ..Default::default()
//! };
//! let client = DynoClient::new(
//!     options,
//!     supplier,
//!     RedisConnection::connection_creator(0),
//!     redis_registry(),
//! );
//!
//! client.set("greeting", "hello")?;
//!
//! let mut pipeline = client.pipelined();
//! let a = pipeline.incr("visits")?;
//! let b = pipeline.get("visits")?;
//! pipeline.sync()?;
//! ```

#![allow(missing_docs)]

pub mod client;
pub mod connection;
pub mod connection_pool;
pub mod counter;
pub mod error;
pub mod host;
pub mod operation;
pub mod pipeline;
pub mod retry;
pub mod supplier;
pub mod token;
pub mod topology;
