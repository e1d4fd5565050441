// Copyright 2020 Joyent, Inc.

//! A host supplier for a fixed list of Dynomite nodes.
//!
//! The node list can be given directly or as a seed string of the form
//! `address:port:rack:datacenter:token`, with entries separated by `|`.

use std::net::IpAddr;

use slog::{o, trace, Logger};

use dynopool::error::Error;
use dynopool::host::{Host, HostPort};
use dynopool::supplier::HostSupplier;
use dynopool::token::Token;

const SEED_SEPARATOR: char = '|';
const FIELD_SEPARATOR: char = ':';
const SEED_FIELDS: usize = 5;

#[derive(Clone, Debug)]
pub struct StaticHostSupplier {
    hosts: Vec<Host>,
    log: Logger,
}

impl StaticHostSupplier {
    pub fn new(hosts: Vec<Host>) -> Self {
        StaticHostSupplier {
            hosts,
            log: Logger::root(slog::Discard, o!()),
        }
    }

    /// Build a supplier from a seed string such as
    /// `10.0.0.1:8102:rack1:dc1:100|10.0.0.2:8102:rack2:dc1:100`.
    pub fn from_seeds(seeds: &str) -> Result<Self, Error> {
        parse_seeds(seeds).map(StaticHostSupplier::new)
    }

    pub fn with_log(mut self, log: Logger) -> Self {
        self.log = log.new(o!("supplier" => "static"));
        self
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }
}

impl HostSupplier for StaticHostSupplier {
    fn list_hosts(&mut self) -> Result<Vec<Host>, Error> {
        trace!(self.log, "supplying {} static hosts", self.hosts.len());
        Ok(self.hosts.clone())
    }
}

fn invalid_seed(seed: &str, reason: &str) -> Error {
    Error::InvalidConfiguration(format!("invalid seed '{}': {}", seed, reason))
}

fn parse_seed(seed: &str) -> Result<Host, Error> {
    let fields: Vec<&str> = seed.split(FIELD_SEPARATOR).map(str::trim).collect();
    if fields.len() != SEED_FIELDS {
        return Err(invalid_seed(
            seed,
            "expected address:port:rack:datacenter:token",
        ));
    }

    let address: IpAddr = fields[0]
        .parse()
        .map_err(|_| invalid_seed(seed, "bad address"))?;
    let port: HostPort = fields[1]
        .parse()
        .map_err(|_| invalid_seed(seed, "bad port"))?;
    if fields[2].is_empty() {
        return Err(invalid_seed(seed, "empty rack"));
    }
    let token: u32 = fields[4]
        .parse()
        .map_err(|_| invalid_seed(seed, "bad token"))?;

    let mut host =
        Host::new(&address, port, fields[2]).with_token(Token::from(token));
    if !fields[3].is_empty() {
        host = host.with_datacenter(fields[3]);
    }
    Ok(host)
}

/// Parse a `|`-separated list of seeds. Empty entries are skipped; any
/// malformed entry fails the whole list.
pub fn parse_seeds(seeds: &str) -> Result<Vec<Host>, Error> {
    seeds
        .split(SEED_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_seed)
        .collect()
}
