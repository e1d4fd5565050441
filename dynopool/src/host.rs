// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::net::IpAddr;

use base64;
use sha1::Sha1;

use derive_more::{Display, From, Into};

use crate::token::Token;

/// A base64 encoded identifier based on the host name, address, and port.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct HostKey(String);
/// The port number for a host. This is a type alias for u16.
pub type HostPort = u16;
/// The concatenation of the host address and port with a colon
/// delimiter. This is a type alias for String.
pub type HostName = String;
/// The IP address of the host. This is a type alias for std::net::IpAddr.
pub type HostAddress = IpAddr;

/// The status of a host as reported by the host supplier.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostStatus {
    Up,
    Down,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostStatus::Up => String::from("up").fmt(fmt),
            HostStatus::Down => String::from("down").fmt(fmt),
        }
    }
}

/// A Dynomite node and the topology information attached to it.
#[derive(Clone, Debug, PartialEq)]
pub struct Host {
    /// The concatenation of the host address and port with a colon delimiter.
    pub name: HostName,
    /// The address of the host.
    pub address: HostAddress,
    /// The port of the host.
    pub port: HostPort,
    /// The rack (availability zone) the host lives in.
    pub rack: String,
    /// The datacenter (region) the host lives in.
    pub datacenter: Option<String>,
    /// The host's position on its rack's token ring. Hosts without an explicit
    /// token are placed by hashing their identity.
    pub token: Option<Token>,
    pub status: HostStatus,
}

impl Host {
    /// Return a new `Host` that is up, has no explicit token, and lives in
    /// the given rack.
    pub fn new(address: &HostAddress, port: HostPort, rack: &str) -> Self {
        Host {
            name: host_name(address, port),
            address: *address,
            port,
            rack: rack.to_string(),
            datacenter: None,
            token: None,
            status: HostStatus::Up,
        }
    }

    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_datacenter(mut self, datacenter: &str) -> Self {
        self.datacenter = Some(datacenter.to_string());
        self
    }

    pub fn with_status(mut self, status: HostStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_up(&self) -> bool {
        self.status == HostStatus::Up
    }

    pub fn key(&self) -> HostKey {
        host_key(self)
    }

    /// The token this host occupies on its rack's ring: the explicit token if
    /// one was assigned, otherwise one derived from the host identity.
    pub fn ring_token(&self) -> Token {
        self.token.unwrap_or_else(|| identity_token(self))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} ({})", self.name, self.rack)
    }
}

// Concatentate the host address and port with a colon delimiter.
fn host_name(address: &HostAddress, port: HostPort) -> HostName {
    let address_str = format!("{}", address);
    [address_str, String::from(":"), port.to_string()].concat()
}

fn identity_digest(host: &Host) -> [u8; 20] {
    let mut sha1 = Sha1::new();
    sha1.update(host.name.as_bytes());
    sha1.update(b"||");
    sha1.update(host.port.to_string().as_bytes());
    sha1.update(b"||");
    sha1.update(host.address.to_string().as_bytes());

    sha1.digest().bytes()
}

/// Return a base64 encoded identifier based on the fields of the host.
pub fn host_key(host: &Host) -> HostKey {
    base64::encode(&identity_digest(host)).into()
}

/// Return a ring position derived from the host identity. Used for unsharded
/// deployments where the supplier does not hand out tokens.
pub fn identity_token(host: &Host) -> Token {
    let digest = identity_digest(host);
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&digest[..4]);
    Token::from(u32::from_be_bytes(prefix))
}
