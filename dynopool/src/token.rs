// Copyright 2020 Joyent, Inc.

//! Consistent hashing over a ring of `u32` tokens.

use std::fmt::Debug;

use derive_more::{Display, From, Into};
use xxhash_rust::xxh32::xxh32;

use crate::host::Host;

/// A position on the token ring.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd,
)]
pub struct Token(u32);

/// Converts keys into ring positions.
pub trait HashPartitioner: Debug + Send + Sync {
    fn hash(&self, key: &[u8]) -> Token;
}

/// The default partitioner: xxh32 with a zero seed.
#[derive(Clone, Copy, Debug, Default)]
pub struct Xxh32Partitioner;

impl HashPartitioner for Xxh32Partitioner {
    fn hash(&self, key: &[u8]) -> Token {
        Token(xxh32(key, 0))
    }
}

/// An immutable, sorted sequence of `(Token, Host)` pairs.
///
/// The owner of a hash is the host with the smallest token greater than or
/// equal to it. Hashes past the last token wrap around to the first entry.
#[derive(Clone, Debug, Default)]
pub struct TokenRing {
    entries: Vec<(Token, Host)>,
}

impl TokenRing {
    /// Build a ring from a set of hosts. When two hosts claim the same token
    /// the one whose name sorts first keeps it.
    pub fn new<I>(hosts: I) -> Self
    where
        I: IntoIterator<Item = Host>,
    {
        let mut entries: Vec<(Token, Host)> =
            hosts.into_iter().map(|h| (h.ring_token(), h)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        entries.dedup_by(|later, earlier| later.0 == earlier.0);

        TokenRing { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Token, Host)> {
        self.entries.iter()
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.entries.iter().map(|(t, _)| *t).collect()
    }

    fn owner_index(&self, hash: Token) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.entries.partition_point(|(t, _)| *t < hash);
        if idx == self.entries.len() {
            Some(0)
        } else {
            Some(idx)
        }
    }

    /// The token owning `hash`.
    pub fn owner_token(&self, hash: Token) -> Option<Token> {
        self.owner_index(hash).map(|i| self.entries[i].0)
    }

    /// The host owning `hash`.
    pub fn owner(&self, hash: Token) -> Option<&Host> {
        self.owner_index(hash).map(|i| &self.entries[i].1)
    }

    /// The host holding exactly `token`, if any.
    pub fn host_for_token(&self, token: Token) -> Option<&Host> {
        self.entries
            .binary_search_by(|(t, _)| t.cmp(&token))
            .ok()
            .map(|i| &self.entries[i].1)
    }
}
