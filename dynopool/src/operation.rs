// Copyright 2020 Joyent, Inc.

//! Operation metadata and the registry used to apply (and re-apply)
//! operations to a connection's command buffer.

use std::collections::HashMap;
use std::fmt;
use std::str;
use std::sync::{Arc, Mutex};

use crate::error::Error;

/// The commands understood by the client.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum OpName {
    Get,
    Set,
    SetEx,
    Incr,
    IncrBy,
    Decr,
    DecrBy,
    Del,
    Exists,
    Expire,
    Append,
    HGet,
    HSet,
    HDel,
    HIncrBy,
    LPush,
    RPush,
    SAdd,
    SMembers,
}

impl OpName {
    pub const ALL: [OpName; 19] = [
        OpName::Get,
        OpName::Set,
        OpName::SetEx,
        OpName::Incr,
        OpName::IncrBy,
        OpName::Decr,
        OpName::DecrBy,
        OpName::Del,
        OpName::Exists,
        OpName::Expire,
        OpName::Append,
        OpName::HGet,
        OpName::HSet,
        OpName::HDel,
        OpName::HIncrBy,
        OpName::LPush,
        OpName::RPush,
        OpName::SAdd,
        OpName::SMembers,
    ];

    /// The protocol command name.
    pub fn command(self) -> &'static str {
        match self {
            OpName::Get => "GET",
            OpName::Set => "SET",
            OpName::SetEx => "SETEX",
            OpName::Incr => "INCR",
            OpName::IncrBy => "INCRBY",
            OpName::Decr => "DECR",
            OpName::DecrBy => "DECRBY",
            OpName::Del => "DEL",
            OpName::Exists => "EXISTS",
            OpName::Expire => "EXPIRE",
            OpName::Append => "APPEND",
            OpName::HGet => "HGET",
            OpName::HSet => "HSET",
            OpName::HDel => "HDEL",
            OpName::HIncrBy => "HINCRBY",
            OpName::LPush => "LPUSH",
            OpName::RPush => "RPUSH",
            OpName::SAdd => "SADD",
            OpName::SMembers => "SMEMBERS",
        }
    }

    /// The minimum and (if bounded) maximum number of arguments, key
    /// included.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            OpName::Get | OpName::Incr | OpName::Decr | OpName::SMembers => {
                (1, Some(1))
            }
            OpName::Set
            | OpName::IncrBy
            | OpName::DecrBy
            | OpName::Expire
            | OpName::Append
            | OpName::HGet => (2, Some(2)),
            OpName::SetEx | OpName::HIncrBy => (3, Some(3)),
            OpName::Del | OpName::Exists => (1, None),
            OpName::HDel | OpName::LPush | OpName::RPush | OpName::SAdd => {
                (2, None)
            }
            OpName::HSet => (3, None),
        }
    }

    pub fn check_arity(self, count: usize) -> Result<(), Error> {
        let (min, max) = self.arity();
        let too_many = max.map_or(false, |m| count > m);
        if count < min || too_many {
            let expected = match max {
                Some(m) if m == min => format!("{}", min),
                Some(m) => format!("{} to {}", min, m),
                None => format!("at least {}", min),
            };
            return Err(Error::InvalidArguments(format!(
                "{} takes {} arguments, got {}",
                self, expected, count
            )));
        }
        Ok(())
    }
}

impl fmt::Display for OpName {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.command().fmt(fmt)
    }
}

/// A single command argument.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Arg {
    Str(String),
    Bytes(Vec<u8>),
    Int(i64),
}

impl Arg {
    /// The argument as it is sent on the wire. Integers are rendered in
    /// decimal.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Arg::Str(s) => s.as_bytes().to_vec(),
            Arg::Bytes(b) => b.clone(),
            Arg::Int(i) => i.to_string().into_bytes(),
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Arg::Bytes(b)
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Arg::Bytes(b.to_vec())
    }
}

impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Arg::Int(i)
    }
}

/// The name and arguments of one operation, retained so the operation can be
/// re-applied to another connection.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationMetadata {
    pub name: OpName,
    pub args: Vec<Arg>,
}

impl OperationMetadata {
    /// Create a new `OperationMetadata`, rejecting argument lists that do not
    /// fit the operation's arity.
    pub fn new(name: OpName, args: Vec<Arg>) -> Result<Self, Error> {
        name.check_arity(args.len())?;
        Ok(OperationMetadata { name, args })
    }

    /// The routing key: the first argument.
    pub fn key(&self) -> Result<Vec<u8>, Error> {
        self.args.first().map(Arg::to_bytes).ok_or_else(|| {
            Error::InvalidArguments(format!("{} has no key", self.name))
        })
    }
}

impl fmt::Display for OperationMetadata {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} ({} args)", self.name, self.args.len())
    }
}

/// A reply from the store.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Data(Vec<u8>),
    Status(String),
    Bulk(Vec<Value>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        *self == Value::Nil
    }

    /// Interpret the reply as an integer. Bulk strings holding a decimal
    /// number are parsed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Data(d) => {
                str::from_utf8(d).ok().and_then(|s| s.parse().ok())
            }
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            Value::Data(d) => String::from_utf8(d.clone()).ok(),
            Value::Status(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }
}

/// The per-command outcome of a flush. `Err` holds an `ApplicationError`.
pub type OperationResult = Result<Value, Error>;

/// Applies one operation's arguments to a connection's command buffer.
pub type OperationFn<B> =
    Arc<dyn Fn(&mut B, &[Arg]) -> Result<(), Error> + Send + Sync>;

/// Maps each `OpName` to the function that appends it to a command buffer of
/// type `B`.
///
/// The registry is built once and shared. It is the single path through which
/// both first submissions and replays reach a connection.
pub struct OperationRegistry<B> {
    operations: HashMap<OpName, OperationFn<B>>,
}

impl<B> OperationRegistry<B> {
    pub fn new() -> Self {
        OperationRegistry {
            operations: HashMap::new(),
        }
    }

    pub fn register<F>(mut self, name: OpName, f: F) -> Self
    where
        F: Fn(&mut B, &[Arg]) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.operations.insert(name, Arc::new(f));
        self
    }

    pub fn contains(&self, name: OpName) -> bool {
        self.operations.contains_key(&name)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Append `op` to `buffer`.
    pub fn apply(
        &self,
        buffer: &mut B,
        op: &OperationMetadata,
    ) -> Result<(), Error> {
        op.name.check_arity(op.args.len())?;
        match self.operations.get(&op.name) {
            Some(f) => f(buffer, &op.args),
            None => Err(Error::UnknownOperation(op.name)),
        }
    }
}

impl<B> Default for OperationRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> Clone for OperationRegistry<B> {
    fn clone(&self) -> Self {
        OperationRegistry {
            operations: self.operations.clone(),
        }
    }
}

impl<B> fmt::Debug for OperationRegistry<B> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut names: Vec<&str> =
            self.operations.keys().map(|n| n.command()).collect();
        names.sort();
        fmt.debug_struct("OperationRegistry")
            .field("operations", &names)
            .finish()
    }
}

/// A handle to the result of one pipelined command. It is filled in when the
/// pipeline is synced.
#[derive(Clone, Debug)]
pub struct PendingResult {
    position: usize,
    cell: Arc<Mutex<Option<OperationResult>>>,
}

impl PendingResult {
    pub(crate) fn new(position: usize) -> Self {
        PendingResult {
            position,
            cell: Arc::new(Mutex::new(None)),
        }
    }

    /// The command's position in its pipeline since the last sync.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_ready(&self) -> bool {
        self.cell.lock().unwrap().is_some()
    }

    /// The command's outcome, or `ResultNotReady` before the pipeline has
    /// been synced.
    pub fn get(&self) -> OperationResult {
        match &*self.cell.lock().unwrap() {
            Some(result) => result.clone(),
            None => Err(Error::ResultNotReady),
        }
    }

    pub(crate) fn fill(&self, result: OperationResult) {
        *self.cell.lock().unwrap() = Some(result);
    }
}
