//! Message bus capability.
//!
//! The lock keeper never talks to a bus implementation directly. Everything
//! goes through [`BusClient`], which the zbus backend in [`crate::dbus`]
//! implements for the real system bus.

use std::fmt::{self, Display, Formatter};
use std::os::fd::OwnedFd;

use thiserror::Error;

/// Bus failure.
#[derive(Error, Debug)]
pub enum BusError {
    /// Connection could not be established or broke down.
    #[error("bus transport failure: {0}")]
    Transport(String),

    /// Connection was closed by the other side.
    #[error("bus connection closed")]
    Disconnected,

    /// Remote peer answered with an error reply.
    #[error("remote error {name}: {message}")]
    Remote { name: String, message: String },

    /// Method arguments could not be encoded.
    #[error("invalid method arguments: {0}")]
    InvalidArgs(String),

    /// Message body could not be decoded.
    #[error("malformed message body: {0}")]
    Malformed(String),
}

/// Method call argument.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Arg<'a> {
    Str(&'a str),
}

/// Decoded message argument.
#[derive(Debug)]
pub enum Value {
    Bool(bool),
    Str(String),
    U32(u32),
    UnixFd(OwnedFd),

    /// Argument of a type the lock keeper has no use for, by signature.
    Other(String),
}

impl Value {
    /// Bus type signature of this value.
    pub fn signature(&self) -> &str {
        match self {
            Self::Bool(_) => "b",
            Self::Str(_) => "s",
            Self::U32(_) => "u",
            Self::UnixFd(_) => "h",
            Self::Other(signature) => signature,
        }
    }
}

/// Outgoing method call.
#[derive(Clone, Debug)]
pub struct MethodCall<'a> {
    pub destination: &'a str,
    pub path: &'a str,
    pub interface: &'a str,
    pub method: &'a str,
    pub args: Vec<Arg<'a>>,
}

/// Kind of a received message.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// Message received from the bus.
#[derive(Debug)]
pub struct BusMessage {
    pub kind: MessageKind,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub args: Vec<Value>,
}

impl BusMessage {
    /// Create a signal message.
    pub fn signal(path: &str, interface: &str, member: &str, args: Vec<Value>) -> Self {
        Self {
            kind: MessageKind::Signal,
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            args,
        }
    }
}

/// Broadcast subscription filter.
///
/// Without a `sender`, any peer on the bus can emit a matching signal.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MatchRule {
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
}

impl Display for MatchRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("type='signal',")?;
        if let Some(sender) = &self.sender {
            write!(f, "sender='{sender}',")?;
        }
        write!(f, "path='{}',interface='{}',member='{}'", self.path, self.interface, self.member)
    }
}

/// Blocking message bus client.
///
/// Clones must share the underlying connection, since the lock manager and
/// the dispatch loop each hold one.
pub trait BusClient {
    /// Blocking stream of messages matching a subscription.
    ///
    /// The stream ending means the connection is gone.
    type Signals: Iterator<Item = Result<BusMessage, BusError>>;

    /// Call a remote method, blocking until its reply arrives.
    fn call(&self, call: &MethodCall<'_>) -> Result<Vec<Value>, BusError>;

    /// Register interest in broadcast messages matching `rule`.
    fn subscribe(&self, rule: &MatchRule) -> Result<Self::Signals, BusError>;
}
