//! Inhibitor lock acquisition and release.

use std::fmt::{self, Display, Formatter};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::bus::{Arg, BusClient, BusError, MethodCall, Value};

/// Inhibition mode.
#[derive(Deserialize, PartialEq, Eq, Copy, Clone, Debug)]
#[serde(rename_all = "lowercase")]
pub enum InhibitMode {
    /// Veto the transition until the lock is dropped.
    Block,

    /// Hold the transition back for a bounded time, announcing it first.
    Delay,
}

impl InhibitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Delay => "delay",
        }
    }
}

impl Display for InhibitMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InhibitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "delay" => Ok(Self::Delay),
            _ => Err(format!("Got {s:?}, expected one of block or delay")),
        }
    }
}

/// Inhibitor lock request parameters.
#[derive(Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct InhibitRequest {
    /// Colon-separated list of inhibited transitions.
    pub what: String,
    /// Requester identity.
    pub who: String,
    /// Human-readable justification.
    pub why: String,
    pub mode: InhibitMode,
}

/// Remote method used to take inhibitor locks.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InhibitTarget {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub method: String,
}

/// Held inhibitor lock.
///
/// The lock is dropped by closing its file descriptor, which happens at most
/// once. The raw descriptor number is kept after release for diagnostics.
#[derive(Debug)]
pub struct LockHandle {
    fd: Option<OwnedFd>,
    raw: RawFd,
}

impl LockHandle {
    pub fn new(fd: OwnedFd) -> Self {
        let raw = fd.as_raw_fd();
        Self { fd: Some(fd), raw }
    }

    /// Check if the lock is still held.
    pub fn is_valid(&self) -> bool {
        self.fd.is_some()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.raw
    }

    /// Close the descriptor, returning `false` if it was closed already.
    pub(crate) fn close(&mut self) -> bool {
        self.fd.take().is_some()
    }
}

impl Display for LockHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.fd {
            Some(_) => write!(f, "fd {}", self.raw),
            None => write!(f, "fd {} (released)", self.raw),
        }
    }
}

/// Inhibitor lock acquisition failure.
#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("bus unavailable: {0}")]
    TransportUnavailable(String),

    #[error("inhibit request rejected by {name}: {message}")]
    RemoteRejected { name: String, message: String },

    #[error("malformed inhibit reply: {0}")]
    MalformedReply(String),
}

impl From<BusError> for AcquireError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Remote { name, message } => Self::RemoteRejected { name, message },
            BusError::Malformed(message) => Self::MalformedReply(message),
            err @ (BusError::Transport(_)
            | BusError::Disconnected
            | BusError::InvalidArgs(_)) => Self::TransportUnavailable(err.to_string()),
        }
    }
}

/// Inhibitor lock release failure.
#[derive(Error, PartialEq, Eq, Debug)]
pub enum ReleaseError {
    #[error("inhibitor lock fd {0} was already released")]
    AlreadyReleased(RawFd),
}

/// Inhibitor lock manager.
pub trait Inhibitor {
    /// Take a new inhibitor lock, blocking until the manager replies.
    fn acquire(&mut self, request: &InhibitRequest) -> Result<LockHandle, AcquireError>;

    /// Drop an inhibitor lock.
    ///
    /// Releasing an already released handle does nothing and reports
    /// [`ReleaseError::AlreadyReleased`].
    fn release(&mut self, handle: &mut LockHandle) -> Result<(), ReleaseError>;
}

/// Inhibitor lock manager backed by a remote bus service.
pub struct BusInhibitor<B> {
    target: InhibitTarget,
    bus: B,
}

impl<B: BusClient> BusInhibitor<B> {
    pub fn new(bus: B, target: InhibitTarget) -> Self {
        Self { target, bus }
    }
}

impl<B: BusClient> Inhibitor for BusInhibitor<B> {
    fn acquire(&mut self, request: &InhibitRequest) -> Result<LockHandle, AcquireError> {
        let call = MethodCall {
            destination: &self.target.service,
            path: &self.target.path,
            interface: &self.target.interface,
            method: &self.target.method,
            args: vec![
                Arg::Str(&request.what),
                Arg::Str(&request.who),
                Arg::Str(&request.why),
                Arg::Str(request.mode.as_str()),
            ],
        };

        debug!("Requesting {} inhibitor lock for {:?}", request.mode, request.what);

        let reply = self.bus.call(&call)?;
        match reply.into_iter().next() {
            Some(Value::UnixFd(fd)) => Ok(LockHandle::new(fd)),
            Some(value) => Err(AcquireError::MalformedReply(format!(
                "expected file descriptor, got {:?}",
                value.signature()
            ))),
            None => Err(AcquireError::MalformedReply("reply has no arguments".into())),
        }
    }

    fn release(&mut self, handle: &mut LockHandle) -> Result<(), ReleaseError> {
        if handle.close() {
            Ok(())
        } else {
            Err(ReleaseError::AlreadyReleased(handle.raw_fd()))
        }
    }
}
