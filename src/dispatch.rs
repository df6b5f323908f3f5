//! Sleep notification dispatch loop.

use std::convert::Infallible;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, BusError, BusMessage, MessageKind, Value};
use crate::config::Config;
use crate::coordinator::{Coordinator, NotificationEvent};
use crate::lock::{AcquireError, BusInhibitor, Inhibitor};

/// Startup failure.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("could not subscribe to sleep notifications: {0}")]
    Subscribe(#[source] BusError),

    #[error("could not take initial inhibitor lock: {0}")]
    InitialAcquire(#[source] AcquireError),
}

/// Broadcast message that could not be turned into a notification.
#[derive(Error, PartialEq, Eq, Debug)]
pub enum MalformedNotification {
    #[error("expected signal, got {0:?}")]
    NotSignal(MessageKind),

    #[error("unexpected signal {interface}.{member} on {path}")]
    Unexpected { path: String, interface: String, member: String },

    #[error("sleep notification has no arguments")]
    MissingArgument,

    #[error("sleep notification argument is {0:?}, expected \"b\"")]
    WrongType(String),
}

/// Sleep notification signal identity.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SignalFilter {
    pub path: String,
    pub interface: String,
    pub member: String,
}

impl SignalFilter {
    /// Decode a bus message as a sleep notification.
    pub fn decode(&self, message: &BusMessage) -> Result<NotificationEvent, MalformedNotification> {
        if message.kind != MessageKind::Signal {
            return Err(MalformedNotification::NotSignal(message.kind));
        }

        let path = message.path.as_deref().unwrap_or_default();
        let interface = message.interface.as_deref().unwrap_or_default();
        let member = message.member.as_deref().unwrap_or_default();
        if path != self.path || interface != self.interface || member != self.member {
            return Err(MalformedNotification::Unexpected {
                path: path.into(),
                interface: interface.into(),
                member: member.into(),
            });
        }

        match message.args.first() {
            Some(Value::Bool(sleep_starting)) => {
                Ok(NotificationEvent { sleep_starting: *sleep_starting })
            },
            Some(value) => Err(MalformedNotification::WrongType(value.signature().into())),
            None => Err(MalformedNotification::MissingArgument),
        }
    }
}

/// Event dispatch loop state.
pub struct Dispatcher<S, I> {
    coordinator: Coordinator<I>,
    filter: SignalFilter,
    signals: S,
}

impl<S, I> Dispatcher<S, I>
where
    S: Iterator<Item = Result<BusMessage, BusError>>,
    I: Inhibitor,
{
    pub fn new(signals: S, filter: SignalFilter, coordinator: Coordinator<I>) -> Self {
        Self { coordinator, filter, signals }
    }

    pub fn coordinator(&self) -> &Coordinator<I> {
        &self.coordinator
    }

    /// Feed notifications to the coordinator until the bus goes away.
    pub fn run(&mut self) -> Result<Infallible, BusError> {
        info!("Listening for sleep notifications");

        while let Some(message) = self.signals.next() {
            let message = match message {
                Ok(message) => message,
                Err(err) => {
                    warn!("Ignoring unreadable bus message: {err}");
                    continue;
                },
            };

            self.dispatch(&message);
        }

        Err(BusError::Disconnected)
    }

    /// Handle a single bus message.
    fn dispatch(&mut self, message: &BusMessage) {
        debug!(
            "Got {:?} {}.{}",
            message.kind,
            message.interface.as_deref().unwrap_or("-"),
            message.member.as_deref().unwrap_or("-"),
        );

        match self.filter.decode(message) {
            Ok(event) => {
                let transition = self.coordinator.notify(event);
                debug!("Sleep notification {event:?} resulted in {transition:?}");
            },
            Err(
                err @ (MalformedNotification::NotSignal(_)
                | MalformedNotification::Unexpected { .. }),
            ) => debug!("Skipping message: {err}"),
            Err(err) => warn!("Ignoring malformed sleep notification: {err}"),
        }
    }
}

/// Subscribe to sleep notifications and take the initial inhibitor lock.
///
/// The subscription is registered first, so a sleep starting while the lock
/// request is in flight is still delivered.
pub fn start<B>(
    bus: B,
    config: &Config,
) -> Result<Dispatcher<B::Signals, BusInhibitor<B>>, StartError>
where
    B: BusClient + Clone,
{
    let rule = config.bus.match_rule();
    let signals = bus.subscribe(&rule).map_err(StartError::Subscribe)?;
    debug!("Subscribed to {rule}");

    let inhibitor = BusInhibitor::new(bus, config.bus.inhibit_target());
    let coordinator = Coordinator::start(inhibitor, config.inhibit.clone())
        .map_err(StartError::InitialAcquire)?;

    let filter = SignalFilter {
        path: rule.path,
        interface: rule.interface,
        member: rule.member,
    };

    Ok(Dispatcher::new(signals, filter, coordinator))
}
