//! DBus system bus backend.

use std::os::fd::AsFd;
use std::time::Duration;

use tracing::debug;
use zbus::blocking::{Connection, MessageIterator};
use zbus::connection::Builder;
use zbus::message::{Body, Message, Type};
use zbus::zvariant::{self, Structure, StructureBuilder};

use crate::bus::{Arg, BusClient, BusError, BusMessage, MatchRule, MessageKind, MethodCall, Value};

impl From<zbus::Error> for BusError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, description, _) => BusError::Remote {
                name: name.to_string(),
                message: description.unwrap_or_default(),
            },
            err => BusError::Transport(err.to_string()),
        }
    }
}

/// System bus connection.
#[derive(Clone)]
pub struct SystemBus {
    connection: Connection,
}

impl SystemBus {
    /// Connect to the system bus.
    ///
    /// Method calls wait forever for their reply unless `timeout` is set.
    pub fn connect(timeout: Option<Duration>) -> Result<Self, BusError> {
        let mut builder = Builder::system()?;
        if let Some(timeout) = timeout {
            builder = builder.method_timeout(timeout);
        }

        let connection = Connection::from(zbus::block_on(builder.build())?);
        debug!("Connected to system bus as {:?}", connection.unique_name());

        Ok(Self { connection })
    }
}

impl BusClient for SystemBus {
    type Signals = SystemSignals;

    fn call(&self, call: &MethodCall<'_>) -> Result<Vec<Value>, BusError> {
        let reply = if call.args.is_empty() {
            self.connection.call_method(
                Some(call.destination),
                call.path,
                Some(call.interface),
                call.method,
                &(),
            )?
        } else {
            let body = call
                .args
                .iter()
                .fold(StructureBuilder::new(), |builder, Arg::Str(value)| builder.add_field(*value))
                .build()
                .map_err(|err| BusError::InvalidArgs(err.to_string()))?;

            self.connection.call_method(
                Some(call.destination),
                call.path,
                Some(call.interface),
                call.method,
                &body,
            )?
        };

        decode_body(&reply.body())
    }

    fn subscribe(&self, rule: &MatchRule) -> Result<Self::Signals, BusError> {
        let rule = rule.to_string();
        let rule = zbus::MatchRule::try_from(rule.as_str())?;
        let messages = MessageIterator::for_match_rule(rule, &self.connection, None)?;
        Ok(SystemSignals { messages })
    }
}

/// Messages matching a system bus subscription.
pub struct SystemSignals {
    messages: MessageIterator,
}

impl Iterator for SystemSignals {
    type Item = Result<BusMessage, BusError>;

    fn next(&mut self) -> Option<Self::Item> {
        let message = match self.messages.next()? {
            Ok(message) => message,
            Err(err) => return Some(Err(err.into())),
        };

        Some(convert_message(&message))
    }
}

/// Convert a zbus message to its bus-agnostic representation.
fn convert_message(message: &Message) -> Result<BusMessage, BusError> {
    let header = message.header();
    let kind = match message.message_type() {
        Type::MethodCall => MessageKind::MethodCall,
        Type::MethodReturn => MessageKind::MethodReturn,
        Type::Error => MessageKind::Error,
        Type::Signal => MessageKind::Signal,
    };

    Ok(BusMessage {
        kind,
        path: header.path().map(|path| path.to_string()),
        interface: header.interface().map(|interface| interface.to_string()),
        member: header.member().map(|member| member.to_string()),
        args: decode_body(&message.body())?,
    })
}

/// Decode the arguments of a message body.
///
/// Arguments of types with no [`Value`] counterpart are kept as
/// [`Value::Other`].
fn decode_body(body: &Body) -> Result<Vec<Value>, BusError> {
    let signature = body.signature().to_string();
    let malformed =
        |err: zbus::Error| BusError::Malformed(format!("bad {signature:?} body: {err}"));

    let value = match signature.as_str() {
        "" => return Ok(Vec::new()),
        "b" => Value::Bool(body.deserialize::<bool>().map_err(malformed)?),
        "s" => Value::Str(body.deserialize::<String>().map_err(malformed)?),
        "u" => Value::U32(body.deserialize::<u32>().map_err(malformed)?),
        "h" => {
            let fd = body.deserialize::<zvariant::OwnedFd>().map_err(malformed)?;
            Value::UnixFd(fd.into())
        },
        // Multiple arguments are reported as a single structure.
        _ if signature.starts_with('(') => {
            let structure = body.deserialize::<Structure>().map_err(malformed)?;
            return structure.fields().iter().map(convert_value).collect();
        },
        _ => Value::Other(signature.clone()),
    };

    Ok(vec![value])
}

/// Convert a single body argument.
fn convert_value(value: &zvariant::Value<'_>) -> Result<Value, BusError> {
    let value = match value {
        zvariant::Value::Bool(value) => Value::Bool(*value),
        zvariant::Value::Str(value) => Value::Str(value.to_string()),
        zvariant::Value::U32(value) => Value::U32(*value),
        zvariant::Value::Fd(fd) => {
            let fd = fd
                .as_fd()
                .try_clone_to_owned()
                .map_err(|err| BusError::Malformed(format!("could not take fd: {err}")))?;
            Value::UnixFd(fd)
        },
        value => Value::Other(value.value_signature().to_string()),
    };

    Ok(value)
}

#[cfg(test)]
mod test {
    use std::fs::File;

    use zbus::names::ErrorName;

    use super::*;
    use crate::coordinator::NotificationEvent;
    use crate::dispatch::{MalformedNotification, SignalFilter};

    const PATH: &str = "/org/freedesktop/login1";
    const INTERFACE: &str = "org.freedesktop.login1.Manager";
    const MEMBER: &str = "PrepareForSleep";

    fn signal<B>(body: &B) -> Message
    where
        B: serde::Serialize + zvariant::DynamicType,
    {
        Message::signal(PATH, INTERFACE, MEMBER).unwrap().build(body).unwrap()
    }

    fn filter() -> SignalFilter {
        SignalFilter { path: PATH.into(), interface: INTERFACE.into(), member: MEMBER.into() }
    }

    #[test]
    fn convert_bool_signal() {
        let message = convert_message(&signal(&true)).unwrap();

        assert_eq!(message.kind, MessageKind::Signal);
        assert_eq!(message.path.as_deref(), Some(PATH));
        assert_eq!(message.interface.as_deref(), Some(INTERFACE));
        assert_eq!(message.member.as_deref(), Some(MEMBER));
        assert!(matches!(message.args[..], [Value::Bool(true)]));
        assert_eq!(filter().decode(&message), Ok(NotificationEvent { sleep_starting: true }));
    }

    #[test]
    fn convert_empty_signal() {
        let message = convert_message(&signal(&())).unwrap();

        assert!(message.args.is_empty());
        assert_eq!(filter().decode(&message), Err(MalformedNotification::MissingArgument));
    }

    #[test]
    fn convert_multiple_arguments() {
        let message = convert_message(&signal(&(false, "extra", 7u32))).unwrap();

        assert!(matches!(message.args[..], [
            Value::Bool(false),
            Value::Str(ref extra),
            Value::U32(7)
        ] if extra == "extra"));
        assert_eq!(filter().decode(&message), Ok(NotificationEvent { sleep_starting: false }));
    }

    #[test]
    fn convert_wrong_type() {
        let message = convert_message(&signal(&"sleep")).unwrap();
        assert_eq!(
            filter().decode(&message),
            Err(MalformedNotification::WrongType("s".into()))
        );

        let message = convert_message(&signal(&(vec![1u8, 2], true))).unwrap();
        assert_eq!(message.args.len(), 2);
        assert_eq!(message.args[0].signature(), "ay");
        assert_eq!(
            filter().decode(&message),
            Err(MalformedNotification::WrongType("ay".into()))
        );
    }

    #[test]
    fn convert_fd_reply() {
        let call = Message::method_call(PATH, "Inhibit").unwrap().build(&()).unwrap();
        let file = File::open("/dev/null").unwrap();
        let reply = Message::method_return(&call.header())
            .unwrap()
            .build(&zvariant::Fd::from(file.as_fd()))
            .unwrap();

        let message = convert_message(&reply).unwrap();

        assert_eq!(message.kind, MessageKind::MethodReturn);
        assert!(matches!(message.args[..], [Value::UnixFd(_)]));
    }

    #[test]
    fn method_error_is_remote() {
        let message = signal(&());
        let name = ErrorName::try_from("org.freedesktop.DBus.Error.AccessDenied").unwrap();
        let err = zbus::Error::MethodError(name.into(), Some("Permission denied".into()), message);

        assert!(matches!(BusError::from(err), BusError::Remote { name, message }
            if name == "org.freedesktop.DBus.Error.AccessDenied"
                && message == "Permission denied"));
    }

    #[test]
    fn other_errors_are_transport() {
        let err = zbus::Error::Failure("connection reset".into());
        assert!(matches!(BusError::from(err), BusError::Transport(_)));
    }
}
