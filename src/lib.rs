//! Logind sleep delay lock keeper.
//!
//! This library holds a `delay` inhibitor lock with the login manager and
//! hands it back whenever the system is about to sleep, taking it again
//! after resume.

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod dbus;
pub mod dispatch;
pub mod lock;
