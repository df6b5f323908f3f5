//! Sleep transition state machine.
//!
//! The coordinator owns the inhibitor lock handle and moves between the
//! [`LockState::Locked`] and [`LockState::Unlocked`] states in response to
//! sleep notifications. Notifications may be duplicated or arrive out of
//! step with the lock, so same-state transitions are explicit no-ops.

use tracing::{error, info, warn};

use crate::lock::{AcquireError, InhibitRequest, Inhibitor, LockHandle};

/// Inhibitor lock state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LockState {
    Unlocked,
    Locked,
}

/// Decoded sleep notification.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct NotificationEvent {
    /// `true` before sleep, `false` after resume or an aborted sleep.
    pub sleep_starting: bool,
}

/// Outcome of a single notification.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Transition {
    /// Lock dropped to let the system sleep.
    Released,
    /// Sleep notification while no lock was held.
    AlreadyReleased,
    /// Lock taken again after resume.
    Acquired,
    /// Resume notification while the lock was still held.
    AlreadyHeld,
    /// Lock could not be taken again after resume.
    AcquireFailed,
}

/// Sleep transition coordinator.
pub struct Coordinator<I> {
    request: InhibitRequest,
    handle: Option<LockHandle>,
    inhibitor: I,
}

impl<I: Inhibitor> Coordinator<I> {
    /// Take the initial inhibitor lock.
    ///
    /// Failure here means there is nothing to coordinate, so callers should
    /// treat it as fatal.
    pub fn start(mut inhibitor: I, request: InhibitRequest) -> Result<Self, AcquireError> {
        let handle = inhibitor.acquire(&request)?;
        info!("Holding {} inhibitor lock ({handle})", request.mode);

        Ok(Self { request, handle: Some(handle), inhibitor })
    }

    /// Current lock state.
    pub fn state(&self) -> LockState {
        match &self.handle {
            Some(handle) if handle.is_valid() => LockState::Locked,
            _ => LockState::Unlocked,
        }
    }

    /// Currently held lock.
    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    pub fn inhibitor(&self) -> &I {
        &self.inhibitor
    }

    /// Apply a sleep notification.
    pub fn notify(&mut self, event: NotificationEvent) -> Transition {
        match (self.state(), event.sleep_starting) {
            (LockState::Locked, true) => {
                self.release();
                Transition::Released
            },
            (LockState::Unlocked, true) => {
                warn!("Sleep is starting, but the inhibitor lock is already released");
                Transition::AlreadyReleased
            },
            (LockState::Unlocked, false) => self.reacquire(),
            (LockState::Locked, false) => {
                warn!("Sleep has ended, but the inhibitor lock is already held");
                Transition::AlreadyHeld
            },
        }
    }

    /// Drop the held lock and clear the handle.
    fn release(&mut self) {
        let mut handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };

        match self.inhibitor.release(&mut handle) {
            Ok(()) => info!("Sleep is starting, released inhibitor lock ({handle})"),
            Err(err) => warn!("{err}"),
        }
    }

    /// Take a new lock after resume.
    ///
    /// Failures are not retried; the next sleep cycle offers another chance.
    fn reacquire(&mut self) -> Transition {
        match self.inhibitor.acquire(&self.request) {
            Ok(handle) => {
                info!("Sleep has ended, reacquired inhibitor lock ({handle})");
                self.handle = Some(handle);
                Transition::Acquired
            },
            Err(err) => {
                error!("Could not reacquire inhibitor lock after resume: {err}");
                Transition::AcquireFailed
            },
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::fs::File;

    use super::*;
    use crate::lock::{InhibitMode, ReleaseError};

    /// Lock manager recording every call.
    #[derive(Default)]
    struct MockInhibitor {
        calls: Vec<&'static str>,
        failures: VecDeque<AcquireError>,
    }

    impl Inhibitor for MockInhibitor {
        fn acquire(&mut self, _request: &InhibitRequest) -> Result<LockHandle, AcquireError> {
            self.calls.push("acquire");
            match self.failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(LockHandle::new(File::open("/dev/null").unwrap().into())),
            }
        }

        fn release(&mut self, handle: &mut LockHandle) -> Result<(), ReleaseError> {
            self.calls.push("release");
            match handle.close() {
                true => Ok(()),
                false => Err(ReleaseError::AlreadyReleased(handle.raw_fd())),
            }
        }
    }

    fn request() -> InhibitRequest {
        InhibitRequest {
            what: "sleep".into(),
            who: "client2".into(),
            why: "Test".into(),
            mode: InhibitMode::Delay,
        }
    }

    fn coordinator() -> Coordinator<MockInhibitor> {
        Coordinator::start(MockInhibitor::default(), request()).unwrap()
    }

    const SLEEP: NotificationEvent = NotificationEvent { sleep_starting: true };
    const RESUME: NotificationEvent = NotificationEvent { sleep_starting: false };

    /// Check that the state matches the held handle.
    fn assert_invariant(coordinator: &Coordinator<MockInhibitor>) {
        let held = coordinator.handle().is_some_and(LockHandle::is_valid);
        assert_eq!(coordinator.state() == LockState::Locked, held);
        if coordinator.state() == LockState::Unlocked {
            assert!(coordinator.handle().is_none());
        }
    }

    #[test]
    fn start_locked() {
        let coordinator = coordinator();
        assert_eq!(coordinator.state(), LockState::Locked);
        assert_eq!(coordinator.inhibitor().calls, ["acquire"]);
        assert_invariant(&coordinator);
    }

    #[test]
    fn start_failure() {
        let mut inhibitor = MockInhibitor::default();
        inhibitor.failures.push_back(AcquireError::TransportUnavailable("gone".into()));

        assert!(Coordinator::start(inhibitor, request()).is_err());
    }

    #[test]
    fn transitions() {
        let mut coordinator = coordinator();

        assert_eq!(coordinator.notify(RESUME), Transition::AlreadyHeld);
        assert_eq!(coordinator.state(), LockState::Locked);

        assert_eq!(coordinator.notify(SLEEP), Transition::Released);
        assert_eq!(coordinator.state(), LockState::Unlocked);

        assert_eq!(coordinator.notify(SLEEP), Transition::AlreadyReleased);
        assert_eq!(coordinator.state(), LockState::Unlocked);

        assert_eq!(coordinator.notify(RESUME), Transition::Acquired);
        assert_eq!(coordinator.state(), LockState::Locked);
        assert_invariant(&coordinator);
    }

    #[test]
    fn duplicate_sleep() {
        let mut coordinator = coordinator();

        coordinator.notify(SLEEP);
        coordinator.notify(SLEEP);

        assert_eq!(coordinator.state(), LockState::Unlocked);
        assert_eq!(coordinator.inhibitor().calls, ["acquire", "release"]);
        assert_invariant(&coordinator);
    }

    #[test]
    fn duplicate_resume() {
        let mut coordinator = coordinator();

        coordinator.notify(SLEEP);
        coordinator.notify(RESUME);
        coordinator.notify(RESUME);

        assert_eq!(coordinator.state(), LockState::Locked);
        assert_eq!(coordinator.inhibitor().calls, ["acquire", "release", "acquire"]);
        assert_invariant(&coordinator);
    }

    #[test]
    fn ordering() {
        let mut coordinator = coordinator();

        for event in [SLEEP, RESUME, SLEEP] {
            coordinator.notify(event);
            assert_invariant(&coordinator);
        }

        assert_eq!(coordinator.inhibitor().calls, ["acquire", "release", "acquire", "release"]);
    }

    #[test]
    fn acquire_failure() {
        let mut coordinator = coordinator();
        coordinator.notify(SLEEP);

        coordinator.inhibitor.failures.push_back(AcquireError::RemoteRejected {
            name: "org.freedesktop.DBus.Error.AccessDenied".into(),
            message: "Permission denied".into(),
        });
        assert_eq!(coordinator.notify(RESUME), Transition::AcquireFailed);
        assert_eq!(coordinator.state(), LockState::Unlocked);
        assert_invariant(&coordinator);

        // Another sleep cycle recovers without a spurious release.
        assert_eq!(coordinator.notify(SLEEP), Transition::AlreadyReleased);
        assert_eq!(coordinator.notify(RESUME), Transition::Acquired);
        assert_eq!(coordinator.inhibitor().calls, ["acquire", "release", "acquire", "acquire"]);
        assert_invariant(&coordinator);
    }
}
