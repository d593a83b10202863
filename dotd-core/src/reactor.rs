//! A single-threaded readiness reactor built on poll(2).
//!
//! Components register interest in a file descriptor and get back a scoped
//! [`Registration`]; dropping the token removes exactly the entry it
//! created. Read and write interests carry an optional deadline; when a
//! deadline passes the descriptor's exception callback runs instead, at
//! most once per loop iteration.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, trace};

/// Called with the descriptor that became ready.
pub type Callback = Rc<dyn Fn(RawFd)>;

/// Which readiness a registration is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    Except,
}

struct TimedEntry {
    callback: Callback,
    deadline: Option<Instant>,
    serial: u64,
}

struct ExceptEntry {
    callback: Callback,
    serial: u64,
}

#[derive(Default)]
struct Inner {
    read: BTreeMap<RawFd, TimedEntry>,
    write: BTreeMap<RawFd, TimedEntry>,
    except: BTreeMap<RawFd, ExceptEntry>,
    next_serial: u64,
}

impl Inner {
    fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.except.is_empty()
    }

    fn serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    fn remove(&mut self, fd: RawFd, interest: Interest, serial: u64) {
        // Only remove the entry the token created: the loop may have
        // already evicted it on timeout and the slot re-registered since.
        match interest {
            Interest::Read => {
                if self.read.get(&fd).is_some_and(|e| e.serial == serial) {
                    self.read.remove(&fd);
                }
            }
            Interest::Write => {
                if self.write.get(&fd).is_some_and(|e| e.serial == serial) {
                    self.write.remove(&fd);
                }
            }
            Interest::Except => {
                if self.except.get(&fd).is_some_and(|e| e.serial == serial) {
                    self.except.remove(&fd);
                }
            }
        }
    }

    /// The poll timeout implied by the nearest read/write deadline.
    fn next_timeout(&self, now: Instant) -> PollTimeout {
        let nearest = self
            .read
            .values()
            .chain(self.write.values())
            .filter_map(|e| e.deadline)
            .min();
        match nearest {
            None => PollTimeout::NONE,
            Some(deadline) => {
                let millis = deadline
                    .saturating_duration_since(now)
                    .as_millis()
                    .min(u128::from(u16::MAX)) as u16;
                PollTimeout::from(millis)
            }
        }
    }
}

/// Scoped handle tying an `(fd, interest)` pair to the loop.
///
/// Move-only; dropping a live token deregisters it. A token returned from a
/// failed registration is inert and drops without effect.
pub struct Registration {
    inner: Weak<RefCell<Inner>>,
    fd: RawFd,
    interest: Option<Interest>,
    serial: u64,
}

impl Registration {
    fn inert() -> Self {
        Self {
            inner: Weak::new(),
            fd: -1,
            interest: None,
            serial: 0,
        }
    }

    /// Whether the registration is live.
    pub fn active(&self) -> bool {
        self.interest.is_some()
    }

    /// Deregister now instead of at drop.
    pub fn reset(&mut self) {
        if let Some(interest) = self.interest.take() {
            if let Some(inner) = self.inner.upgrade() {
                inner.borrow_mut().remove(self.fd, interest, self.serial);
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.reset();
    }
}

/// The event loop. Clones share one underlying loop.
#[derive(Clone, Default)]
pub struct Reactor {
    inner: Rc<RefCell<Inner>>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a read callback, optionally bounded by a deadline.
    ///
    /// Fails (returns an inert token) if the descriptor already has a read
    /// registration; the existing one is never replaced.
    pub fn register_read(
        &self,
        fd: RawFd,
        callback: Callback,
        deadline: Option<Instant>,
    ) -> Registration {
        let mut inner = self.inner.borrow_mut();
        if inner.read.contains_key(&fd) {
            trace!(fd, "read already registered");
            return Registration::inert();
        }
        let serial = inner.serial();
        inner.read.insert(
            fd,
            TimedEntry {
                callback,
                deadline,
                serial,
            },
        );
        Registration {
            inner: Rc::downgrade(&self.inner),
            fd,
            interest: Some(Interest::Read),
            serial,
        }
    }

    /// Register a write callback, optionally bounded by a deadline.
    pub fn register_write(
        &self,
        fd: RawFd,
        callback: Callback,
        deadline: Option<Instant>,
    ) -> Registration {
        let mut inner = self.inner.borrow_mut();
        if inner.write.contains_key(&fd) {
            trace!(fd, "write already registered");
            return Registration::inert();
        }
        let serial = inner.serial();
        inner.write.insert(
            fd,
            TimedEntry {
                callback,
                deadline,
                serial,
            },
        );
        Registration {
            inner: Rc::downgrade(&self.inner),
            fd,
            interest: Some(Interest::Write),
            serial,
        }
    }

    /// Register an exception callback. Poll reports errors and hangups
    /// unconditionally, so there is no readiness bit to request.
    pub fn register_exception(&self, fd: RawFd, callback: Callback) -> Registration {
        let mut inner = self.inner.borrow_mut();
        if inner.except.contains_key(&fd) {
            trace!(fd, "exception already registered");
            return Registration::inert();
        }
        let serial = inner.serial();
        inner.except.insert(fd, ExceptEntry { callback, serial });
        Registration {
            inner: Rc::downgrade(&self.inner),
            fd,
            interest: Some(Interest::Except),
            serial,
        }
    }

    /// Run until every registration is gone.
    ///
    /// Callbacks may freely add or drop registrations, including their own,
    /// but must not call `run` recursively.
    pub fn run(&self) {
        loop {
            let (interests, timeout) = {
                let inner = self.inner.borrow();
                if inner.is_empty() {
                    break;
                }
                let mut interests: BTreeMap<RawFd, PollFlags> = BTreeMap::new();
                for fd in inner.read.keys() {
                    *interests.entry(*fd).or_insert(PollFlags::empty()) |= PollFlags::POLLIN;
                }
                for fd in inner.write.keys() {
                    *interests.entry(*fd).or_insert(PollFlags::empty()) |= PollFlags::POLLOUT;
                }
                for fd in inner.except.keys() {
                    interests.entry(*fd).or_insert(PollFlags::empty());
                }
                (interests, inner.next_timeout(Instant::now()))
            };

            let ready = match self.wait(&interests, timeout) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    error!(%err, "poll failed");
                    break;
                }
            };

            for (fd, revents) in ready {
                // Look every callback up again right before the call: an
                // earlier callback this iteration may have dropped it.
                if revents.contains(PollFlags::POLLIN) {
                    if let Some(callback) = self.read_callback(fd) {
                        callback(fd);
                    }
                }
                if revents.contains(PollFlags::POLLOUT) {
                    if let Some(callback) = self.write_callback(fd) {
                        callback(fd);
                    }
                }
                if revents.intersects(!(PollFlags::POLLIN | PollFlags::POLLOUT)) {
                    if let Some(callback) = self.except_callback(fd) {
                        callback(fd);
                    }
                }
            }

            self.sweep_deadlines(Instant::now());
        }
    }

    /// Block in poll(2) and return the descriptors with events.
    fn wait(
        &self,
        interests: &BTreeMap<RawFd, PollFlags>,
        timeout: PollTimeout,
    ) -> Result<Vec<(RawFd, PollFlags)>, Errno> {
        // The raw descriptors stay open for the lifetime of this call:
        // their owners cannot close them without first dropping the
        // registration, which only happens from callbacks dispatched after
        // the poll returns.
        #[allow(unsafe_code)]
        let mut pollfds: Vec<PollFd> = interests
            .iter()
            .map(|(fd, events)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, *events))
            .collect();

        poll(&mut pollfds, timeout)?;

        Ok(interests
            .keys()
            .zip(pollfds.iter())
            .filter_map(|(fd, pollfd)| {
                let revents = pollfd.revents().unwrap_or(PollFlags::empty());
                if revents.is_empty() {
                    None
                } else {
                    Some((*fd, revents))
                }
            })
            .collect())
    }

    /// Evict read/write entries whose deadline has passed and raise the
    /// exception callback for each affected descriptor, once per iteration.
    fn sweep_deadlines(&self, now: Instant) {
        let mut raised: BTreeSet<RawFd> = BTreeSet::new();
        loop {
            let expired = {
                let inner = self.inner.borrow();
                inner
                    .read
                    .iter()
                    .chain(inner.write.iter())
                    .find(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
                    .map(|(fd, _)| *fd)
            };
            let Some(fd) = expired else { break };

            {
                let mut inner = self.inner.borrow_mut();
                if inner
                    .read
                    .get(&fd)
                    .is_some_and(|e| e.deadline.is_some_and(|d| d <= now))
                {
                    inner.read.remove(&fd);
                    debug!(fd, "read deadline expired");
                }
                if inner
                    .write
                    .get(&fd)
                    .is_some_and(|e| e.deadline.is_some_and(|d| d <= now))
                {
                    inner.write.remove(&fd);
                    debug!(fd, "write deadline expired");
                }
            }

            // Raising the exception may register or remove anything; the
            // guard set keeps one fd from being excepted twice.
            if raised.insert(fd) {
                if let Some(callback) = self.except_callback(fd) {
                    callback(fd);
                }
            }
        }
    }

    fn read_callback(&self, fd: RawFd) -> Option<Callback> {
        self.inner.borrow().read.get(&fd).map(|e| e.callback.clone())
    }

    fn write_callback(&self, fd: RawFd) -> Option<Callback> {
        self.inner.borrow().write.get(&fd).map(|e| e.callback.clone())
    }

    fn except_callback(&self, fd: RawFd) -> Option<Callback> {
        self.inner
            .borrow()
            .except
            .get(&fd)
            .map(|e| e.callback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, write};
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    #[test]
    fn test_run_returns_when_nothing_registered() {
        Reactor::new().run();
    }

    #[test]
    fn test_read_callback_fires_and_token_drop_ends_loop() {
        let reactor = Reactor::new();
        let (rx, tx) = pipe().unwrap();
        write(&tx, b"x").unwrap();

        let fired = Rc::new(RefCell::new(0u32));
        let token = Rc::new(RefCell::new(None));

        let fired_in = fired.clone();
        let token_in = token.clone();
        let registration = reactor.register_read(
            rx.as_raw_fd(),
            Rc::new(move |_fd| {
                *fired_in.borrow_mut() += 1;
                // Drop our own registration so the loop drains.
                token_in.borrow_mut().take();
            }),
            None,
        );
        assert!(registration.active());
        *token.borrow_mut() = Some(registration);

        reactor.run();
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let reactor = Reactor::new();
        let (rx, _tx) = pipe().unwrap();

        let first = reactor.register_read(rx.as_raw_fd(), Rc::new(|_| {}), None);
        let second = reactor.register_read(rx.as_raw_fd(), Rc::new(|_| {}), None);
        assert!(first.active());
        assert!(!second.active());

        // Dropping the failed token must not disturb the live entry.
        drop(second);
        assert!(reactor.inner.borrow().read.contains_key(&rx.as_raw_fd()));
    }

    #[test]
    fn test_drop_removes_only_its_own_kind() {
        let reactor = Reactor::new();
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();

        let read = reactor.register_read(fd, Rc::new(|_| {}), None);
        let write_reg = reactor.register_write(fd, Rc::new(|_| {}), None);
        drop(read);

        let inner = reactor.inner.borrow();
        assert!(!inner.read.contains_key(&fd));
        assert!(inner.write.contains_key(&fd));
        drop(inner);
        drop(write_reg);
        assert!(reactor.inner.borrow().write.is_empty());
    }

    #[test]
    fn test_stale_token_does_not_remove_replacement() {
        let reactor = Reactor::new();
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();

        let mut first = reactor.register_read(fd, Rc::new(|_| {}), None);
        first.reset();
        let second = reactor.register_read(fd, Rc::new(|_| {}), None);
        assert!(second.active());

        // The drained token drops after a new entry took the slot.
        drop(first);
        assert!(reactor.inner.borrow().read.contains_key(&fd));
        drop(second);
    }

    #[test]
    fn test_deadline_raises_exception_exactly_once() {
        let reactor = Reactor::new();
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();

        let raised = Rc::new(RefCell::new(0u32));
        let tokens: Rc<RefCell<Vec<Registration>>> = Rc::new(RefCell::new(Vec::new()));

        let raised_in = raised.clone();
        let tokens_in = tokens.clone();
        let except = reactor.register_exception(
            fd,
            Rc::new(move |_fd| {
                *raised_in.borrow_mut() += 1;
                tokens_in.borrow_mut().clear();
            }),
        );

        let deadline = Some(Instant::now() - Duration::from_millis(10));
        let read = reactor.register_read(fd, Rc::new(|_| {}), deadline);
        let write_reg = reactor.register_write(fd, Rc::new(|_| {}), deadline);
        tokens.borrow_mut().push(except);
        tokens.borrow_mut().push(read);
        tokens.borrow_mut().push(write_reg);

        reactor.run();

        // Both the read and the write deadline expired, but the exception
        // path ran once.
        assert_eq!(*raised.borrow(), 1);
    }

    #[test]
    fn test_exception_on_closed_pipe() {
        let reactor = Reactor::new();
        let (rx, tx) = pipe().unwrap();
        let fd = tx.as_raw_fd();
        drop(rx);

        let raised = Rc::new(RefCell::new(0u32));
        let token = Rc::new(RefCell::new(None));

        let raised_in = raised.clone();
        let token_in = token.clone();
        *token.borrow_mut() = Some(reactor.register_exception(
            fd,
            Rc::new(move |_fd| {
                *raised_in.borrow_mut() += 1;
                token_in.borrow_mut().take();
            }),
        ));

        reactor.run();
        assert_eq!(*raised.borrow(), 1);
    }
}
