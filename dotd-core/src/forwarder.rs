//! One TCP/TLS connection to one upstream, driven by reactor readiness.
//!
//! The proxy opens a fresh connection per query: the dispatcher sends a
//! single framed request down it, waits for `on_incoming`, then shuts the
//! connection down. Failures demote the upstream in the pool so the next
//! query tries a different server.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::reactor::{Callback, Reactor, Registration};
use crate::socket::Socket;
use crate::tls::{CachedVerifier, PolicyVerifier, TlsContext, TlsResult, TlsSession};
use crate::upstream::{Upstream, UpstreamSet};

/// Invoked with each decrypted buffer read from the upstream.
pub type IncomingCallback = Rc<dyn Fn(&ForwarderConnection, Vec<u8>)>;
/// Invoked exactly once when the connection reaches `Closed`.
pub type ShutdownCallback = Rc<dyn Fn(&ForwarderConnection)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Open,
    ShuttingDown,
    Closed,
}

struct Inner {
    reactor: Reactor,
    upstreams: Rc<UpstreamSet>,
    upstream: Option<Upstream>,
    deadline: Instant,
    fd: RawFd,
    session: Option<TlsSession>,
    state: State,
    write_buffer: Option<Vec<u8>>,
    read_reg: Option<Registration>,
    write_reg: Option<Registration>,
    except_reg: Option<Registration>,
    on_incoming: Option<IncomingCallback>,
    on_shutdown: Option<ShutdownCallback>,
}

/// Cheap-to-clone handle on one forwarder connection.
#[derive(Clone)]
pub struct ForwarderConnection {
    inner: Rc<RefCell<Inner>>,
}

impl ForwarderConnection {
    /// Pick the pool's current upstream and start connecting to it.
    ///
    /// The returned connection may already be `Closed` if the pool is empty
    /// or the socket could not be created; `send` then reports false.
    pub fn connect(
        reactor: &Reactor,
        upstreams: &Rc<UpstreamSet>,
        context: &Rc<TlsContext>,
    ) -> Self {
        let deadline = Instant::now() + upstreams.timeout();
        let connection = Self {
            inner: Rc::new(RefCell::new(Inner {
                reactor: reactor.clone(),
                upstreams: upstreams.clone(),
                upstream: None,
                deadline,
                fd: -1,
                session: None,
                state: State::Closed,
                write_buffer: None,
                read_reg: None,
                write_reg: None,
                except_reg: None,
                on_incoming: None,
                on_shutdown: None,
            })),
        };

        let Some(upstream) = upstreams.get() else {
            debug!("no upstream available");
            return connection;
        };

        let socket = match Socket::connect_tcp(&upstream.addr) {
            Ok(socket) => socket,
            Err(err) => {
                warn!(upstream = %upstream.addr, %err, "connect failed");
                upstreams.mark_bad(&upstream.addr);
                return connection;
            }
        };
        let fd = socket.raw_fd();

        let mut session = match TlsSession::new(context.clone(), socket) {
            Ok(session) => session,
            Err(err) => {
                warn!(upstream = %upstream.addr, %err, "failed to create TLS session");
                return connection;
            }
        };
        let policy = Arc::new(PolicyVerifier::new(
            upstream.hostname.clone(),
            upstream.pin.clone(),
        ));
        session.set_verifier(
            Arc::new(CachedVerifier::new(context.verify_cache(), policy)),
            !upstream.no_pki,
        );

        {
            let mut inner = connection.inner.borrow_mut();
            inner.upstream = Some(upstream);
            inner.fd = fd;
            inner.session = Some(session);
            inner.state = State::Connecting;

            let weak = Rc::downgrade(&connection.inner);
            inner.except_reg = Some(reactor.register_exception(
                fd,
                Rc::new(move |_fd| {
                    if let Some(inner) = weak.upgrade() {
                        Self::on_exception(&inner);
                    }
                }),
            ));
        }

        Self::drive_connect(&connection.inner);
        connection
    }

    /// Install the response handler. Set before data can arrive.
    pub fn set_on_incoming(&self, callback: IncomingCallback) {
        self.inner.borrow_mut().on_incoming = Some(callback);
    }

    /// Install the close handler; it fires exactly once.
    pub fn set_on_shutdown(&self, callback: ShutdownCallback) {
        self.inner.borrow_mut().on_shutdown = Some(callback);
    }

    /// Whether the connection is already closing or closed.
    pub fn closed(&self) -> bool {
        matches!(
            self.inner.borrow().state,
            State::ShuttingDown | State::Closed
        )
    }

    /// Identity comparison for tracking collections.
    pub fn same_as(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue one buffer for sending.
    ///
    /// Accepted only while connecting or open and only when no other
    /// buffer is pending; the per-query design needs exactly one.
    pub fn send(&self, buffer: Vec<u8>) -> bool {
        let state = {
            let mut inner = self.inner.borrow_mut();
            if inner.session.is_none()
                || !matches!(inner.state, State::Connecting | State::Open)
                || inner.write_buffer.is_some()
            {
                return false;
            }
            inner.write_buffer = Some(buffer);
            inner.state
        };
        if state == State::Open {
            Self::register_write_for_buffer(&self.inner);
            Self::on_writable(&self.inner);
        }
        true
    }

    /// Begin a graceful TLS shutdown.
    pub fn shutdown(&self) {
        let state = self.inner.borrow().state;
        if matches!(state, State::Connecting | State::Open) {
            Self::drive_shutdown(&self.inner);
        }
    }

    fn callback(inner: &Rc<RefCell<Inner>>, f: fn(&Rc<RefCell<Inner>>)) -> Callback {
        let weak: Weak<RefCell<Inner>> = Rc::downgrade(inner);
        Rc::new(move |_fd| {
            if let Some(inner) = weak.upgrade() {
                f(&inner);
            }
        })
    }

    /// Drive the handshake; registered as both the read and write handler
    /// while connecting, whichever the TLS engine last asked for.
    fn drive_connect(inner: &Rc<RefCell<Inner>>) {
        let (result, reactor, fd, deadline) = {
            let mut guard = inner.borrow_mut();
            guard.read_reg = None;
            guard.write_reg = None;
            let Some(session) = guard.session.as_mut() else {
                return;
            };
            let result = session.connect();
            (result, guard.reactor.clone(), guard.fd, guard.deadline)
        };

        match result {
            TlsResult::NeedRead => {
                let reg = reactor.register_read(
                    fd,
                    Self::callback(inner, Self::drive_connect),
                    Some(deadline),
                );
                inner.borrow_mut().read_reg = Some(reg);
            }
            TlsResult::NeedWrite => {
                let reg = reactor.register_write(
                    fd,
                    Self::callback(inner, Self::drive_connect),
                    Some(deadline),
                );
                inner.borrow_mut().write_reg = Some(reg);
            }
            TlsResult::Success => {
                {
                    let mut guard = inner.borrow_mut();
                    guard.state = State::Open;
                    debug!(fd, "upstream TLS established");
                }
                let reg = reactor.register_read(
                    fd,
                    Self::callback(inner, Self::on_readable),
                    Some(deadline),
                );
                let mut guard = inner.borrow_mut();
                guard.read_reg = Some(reg);
                let pending = guard.write_buffer.is_some();
                drop(guard);
                if pending {
                    Self::register_write_for_buffer(inner);
                    Self::on_writable(inner);
                }
            }
            TlsResult::Closed | TlsResult::Fatal => {
                Self::close(inner, true);
            }
        }
    }

    fn register_write_for_buffer(inner: &Rc<RefCell<Inner>>) {
        let (reactor, fd, deadline, already) = {
            let guard = inner.borrow();
            (
                guard.reactor.clone(),
                guard.fd,
                guard.deadline,
                guard.write_reg.is_some(),
            )
        };
        if already {
            return;
        }
        let reg =
            reactor.register_write(fd, Self::callback(inner, Self::on_writable), Some(deadline));
        inner.borrow_mut().write_reg = Some(reg);
    }

    /// Flush the pending buffer once the socket is writable.
    fn on_writable(inner: &Rc<RefCell<Inner>>) {
        let result = {
            let mut guard = inner.borrow_mut();
            let Inner {
                session,
                write_buffer,
                ..
            } = &mut *guard;
            let (Some(session), Some(buffer)) = (session.as_mut(), write_buffer.as_ref()) else {
                return;
            };
            session.write(buffer)
        };

        match result {
            // The write handler retries on its own; a handshake-driven
            // NeedRead resolves itself since the read side is registered.
            TlsResult::NeedRead | TlsResult::NeedWrite => {}
            TlsResult::Success => {
                let mut guard = inner.borrow_mut();
                guard.write_buffer = None;
                guard.write_reg = None;
            }
            TlsResult::Closed => Self::close(inner, false),
            TlsResult::Fatal => Self::close(inner, true),
        }
    }

    /// Pull decrypted bytes and hand them to the owner.
    fn on_readable(inner: &Rc<RefCell<Inner>>) {
        let mut buffer = Vec::new();
        let result = {
            let mut guard = inner.borrow_mut();
            let Some(session) = guard.session.as_mut() else {
                return;
            };
            session.read(&mut buffer)
        };

        match result {
            TlsResult::NeedRead | TlsResult::NeedWrite => {}
            TlsResult::Success => {
                if !buffer.is_empty() {
                    let callback = inner.borrow().on_incoming.clone();
                    if let Some(callback) = callback {
                        callback(
                            &ForwarderConnection {
                                inner: inner.clone(),
                            },
                            buffer,
                        );
                    }
                }
            }
            TlsResult::Closed => Self::close(inner, false),
            TlsResult::Fatal => Self::close(inner, true),
        }
    }

    /// Drive the close_notify exchange.
    fn drive_shutdown(inner: &Rc<RefCell<Inner>>) {
        let (result, reactor, fd, deadline) = {
            let mut guard = inner.borrow_mut();
            guard.read_reg = None;
            guard.write_reg = None;
            guard.state = State::ShuttingDown;
            let Some(session) = guard.session.as_mut() else {
                return;
            };
            let result = session.shutdown();
            (result, guard.reactor.clone(), guard.fd, guard.deadline)
        };

        match result {
            TlsResult::NeedRead => {
                let reg = reactor.register_read(
                    fd,
                    Self::callback(inner, Self::drive_shutdown),
                    Some(deadline),
                );
                inner.borrow_mut().read_reg = Some(reg);
            }
            TlsResult::NeedWrite => {
                let reg = reactor.register_write(
                    fd,
                    Self::callback(inner, Self::drive_shutdown),
                    Some(deadline),
                );
                inner.borrow_mut().write_reg = Some(reg);
            }
            TlsResult::Success | TlsResult::Closed | TlsResult::Fatal => {
                Self::close(inner, false);
            }
        }
    }

    /// The reactor's error/timeout path. A connection that never finished
    /// its handshake takes the upstream down with it.
    fn on_exception(inner: &Rc<RefCell<Inner>>) {
        let connecting = inner.borrow().state == State::Connecting;
        if connecting {
            debug!("upstream connection failed before handshake completion");
        }
        Self::close(inner, connecting);
    }

    /// Tear everything down and fire `on_shutdown` exactly once.
    fn close(inner: &Rc<RefCell<Inner>>, mark_bad: bool) {
        let callback = {
            let mut guard = inner.borrow_mut();
            if guard.state == State::Closed && guard.session.is_none() {
                return;
            }
            guard.read_reg = None;
            guard.write_reg = None;
            guard.except_reg = None;
            guard.state = State::Closed;
            guard.write_buffer = None;
            // Dropping the session closes the socket.
            guard.session = None;
            if mark_bad {
                if let Some(upstream) = guard.upstream.as_ref() {
                    guard.upstreams.mark_bad(&upstream.addr);
                }
            }
            // No callback may be re-entered after Closed.
            guard.on_incoming = None;
            guard.on_shutdown.take()
        };
        if let Some(callback) = callback {
            callback(&ForwarderConnection {
                inner: inner.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::DEFAULT_CIPHERS;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn upstream_set(addrs: &[SocketAddr], timeout: Duration) -> Rc<UpstreamSet> {
        let upstreams = addrs
            .iter()
            .map(|addr| Upstream {
                addr: *addr,
                hostname: "dns.example".into(),
                pin: Vec::new(),
                no_pki: false,
            })
            .collect();
        Rc::new(UpstreamSet::new(upstreams, timeout))
    }

    fn context() -> Rc<TlsContext> {
        Rc::new(TlsContext::new(DEFAULT_CIPHERS).unwrap())
    }

    #[test]
    fn test_empty_pool_fails_fast() {
        let reactor = Reactor::new();
        let upstreams = upstream_set(&[], Duration::from_secs(1));
        let connection = ForwarderConnection::connect(&reactor, &upstreams, &context());
        assert!(!connection.send(vec![0, 1, 2]));
        assert!(connection.closed());
    }

    #[test]
    fn test_single_pending_buffer() {
        let reactor = Reactor::new();
        // A port from the discard range that nothing should be listening
        // on; the connect is non-blocking so send still queues.
        let upstreams = upstream_set(&["127.0.0.1:9".parse().unwrap()], Duration::from_secs(5));
        let connection = ForwarderConnection::connect(&reactor, &upstreams, &context());
        assert!(connection.send(vec![1]));
        assert!(!connection.send(vec![2]));
    }

    #[test]
    fn test_refused_connect_marks_upstream_bad_and_shuts_down_once() {
        let reactor = Reactor::new();
        let first: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let second: SocketAddr = "127.0.0.2:9".parse().unwrap();
        let upstreams = upstream_set(&[first, second], Duration::from_secs(5));

        let connection = ForwarderConnection::connect(&reactor, &upstreams, &context());
        assert!(connection.send(vec![0u8; 4]));

        let shutdowns = Rc::new(RefCell::new(0u32));
        let shutdowns_in = shutdowns.clone();
        connection.set_on_shutdown(Rc::new(move |_conn| {
            *shutdowns_in.borrow_mut() += 1;
        }));

        reactor.run();

        assert_eq!(*shutdowns.borrow(), 1);
        assert!(connection.closed());
        // The failing upstream was rotated to the back.
        assert_eq!(upstreams.get().unwrap().addr, second);
    }

    #[test]
    fn test_deadline_fires_exception_and_demotes_upstream() {
        // A listener that accepts TCP but never speaks TLS.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let other: SocketAddr = "127.0.0.2:9".parse().unwrap();

        let reactor = Reactor::new();
        let upstreams = upstream_set(&[addr, other], Duration::from_millis(50));
        let connection = ForwarderConnection::connect(&reactor, &upstreams, &context());
        assert!(connection.send(vec![0u8; 4]));

        let shutdowns = Rc::new(RefCell::new(0u32));
        let shutdowns_in = shutdowns.clone();
        connection.set_on_shutdown(Rc::new(move |_conn| {
            *shutdowns_in.borrow_mut() += 1;
        }));

        let started = Instant::now();
        reactor.run();

        assert_eq!(*shutdowns.borrow(), 1);
        assert!(connection.closed());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(upstreams.get().unwrap().addr, other);
    }

    #[test]
    fn test_shutdown_before_open_is_safe() {
        let reactor = Reactor::new();
        let upstreams = upstream_set(&["127.0.0.1:9".parse().unwrap()], Duration::from_secs(5));
        let connection = ForwarderConnection::connect(&reactor, &upstreams, &context());

        let shutdowns = Rc::new(RefCell::new(0u32));
        let shutdowns_in = shutdowns.clone();
        connection.set_on_shutdown(Rc::new(move |_conn| {
            *shutdowns_in.borrow_mut() += 1;
        }));

        connection.shutdown();
        // Repeated shutdown must not re-fire the callback.
        connection.shutdown();
        assert_eq!(*shutdowns.borrow(), 1);
        assert!(connection.closed());
    }
}
