//! One-shot pin lookup: connect to a resolver, report the certificate's
//! common name and SPKI pin, and exit. Used to bootstrap a configuration
//! against a server whose pin is not yet known.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use openssl::error::ErrorStack;
use thiserror::Error;

use crate::pin::{encode_pin, spki_sha256};
use crate::reactor::{Reactor, Registration};
use crate::socket::{Socket, SocketError};
use crate::tls::{TlsContext, TlsResult, TlsSession};

#[derive(Debug, Error)]
pub enum LookupError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Ssl(#[from] ErrorStack),
    #[error("the TLS handshake did not complete")]
    HandshakeFailed,
}

/// What the upstream presented.
pub struct LookupResult {
    pub common_name: String,
    pub pin: String,
}

struct Lookup {
    reactor: Reactor,
    fd: RawFd,
    session: TlsSession,
    deadline: Instant,
    read_reg: Option<Registration>,
    write_reg: Option<Registration>,
    except_reg: Option<Registration>,
}

/// Connect with verification disabled and harvest the leaf certificate.
pub fn lookup_pin(
    addr: &SocketAddr,
    ciphers: &str,
    timeout: Duration,
) -> Result<LookupResult, LookupError> {
    let reactor = Reactor::new();
    let context = Rc::new(TlsContext::new(ciphers)?);

    let socket = Socket::connect_tcp(addr)?;
    let fd = socket.raw_fd();
    let mut session = TlsSession::new(context, socket)?;
    // There is nothing to verify against yet; the pin is the output.
    session.disable_verification();

    let inner = Rc::new(RefCell::new(Lookup {
        reactor: reactor.clone(),
        fd,
        session,
        deadline: Instant::now() + timeout,
        read_reg: None,
        write_reg: None,
        except_reg: None,
    }));

    {
        let weak = Rc::downgrade(&inner);
        let except = reactor.register_exception(
            fd,
            Rc::new(move |_fd| {
                if let Some(inner) = weak.upgrade() {
                    let mut guard = inner.borrow_mut();
                    guard.read_reg = None;
                    guard.write_reg = None;
                    guard.except_reg = None;
                }
            }),
        );
        inner.borrow_mut().except_reg = Some(except);
    }

    drive(&inner);
    reactor.run();

    let guard = inner.borrow();
    let certificate = guard
        .session
        .peer_certificate()
        .ok_or(LookupError::HandshakeFailed)?;
    let common_name = certificate
        .subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .map(|entry| String::from_utf8_lossy(entry.data().as_slice()).into_owned())
        .unwrap_or_default();
    let pin = encode_pin(&spki_sha256(&certificate)?);

    Ok(LookupResult { common_name, pin })
}

fn drive(inner: &Rc<RefCell<Lookup>>) {
    let (result, reactor, fd, deadline) = {
        let mut guard = inner.borrow_mut();
        guard.read_reg = None;
        guard.write_reg = None;
        let result = guard.session.connect();
        (result, guard.reactor.clone(), guard.fd, guard.deadline)
    };

    let weak = Rc::downgrade(inner);
    let callback = move |_fd: RawFd| {
        if let Some(inner) = weak.upgrade() {
            drive(&inner);
        }
    };

    match result {
        TlsResult::NeedRead => {
            let reg = reactor.register_read(fd, Rc::new(callback), Some(deadline));
            inner.borrow_mut().read_reg = Some(reg);
        }
        TlsResult::NeedWrite => {
            let reg = reactor.register_write(fd, Rc::new(callback), Some(deadline));
            inner.borrow_mut().write_reg = Some(reg);
        }
        TlsResult::Success | TlsResult::Closed | TlsResult::Fatal => {
            // Finished one way or the other; let the loop drain.
            let mut guard = inner.borrow_mut();
            guard.read_reg = None;
            guard.write_reg = None;
            guard.except_reg = None;
        }
    }
}
