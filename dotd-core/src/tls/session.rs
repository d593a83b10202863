//! One non-blocking TLS connection.
//!
//! Every operation reports how it wants to be resumed: `NeedRead` and
//! `NeedWrite` ask the caller to re-invoke the same operation once the
//! socket has the matching readiness. The reactor drives the handshake,
//! reads, writes and shutdown this way without ever blocking.

use std::net::TcpStream;
use std::rc::Rc;
use std::sync::Arc;

use openssl::error::ErrorStack;
use openssl::ssl::{self, ErrorCode, ShutdownResult, Ssl, SslStream, SslVerifyMode};
use openssl::x509::{X509, X509StoreContextRef};
use tracing::debug;

use super::context::TlsContext;
use super::verify::{override_allowed, Verdict, Verify};
use crate::socket::Socket;

/// How far one TLS operation got.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsResult {
    /// Retry the same operation when the socket is readable.
    NeedRead,
    /// Retry the same operation when the socket is writable.
    NeedWrite,
    /// The operation completed.
    Success,
    /// The peer closed the connection cleanly.
    Closed,
    /// The connection is beyond saving.
    Fatal,
}

/// Reads are sized to the TLS maximum record length.
const MAX_FRAME: usize = 16 * 1024;

enum State {
    /// Verification can still be configured; no bytes have moved.
    Setup { ssl: Box<Ssl>, stream: TcpStream },
    /// The handshake machinery owns the socket now.
    Active(SslStream<TcpStream>),
    /// Construction of the stream itself failed.
    Broken,
}

/// A TLS session bound to one non-blocking TCP socket.
pub struct TlsSession {
    context: Rc<TlsContext>,
    state: State,
}

impl TlsSession {
    /// Wrap a freshly connected (or connecting) socket. If the context has
    /// a cached session it is offered for resumption.
    pub fn new(context: Rc<TlsContext>, socket: Socket) -> Result<Self, ErrorStack> {
        let mut ssl = Ssl::new(context.raw())?;
        if let Some(session) = context.session() {
            // set_session requires a session minted by this same context;
            // the slot never holds anything else.
            #[allow(unsafe_code)]
            unsafe {
                ssl.set_session(&session)?;
            }
        }
        ssl.set_connect_state();
        Ok(Self {
            context,
            state: State::Setup {
                ssl: Box::new(ssl),
                stream: TcpStream::from(socket.into_fd()),
            },
        })
    }

    /// Install the leaf policy. Must happen before `connect`.
    ///
    /// With `pki` set the standard chain is built first and the verdict
    /// refines it; a failed chain can only be rescued by a `Pinned` verdict
    /// and only for the short list of overridable build errors. Without
    /// `pki` the chain result is ignored and the verdict alone decides.
    pub fn set_verifier(&mut self, verifier: Arc<dyn Verify>, pki: bool) {
        if let State::Setup { ssl, .. } = &mut self.state {
            ssl.set_verify_callback(
                SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
                move |chain_ok, store| route(chain_ok, store, &*verifier, pki),
            );
        }
    }

    /// Turn certificate verification off entirely (pin-lookup mode).
    pub fn disable_verification(&mut self) {
        if let State::Setup { ssl, .. } = &mut self.state {
            ssl.set_verify(SslVerifyMode::NONE);
        }
    }

    /// Drive the handshake one step.
    pub fn connect(&mut self) -> TlsResult {
        if matches!(self.state, State::Setup { .. }) {
            if let State::Setup { ssl, stream } = std::mem::replace(&mut self.state, State::Broken)
            {
                match SslStream::new(*ssl, stream) {
                    Ok(active) => self.state = State::Active(active),
                    Err(err) => {
                        debug!(%err, "failed to attach TLS to socket");
                        self.context.store_session(None);
                        return TlsResult::Fatal;
                    }
                }
            }
        }
        let State::Active(stream) = &mut self.state else {
            return TlsResult::Fatal;
        };

        match stream.do_handshake() {
            Ok(()) => {
                let session = stream.ssl().session().map(|session| session.to_owned());
                self.context.store_session(session);
                TlsResult::Success
            }
            Err(err) => {
                let result = map_error(&err);
                if result == TlsResult::Fatal {
                    // The pool is about to rotate upstreams; a ticket for
                    // the old one is useless.
                    self.context.store_session(None);
                }
                result
            }
        }
    }

    /// Queue `buffer` into the TLS stream.
    ///
    /// An empty buffer succeeds without touching the library, whose
    /// behaviour for zero-length writes is undefined.
    pub fn write(&mut self, buffer: &[u8]) -> TlsResult {
        if buffer.is_empty() {
            return TlsResult::Success;
        }
        let State::Active(stream) = &mut self.state else {
            return TlsResult::Fatal;
        };
        match stream.ssl_write(buffer) {
            Ok(_) => TlsResult::Success,
            Err(err) => map_error(&err),
        }
    }

    /// Read up to 16 KiB, replacing `out` with the bytes received.
    pub fn read(&mut self, out: &mut Vec<u8>) -> TlsResult {
        let State::Active(stream) = &mut self.state else {
            return TlsResult::Fatal;
        };
        let mut buffer = [0u8; MAX_FRAME];
        match stream.ssl_read(&mut buffer) {
            Ok(0) => TlsResult::Closed,
            Ok(count) => {
                out.clear();
                out.extend_from_slice(&buffer[..count]);
                TlsResult::Success
            }
            Err(err) => map_error(&err),
        }
    }

    /// Drive the close_notify exchange one step. Safe to call repeatedly;
    /// a session that never went active just reports itself closed.
    ///
    /// Sending our close_notify is only half the exchange: `NeedRead` asks
    /// to be called again once the peer's close_notify can be read.
    pub fn shutdown(&mut self) -> TlsResult {
        let State::Active(stream) = &mut self.state else {
            return TlsResult::Closed;
        };
        match stream.shutdown() {
            Ok(ShutdownResult::Sent) => TlsResult::NeedRead,
            Ok(ShutdownResult::Received) => TlsResult::Success,
            Err(err) => map_error(&err),
        }
    }

    /// The peer's leaf certificate, once the handshake finished.
    pub fn peer_certificate(&self) -> Option<X509> {
        match &self.state {
            State::Active(stream) => stream.ssl().peer_certificate(),
            _ => None,
        }
    }

    /// Whether the handshake reused a cached session.
    pub fn session_reused(&self) -> bool {
        match &self.state {
            State::Active(stream) => stream.ssl().session_reused(),
            _ => false,
        }
    }
}

fn map_error(err: &ssl::Error) -> TlsResult {
    match err.code() {
        ErrorCode::WANT_READ => TlsResult::NeedRead,
        ErrorCode::WANT_WRITE => TlsResult::NeedWrite,
        ErrorCode::ZERO_RETURN => TlsResult::Closed,
        _ => TlsResult::Fatal,
    }
}

/// The chain/policy combination of the verification design.
///
/// Called by OpenSSL once per certificate in the chain. Intermediate
/// certificates pass through (a failed build is tolerated only for the
/// overridable errors); the decision is taken at the leaf, where the
/// policy verdict refines or overrides the chain result.
fn route(
    chain_ok: bool,
    store: &mut X509StoreContextRef,
    verifier: &dyn Verify,
    pki: bool,
) -> bool {
    if pki && !chain_ok && !override_allowed(store.error()) {
        return false;
    }
    if store.error_depth() > 0 {
        return true;
    }
    let Some(certificate) = store.current_cert() else {
        return false;
    };
    match verifier.verify(certificate) {
        Verdict::Pinned => true,
        Verdict::Reject => false,
        Verdict::HostnameOnly => !pki || chain_ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_routing_table() {
        // (verdict, chain_ok, pki) -> accepted
        let apply = |verdict: Verdict, chain_ok: bool, pki: bool| match verdict {
            Verdict::Pinned => true,
            Verdict::Reject => false,
            Verdict::HostnameOnly => !pki || chain_ok,
        };

        // A pin overrides a failed chain; a reject overrides a good one.
        assert!(apply(Verdict::Pinned, false, true));
        assert!(!apply(Verdict::Reject, true, true));
        // Hostname-only leaves the chain result alone.
        assert!(apply(Verdict::HostnameOnly, true, true));
        assert!(!apply(Verdict::HostnameOnly, false, true));
        // Without PKI the chain never matters.
        assert!(apply(Verdict::HostnameOnly, false, false));
    }
}
