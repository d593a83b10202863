//! The shared TLS client context: cipher policy, trust roots, and the
//! process-wide single-slot session cache used for resumption.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use openssl::error::ErrorStack;
use openssl::ssl::{SslContext, SslContextRef, SslMethod, SslOptions, SslSession, SslVerifyMode};
use tracing::debug;

use super::verify::VerifyCache;

/// The cipher list offered to upstreams: AEAD and forward secrecy first,
/// with the legacy and null suites excluded outright.
pub const DEFAULT_CIPHERS: &str = "EECDH+ECDSA+AESGCM:EECDH+aRSA+AESGCM:\
EECDH+ECDSA+SHA256:EECDH+aRSA+SHA256:EECDH+ECDSA+SHA384:EECDH+ECDSA+SHA256:\
EECDH+aRSA+SHA384:EDH+aRSA+AESGCM:EDH+aRSA+SHA256:EDH+aRSA:EECDH:\
!aNULL:!eNULL:!MEDIUM:!LOW:!3DES:!MD5:!EXP:!PSK:!SRP:!DSS:!RC4:!SEED";

/// A TLS client context shared by every session in the process.
///
/// Owns one session-resumption slot: the most recent successful handshake
/// stores its session here and the next connection offers it back to the
/// upstream. A fatal handshake clears the slot, since the pool will rotate
/// to a different server.
pub struct TlsContext {
    context: SslContext,
    session: RefCell<Option<SslSession>>,
    verify_cache: Arc<VerifyCache>,
}

impl TlsContext {
    pub fn new(ciphers: &str) -> Result<Self, ErrorStack> {
        let mut builder = SslContext::builder(SslMethod::tls_client())?;
        // TLS only; SSLv2/v3 and compression stay off.
        builder.set_options(
            SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3 | SslOptions::NO_COMPRESSION,
        );
        builder.set_default_verify_paths()?;
        builder.set_verify(SslVerifyMode::PEER);
        builder.set_cipher_list(ciphers)?;
        Ok(Self {
            context: builder.build(),
            session: RefCell::new(None),
            verify_cache: Arc::new(VerifyCache::new(VerifyCache::DEFAULT_TTL)),
        })
    }

    pub fn with_verify_ttl(ciphers: &str, ttl: Duration) -> Result<Self, ErrorStack> {
        let mut context = Self::new(ciphers)?;
        context.verify_cache = Arc::new(VerifyCache::new(ttl));
        Ok(context)
    }

    pub(crate) fn raw(&self) -> &SslContextRef {
        &self.context
    }

    pub(crate) fn verify_cache(&self) -> Arc<VerifyCache> {
        self.verify_cache.clone()
    }

    /// The cached session for resumption, if any.
    pub(crate) fn session(&self) -> Option<SslSession> {
        self.session.borrow().clone()
    }

    /// Replace (or clear) the resumption slot.
    pub(crate) fn store_session(&self, session: Option<SslSession>) {
        if session.is_none() && self.session.borrow().is_some() {
            debug!("invalidating cached TLS session");
        }
        *self.session.borrow_mut() = session;
    }

    #[cfg(test)]
    pub(crate) fn has_session(&self) -> bool {
        self.session.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builds_with_default_ciphers() {
        TlsContext::new(DEFAULT_CIPHERS).unwrap();
    }

    #[test]
    fn test_context_rejects_nonsense_ciphers() {
        assert!(TlsContext::new("NOT-A-CIPHER-LIST!!!").is_err());
    }

    #[test]
    fn test_session_slot_starts_empty() {
        let context = TlsContext::new(DEFAULT_CIPHERS).unwrap();
        assert!(!context.has_session());
        context.store_session(None);
        assert!(!context.has_session());
    }
}
