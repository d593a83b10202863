//! TLS plumbing: the shared client context, non-blocking sessions, and the
//! certificate verification policy.

mod context;
mod session;
mod verify;

pub use context::{TlsContext, DEFAULT_CIPHERS};
pub use session::{TlsResult, TlsSession};
pub use verify::{verify_hostname, CachedVerifier, PolicyVerifier, Verdict, Verify, VerifyCache};
