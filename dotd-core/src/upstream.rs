//! The ordered set of DoT upstreams and their selection policy.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

/// Everything needed to connect to and authenticate one upstream resolver.
///
/// A descriptor is immutable once built: `hostname` is the name the leaf
/// certificate must carry (empty means no hostname check), `pin` is the raw
/// SHA-256 of the leaf's SubjectPublicKeyInfo (empty means no pin check) and
/// `no_pki` bypasses the chain so the decision rests on pin and hostname
/// alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub addr: SocketAddr,
    pub hostname: String,
    pub pin: Vec<u8>,
    pub no_pki: bool,
}

impl Upstream {
    /// A descriptor is only usable when something authenticates the peer.
    pub fn usable(&self) -> bool {
        !self.hostname.is_empty() || !self.pin.is_empty() || self.no_pki
    }
}

/// Ordered upstream descriptors with a stable priority.
///
/// `get` hands out the front entry; `mark_bad` demotes a failing upstream to
/// the back so the next connection tries the following one.
pub struct UpstreamSet {
    upstreams: RefCell<VecDeque<Upstream>>,
    timeout: Duration,
}

impl UpstreamSet {
    pub fn new(upstreams: Vec<Upstream>, timeout: Duration) -> Self {
        Self {
            upstreams: RefCell::new(upstreams.into()),
            timeout,
        }
    }

    /// The per-connection deadline budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The upstream a new connection should use, or None if the set is
    /// empty (new connections then fail fast).
    pub fn get(&self) -> Option<Upstream> {
        self.upstreams.borrow().front().cloned()
    }

    /// Rotate the upstream with the given address to the back of the set.
    ///
    /// Matching is by address equality, idempotent, and preserves the order
    /// of every other descriptor.
    pub fn mark_bad(&self, addr: &SocketAddr) {
        let mut upstreams = self.upstreams.borrow_mut();
        if let Some(index) = upstreams.iter().position(|u| u.addr == *addr) {
            if index + 1 != upstreams.len() {
                debug!(upstream = %addr, "demoting upstream");
                if let Some(bad) = upstreams.remove(index) {
                    upstreams.push_back(bad);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.upstreams.borrow().len()
    }
}
