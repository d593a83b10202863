//! Core engine of a DNS-over-TLS forwarding proxy.
//!
//! Plain UDP queries arrive at the [`server::Server`] ingress, get framed
//! for TCP transport, and are relayed by the [`dispatch::Dispatcher`] over
//! per-query TLS connections ([`forwarder::ForwarderConnection`]) to an
//! upstream resolver chosen from the [`upstream::UpstreamSet`]. Responses
//! flow back the same way, minus any EDNS padding, onto the client's
//! original socket.
//!
//! Everything runs on one thread under the [`reactor::Reactor`]; all I/O
//! is non-blocking and the only place the process sleeps is the poll wait.

pub mod dispatch;
pub mod dns;
pub mod forwarder;
pub mod lookup;
pub mod pin;
pub mod reactor;
pub mod server;
pub mod socket;
pub mod tls;
pub mod upstream;
