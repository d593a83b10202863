//! Fans incoming queries out over a bounded pool of forwarder connections.
//!
//! One connection per query. At capacity, queries wait in a FIFO overflow
//! queue; each connection shutdown admits exactly one queued entry. The
//! queue itself is bounded, dropping the oldest entry when full.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::rc::{Rc, Weak};

use nix::sys::socket::SockaddrStorage;
use tracing::{debug, info, warn};

use crate::dns::DnsPacket;
use crate::forwarder::ForwarderConnection;
use crate::reactor::Reactor;
use crate::socket::Socket;
use crate::tls::TlsContext;
use crate::upstream::UpstreamSet;

/// Upper bound on queued queries while every connection slot is busy.
/// Clients behind a full queue are served by their own retries.
pub const QUEUE_LIMIT: usize = 1024;

/// A query waiting for a connection slot.
struct PendingQuery {
    reply: Rc<Socket>,
    client: SockaddrStorage,
    local: Option<IpAddr>,
    iface: Option<u32>,
    frame: Vec<u8>,
}

struct Inner {
    reactor: Reactor,
    upstreams: Rc<UpstreamSet>,
    context: Rc<TlsContext>,
    max_connections: usize,
    live: Vec<ForwarderConnection>,
    queue: VecDeque<PendingQuery>,
}

/// Hands queries to forwarder connections and replies to clients.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<RefCell<Inner>>,
}

impl Dispatcher {
    pub fn new(
        reactor: Reactor,
        upstreams: Rc<UpstreamSet>,
        context: Rc<TlsContext>,
        max_connections: usize,
    ) -> Self {
        info!(
            max_connections,
            queue_limit = QUEUE_LIMIT,
            "dispatcher ready"
        );
        Self {
            inner: Rc::new(RefCell::new(Inner {
                reactor,
                upstreams,
                context,
                max_connections,
                live: Vec::new(),
                queue: VecDeque::new(),
            })),
        }
    }

    /// Accept one framed query from the server ingress.
    ///
    /// `reply` is the very socket the query arrived on; `local` and `iface`
    /// pin the response's source so multi-homed hosts answer from the
    /// address the client targeted.
    pub fn handle_request(
        &self,
        reply: Rc<Socket>,
        client: SockaddrStorage,
        local: Option<IpAddr>,
        iface: Option<u32>,
        frame: Vec<u8>,
    ) {
        let query = PendingQuery {
            reply,
            client,
            local,
            iface,
            frame,
        };
        let at_capacity = {
            let inner = self.inner.borrow();
            inner.live.len() >= inner.max_connections
        };
        if at_capacity {
            self.enqueue(query);
        } else {
            self.dispatch(query);
        }
    }

    /// Number of connections currently in flight.
    pub fn live_connections(&self) -> usize {
        self.inner.borrow().live.len()
    }

    /// Number of queries parked in the overflow queue.
    pub fn queued(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    fn enqueue(&self, query: PendingQuery) {
        let mut inner = self.inner.borrow_mut();
        if inner.queue.len() >= QUEUE_LIMIT {
            warn!("overflow queue full, dropping oldest query");
            inner.queue.pop_front();
        }
        inner.queue.push_back(query);
    }

    fn dispatch(&self, query: PendingQuery) {
        let connection = {
            let inner = self.inner.borrow();
            ForwarderConnection::connect(&inner.reactor, &inner.upstreams, &inner.context)
        };

        if connection.send(query.frame) {
            let reply = query.reply;
            let client = query.client;
            let local = query.local;
            let iface = query.iface;
            connection.set_on_incoming(Rc::new(move |conn, buffer| {
                emit_reply(&reply, &client, local, iface, buffer);
                // One response per query.
                conn.shutdown();
            }));

            let weak: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
            connection.set_on_shutdown(Rc::new(move |conn| {
                if let Some(inner) = weak.upgrade() {
                    Dispatcher { inner }.handle_shutdown(conn);
                }
            }));

            self.inner.borrow_mut().live.push(connection);
        } else {
            debug!("query dropped, no usable upstream connection");
            drop(connection);
            // Keep draining even though this query died.
            self.dequeue();
        }
    }

    fn handle_shutdown(&self, connection: &ForwarderConnection) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.live.retain(|c| !c.same_as(connection));
        }
        self.dequeue();
    }

    /// Admit one queued query, if any. One per shutdown, no batching.
    fn dequeue(&self) {
        let query = self.inner.borrow_mut().queue.pop_front();
        if let Some(query) = query {
            self.dispatch(query);
        }
    }
}

/// Decode the upstream's framed response, strip EDNS padding, and send the
/// bare DNS message back to the client.
fn emit_reply(
    reply: &Socket,
    client: &SockaddrStorage,
    local: Option<IpAddr>,
    iface: Option<u32>,
    buffer: Vec<u8>,
) {
    let mut packet = DnsPacket::new(buffer);
    if !packet.valid() {
        info!("dropping malformed upstream response");
        return;
    }
    // Padding is only meaningful on the encrypted leg; a parse anomaly
    // forwards the response as-is.
    packet.strip_padding();
    if let Err(err) = reply.send_reply(packet.data(), client, local, iface) {
        warn!(%err, "unable to send response to client");
    }
}
