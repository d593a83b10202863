//! UDP ingress: receives client queries, frames them for TCP transport and
//! hands them to the dispatcher.

use std::net::SocketAddr;
use std::rc::Rc;

use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::reactor::{Reactor, Registration};
use crate::socket::{Socket, SocketError};

/// Largest plain-UDP DNS query accepted from clients.
const MAX_QUERY: usize = 512;

/// The set of listening sockets. Dropping the server deregisters them all,
/// which lets the reactor drain in-flight queries and exit.
pub struct Server {
    reactor: Reactor,
    dispatcher: Dispatcher,
    listeners: Vec<(Rc<Socket>, Registration)>,
}

impl Server {
    pub fn new(reactor: Reactor, dispatcher: Dispatcher) -> Self {
        Self {
            reactor,
            dispatcher,
            listeners: Vec::new(),
        }
    }

    /// Bind one UDP listen address and register it with the reactor.
    pub fn add_listener(&mut self, addr: &SocketAddr) -> Result<(), SocketError> {
        let socket = Rc::new(Socket::bind_udp(addr)?);
        socket.enable_packet_info()?;

        let dispatcher = self.dispatcher.clone();
        let reply = socket.clone();
        let registration = self.reactor.register_read(
            socket.raw_fd(),
            Rc::new(move |_fd| receive_query(&reply, &dispatcher)),
            None,
        );
        if !registration.active() {
            warn!(%addr, "listen address registered twice");
        }

        info!(%addr, "listening for DNS queries");
        self.listeners.push((socket, registration));
        Ok(())
    }
}

/// Pull one datagram off a listener and dispatch it.
fn receive_query(socket: &Rc<Socket>, dispatcher: &Dispatcher) {
    let datagram = match socket.recv_query(MAX_QUERY) {
        Ok(Some(datagram)) => datagram,
        Ok(None) => return,
        Err(SocketError::Truncated) => {
            info!("dropping oversized DNS query");
            return;
        }
        Err(err) => {
            warn!(%err, "failed to receive DNS query");
            return;
        }
    };

    // TCP DNS framing: two bytes of big-endian length, then the message.
    let mut frame = Vec::with_capacity(datagram.payload.len() + 2);
    frame.extend_from_slice(&(datagram.payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&datagram.payload);

    dispatcher.handle_request(
        socket.clone(),
        datagram.peer,
        datagram.local,
        datagram.iface,
        frame,
    );
}
