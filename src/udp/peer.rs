//! `UdpPeer`: a remembered datagram sender.

use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::endpoint::{Endpoint, PeerId};
use crate::error::Error;
use crate::reactor::Reactor;
use crate::udp::server::ServerInner;

/// One sender a `UdpServer` has seen a datagram from. In transient mode
/// (`UdpServer::start_receive`) a fresh, unshared `UdpPeer` is built per
/// packet; in tracked mode (`start_receive_tracked`) the same `Rc<UdpPeer>`
/// is reused across packets from the same `PeerId` until it times out or is
/// explicitly closed.
pub struct UdpPeer {
    id: PeerId,
    endpoint: Endpoint,
    last_packet_time: Cell<u64>,
    closed: Cell<bool>,
    server: Weak<ServerInner>,
}

impl UdpPeer {
    pub(crate) fn new_transient(id: PeerId, endpoint: Endpoint, server: Weak<ServerInner>) -> UdpPeer {
        UdpPeer {
            id,
            endpoint,
            last_packet_time: Cell::new(0),
            closed: Cell::new(false),
            server,
        }
    }

    pub(crate) fn new_tracked(
        id: PeerId,
        endpoint: Endpoint,
        now_ms: u64,
        server: Weak<ServerInner>,
    ) -> UdpPeer {
        UdpPeer {
            id,
            endpoint,
            last_packet_time: Cell::new(now_ms),
            closed: Cell::new(false),
            server,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_packet_time.set(now_ms);
    }

    pub(crate) fn last_packet_time(&self) -> u64 {
        self.last_packet_time.get()
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.set(true);
    }

    /// Sends a datagram back to this peer's address via the owning server's
    /// socket. Fails with `NotConnected` if the server has since closed.
    pub fn send_data(
        &self,
        data: Vec<u8>,
        on_end_send: Option<impl FnOnce(&Reactor, Error) + 'static>,
    ) -> Result<(), Error> {
        let server = self
            .server
            .upgrade()
            .ok_or_else(|| Error::new(crate::error::StatusCode::NotConnected))?;
        server.send_to(
            self.endpoint,
            data,
            on_end_send.map(|f| Box::new(f) as Box<dyn FnOnce(&Reactor, Error)>),
        )
    }
}
