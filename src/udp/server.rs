//! `UdpServer`: a bound UDP socket that can track senders across packets.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::net::UdpSocket;
use mio::Token;

use crate::backlog::BacklogWithTimeout;
use crate::buffer::{BufferPool, DataChunk, SharedBuffer};
use crate::endpoint::{Endpoint, PeerId};
use crate::error::{Error, StatusCode};
use crate::reactor::{IoHandler, Readiness, Reactor, Timer};
use crate::removable::{Removable, RemovalState};
use crate::udp::monotonic_ms;
use crate::udp::peer::UdpPeer;

const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

type OnReceiveTransient = Rc<RefCell<dyn FnMut(&Reactor, &UdpPeer, &DataChunk)>>;
type OnNewPeer = Rc<RefCell<dyn FnMut(&Reactor, &Rc<UdpPeer>)>>;
type OnReceiveTracked = Rc<RefCell<dyn FnMut(&Reactor, &Rc<UdpPeer>, &DataChunk)>>;
type OnPeerTimeout = Rc<RefCell<dyn FnMut(&Reactor, Rc<UdpPeer>, Error)>>;

struct PendingDatagram {
    addr: SocketAddr,
    data: Vec<u8>,
    on_end_send: Option<Box<dyn FnOnce(&Reactor, Error)>>,
}

/// State for `start_receive_tracked`: senders remembered across packets and
/// expired via `BacklogWithTimeout` after `timeout_ms` of inactivity.
struct TrackedState {
    on_new_peer: Option<OnNewPeer>,
    on_receive: OnReceiveTracked,
    on_peer_timeout: OnPeerTimeout,
    active: RefCell<HashMap<PeerId, Rc<UdpPeer>>>,
    backlog: BacklogWithTimeout<Rc<UdpPeer>>,
    /// Peers moved here by `close_peer`; packets from them are dropped until
    /// their cooldown timer fires and removes the entry.
    inactive: RefCell<HashMap<PeerId, Timer>>,
}

pub(crate) struct ServerInner {
    self_weak: Weak<ServerInner>,
    reactor: Reactor,
    socket: RefCell<Option<UdpSocket>>,
    token: Cell<Option<Token>>,
    endpoint: Cell<Endpoint>,
    read_pool: RefCell<BufferPool>,
    outgoing: RefCell<VecDeque<PendingDatagram>>,
    transient: RefCell<Option<OnReceiveTransient>>,
    tracked: RefCell<Option<TrackedState>>,
    removal: Rc<RemovalState>,
}

/// Receives UDP datagrams on a bound socket, optionally tracking senders as
/// [`UdpPeer`]s across packets.
pub struct UdpServer {
    inner: Rc<ServerInner>,
}

impl UdpServer {
    pub fn new(reactor: &Reactor) -> UdpServer {
        let inner = Rc::new_cyclic(|weak| ServerInner {
            self_weak: weak.clone(),
            reactor: reactor.clone(),
            socket: RefCell::new(None),
            token: Cell::new(None),
            endpoint: Cell::new(Endpoint::Undefined),
            read_pool: RefCell::new(BufferPool::new()),
            outgoing: RefCell::new(VecDeque::new()),
            transient: RefCell::new(None),
            tracked: RefCell::new(None),
            removal: Rc::new(RemovalState::new()),
        });
        UdpServer { inner }
    }

    /// Transient mode: each datagram yields a fresh, untracked `UdpPeer`.
    pub fn start_receive(
        &self,
        endpoint: Endpoint,
        on_receive: impl FnMut(&Reactor, &UdpPeer, &DataChunk) + 'static,
    ) -> Result<(), Error> {
        self.bind(endpoint)?;
        *self.inner.transient.borrow_mut() = Some(Rc::new(RefCell::new(on_receive)));
        Ok(())
    }

    /// Peer-tracking mode: senders are remembered by `PeerId` and expire
    /// after `timeout_ms` of inactivity, firing `on_peer_timeout`.
    pub fn start_receive_tracked(
        &self,
        endpoint: Endpoint,
        on_new_peer: Option<impl FnMut(&Reactor, &Rc<UdpPeer>) + 'static>,
        on_receive: impl FnMut(&Reactor, &Rc<UdpPeer>, &DataChunk) + 'static,
        timeout_ms: u64,
        on_peer_timeout: impl FnMut(&Reactor, Rc<UdpPeer>, Error) + 'static,
    ) -> Result<(), Error> {
        self.bind(endpoint)?;

        let inner_weak = self.inner.self_weak.clone();
        let backlog = BacklogWithTimeout::new(
            &self.inner.reactor,
            timeout_ms,
            move |peer: Rc<UdpPeer>| {
                if let Some(inner) = inner_weak.upgrade() {
                    inner.expire_peer(peer);
                }
            },
            |peer: &Rc<UdpPeer>| peer.last_packet_time(),
            monotonic_ms,
        );

        *self.inner.tracked.borrow_mut() = Some(TrackedState {
            on_new_peer: on_new_peer.map(|f| Rc::new(RefCell::new(f)) as OnNewPeer),
            on_receive: Rc::new(RefCell::new(on_receive)),
            on_peer_timeout: Rc::new(RefCell::new(on_peer_timeout)),
            active: RefCell::new(HashMap::new()),
            backlog,
            inactive: RefCell::new(HashMap::new()),
        });
        Ok(())
    }

    fn bind(&self, endpoint: Endpoint) -> Result<(), Error> {
        if endpoint.is_undefined() {
            return Err(Error::new(StatusCode::InvalidArgument));
        }
        if self.inner.socket.borrow().is_some() {
            return Err(Error::new(StatusCode::ConnectionAlreadyInProgress));
        }
        let addr = std::net::SocketAddr::try_from(endpoint)
            .map_err(|_| Error::new(StatusCode::InvalidArgument))?;
        let mut socket = UdpSocket::bind(addr).map_err(Error::from)?;

        let handler: Rc<dyn IoHandler> = Rc::clone(&self.inner) as Rc<dyn IoHandler>;
        let token = self.inner.reactor.register_io_handler(handler);
        self.inner
            .reactor
            .registry()
            .register(&mut socket, token, Reactor::interest_rw())
            .map_err(Error::from)?;

        self.inner
            .endpoint
            .set(socket.local_addr().map(Endpoint::from).unwrap_or(endpoint));
        self.inner.token.set(Some(token));
        *self.inner.socket.borrow_mut() = Some(socket);
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.get()
    }

    /// Moves `peer` out of the active map into a cooldown map for
    /// `inactivity_timeout_ms`: packets from it are dropped until the
    /// cooldown elapses, instead of being treated as a new peer.
    pub fn close_peer(&self, peer: &Rc<UdpPeer>, inactivity_timeout_ms: u64) {
        self.inner.close_peer(peer, inactivity_timeout_ms);
    }

    pub fn close(&self, on_done: Option<impl FnOnce(&Reactor) + 'static>) {
        self.inner.teardown();
        if let Some(cb) = on_done {
            let reactor = self.inner.reactor.clone();
            reactor.schedule_callback(move |r| cb(r));
        }
    }
}

impl ServerInner {
    fn expire_peer(&self, peer: Rc<UdpPeer>) {
        peer.mark_closed();
        let on_timeout = {
            let mut tracked = self.tracked.borrow_mut();
            match tracked.as_mut() {
                Some(t) => {
                    t.active.borrow_mut().remove(&peer.id());
                    Rc::clone(&t.on_peer_timeout)
                }
                None => return,
            }
        };
        (on_timeout.borrow_mut())(&self.reactor, peer, Error::OK);
    }

    fn close_peer(&self, peer: &Rc<UdpPeer>, inactivity_timeout_ms: u64) {
        let mut tracked = self.tracked.borrow_mut();
        let tracked = match tracked.as_mut() {
            Some(t) => t,
            None => return,
        };
        tracked.active.borrow_mut().remove(&peer.id());
        peer.mark_closed();

        if inactivity_timeout_ms == 0 {
            return;
        }
        let id = peer.id();
        let timer = Timer::new(&self.reactor);
        let self_weak = self.self_weak.clone();
        timer
            .start(Duration::from_millis(inactivity_timeout_ms), None, move |_| {
                if let Some(inner) = self_weak.upgrade() {
                    if let Some(t) = inner.tracked.borrow_mut().as_mut() {
                        t.inactive.borrow_mut().remove(&id);
                    }
                }
            })
            .expect("starting the inactive-cooldown timer cannot fail");
        tracked.inactive.borrow_mut().insert(id, timer);
    }

    fn handle_datagram(self: &Rc<Self>, addr: SocketAddr, chunk_buf: SharedBuffer, n: usize) {
        let endpoint = Endpoint::from(addr);
        let peer_id = PeerId::from_endpoint(&endpoint);
        let now = monotonic_ms();
        let chunk = DataChunk::new(chunk_buf, n, 0);

        let transient_cb = self.transient.borrow().clone();
        if let Some(on_receive) = transient_cb {
            let peer = UdpPeer::new_transient(peer_id, endpoint, Weak::clone(&self.self_weak));
            (on_receive.borrow_mut())(&self.reactor, &peer, &chunk);
            return;
        }

        // Collect what's needed from `tracked`, then drop its borrow before
        // invoking any user callback: those callbacks may call back into
        // `close_peer`/`start_receive_tracked`, which also borrow `tracked`.
        let (peer, on_new_peer, on_receive) = {
            let mut tracked_opt = self.tracked.borrow_mut();
            let tracked = match tracked_opt.as_mut() {
                Some(t) => t,
                None => return,
            };
            if tracked.inactive.borrow().contains_key(&peer_id) {
                return;
            }
            let existing = tracked.active.borrow().get(&peer_id).cloned();
            match existing {
                Some(p) => {
                    p.touch(now);
                    (p, None, Rc::clone(&tracked.on_receive))
                }
                None => {
                    let p = Rc::new(UdpPeer::new_tracked(
                        peer_id,
                        endpoint,
                        now,
                        Weak::clone(&self.self_weak),
                    ));
                    tracked.active.borrow_mut().insert(peer_id, Rc::clone(&p));
                    tracked.backlog.add_item(Rc::clone(&p));
                    (p, tracked.on_new_peer.clone(), Rc::clone(&tracked.on_receive))
                }
            }
        };

        if let Some(cb) = on_new_peer {
            (cb.borrow_mut())(&self.reactor, &peer);
        }
        (on_receive.borrow_mut())(&self.reactor, &peer, &chunk);
    }

    pub(crate) fn send_to(
        self: &Rc<Self>,
        endpoint: Endpoint,
        data: Vec<u8>,
        on_end_send: Option<Box<dyn FnOnce(&Reactor, Error)>>,
    ) -> Result<(), Error> {
        let addr = std::net::SocketAddr::try_from(endpoint)
            .map_err(|_| Error::new(StatusCode::InvalidArgument))?;
        if self.socket.borrow().is_none() {
            return Err(Error::new(StatusCode::NotConnected));
        }
        self.outgoing.borrow_mut().push_back(PendingDatagram {
            addr,
            data,
            on_end_send,
        });
        self.flush_outgoing();
        Ok(())
    }

    fn flush_outgoing(self: &Rc<Self>) {
        loop {
            let mut outgoing = self.outgoing.borrow_mut();
            if outgoing.front().is_none() {
                return;
            }
            let socket_ref = self.socket.borrow();
            let socket = match socket_ref.as_ref() {
                Some(s) => s,
                None => return,
            };
            let front = outgoing.front().unwrap();
            match socket.send_to(&front.data, front.addr) {
                Ok(_) => {
                    drop(socket_ref);
                    let done = outgoing.pop_front().unwrap();
                    drop(outgoing);
                    if let Some(cb) = done.on_end_send {
                        let reactor = self.reactor.clone();
                        reactor.schedule_callback(move |r| cb(r, Error::OK));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(socket_ref);
                    let done = outgoing.pop_front().unwrap();
                    drop(outgoing);
                    if let Some(cb) = done.on_end_send {
                        let reactor = self.reactor.clone();
                        let err = Error::from(e);
                        reactor.schedule_callback(move |r| cb(r, err));
                    }
                }
            }
        }
    }

    fn do_reads(self: &Rc<Self>) {
        loop {
            let buf = self
                .read_pool
                .borrow_mut()
                .take_or_allocate(DEFAULT_RECEIVE_BUFFER_SIZE);
            let result = {
                let socket_ref = self.socket.borrow();
                let socket = match socket_ref.as_ref() {
                    Some(s) => s,
                    None => return,
                };
                let mut borrowed = buf.borrow_mut();
                socket.recv_from(&mut borrowed[..])
            };
            match result {
                Ok((n, addr)) => {
                    self.handle_datagram(addr, Rc::clone(&buf), n);
                    self.read_pool.borrow_mut().reclaim(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }

    fn teardown(&self) {
        if let Some(token) = self.token.take() {
            if let Some(mut socket) = self.socket.borrow_mut().take() {
                let _ = self.reactor.registry().deregister(&mut socket);
            }
            self.reactor.deregister_io_handler(token);
        }
        if let Some(t) = self.tracked.borrow().as_ref() {
            t.backlog.stop();
        }
        *self.transient.borrow_mut() = None;
        *self.tracked.borrow_mut() = None;
        self.outgoing.borrow_mut().clear();
    }
}

impl IoHandler for ServerInner {
    fn on_ready(&self, _reactor: &Reactor, readiness: Readiness) {
        let this = match self.self_weak.upgrade() {
            Some(rc) => rc,
            None => return,
        };
        if readiness.readable {
            this.do_reads();
        }
        if readiness.writable {
            this.flush_outgoing();
        }
    }
}

impl Removable for UdpServer {
    fn schedule_removal(&self) {
        self.close(None::<fn(&Reactor)>);
        self.inner.removal.schedule(&self.inner.reactor, || {});
    }

    fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>) {
        self.inner.removal.set_on_schedule_removal(f);
    }

    fn is_removal_scheduled(&self) -> bool {
        self.inner.removal.is_scheduled()
    }
}
