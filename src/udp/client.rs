//! `UdpClient`: a bound UDP socket with a single memorized destination.
//!
//! Unlike `UdpServer`, a client tracks exactly one destination, so a full
//! `BacklogWithTimeout` (built for many tracked items sharing log2-bucketed
//! timers) would be pure overhead here; inactivity is tracked with a single
//! `Timer` that is simply restarted every time a packet is sent or received.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::net::UdpSocket;
use mio::Token;

use crate::buffer::{BufferPool, DataChunk};
use crate::endpoint::Endpoint;
use crate::error::{Error, StatusCode};
use crate::global;
use crate::reactor::{IoHandler, Readiness, Reactor, Timer};
use crate::removable::{Removable, RemovalState};

struct PendingDatagram {
    data: Vec<u8>,
    on_end_send: Option<Box<dyn FnOnce(&Reactor, Error)>>,
}

struct ClientInner {
    self_weak: Weak<ClientInner>,
    reactor: Reactor,
    socket: RefCell<Option<UdpSocket>>,
    token: Cell<Option<Token>>,
    local_endpoint: Cell<Endpoint>,
    destination: Cell<Endpoint>,
    read_pool: RefCell<BufferPool>,
    outgoing: RefCell<VecDeque<PendingDatagram>>,
    on_receive: RefCell<Option<Box<dyn FnMut(&Reactor, &DataChunk)>>>,
    on_close: RefCell<Option<Box<dyn FnOnce(&Reactor, Error)>>>,
    inactivity_timer: Timer,
    inactivity_timeout_ms: Cell<Option<u64>>,
    removal: Rc<RemovalState>,
}

/// A bound UDP socket that sends to (and, optionally, receives from) a
/// single memorized destination.
pub struct UdpClient {
    inner: Rc<ClientInner>,
}

impl UdpClient {
    pub fn new(reactor: &Reactor) -> UdpClient {
        let inner = Rc::new_cyclic(|weak| ClientInner {
            self_weak: weak.clone(),
            reactor: reactor.clone(),
            socket: RefCell::new(None),
            token: Cell::new(None),
            local_endpoint: Cell::new(Endpoint::Undefined),
            destination: Cell::new(Endpoint::Undefined),
            read_pool: RefCell::new(BufferPool::new()),
            outgoing: RefCell::new(VecDeque::new()),
            on_receive: RefCell::new(None),
            on_close: RefCell::new(None),
            inactivity_timer: Timer::new(reactor),
            inactivity_timeout_ms: Cell::new(None),
            removal: Rc::new(RemovalState::new()),
        });
        UdpClient { inner }
    }

    /// Memorizes `endpoint` as the destination for `send_data`, and (if
    /// `on_receive` is given) starts listening for replies from it.
    /// `timeout_ms`, if set, restarts an inactivity timer on every send or
    /// receive; `on_close` fires if it elapses.
    #[allow(clippy::too_many_arguments)]
    pub fn set_destination(
        &self,
        endpoint: Endpoint,
        on_set: impl FnOnce(&Reactor, Error) + 'static,
        on_receive: Option<impl FnMut(&Reactor, &DataChunk) + 'static>,
        timeout_ms: Option<u64>,
        on_close: Option<impl FnOnce(&Reactor, Error) + 'static>,
    ) -> Result<(), Error> {
        if endpoint.is_undefined() {
            let err = Error::new(StatusCode::InvalidArgument);
            self.inner.reactor.schedule_callback(move |r| on_set(r, err));
            return Err(Error::new(StatusCode::InvalidArgument));
        }

        let prior = self.inner.destination.get();
        if !prior.is_undefined() && prior.is_ipv4() != endpoint.is_ipv4() {
            let err = Error::new(StatusCode::AddressFamilyNotSupported);
            self.inner.reactor.schedule_callback(move |r| on_set(r, err));
            return Err(Error::new(StatusCode::AddressFamilyNotSupported));
        }

        if self.inner.socket.borrow().is_none() {
            if let Err(e) = self.ensure_bound(endpoint) {
                self.inner.reactor.schedule_callback(move |r| on_set(r, e.clone()));
                return Err(e);
            }
        }

        self.inner.destination.set(endpoint);
        if let Some(cb) = on_receive {
            *self.inner.on_receive.borrow_mut() = Some(Box::new(cb));
        }
        *self.inner.on_close.borrow_mut() =
            on_close.map(|f| Box::new(f) as Box<dyn FnOnce(&Reactor, Error)>);
        self.inner.inactivity_timeout_ms.set(timeout_ms);
        self.arm_inactivity_timer();

        let reactor = self.inner.reactor.clone();
        reactor.schedule_callback(move |r| on_set(r, Error::OK));
        Ok(())
    }

    fn ensure_bound(&self, destination: Endpoint) -> Result<(), Error> {
        let any: std::net::SocketAddr = if destination.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let mut socket = UdpSocket::bind(any).map_err(Error::from)?;

        let handler: Rc<dyn IoHandler> = Rc::clone(&self.inner) as Rc<dyn IoHandler>;
        let token = self.inner.reactor.register_io_handler(handler);
        self.inner
            .reactor
            .registry()
            .register(&mut socket, token, Reactor::interest_rw())
            .map_err(Error::from)?;

        self.inner
            .local_endpoint
            .set(socket.local_addr().map(Endpoint::from).unwrap_or(Endpoint::Undefined));
        self.inner.token.set(Some(token));
        *self.inner.socket.borrow_mut() = Some(socket);
        Ok(())
    }

    fn arm_inactivity_timer(&self) {
        let timeout_ms = match self.inner.inactivity_timeout_ms.get() {
            Some(t) if t > 0 => t,
            _ => {
                self.inner.inactivity_timer.stop();
                return;
            }
        };
        let self_weak = self.inner.self_weak.clone();
        self.inner
            .inactivity_timer
            .start(Duration::from_millis(timeout_ms), None, move |r| {
                if let Some(inner) = self_weak.upgrade() {
                    inner.fire_inactivity_timeout(r);
                }
            })
            .expect("starting the inactivity timer cannot fail");
    }

    pub fn send_data(
        &self,
        data: Vec<u8>,
        on_end_send: Option<impl FnOnce(&Reactor, Error) + 'static>,
    ) -> Result<(), Error> {
        if self.inner.destination.get().is_undefined() {
            return Err(Error::new(StatusCode::DestinationAddressRequired));
        }
        self.arm_inactivity_timer();
        self.inner.outgoing.borrow_mut().push_back(PendingDatagram {
            data,
            on_end_send: on_end_send.map(|f| Box::new(f) as Box<dyn FnOnce(&Reactor, Error)>),
        });
        self.inner.flush_outgoing();
        Ok(())
    }

    pub fn bound_port(&self) -> u16 {
        self.inner.local_endpoint.get().port()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.destination.get()
    }

    pub fn is_open(&self) -> bool {
        self.inner.socket.borrow().is_some()
    }

    pub fn set_receive_buffer_size(&self, size: usize) -> Result<(), Error> {
        let size = size.clamp(global::min_receive_buffer_size(), global::max_receive_buffer_size());
        let socket_ref = self.inner.socket.borrow();
        match socket_ref.as_ref() {
            Some(s) => set_recv_buffer_size(s, size).map_err(Error::from),
            None => Err(Error::new(StatusCode::NotOpen)),
        }
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), Error> {
        let size = size.clamp(global::min_send_buffer_size(), global::max_send_buffer_size());
        let socket_ref = self.inner.socket.borrow();
        match socket_ref.as_ref() {
            Some(s) => set_send_buffer_size(s, size).map_err(Error::from),
            None => Err(Error::new(StatusCode::NotOpen)),
        }
    }

    pub fn close(&self) {
        self.inner.teardown(Error::OK);
    }
}

impl ClientInner {
    fn fire_inactivity_timeout(self: &Rc<Self>, _reactor: &Reactor) {
        self.teardown(Error::new(StatusCode::TimedOut));
    }

    fn flush_outgoing(self: &Rc<Self>) {
        loop {
            let mut outgoing = self.outgoing.borrow_mut();
            if outgoing.front().is_none() {
                return;
            }
            let dest = match std::net::SocketAddr::try_from(self.destination.get()) {
                Ok(addr) => addr,
                Err(_) => return,
            };
            let socket_ref = self.socket.borrow();
            let socket = match socket_ref.as_ref() {
                Some(s) => s,
                None => return,
            };
            let front = outgoing.front().unwrap();
            match socket.send_to(&front.data, dest) {
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
            let buf = self.read_pool.borrow_mut().take_or_allocate(64 * 1024);
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
                    // Only packets from the memorized destination count;
                    // anything else is silently dropped.
                    if Endpoint::from(addr) == self.destination.get() {
                        self.arm_inactivity_timer_inline();
                        let chunk = DataChunk::new(Rc::clone(&buf), n, 0);
                        if let Some(cb) = self.on_receive.borrow_mut().as_mut() {
                            cb(&self.reactor, &chunk);
                        }
                    }
                    self.read_pool.borrow_mut().reclaim(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }

    fn arm_inactivity_timer_inline(self: &Rc<Self>) {
        let timeout_ms = match self.inactivity_timeout_ms.get() {
            Some(t) if t > 0 => t,
            _ => return,
        };
        let self_weak = self.self_weak.clone();
        self.inactivity_timer
            .start(Duration::from_millis(timeout_ms), None, move |r| {
                if let Some(inner) = self_weak.upgrade() {
                    inner.fire_inactivity_timeout(r);
                }
            })
            .expect("restarting the inactivity timer cannot fail");
    }

    fn teardown(self: &Rc<Self>, err: Error) {
        self.inactivity_timer.stop();
        if let Some(token) = self.token.take() {
            if let Some(mut socket) = self.socket.borrow_mut().take() {
                let _ = self.reactor.registry().deregister(&mut socket);
            }
            self.reactor.deregister_io_handler(token);
        }
        if let Some(cb) = self.on_close.borrow_mut().take() {
            let reactor = self.reactor.clone();
            reactor.schedule_callback(move |r| cb(r, err));
        }
    }
}

impl IoHandler for ClientInner {
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

/// `mio::net::UdpSocket` doesn't expose `SO_RCVBUF`/`SO_SNDBUF` setters
/// directly; borrow the fd as a `socket2::Socket` just long enough to call
/// them, then hand it back without closing it.
#[cfg(unix)]
fn set_recv_buffer_size(socket: &UdpSocket, size: usize) -> io::Result<()> {
    use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
    let borrowed = unsafe { socket2::Socket::from_raw_fd(socket.as_raw_fd()) };
    let result = borrowed.set_recv_buffer_size(size);
    let _ = borrowed.into_raw_fd();
    result
}

#[cfg(unix)]
fn set_send_buffer_size(socket: &UdpSocket, size: usize) -> io::Result<()> {
    use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
    let borrowed = unsafe { socket2::Socket::from_raw_fd(socket.as_raw_fd()) };
    let result = borrowed.set_send_buffer_size(size);
    let _ = borrowed.into_raw_fd();
    result
}

impl Removable for UdpClient {
    fn schedule_removal(&self) {
        self.close();
        self.inner.removal.schedule(&self.inner.reactor, || {});
    }

    fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>) {
        self.inner.removal.set_on_schedule_removal(f);
    }

    fn is_removal_scheduled(&self) -> bool {
        self.inner.removal.is_scheduled()
    }
}
