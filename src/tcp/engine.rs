//! The read/write state machine shared by `TcpClient` and
//! `TcpConnectedClient`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::rc::{Rc, Weak};

use mio::net::TcpStream;
use mio::Token;

use crate::buffer::{BufferPool, DataChunk};
use crate::endpoint::Endpoint;
use crate::error::{Error, StatusCode};
use crate::reactor::{IoHandler, Readiness, Reactor};
use crate::removable::{Removable, RemovalState};

pub(crate) const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

struct PendingWrite {
    data: Vec<u8>,
    offset: usize,
    on_end_send: Option<Box<dyn FnOnce(&Reactor, Error)>>,
}

/// Owns the `mio::net::TcpStream`, its registration, and the send queue.
/// Implements `IoHandler` so it can be registered with the reactor directly;
/// `TcpClient`/`TcpConnectedClient` are thin handles around an `Rc<Self>`.
///
/// `self_weak` is set once at construction via `Rc::new_cyclic` so internal
/// paths that need an owned `Rc<Self>` (registering with the reactor,
/// extending lifetime into a deferred callback) can recover one from `&self`
/// without unsafe code.
pub(crate) struct StreamEngine {
    self_weak: Weak<StreamEngine>,
    reactor: Reactor,
    stream: RefCell<Option<TcpStream>>,
    token: Cell<Option<Token>>,
    state: Cell<StreamState>,
    read_pool: RefCell<BufferPool>,
    bytes_received: Cell<u64>,
    outgoing: RefCell<VecDeque<PendingWrite>>,
    pending_send_requests: Cell<usize>,
    removal: Rc<RemovalState>,

    on_connect: RefCell<Option<Box<dyn FnOnce(&Reactor, Error)>>>,
    on_receive: RefCell<Option<Box<dyn FnMut(&Reactor, &DataChunk)>>>,
    on_close: RefCell<Option<Box<dyn FnOnce(&Reactor, Error)>>>,
    closed_reported: Cell<bool>,
}

impl StreamEngine {
    pub fn new(reactor: &Reactor) -> Rc<StreamEngine> {
        Rc::new_cyclic(|weak| StreamEngine {
            self_weak: weak.clone(),
            reactor: reactor.clone(),
            stream: RefCell::new(None),
            token: Cell::new(None),
            state: Cell::new(StreamState::Idle),
            read_pool: RefCell::new(BufferPool::new()),
            bytes_received: Cell::new(0),
            outgoing: RefCell::new(VecDeque::new()),
            pending_send_requests: Cell::new(0),
            removal: Rc::new(RemovalState::new()),
            on_connect: RefCell::new(None),
            on_receive: RefCell::new(None),
            on_close: RefCell::new(None),
            closed_reported: Cell::new(false),
        })
    }

    /// Recovers an owned `Rc<Self>`. Always succeeds: every `StreamEngine`
    /// is created through `Rc::new_cyclic` and only dropped when its last
    /// strong reference (held by its owning `TcpClient`/`TcpConnectedClient`
    /// or a deferred callback) goes away, never while `&self` is reachable.
    fn rc(&self) -> Rc<StreamEngine> {
        self.self_weak
            .upgrade()
            .expect("StreamEngine outlives its own Rc")
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn set_on_connect(&self, f: impl FnOnce(&Reactor, Error) + 'static) {
        *self.on_connect.borrow_mut() = Some(Box::new(f));
    }

    pub fn set_on_receive(&self, f: impl FnMut(&Reactor, &DataChunk) + 'static) {
        *self.on_receive.borrow_mut() = Some(Box::new(f));
    }

    pub fn set_on_close(&self, f: impl FnOnce(&Reactor, Error) + 'static) {
        *self.on_close.borrow_mut() = Some(Box::new(f));
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state.get() == StreamState::Open
    }

    pub fn pending_send_requests(&self) -> usize {
        self.pending_send_requests.get()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.stream
            .borrow()
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
            .map(Endpoint::from)
            .unwrap_or(Endpoint::Undefined)
    }

    /// Begins a non-blocking connect. Registers immediately; completion is
    /// detected on the first writable readiness via `take_error`.
    pub fn connect(&self, endpoint: Endpoint) -> Result<(), Error> {
        if endpoint.is_undefined() {
            return Err(Error::new(StatusCode::InvalidArgument));
        }
        let addr = std::net::SocketAddr::try_from(endpoint)
            .map_err(|_| Error::new(StatusCode::InvalidArgument))?;

        self.teardown_stream();

        let stream = match TcpStream::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                let err = Error::from(e);
                self.deliver_connect_result(err.clone());
                return Err(err);
            }
        };
        if let Err(e) = self.register(stream, StreamState::Connecting) {
            self.deliver_connect_result(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Fires `on_connect` (if set) on the next loop cycle, never
    /// synchronously from inside `connect` itself, so callers always see
    /// `on_connect` run after `connect` returns regardless of which path
    /// (immediate OS failure vs. async completion in `on_ready`) produced
    /// the result.
    fn deliver_connect_result(&self, err: Error) {
        if let Some(cb) = self.on_connect.borrow_mut().take() {
            let reactor = self.reactor.clone();
            reactor.schedule_callback(move |r| cb(r, err));
        }
    }

    /// Adopts an already-connected stream (accept path): starts at `Open`
    /// and begins reading immediately.
    pub fn adopt(&self, stream: TcpStream) -> Result<(), Error> {
        self.register(stream, StreamState::Open)
    }

    fn register(&self, mut stream: TcpStream, state: StreamState) -> Result<(), Error> {
        let handler: Rc<dyn IoHandler> = self.rc();
        let token = self.reactor.register_io_handler(handler);
        self.reactor
            .registry()
            .register(&mut stream, token, Reactor::interest_rw())
            .map_err(Error::from)?;
        self.token.set(Some(token));
        *self.stream.borrow_mut() = Some(stream);
        self.state.set(state);
        Ok(())
    }

    fn teardown_stream(&self) {
        if let Some(token) = self.token.take() {
            if let Some(mut stream) = self.stream.borrow_mut().take() {
                let _ = self.reactor.registry().deregister(&mut stream);
            }
            self.reactor.deregister_io_handler(token);
        }
        self.outgoing.borrow_mut().clear();
        self.pending_send_requests.set(0);
    }

    pub fn send_data(&self, data: Vec<u8>, on_end_send: Option<Box<dyn FnOnce(&Reactor, Error)>>) -> Result<(), Error> {
        if self.state.get() != StreamState::Open {
            return Err(Error::new(StatusCode::NotConnected));
        }
        if data.is_empty() {
            return Err(Error::new(StatusCode::InvalidArgument));
        }
        self.pending_send_requests.set(self.pending_send_requests.get() + 1);
        self.outgoing.borrow_mut().push_back(PendingWrite {
            data,
            offset: 0,
            on_end_send,
        });
        self.flush_outgoing();
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(stream) = self.stream.borrow().as_ref() {
            let _ = stream.shutdown(Shutdown::Write);
        }
        self.state.set(StreamState::Closing);
    }

    pub fn close(&self) {
        self.finish(Error::OK);
    }

    #[cfg(unix)]
    pub fn close_with_reset(&self) {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        if let Some(stream) = self.stream.borrow().as_ref() {
            let fd = stream.as_raw_fd();
            // `mio::net::TcpStream` has no `set_linger`; borrow the fd into a
            // `socket2::Socket` just long enough to set SO_LINGER(on, 0),
            // then forget it so the stream keeps ownership of the fd.
            let borrowed = unsafe { socket2::Socket::from_raw_fd(fd) };
            let _ = borrowed.set_linger(Some(std::time::Duration::from_secs(0)));
            std::mem::forget(borrowed);
        }
        self.finish(Error::OK);
    }

    #[cfg(not(unix))]
    pub fn close_with_reset(&self) {
        self.finish(Error::OK);
    }

    pub fn set_delay_send(&self, delay: bool) {
        if let Some(stream) = self.stream.borrow().as_ref() {
            let _ = stream.set_nodelay(!delay);
        }
    }

    fn finish(&self, err: Error) {
        if self.state.get() == StreamState::Closed {
            return;
        }
        self.state.set(StreamState::Closed);
        self.teardown_stream();
        if !self.closed_reported.replace(true) {
            if let Some(cb) = self.on_close.borrow_mut().take() {
                let reactor = self.reactor.clone();
                // Keeps the engine alive until the callback actually runs,
                // even if the owning `TcpClient`/`TcpConnectedClient` handle
                // is dropped first.
                let this = self.rc();
                reactor.schedule_callback(move |r| {
                    cb(r, err);
                    let _ = this;
                });
            }
        }
        self.removal.schedule(&self.reactor, || {});
    }

    fn flush_outgoing(&self) {
        loop {
            let mut outgoing = self.outgoing.borrow_mut();
            let front = match outgoing.front_mut() {
                Some(w) => w,
                None => return,
            };
            let stream_ref = self.stream.borrow();
            let stream = match stream_ref.as_ref() {
                Some(s) => s,
                None => return,
            };
            // `front` borrows from `outgoing`, `stream` from `stream_ref`;
            // both released together at the end of the loop iteration, so
            // no aliasing across iterations.
            match write_nonblocking(stream, &front.data[front.offset..]) {
                Ok(n) => {
                    front.offset += n;
                    if front.offset >= front.data.len() {
                        let done = outgoing.pop_front().unwrap();
                        drop(stream_ref);
                        drop(outgoing);
                        self.pending_send_requests.set(self.pending_send_requests.get().saturating_sub(1));
                        if let Some(cb) = done.on_end_send {
                            let reactor = self.reactor.clone();
                            reactor.schedule_callback(move |r| cb(r, Error::OK));
                        }
                        continue;
                    }
                    return;
                }
                Err(WriteOutcome::WouldBlock) => return,
                Err(WriteOutcome::Fatal(e)) => {
                    drop(stream_ref);
                    drop(outgoing);
                    self.finish(e);
                    return;
                }
            }
        }
    }

    fn do_reads(&self) {
        loop {
            let buf = self.read_pool.borrow_mut().take_or_allocate(DEFAULT_RECEIVE_BUFFER_SIZE);
            let n = {
                let mut stream_ref = self.stream.borrow_mut();
                let stream = match stream_ref.as_mut() {
                    Some(s) => s,
                    None => return,
                };
                let mut borrowed = buf.borrow_mut();
                stream.read(&mut borrowed[..])
            };
            match n {
                Ok(0) => {
                    self.read_pool.borrow_mut().reclaim(buf);
                    self.on_eof();
                    return;
                }
                Ok(n) => {
                    let offset = self.bytes_received.get();
                    self.bytes_received.set(offset + n as u64);
                    let chunk = DataChunk::new(Rc::clone(&buf), n, offset);
                    if let Ok(mut cb) = self.on_receive.try_borrow_mut() {
                        if let Some(cb) = cb.as_mut() {
                            cb(&self.reactor, &chunk);
                        }
                    }
                    drop(chunk);
                    self.read_pool.borrow_mut().reclaim(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finish(Error::from(e));
                    return;
                }
            }
        }
    }

    /// Forces the closed state with an explicit `err`, bypassing the
    /// `Ok`-only public `close`/`close_with_reset`. Used by `TcpServer` for
    /// the immediate-RST accept edge case.
    pub(crate) fn force_finish(&self, err: Error) {
        self.finish(err);
    }

    fn on_eof(&self) {
        #[cfg(target_os = "linux")]
        {
            if let Some(stream) = self.stream.borrow().as_ref() {
                if let Ok(Some(err)) = stream.take_error() {
                    if err.kind() == io::ErrorKind::ConnectionReset {
                        self.finish(Error::new(StatusCode::ConnectionResetByPeer));
                        return;
                    }
                }
            }
        }
        self.finish(Error::OK);
    }
}

enum WriteOutcome {
    WouldBlock,
    Fatal(Error),
}

fn write_nonblocking(stream: &TcpStream, buf: &[u8]) -> Result<usize, WriteOutcome> {
    match stream.write(buf) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(WriteOutcome::WouldBlock),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(WriteOutcome::Fatal(Error::from(e))),
    }
}

impl IoHandler for StreamEngine {
    fn on_ready(&self, _reactor: &Reactor, readiness: Readiness) {
        if self.state.get() == StreamState::Connecting && (readiness.writable || readiness.error) {
            let failed = self
                .stream
                .borrow()
                .as_ref()
                .and_then(|s| s.take_error().ok().flatten());
            match failed {
                Some(e) => {
                    let err = Error::from(e);
                    self.deliver_connect_result(err.clone());
                    self.finish(err);
                    return;
                }
                None => {
                    self.state.set(StreamState::Open);
                    self.deliver_connect_result(Error::OK);
                }
            }
        }

        if readiness.readable
            && matches!(self.state.get(), StreamState::Open | StreamState::Closing)
        {
            self.do_reads();
        }
        if self.state.get() == StreamState::Closed {
            return;
        }
        if readiness.writable {
            self.flush_outgoing();
        }
    }
}

impl Removable for StreamEngine {
    fn schedule_removal(&self) {
        // `finish` already performs the effective teardown (deregistering
        // from the reactor, dropping the stream); `Removable` here only
        // exists so owners (`TcpServer`) can treat connected clients
        // uniformly with other handle types.
        self.finish(Error::OK);
    }

    fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>) {
        self.removal.set_on_schedule_removal(f);
    }

    fn is_removal_scheduled(&self) -> bool {
        self.removal.is_scheduled()
    }
}
