//! `TcpServer`: a listening TCP socket that fans accepted connections out.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use mio::net::TcpListener;
use mio::Token;
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};

use crate::buffer::DataChunk;
use crate::endpoint::Endpoint;
use crate::error::{Error, StatusCode};
use crate::reactor::{IoHandler, Readiness, Reactor};
use crate::removable::{Removable, RemovalState};
use crate::tcp::connected_client::{SharedOnClose, SharedOnReceive, TcpConnectedClient};

pub(crate) const DEFAULT_BACKLOG: i32 = 128;

/// Listening TCP socket that fans accepted connections out as
/// [`TcpConnectedClient`]s, all sharing one `on_receive`/`on_close` pair.
pub struct TcpServer {
    self_weak: Weak<TcpServer>,
    reactor: Reactor,
    listener: RefCell<Option<TcpListener>>,
    token: Cell<Option<Token>>,
    endpoint: Cell<Endpoint>,
    connections: RefCell<Slab<Rc<TcpConnectedClient>>>,
    on_new_conn: RefCell<Option<Box<dyn FnMut(&Reactor, Result<Rc<TcpConnectedClient>, Error>)>>>,
    on_receive: RefCell<Option<SharedOnReceive>>,
    on_close: RefCell<Option<SharedOnClose>>,
    removal: Rc<RemovalState>,
}

impl TcpServer {
    pub fn new(reactor: &Reactor) -> Rc<TcpServer> {
        Rc::new_cyclic(|weak| TcpServer {
            self_weak: weak.clone(),
            reactor: reactor.clone(),
            listener: RefCell::new(None),
            token: Cell::new(None),
            endpoint: Cell::new(Endpoint::Undefined),
            connections: RefCell::new(Slab::new()),
            on_new_conn: RefCell::new(None),
            on_receive: RefCell::new(None),
            on_close: RefCell::new(None),
            removal: Rc::new(RemovalState::new()),
        })
    }

    fn rc(&self) -> Rc<TcpServer> {
        self.self_weak.upgrade().expect("TcpServer outlives its own Rc")
    }

    /// Binds and starts listening. `on_receive` is shared across every
    /// accepted connection; `on_close` is optional and likewise shared.
    pub fn listen(
        &self,
        endpoint: Endpoint,
        on_new_conn: impl FnMut(&Reactor, Result<Rc<TcpConnectedClient>, Error>) + 'static,
        on_receive: impl FnMut(&Reactor, &Rc<TcpConnectedClient>, &DataChunk) + 'static,
        on_close: Option<impl FnMut(&Reactor, &Rc<TcpConnectedClient>, Error) + 'static>,
        backlog: i32,
    ) -> Result<(), Error> {
        if endpoint.is_undefined() {
            return Err(Error::new(StatusCode::InvalidArgument));
        }
        if self.listener.borrow().is_some() {
            return Err(Error::new(StatusCode::ConnectionAlreadyInProgress));
        }
        let addr = std::net::SocketAddr::try_from(endpoint)
            .map_err(|_| Error::new(StatusCode::InvalidArgument))?;

        let std_listener = bind_with_backlog(addr, backlog).map_err(Error::from)?;
        let mut listener = TcpListener::from_std(std_listener);

        let handler: Rc<dyn IoHandler> = self.rc();
        let token = self.reactor.register_io_handler(handler);
        self.reactor
            .registry()
            .register(&mut listener, token, mio::Interest::READABLE)
            .map_err(Error::from)?;

        self.endpoint
            .set(listener.local_addr().map(Endpoint::from).unwrap_or(endpoint));
        self.token.set(Some(token));
        *self.listener.borrow_mut() = Some(listener);
        *self.on_new_conn.borrow_mut() = Some(Box::new(on_new_conn));
        *self.on_receive.borrow_mut() = Some(Rc::new(RefCell::new(on_receive)));
        *self.on_close.borrow_mut() = on_close.map(|f| {
            Rc::new(RefCell::new(f)) as SharedOnClose
        });
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.get()
    }

    pub fn connected_clients_count(&self) -> usize {
        self.connections.borrow().len()
    }

    /// Half-closes every accepted connection, then stops accepting new
    /// ones. `on_done` fires once every connection has settled.
    pub fn shutdown(&self, on_done: Option<impl FnOnce(&Reactor) + 'static>) {
        self.stop_accepting();
        for (_, client) in self.connections.borrow().iter() {
            client.shutdown();
        }
        if let Some(cb) = on_done {
            let reactor = self.reactor.clone();
            reactor.schedule_callback(move |r| cb(r));
        }
    }

    /// Closes every accepted connection and then the listener itself.
    pub fn close(&self, on_done: Option<impl FnOnce(&Reactor) + 'static>) {
        self.stop_accepting();
        let clients: Vec<Rc<TcpConnectedClient>> =
            self.connections.borrow().iter().map(|(_, c)| Rc::clone(c)).collect();
        for client in clients {
            client.close();
        }
        if let Some(cb) = on_done {
            let reactor = self.reactor.clone();
            reactor.schedule_callback(move |r| cb(r));
        }
    }

    fn stop_accepting(&self) {
        if let Some(token) = self.token.take() {
            if let Some(mut listener) = self.listener.borrow_mut().take() {
                let _ = self.reactor.registry().deregister(&mut listener);
            }
            self.reactor.deregister_io_handler(token);
        }
    }

    fn accept_loop(&self) {
        loop {
            let accepted = {
                let listener = self.listener.borrow();
                match listener.as_ref() {
                    Some(l) => l.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok((stream, _addr)) => self.handle_accepted(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.report_new_conn(Err(Error::from(e)));
                    return;
                }
            }
        }
    }

    fn handle_accepted(&self, stream: mio::net::TcpStream) {
        let on_receive = match self.on_receive.borrow().clone() {
            Some(cb) => cb,
            None => return,
        };
        let on_close = self.on_close.borrow().clone().unwrap_or_else(|| {
            Rc::new(RefCell::new(|_: &Reactor, _: &Rc<TcpConnectedClient>, _: Error| {}))
                as SharedOnClose
        });

        match TcpConnectedClient::adopt(&self.reactor, stream, on_receive, on_close) {
            Ok(client) => {
                let key = self.connections.borrow_mut().insert(Rc::clone(&client));
                let server_weak = self.self_weak.clone();
                client.set_on_schedule_removal(Box::new(move || {
                    if let Some(server) = server_weak.upgrade() {
                        if server.connections.borrow().contains(key) {
                            server.connections.borrow_mut().remove(key);
                        }
                    }
                }));

                // Some platforms report `getpeername` failure for a
                // connection that was reset immediately after accept; in
                // that case report a single consistent sequence instead of
                // surfacing the raw lookup error.
                if client.endpoint().is_undefined() {
                    self.report_new_conn(Ok(Rc::clone(&client)));
                    client.force_close(Error::new(StatusCode::ConnectionResetByPeer));
                    return;
                }
                self.report_new_conn(Ok(client));
            }
            Err(e) => self.report_new_conn(Err(e)),
        }
    }

    fn report_new_conn(&self, result: Result<Rc<TcpConnectedClient>, Error>) {
        if let Ok(mut cb) = self.on_new_conn.try_borrow_mut() {
            if let Some(cb) = cb.as_mut() {
                cb(&self.reactor, result);
            }
        }
    }
}

fn bind_with_backlog(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

impl IoHandler for TcpServer {
    fn on_ready(&self, _reactor: &Reactor, readiness: Readiness) {
        if readiness.readable {
            self.accept_loop();
        }
    }
}

impl Removable for TcpServer {
    fn schedule_removal(&self) {
        self.close(None::<fn(&Reactor)>);
        self.removal.schedule(&self.reactor, || {});
    }

    fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>) {
        self.removal.set_on_schedule_removal(f);
    }

    fn is_removal_scheduled(&self) -> bool {
        self.removal.is_scheduled()
    }
}
