//! POSIX self-pipe signal delivery.
//!
//! A signal handler may only call async-signal-safe functions, so the actual
//! `extern "C"` handler does nothing but `write(2)` the signal number as one
//! byte into every registered reactor's pipe. Each reactor reads its own
//! `mio::unix::pipe::Receiver` on the loop thread and only then looks up
//! which of its own registered handlers match — installing the OS handler
//! and waking a loop are decoupled from deciding who cares.

#[cfg(unix)]
mod imp {
    use std::collections::HashSet;
    use std::io::Read;
    use std::os::unix::io::AsRawFd;
    use std::rc::Rc;
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::{Mutex, OnceLock};

    use mio::Interest;
    use mio::unix::pipe;
    use slab::Slab;

    use crate::error::{Error, StatusCode};
    use crate::reactor::Reactor;

    const MAX_REACTORS: usize = 256;

    static PIPE_FD: [AtomicI32; MAX_REACTORS] = [const { AtomicI32::new(-1) }; MAX_REACTORS];

    fn installed_signals() -> &'static Mutex<HashSet<i32>> {
        static INSTALLED: OnceLock<Mutex<HashSet<i32>>> = OnceLock::new();
        INSTALLED.get_or_init(|| Mutex::new(HashSet::new()))
    }

    /// The actual signal handler. Async-signal-safe: only touches atomics
    /// and calls `write(2)`, per `signal-safety(7)`.
    extern "C" fn relay(signum: libc::c_int) {
        let byte = signum as u8;
        for slot in &PIPE_FD {
            let fd = slot.load(Ordering::Relaxed);
            if fd >= 0 {
                unsafe {
                    libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
                }
            }
        }
    }

    fn install_handler(sig: i32) -> Result<(), Error> {
        let mut installed = installed_signals().lock().unwrap();
        if installed.contains(&sig) {
            return Ok(());
        }
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = relay as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(Error::from(std::io::Error::last_os_error()));
            }
        }
        installed.insert(sig);
        Ok(())
    }

    fn reserve_slot(fd: i32) -> Result<usize, Error> {
        for (i, slot) in PIPE_FD.iter().enumerate() {
            if slot.compare_exchange(-1, fd, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                return Ok(i);
            }
        }
        Err(Error::new(StatusCode::NoBufferSpaceAvailable))
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SignalHandlerId(usize);

    struct SignalEntry {
        signum: i32,
        repeat: bool,
        callback: Rc<RefCell<Box<dyn FnMut(&Reactor)>>>,
    }

    struct PipeState {
        // Kept alive so the fd stays open; the reactor never writes through
        // it directly, only `relay` does, via the raw fd in `PIPE_FD`.
        #[allow(dead_code)]
        sender: pipe::Sender,
        receiver: pipe::Receiver,
        slot: usize,
    }

    impl Drop for PipeState {
        fn drop(&mut self) {
            PIPE_FD[self.slot].store(-1, Ordering::SeqCst);
        }
    }

    pub(crate) struct SignalTable {
        entries: Slab<SignalEntry>,
        pipe: Option<PipeState>,
    }

    impl SignalTable {
        pub fn new() -> SignalTable {
            SignalTable {
                entries: Slab::new(),
                pipe: None,
            }
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        pub fn add(
            &mut self,
            sig: i32,
            repeat: bool,
            callback: Box<dyn FnMut(&Reactor)>,
        ) -> SignalHandlerId {
            let key = self.entries.insert(SignalEntry {
                signum: sig,
                repeat,
                callback: Rc::new(RefCell::new(callback)),
            });
            SignalHandlerId(key)
        }

        pub fn remove(&mut self, id: SignalHandlerId) {
            if self.entries.contains(id.0) {
                self.entries.remove(id.0);
            }
        }
    }

    /// Lazily creates this reactor's self-pipe, registers its read end with
    /// the reactor's `Poll`, and installs the OS handler for `sig` if it
    /// hasn't already been installed process-wide.
    pub(crate) fn ensure_pipe_registered(reactor: &Reactor, sig: i32) -> Result<(), Error> {
        install_handler(sig)?;

        let mut signals = reactor.0.signals.borrow_mut();
        if signals.pipe.is_some() {
            return Ok(());
        }

        let (sender, mut receiver) = pipe::new().map_err(Error::from)?;
        let sender_fd = sender.as_raw_fd();
        let slot = reserve_slot(sender_fd)?;

        drop(signals);
        reactor
            .registry()
            .register(&mut receiver, Reactor::signal_token(), Interest::READABLE)
            .map_err(Error::from)?;
        signals = reactor.0.signals.borrow_mut();

        signals.pipe = Some(PipeState {
            sender,
            receiver,
            slot,
        });
        Ok(())
    }

    pub(crate) fn drain_pipe(reactor: &Reactor) {
        let mut buf = [0u8; 64];
        loop {
            let mut signals = reactor.0.signals.borrow_mut();
            let n = match signals.pipe.as_mut() {
                Some(p) => match p.receiver.read(&mut buf) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                },
                None => return,
            };
            drop(signals);
            if n == 0 {
                break;
            }
            for &byte in &buf[..n] {
                dispatch_one(reactor, byte as i32);
            }
        }
    }

    fn dispatch_one(reactor: &Reactor, signum: i32) {
        let matches: Vec<(usize, Rc<RefCell<Box<dyn FnMut(&Reactor)>>>, bool)> = {
            let signals = reactor.0.signals.borrow();
            signals
                .entries
                .iter()
                .filter(|(_, e)| e.signum == signum)
                .map(|(k, e)| (k, Rc::clone(&e.callback), e.repeat))
                .collect()
        };
        for (key, callback, repeat) in matches {
            if let Ok(mut cb) = callback.try_borrow_mut() {
                cb(reactor);
            }
            if !repeat {
                reactor.0.signals.borrow_mut().remove(key);
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use crate::error::{Error, StatusCode};
    use crate::reactor::Reactor;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SignalHandlerId(usize);

    pub(crate) struct SignalTable;

    impl SignalTable {
        pub fn new() -> SignalTable {
            SignalTable
        }

        pub fn is_empty(&self) -> bool {
            true
        }

        pub fn add(
            &mut self,
            _sig: i32,
            _repeat: bool,
            _callback: Box<dyn FnMut(&Reactor)>,
        ) -> SignalHandlerId {
            SignalHandlerId(0)
        }

        pub fn remove(&mut self, _id: SignalHandlerId) {}
    }

    pub(crate) fn ensure_pipe_registered(_reactor: &Reactor, _sig: i32) -> Result<(), Error> {
        Err(Error::new(StatusCode::OperationNotSupported))
    }

    pub(crate) fn drain_pipe(_reactor: &Reactor) {}
}

pub use imp::SignalHandlerId;
pub(crate) use imp::{drain_pipe, ensure_pipe_registered, SignalTable};
