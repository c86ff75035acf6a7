//! `fs::File`: a pipelined file reader/writer.
//!
//! Reads are pipelined across a fixed array of read slots, the way libuv's
//! `uv_fs_t` requests pipeline reads behind a `shared_ptr<char>` buffer whose
//! custom deleter both frees the slot and decides whether to keep reading.
//! `Rc` has no custom-deleter hook, so this port polls instead: a slot is
//! considered free again the next time something asks
//! (`Rc::strong_count(&buf) == 1`), and that question gets asked either
//! right after a read completes, or — if the user retained the chunk — once
//! per loop cycle via `schedule_call_on_each_loop_cycle` until it stops
//! being true.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::SystemTime;

use crate::buffer::{DataChunk, SharedBuffer};
use crate::error::{Error, StatusCode};
use crate::reactor::{CycleCallbackId, Reactor};
use crate::removable::{Removable, RemovalState};

/// Number of reads this type is willing to have outstanding (buffers handed
/// to the user but not yet reclaimed) at once. 4 is chosen to line up with
/// this crate's own worker-pool default size.
const READ_BUFS_NUM: usize = 4;
const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Idle,
    Opening,
    Opened,
    Closing,
    Closed,
}

/// Metadata returned by [`File::stat`], trimmed from `std::fs::Metadata` to
/// the fields applications actually read.
#[derive(Debug, Clone)]
pub struct StatData {
    pub size: u64,
    pub is_file: bool,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub readonly: bool,
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

impl From<std::fs::Metadata> for StatData {
    fn from(m: std::fs::Metadata) -> StatData {
        StatData {
            size: m.len(),
            is_file: m.is_file(),
            is_dir: m.is_dir(),
            is_symlink: m.file_type().is_symlink(),
            readonly: m.permissions().readonly(),
            modified: m.modified().ok(),
            accessed: m.accessed().ok(),
            created: m.created().ok(),
        }
    }
}

struct ReadSlot {
    buffer: SharedBuffer,
    in_use: Cell<bool>,
}

fn empty_chunk() -> DataChunk {
    DataChunk::new(Rc::new(RefCell::new(Vec::new())), 0, 0)
}

struct FileEngine {
    self_weak: Weak<FileEngine>,
    reactor: Reactor,
    path: RefCell<PathBuf>,
    state: Cell<FileState>,
    file: RefCell<Option<std::fs::File>>,
    current_offset: Cell<u64>,
    read_in_progress: Cell<bool>,
    done_read: Cell<bool>,
    need_reschedule_remove: Cell<bool>,
    removal_requested: Cell<bool>,
    stat_in_progress: Cell<bool>,
    slots: Vec<ReadSlot>,
    watcher: RefCell<Option<CycleCallbackId>>,
    on_open: RefCell<Option<Box<dyn FnOnce(&Reactor, Error)>>>,
    on_chunk: RefCell<Option<Box<dyn FnMut(&Reactor, &DataChunk, Error)>>>,
    on_end: RefCell<Option<Box<dyn FnOnce(&Reactor)>>>,
    removal: Rc<RemovalState>,
}

impl FileEngine {
    fn new(reactor: &Reactor) -> Rc<FileEngine> {
        let slots = (0..READ_BUFS_NUM)
            .map(|_| ReadSlot {
                buffer: Rc::new(RefCell::new(Vec::new())),
                in_use: Cell::new(false),
            })
            .collect();
        Rc::new_cyclic(|weak| FileEngine {
            self_weak: weak.clone(),
            reactor: reactor.clone(),
            path: RefCell::new(PathBuf::new()),
            state: Cell::new(FileState::Idle),
            file: RefCell::new(None),
            current_offset: Cell::new(0),
            read_in_progress: Cell::new(false),
            done_read: Cell::new(false),
            need_reschedule_remove: Cell::new(false),
            removal_requested: Cell::new(false),
            stat_in_progress: Cell::new(false),
            slots,
            watcher: RefCell::new(None),
            on_open: RefCell::new(None),
            on_chunk: RefCell::new(None),
            on_end: RefCell::new(None),
            removal: Rc::new(RemovalState::new()),
        })
    }

    fn is_open(&self) -> bool {
        self.state.get() == FileState::Opened
    }

    fn has_read_buffers_in_use(&self) -> bool {
        self.slots.iter().any(|s| s.in_use.get())
    }

    fn rc(&self) -> Rc<FileEngine> {
        self.self_weak.upgrade().expect("FileEngine outlives its own callbacks")
    }

    fn ensure_watcher(&self) {
        if self.watcher.borrow().is_some() {
            return;
        }
        self.reactor.start_block_loop_from_exit();
        let weak = self.self_weak.clone();
        let id = self.reactor.schedule_call_on_each_loop_cycle(move |_r| {
            if let Some(this) = weak.upgrade() {
                this.poll_slots();
            }
        });
        *self.watcher.borrow_mut() = Some(id);
    }

    fn stop_watcher(&self) {
        if let Some(id) = self.watcher.borrow_mut().take() {
            self.reactor.stop_call_on_each_loop_cycle(id);
            self.reactor.stop_block_loop_from_exit();
        }
    }

    fn poll_slots(self: Rc<Self>) {
        for slot in &self.slots {
            if slot.in_use.get() && Rc::strong_count(&slot.buffer) == 1 {
                slot.in_use.set(false);
            }
        }

        if self.need_reschedule_remove.get() {
            if !self.has_read_buffers_in_use() {
                self.need_reschedule_remove.set(false);
                self.stop_watcher();
                let this = Rc::clone(&self);
                self.removal.schedule(&self.reactor, move || {
                    let _ = &this;
                });
            }
            return;
        }

        if self.is_open() && !self.done_read.get() {
            self.clone().schedule_read();
        }

        if !self.has_read_buffers_in_use() && !self.read_in_progress.get() {
            self.stop_watcher();
        }
    }

    fn invoke_on_chunk(&self, reactor: &Reactor, chunk: &DataChunk, err: Error) {
        if let Ok(mut cb) = self.on_chunk.try_borrow_mut() {
            if let Some(f) = cb.as_mut() {
                f(reactor, chunk, err);
            }
        }
    }

    fn schedule_read(self: Rc<Self>) {
        if !self.is_open() || self.removal.is_scheduled() || self.read_in_progress.get() {
            return;
        }

        let idx = match self.slots.iter().position(|s| !s.in_use.get()) {
            Some(i) => i,
            None => {
                self.ensure_watcher();
                return;
            }
        };

        let file = match self.file.borrow().as_ref().map(|f| f.try_clone()) {
            Some(Ok(f)) => f,
            Some(Err(e)) => {
                self.invoke_on_chunk(&self.reactor.clone(), &empty_chunk(), Error::from(e));
                return;
            }
            None => return,
        };

        self.slots[idx].in_use.set(true);
        self.read_in_progress.set(true);
        let offset = self.current_offset.get();

        let this = Rc::clone(&self);
        self.reactor.add_work(
            move || -> io::Result<Vec<u8>> {
                let mut buf = vec![0u8; READ_BUF_SIZE];
                let n = file.read_at(&mut buf, offset)?;
                buf.truncate(n);
                Ok(buf)
            },
            move |reactor, result| this.on_read_complete(reactor, idx, offset, result),
        );
    }

    fn on_read_complete(
        self: Rc<Self>,
        reactor: &Reactor,
        idx: usize,
        offset: u64,
        result: Result<io::Result<Vec<u8>>, Error>,
    ) {
        self.read_in_progress.set(false);

        if !self.is_open() {
            self.slots[idx].in_use.set(false);
            return;
        }

        let outcome = match result {
            Ok(inner) => inner.map_err(Error::from),
            Err(e) => Err(e),
        };

        match outcome {
            Err(e) => {
                self.done_read.set(true);
                self.slots[idx].in_use.set(false);
                self.invoke_on_chunk(reactor, &empty_chunk(), e);
            }
            Ok(bytes) if bytes.is_empty() => {
                self.done_read.set(true);
                self.slots[idx].in_use.set(false);
                if let Some(cb) = self.on_end.borrow_mut().take() {
                    cb(reactor);
                }
            }
            Ok(bytes) => {
                let n = bytes.len();
                *self.slots[idx].buffer.borrow_mut() = bytes;
                self.current_offset.set(offset + n as u64);
                {
                    let chunk = DataChunk::new(Rc::clone(&self.slots[idx].buffer), n, offset);
                    self.invoke_on_chunk(reactor, &chunk, Error::OK);
                }
                if Rc::strong_count(&self.slots[idx].buffer) == 1 {
                    self.slots[idx].in_use.set(false);
                } else {
                    self.ensure_watcher();
                }
                if !self.done_read.get() {
                    Rc::clone(&self).schedule_read();
                }
            }
        }

        if !self.has_read_buffers_in_use() && !self.need_reschedule_remove.get() {
            self.stop_watcher();
        }
    }

    fn do_open(self: &Rc<Self>, path: PathBuf, on_open: Box<dyn FnOnce(&Reactor, Error)>) {
        if self.state.get() == FileState::Opening || self.is_open() {
            self.reactor
                .schedule_callback(move |r| on_open(r, Error::new(StatusCode::OperationAlreadyInProgress)));
            return;
        }

        self.state.set(FileState::Opening);
        *self.path.borrow_mut() = path.clone();
        self.current_offset.set(0);
        self.done_read.set(false);
        *self.on_open.borrow_mut() = Some(on_open);

        let this = Rc::clone(self);
        self.reactor.add_work(
            move || -> io::Result<std::fs::File> {
                let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
                if file.metadata()?.is_dir() {
                    return Err(io::Error::new(io::ErrorKind::Other, "is a directory"));
                }
                Ok(file)
            },
            move |reactor, result| this.on_open_complete(reactor, result),
        );
    }

    fn on_open_complete(&self, reactor: &Reactor, result: Result<io::Result<std::fs::File>, Error>) {
        let cb = self.on_open.borrow_mut().take();
        match result {
            Ok(Ok(file)) => {
                *self.file.borrow_mut() = Some(file);
                self.state.set(FileState::Opened);
                if let Some(cb) = cb {
                    cb(reactor, Error::OK);
                }
            }
            Ok(Err(e)) => {
                let code = if e.raw_os_error().is_none() && e.kind() == io::ErrorKind::Other {
                    StatusCode::IllegalOperationOnADirectory
                } else {
                    Error::from(e).code()
                };
                self.state.set(FileState::Closed);
                self.path.borrow_mut().clear();
                if let Some(cb) = cb {
                    cb(reactor, Error::new(code));
                }
            }
            Err(e) => {
                self.state.set(FileState::Closed);
                if let Some(cb) = cb {
                    cb(reactor, e);
                }
            }
        }
    }

    fn do_close(self: &Rc<Self>, on_close: Box<dyn FnOnce(&Reactor, Error)>) {
        if !self.is_open() {
            self.reactor.schedule_callback(move |r| on_close(r, Error::new(StatusCode::FileNotOpen)));
            return;
        }
        if self.state.get() == FileState::Closing {
            on_close(&self.reactor.clone(), Error::new(StatusCode::OperationAlreadyInProgress));
            return;
        }

        self.state.set(FileState::Closing);
        let file = self.file.borrow_mut().take();
        let this = Rc::clone(self);
        self.reactor.add_work(
            move || drop(file),
            move |reactor, result: Result<(), Error>| {
                this.state.set(FileState::Closed);
                this.path.borrow_mut().clear();
                on_close(reactor, result.err().unwrap_or(Error::OK));
            },
        );
    }

    fn do_stat(self: &Rc<Self>, on_stat: Box<dyn FnOnce(&Reactor, Option<StatData>, Error)>) {
        if !self.is_open() {
            self.reactor
                .schedule_callback(move |r| on_stat(r, None, Error::new(StatusCode::FileNotOpen)));
            return;
        }
        if self.stat_in_progress.replace(true) {
            self.reactor
                .schedule_callback(move |r| on_stat(r, None, Error::new(StatusCode::OperationAlreadyInProgress)));
            return;
        }

        let file = match self.file.borrow().as_ref().map(|f| f.try_clone()) {
            Some(Ok(f)) => f,
            Some(Err(e)) => {
                self.stat_in_progress.set(false);
                self.reactor.schedule_callback(move |r| on_stat(r, None, Error::from(e)));
                return;
            }
            None => return,
        };

        let this = Rc::clone(self);
        self.reactor.add_work(
            move || file.metadata(),
            move |reactor, result: Result<io::Result<std::fs::Metadata>, Error>| {
                this.stat_in_progress.set(false);
                match result {
                    Ok(Ok(meta)) => on_stat(reactor, Some(StatData::from(meta)), Error::OK),
                    Ok(Err(e)) => on_stat(reactor, None, Error::from(e)),
                    Err(e) => on_stat(reactor, None, e),
                }
            },
        );
    }

    fn do_read_block(
        self: &Rc<Self>,
        offset: u64,
        size: usize,
        on_chunk: Box<dyn FnOnce(&Reactor, &DataChunk, Error)>,
    ) {
        if !self.is_open() {
            let chunk = empty_chunk();
            self.reactor
                .schedule_callback(move |r| on_chunk(r, &chunk, Error::new(StatusCode::FileNotOpen)));
            return;
        }

        let file = match self.file.borrow().as_ref().map(|f| f.try_clone()) {
            Some(Ok(f)) => f,
            Some(Err(e)) => {
                let chunk = empty_chunk();
                self.reactor.schedule_callback(move |r| on_chunk(r, &chunk, Error::from(e)));
                return;
            }
            None => return,
        };

        self.reactor.add_work(
            move || -> io::Result<Vec<u8>> {
                let mut buf = vec![0u8; size];
                let n = file.read_at(&mut buf, offset)?;
                buf.truncate(n);
                Ok(buf)
            },
            move |reactor, result: Result<io::Result<Vec<u8>>, Error>| match result {
                Ok(Ok(bytes)) => {
                    let n = bytes.len();
                    let chunk = DataChunk::new(Rc::new(RefCell::new(bytes)), n, offset);
                    on_chunk(reactor, &chunk, Error::OK);
                }
                Ok(Err(e)) => on_chunk(reactor, &empty_chunk(), Error::from(e)),
                Err(e) => on_chunk(reactor, &empty_chunk(), e),
            },
        );
    }
}

impl Removable for FileEngine {
    fn schedule_removal(&self) {
        if self.removal_requested.replace(true) {
            return;
        }
        let rc = self.rc();
        if rc.is_open() {
            let rc2 = Rc::clone(&rc);
            rc.do_close(Box::new(move |_r, _e| {
                if rc2.has_read_buffers_in_use() {
                    rc2.need_reschedule_remove.set(true);
                    rc2.ensure_watcher();
                } else {
                    let rc3 = Rc::clone(&rc2);
                    rc2.removal.schedule(&rc2.reactor.clone(), move || {
                        let _ = &rc3;
                    });
                }
            }));
        } else if rc.has_read_buffers_in_use() {
            rc.need_reschedule_remove.set(true);
            rc.ensure_watcher();
        } else {
            rc.removal.schedule(&rc.reactor.clone(), || {});
        }
    }

    fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>) {
        self.removal.set_on_schedule_removal(f);
    }

    fn is_removal_scheduled(&self) -> bool {
        self.removal.is_scheduled()
    }
}

/// A pipelined file reader/writer boundary: `open -> read* -> close`, plus
/// one-shot `read_block`/`stat`.
pub struct File {
    engine: Rc<FileEngine>,
}

impl File {
    pub fn new(reactor: &Reactor) -> File {
        File {
            engine: FileEngine::new(reactor),
        }
    }

    pub fn open(&self, path: impl Into<PathBuf>, on_open: impl FnOnce(&Reactor, Error) + 'static) {
        self.engine.do_open(path.into(), Box::new(on_open));
    }

    /// Reads the file from the start, pipelining up to `READ_BUFS_NUM`
    /// outstanding buffers. `on_chunk` fires for every successful read
    /// (`Error::OK`) or the terminal read error; `on_end` fires once,
    /// exactly at EOF, and is never called after an error.
    pub fn read(
        &self,
        on_chunk: impl FnMut(&Reactor, &DataChunk, Error) + 'static,
        on_end: Option<impl FnOnce(&Reactor) + 'static>,
    ) {
        if !self.engine.is_open() {
            let chunk = empty_chunk();
            let mut on_chunk = on_chunk;
            self.engine.reactor.schedule_callback(move |r| {
                on_chunk(r, &chunk, Error::new(StatusCode::FileNotOpen));
            });
            return;
        }

        *self.engine.on_chunk.borrow_mut() = Some(Box::new(on_chunk));
        *self.engine.on_end.borrow_mut() = on_end.map(|f| Box::new(f) as Box<dyn FnOnce(&Reactor)>);
        self.engine.done_read.set(false);
        Rc::clone(&self.engine).schedule_read();
    }

    pub fn read_block(
        &self,
        offset: u64,
        size: usize,
        on_chunk: impl FnOnce(&Reactor, &DataChunk, Error) + 'static,
    ) {
        self.engine.do_read_block(offset, size, Box::new(on_chunk));
    }

    pub fn stat(&self, on_stat: impl FnOnce(&Reactor, Option<StatData>, Error) + 'static) {
        self.engine.do_stat(Box::new(on_stat));
    }

    pub fn close(&self, on_close: impl FnOnce(&Reactor, Error) + 'static) {
        self.engine.do_close(Box::new(on_close));
    }

    pub fn path(&self) -> PathBuf {
        self.engine.path.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }
}

impl Removable for File {
    fn schedule_removal(&self) {
        Removable::schedule_removal(&*self.engine);
    }

    fn set_on_schedule_removal(&self, f: Box<dyn FnOnce()>) {
        Removable::set_on_schedule_removal(&*self.engine, f);
    }

    fn is_removal_scheduled(&self) -> bool {
        Removable::is_removal_scheduled(&*self.engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::io::Write;

    #[test]
    fn reads_whole_file_in_order() {
        let reactor = Reactor::new().unwrap();
        let dir = std::env::temp_dir().join(format!("nexio-file-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hello.txt");
        std::fs::write(&path, b"hello pipelined world").unwrap();

        let file = File::new(&reactor);
        let collected = Rc::new(StdRefCell::new(Vec::new()));
        let collected2 = Rc::clone(&collected);
        let ended = Rc::new(StdRefCell::new(false));
        let ended2 = Rc::clone(&ended);

        file.open(path.clone(), move |_r, err| {
            assert!(err.is_ok());
        });
        reactor.run().unwrap();

        file.read(
            move |_r, chunk, err| {
                assert!(err.is_ok());
                collected2.borrow_mut().extend_from_slice(&chunk.bytes());
            },
            Some(move |_r: &Reactor| {
                *ended2.borrow_mut() = true;
            }),
        );
        reactor.run().unwrap();

        assert!(*ended.borrow());
        assert_eq!(&*collected.borrow(), b"hello pipelined world");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stat_reports_file_not_open() {
        let reactor = Reactor::new().unwrap();
        let file = File::new(&reactor);
        let got = Rc::new(StdRefCell::new(None));
        let got2 = Rc::clone(&got);
        file.stat(move |_r, data, err| {
            *got2.borrow_mut() = Some((data.is_none(), err.code()));
        });
        reactor.run().unwrap();
        assert_eq!(*got.borrow(), Some((true, StatusCode::FileNotOpen)));
    }

    #[test]
    fn retained_chunk_pauses_then_resumes_reading() {
        let reactor = Reactor::new().unwrap();
        let dir = std::env::temp_dir().join(format!("nexio-file-retain-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("retain.txt");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(&vec![b'x'; READ_BUF_SIZE * 2]).unwrap();
        }

        let file = File::new(&reactor);
        file.open(path.clone(), |_r, err| assert!(err.is_ok()));
        reactor.run().unwrap();

        let retained = Rc::new(StdRefCell::new(Vec::new()));
        let retained2 = Rc::clone(&retained);
        let total = Rc::new(Cell::new(0usize));
        let total2 = Rc::clone(&total);

        file.read(
            move |_r, chunk, err| {
                assert!(err.is_ok());
                total2.set(total2.get() + chunk.size());
                retained2.borrow_mut().push(chunk.retain_buffer());
            },
            None::<fn(&Reactor)>,
        );
        reactor.run().unwrap();

        assert_eq!(total.get(), READ_BUF_SIZE * 2);
        assert!(!retained.borrow().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
