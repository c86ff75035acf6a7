//! `fs::Dir` and the free directory functions.
//!
//! libuv's `uv_fs_readdir` streams directory entries one at a time so a slow
//! consumer never holds more than one entry in memory. Rust's standard
//! library has no async single-entry read primitive, only
//! `std::fs::read_dir`'s blocking iterator, so `list` reads the whole
//! directory inside one offloaded `add_work` call and replays the entries
//! on the loop thread instead — a deliberate simplification, noted here
//! rather than hidden.

use std::cell::{Cell, RefCell};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use crate::error::{Error, StatusCode};
use crate::reactor::Reactor;
use crate::removable::{Removable, RemovalState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryEntryType {
    File,
    Dir,
    Link,
    Fifo,
    Socket,
    Char,
    Block,
    Unknown,
}

impl From<std::fs::FileType> for DirectoryEntryType {
    fn from(t: std::fs::FileType) -> DirectoryEntryType {
        use std::os::unix::fs::FileTypeExt;
        if t.is_file() {
            DirectoryEntryType::File
        } else if t.is_dir() {
            DirectoryEntryType::Dir
        } else if t.is_symlink() {
            DirectoryEntryType::Link
        } else if t.is_fifo() {
            DirectoryEntryType::Fifo
        } else if t.is_socket() {
            DirectoryEntryType::Socket
        } else if t.is_char_device() {
            DirectoryEntryType::Char
        } else if t.is_block_device() {
            DirectoryEntryType::Block
        } else {
            DirectoryEntryType::Unknown
        }
    }
}

/// One entry from [`Dir::list`]: the bare file name (not a full path,
/// matching `uv_dirent_t::name`) plus its type.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: PathBuf,
    pub kind: DirectoryEntryType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirState {
    Idle,
    Opening,
    Opened,
    WantClose,
    Closed,
}

struct DirEngine {
    self_weak: Weak<DirEngine>,
    reactor: Reactor,
    path: RefCell<PathBuf>,
    state: Cell<DirState>,
    list_in_progress: Cell<bool>,
    removal: Rc<RemovalState>,
}

impl DirEngine {
    fn new(reactor: &Reactor) -> Rc<DirEngine> {
        Rc::new_cyclic(|weak| DirEngine {
            self_weak: weak.clone(),
            reactor: reactor.clone(),
            path: RefCell::new(PathBuf::new()),
            state: Cell::new(DirState::Idle),
            list_in_progress: Cell::new(false),
            removal: Rc::new(RemovalState::new()),
        })
    }

    fn is_open(&self) -> bool {
        self.state.get() == DirState::Opened
    }

    fn rc(&self) -> Rc<DirEngine> {
        self.self_weak.upgrade().expect("DirEngine outlives its own callbacks")
    }

    fn do_open(self: &Rc<Self>, path: PathBuf, on_open: Box<dyn FnOnce(&Reactor, Error)>) {
        if self.state.get() == DirState::Opening || self.is_open() {
            self.reactor
                .schedule_callback(move |r| on_open(r, Error::new(StatusCode::OperationAlreadyInProgress)));
            return;
        }

        self.state.set(DirState::Opening);
        *self.path.borrow_mut() = path.clone();

        let this = Rc::clone(self);
        let mut on_open = Some(on_open);
        self.reactor.add_work(
            move || -> io::Result<()> {
                let meta = std::fs::metadata(&path)?;
                if !meta.is_dir() {
                    return Err(io::Error::new(io::ErrorKind::Other, "not a directory"));
                }
                Ok(())
            },
            move |reactor, result: Result<io::Result<()>, Error>| {
                let cb = on_open.take().expect("on_open called once");
                match result {
                    Ok(Ok(())) => {
                        this.state.set(DirState::Opened);
                        cb(reactor, Error::OK);
                    }
                    Ok(Err(e)) => {
                        let code = if e.kind() == io::ErrorKind::Other {
                            StatusCode::NotADirectory
                        } else {
                            Error::from(e).code()
                        };
                        this.state.set(DirState::Closed);
                        this.path.borrow_mut().clear();
                        cb(reactor, Error::new(code));
                    }
                    Err(e) => {
                        this.state.set(DirState::Closed);
                        this.path.borrow_mut().clear();
                        cb(reactor, e);
                    }
                }
            },
        );
    }

    /// Whole-directory scan offloaded to a worker thread; entries replay on
    /// the loop thread in the order `std::fs::read_dir` returned them.
    fn do_list(
        self: &Rc<Self>,
        mut on_entry: Box<dyn FnMut(&Reactor, &DirEntry) -> bool>,
        on_end: Box<dyn FnOnce(&Reactor, Error)>,
    ) {
        if !self.is_open() {
            self.reactor
                .schedule_callback(move |r| on_end(r, Error::new(StatusCode::DirNotOpen)));
            return;
        }
        if self.list_in_progress.replace(true) {
            on_end(&self.reactor.clone(), Error::new(StatusCode::OperationAlreadyInProgress));
            return;
        }

        let path = self.path.borrow().clone();
        let this = Rc::clone(self);
        self.reactor.add_work(
            move || -> io::Result<Vec<DirEntry>> {
                let mut entries = Vec::new();
                for entry in std::fs::read_dir(&path)? {
                    let entry = entry?;
                    entries.push(DirEntry {
                        name: PathBuf::from(entry.file_name()),
                        kind: DirectoryEntryType::from(entry.file_type()?),
                    });
                }
                Ok(entries)
            },
            move |reactor, result: Result<io::Result<Vec<DirEntry>>, Error>| {
                this.list_in_progress.set(false);
                match result {
                    Ok(Ok(entries)) => {
                        for entry in &entries {
                            if !on_entry(reactor, entry) {
                                break;
                            }
                        }
                        on_end(reactor, Error::OK);
                    }
                    Ok(Err(e)) => on_end(reactor, Error::from(e)),
                    Err(e) => on_end(reactor, e),
                }
            },
        );
    }

    fn do_close(self: &Rc<Self>, on_close: Box<dyn FnOnce(&Reactor, Error)>) {
        if !self.is_open() {
            // Closing a directory that was never successfully opened is
            // silently a no-op, callback included.
            return;
        }

        if self.list_in_progress.get() {
            self.state.set(DirState::WantClose);
            let this = Rc::clone(self);
            self.reactor.schedule_callback(move |_r| this.do_close(on_close));
            return;
        }

        self.state.set(DirState::Closed);
        self.path.borrow_mut().clear();
        self.reactor.schedule_callback(move |r| on_close(r, Error::OK));
    }
}

impl Removable for DirEngine {
    fn schedule_removal(&self) {
        let rc = self.rc();
        if rc.is_open() {
            let rc2 = Rc::clone(&rc);
            rc.do_close(Box::new(move |reactor, _err| {
                rc2.removal.schedule(reactor, || {});
            }));
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

/// A directory listing boundary: `open -> list* -> close`.
pub struct Dir {
    engine: Rc<DirEngine>,
}

impl Dir {
    pub fn new(reactor: &Reactor) -> Dir {
        Dir {
            engine: DirEngine::new(reactor),
        }
    }

    pub fn open(&self, path: impl Into<PathBuf>, on_open: impl FnOnce(&Reactor, Error) + 'static) {
        self.engine.do_open(path.into(), Box::new(on_open));
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    pub fn path(&self) -> PathBuf {
        self.engine.path.borrow().clone()
    }

    /// Lists every entry. Return `false` from `on_entry` to stop early;
    /// `on_end` always fires exactly once, with the terminal error (if any).
    pub fn list(
        &self,
        on_entry: impl FnMut(&Reactor, &DirEntry) -> bool + 'static,
        on_end: impl FnOnce(&Reactor, Error) + 'static,
    ) {
        self.engine.do_list(Box::new(on_entry), Box::new(on_end));
    }

    pub fn close(&self, on_close: impl FnOnce(&Reactor, Error) + 'static) {
        self.engine.do_close(Box::new(on_close));
    }
}

impl Removable for Dir {
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

fn path_is_root(path: &Path) -> bool {
    path.parent().is_none()
}

/// Creates a single directory. Fails with
/// [`StatusCode::IllegalOperationOnADirectory`] for a root path.
pub fn make_dir(
    reactor: &Reactor,
    path: impl Into<PathBuf>,
    on_done: impl FnOnce(&Reactor, &Path, Error) + 'static,
) {
    let path = path.into();
    if path.as_os_str().is_empty() {
        let path2 = path.clone();
        reactor.schedule_callback(move |r| on_done(r, &path2, Error::new(StatusCode::InvalidArgument)));
        return;
    }
    if path_is_root(&path) {
        let path2 = path.clone();
        reactor.schedule_callback(move |r| {
            on_done(r, &path2, Error::new(StatusCode::IllegalOperationOnADirectory))
        });
        return;
    }

    let for_work = path.clone();
    reactor.add_work(
        move || std::fs::create_dir(&for_work),
        move |reactor, result: Result<io::Result<()>, Error>| match result {
            Ok(Ok(())) => on_done(reactor, &path, Error::OK),
            Ok(Err(e)) => on_done(reactor, &path, Error::from(e)),
            Err(e) => on_done(reactor, &path, e),
        },
    );
}

/// Creates `path` and every missing ancestor directory.
/// `std::fs::create_dir_all` already walks ancestors one `stat`+`mkdir` pair
/// at a time, so this is a direct substitute rather than a hand-rolled walk.
pub fn make_all_dirs(
    reactor: &Reactor,
    path: impl Into<PathBuf>,
    on_done: impl FnOnce(&Reactor, &Path, Error) + 'static,
) {
    let path = path.into();
    if path.as_os_str().is_empty() {
        let path2 = path.clone();
        reactor.schedule_callback(move |r| on_done(r, &path2, Error::new(StatusCode::InvalidArgument)));
        return;
    }

    let for_work = path.clone();
    reactor.add_work(
        move || std::fs::create_dir_all(&for_work),
        move |reactor, result: Result<io::Result<()>, Error>| match result {
            Ok(Ok(())) => on_done(reactor, &path, Error::OK),
            Ok(Err(e)) => on_done(reactor, &path, Error::from(e)),
            Err(e) => on_done(reactor, &path, e),
        },
    );
}

/// Creates a uniquely-named temporary directory from `name_template`
/// (a `XXXXXX`-suffixed pattern, per `mkdtemp(3)`). Implemented as a direct
/// `libc::mkdtemp` call rather than via the `tempfile` crate: `tempfile` is
/// a dev-dependency only in this crate's `Cargo.toml`, so production code
/// can't reach for it.
pub fn make_temp_dir(
    reactor: &Reactor,
    name_template: impl Into<PathBuf>,
    on_done: impl FnOnce(&Reactor, Option<PathBuf>, Error) + 'static,
) {
    let template = name_template.into();
    reactor.add_work(
        move || -> io::Result<PathBuf> { mkdtemp(&template) },
        move |reactor, result: Result<io::Result<PathBuf>, Error>| match result {
            Ok(Ok(path)) => on_done(reactor, Some(path), Error::OK),
            Ok(Err(e)) => on_done(reactor, None, Error::from(e)),
            Err(e) => on_done(reactor, None, e),
        },
    );
}

#[cfg(unix)]
fn mkdtemp(template: &Path) -> io::Result<PathBuf> {
    use std::ffi::{CString, OsStr};
    use std::os::unix::ffi::OsStrExt;

    let c_template = CString::new(template.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "template contains a NUL byte"))?;
    let raw = c_template.into_raw();
    let result = unsafe { libc::mkdtemp(raw) };
    // Reclaim ownership unconditionally (mkdtemp edits the buffer in place,
    // it never frees or reallocates it) so the CString is never leaked.
    let reclaimed = unsafe { CString::from_raw(raw) };
    if result.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(PathBuf::from(OsStr::from_bytes(reclaimed.as_bytes())))
}

struct RemovedEntry {
    path: PathBuf,
}

fn remove_dir_recursive(root: &Path) -> io::Result<Vec<RemovedEntry>> {
    let mut removed = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    let mut to_remove = Vec::new();

    while let Some(dir) = stack.pop() {
        to_remove.push(dir.clone());
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                std::fs::remove_file(&path)?;
            }
        }
    }

    for dir in to_remove.into_iter().rev() {
        std::fs::remove_dir(&dir)?;
        removed.push(RemovedEntry { path: dir });
    }

    Ok(removed)
}

/// Recursively removes `path` and everything under it. `progress`, if
/// given, fires once per directory removed, in removal order.
///
/// A progress closure almost always closes over `Rc` state and cannot cross
/// threads, so this collects the whole removal log on the worker thread and
/// replays it on the loop thread right before `on_done` — progress is
/// reported after the fact rather than live, in exchange for staying
/// single-threaded everywhere user code runs.
pub fn remove_dir(
    reactor: &Reactor,
    path: impl Into<PathBuf>,
    progress: Option<impl Fn(&Reactor, &Path) + 'static>,
    on_done: impl FnOnce(&Reactor, Error) + 'static,
) {
    let path = path.into();
    reactor.add_work(
        move || remove_dir_recursive(&path),
        move |reactor, result: Result<io::Result<Vec<RemovedEntry>>, Error>| match result {
            Ok(Ok(removed)) => {
                if let Some(progress) = progress {
                    for entry in &removed {
                        progress(reactor, &entry.path);
                    }
                }
                on_done(reactor, Error::OK);
            }
            Ok(Err(e)) => on_done(reactor, Error::from(e)),
            Err(e) => on_done(reactor, e),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nexio-dir-test-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn lists_entries_and_ends() {
        let reactor = Reactor::new().unwrap();
        let root = scratch_dir("list");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("b.txt"), b"b").unwrap();

        let dir = Dir::new(&reactor);
        dir.open(root.clone(), |_r, err| assert!(err.is_ok()));
        reactor.run().unwrap();

        let names = Rc::new(StdRefCell::new(Vec::new()));
        let names2 = Rc::clone(&names);
        let ended = Rc::new(StdRefCell::new(false));
        let ended2 = Rc::clone(&ended);
        dir.list(
            move |_r, entry| {
                names2.borrow_mut().push(entry.name.clone());
                true
            },
            move |_r, err| {
                assert!(err.is_ok());
                *ended2.borrow_mut() = true;
            },
        );
        reactor.run().unwrap();

        assert!(*ended.borrow());
        assert_eq!(names.borrow().len(), 2);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn list_on_unopened_dir_reports_not_open() {
        let reactor = Reactor::new().unwrap();
        let dir = Dir::new(&reactor);
        let got = Rc::new(StdRefCell::new(None));
        let got2 = Rc::clone(&got);
        dir.list(|_r, _e| true, move |_r, err| *got2.borrow_mut() = Some(err.code()));
        reactor.run().unwrap();
        assert_eq!(*got.borrow(), Some(StatusCode::DirNotOpen));
    }

    #[test]
    fn make_all_dirs_creates_missing_ancestors() {
        let reactor = Reactor::new().unwrap();
        let root = scratch_dir("make-all");
        let nested = root.join("a").join("b").join("c");
        let done = Rc::new(StdRefCell::new(false));
        let done2 = Rc::clone(&done);
        make_all_dirs(&reactor, nested.clone(), move |_r, _p, err| {
            assert!(err.is_ok());
            *done2.borrow_mut() = true;
        });
        reactor.run().unwrap();
        assert!(*done.borrow());
        assert!(nested.is_dir());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn remove_dir_reports_progress_for_every_removed_directory() {
        let reactor = Reactor::new().unwrap();
        let root = scratch_dir("remove");
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a/b/f.txt"), b"x").unwrap();

        let progressed = Rc::new(StdRefCell::new(0usize));
        let progressed2 = Rc::clone(&progressed);
        let done = Rc::new(StdRefCell::new(false));
        let done2 = Rc::clone(&done);

        remove_dir(
            &reactor,
            root.clone(),
            Some(move |_r: &Reactor, _p: &Path| {
                *progressed2.borrow_mut() += 1;
            }),
            move |_r, err| {
                assert!(err.is_ok());
                *done2.borrow_mut() = true;
            },
        );
        reactor.run().unwrap();

        assert!(*done.borrow());
        assert_eq!(*progressed.borrow(), 3);
        assert!(!root.exists());
    }
}
