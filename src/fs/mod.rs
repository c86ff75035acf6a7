//! Filesystem I/O: pipelined file reads and directory listing, offloaded to
//! the reactor's worker pool since none of this can be done with `mio`'s
//! readiness model.

mod dir;
mod file;

pub use dir::{make_all_dirs, make_dir, make_temp_dir, remove_dir, Dir, DirEntry, DirectoryEntryType};
pub use file::{File, StatData};
