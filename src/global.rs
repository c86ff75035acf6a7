//! Process-wide configuration: the TLS cipher list default, an installable
//! `log::Log` sink, and socket send/recv buffer size bounds detected once per
//! process by bisecting `setsockopt` against a throwaway UDP socket.

use std::io;
use std::sync::{OnceLock, RwLock};

use socket2::{Domain, Socket, Type};

/// Mirrors the original library's default OpenSSL cipher string.
const DEFAULT_CIPHERS_LIST: &str = "ALL:!SHA256:!SHA384:!aPSK:!ECDSA+SHA1:!ADH:!LOW:!EXP:!MD5";

#[derive(Debug, Clone, Copy)]
pub struct BufferSizeBounds {
    pub min: usize,
    pub default: usize,
    pub max: usize,
}

struct Configuration {
    ciphers_list: RwLock<String>,
    receive_buffer_bounds: OnceLock<BufferSizeBounds>,
    send_buffer_bounds: OnceLock<BufferSizeBounds>,
}

fn configuration() -> &'static Configuration {
    static CONFIG: OnceLock<Configuration> = OnceLock::new();
    CONFIG.get_or_init(|| Configuration {
        ciphers_list: RwLock::new(DEFAULT_CIPHERS_LIST.to_string()),
        receive_buffer_bounds: OnceLock::new(),
        send_buffer_bounds: OnceLock::new(),
    })
}

/// Installs `logger` as the process's `log` backend, the same entry point
/// applications use for `env_logger`. Returns an error if a logger is
/// already installed (mirrors `log::set_boxed_logger`).
pub fn set_logger(logger: Box<dyn log::Log>) -> Result<(), log::SetLoggerError> {
    log::set_boxed_logger(logger)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}

pub fn set_ciphers_list(ciphers: impl Into<String>) {
    *configuration().ciphers_list.write().unwrap() = ciphers.into();
}

pub fn ciphers_list() -> String {
    configuration().ciphers_list.read().unwrap().clone()
}

pub fn min_receive_buffer_size() -> usize {
    receive_buffer_bounds().min
}

pub fn default_receive_buffer_size() -> usize {
    receive_buffer_bounds().default
}

pub fn max_receive_buffer_size() -> usize {
    receive_buffer_bounds().max
}

pub fn min_send_buffer_size() -> usize {
    send_buffer_bounds().min
}

pub fn default_send_buffer_size() -> usize {
    send_buffer_bounds().default
}

pub fn max_send_buffer_size() -> usize {
    send_buffer_bounds().max
}

fn receive_buffer_bounds() -> BufferSizeBounds {
    *configuration()
        .receive_buffer_bounds
        .get_or_init(|| detect_buffer_size_bounds(BufferKind::Receive))
}

fn send_buffer_bounds() -> BufferSizeBounds {
    *configuration()
        .send_buffer_bounds
        .get_or_init(|| detect_buffer_size_bounds(BufferKind::Send))
}

#[derive(Clone, Copy)]
enum BufferKind {
    Receive,
    Send,
}

impl BufferKind {
    fn get(self, socket: &Socket) -> io::Result<usize> {
        match self {
            BufferKind::Receive => socket.recv_buffer_size(),
            BufferKind::Send => socket.send_buffer_size(),
        }
    }

    fn set(self, socket: &Socket, size: usize) -> io::Result<()> {
        match self {
            BufferKind::Receive => socket.set_recv_buffer_size(size),
            BufferKind::Send => socket.set_send_buffer_size(size),
        }
    }
}

fn throwaway_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.bind(&"0.0.0.0:0".parse::<std::net::SocketAddr>().unwrap().into())?;
    Ok(socket)
}

/// Linux doubles whatever `SO_RCVBUF`/`SO_SNDBUF` value is requested
/// (`socket(7)`); other platforms return what was asked for.
fn kernel_size_multiplier() -> usize {
    if cfg!(target_os = "linux") {
        2
    } else {
        1
    }
}

fn is_buffer_size_available(socket: &Socket, kind: BufferKind, size: usize) -> bool {
    if size == 0 {
        return false;
    }
    if kind.set(socket, size).is_err() {
        return false;
    }
    match kind.get(socket) {
        Ok(got) => got == size.saturating_mul(kernel_size_multiplier()),
        Err(_) => false,
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Direction {
    Min,
    Max,
}

fn bound_buffer_size(
    socket: &Socket,
    kind: BufferKind,
    mut lower_bound: usize,
    mut upper_bound: usize,
    direction: Direction,
) -> usize {
    let mut candidate = (upper_bound + lower_bound) / 2;
    while lower_bound + 1 < upper_bound {
        let available = is_buffer_size_available(socket, kind, candidate);
        match (direction, available) {
            (Direction::Min, true) => upper_bound = candidate,
            (Direction::Min, false) => lower_bound = candidate,
            (Direction::Max, true) => lower_bound = candidate,
            (Direction::Max, false) => upper_bound = candidate,
        }
        candidate = (upper_bound + lower_bound) / 2;
    }

    match direction {
        Direction::Min => {
            if is_buffer_size_available(socket, kind, lower_bound) {
                lower_bound
            } else {
                upper_bound
            }
        }
        Direction::Max => {
            if is_buffer_size_available(socket, kind, upper_bound) {
                upper_bound
            } else {
                lower_bound
            }
        }
    }
}

fn detect_buffer_size_bounds(kind: BufferKind) -> BufferSizeBounds {
    let fallback = BufferSizeBounds {
        min: 0,
        default: 0,
        max: 0,
    };
    let socket = match throwaway_socket() {
        Ok(s) => s,
        Err(_) => return fallback,
    };

    let default = match kind.get(&socket) {
        Ok(v) => v,
        Err(_) => return fallback,
    };

    let min = bound_buffer_size(&socket, kind, 0, default, Direction::Min);

    let upper_limit = (i32::MAX as usize) / 2;
    let mut probe = default.max(1);
    while is_buffer_size_available(&socket, kind, probe) && probe < upper_limit {
        probe = probe.saturating_mul(2);
    }
    let max = bound_buffer_size(&socket, kind, default, probe, Direction::Max);

    BufferSizeBounds { min, default, max }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ciphers_list_round_trips() {
        let before = ciphers_list();
        set_ciphers_list("HIGH:!aNULL");
        assert_eq!(ciphers_list(), "HIGH:!aNULL");
        set_ciphers_list(before);
    }

    #[test]
    fn buffer_bounds_are_ordered() {
        let bounds = receive_buffer_bounds();
        assert!(bounds.min <= bounds.default);
        assert!(bounds.default <= bounds.max || bounds.max == 0);
    }
}
