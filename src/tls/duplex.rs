//! `MemoryDuplex`: an in-process BIO substitute — OpenSSL reads/writes
//! ciphertext through this instead of a socket, so the handshake and record
//! pumps can be driven by our own reactor instead of blocking on real I/O.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

#[derive(Default)]
pub(crate) struct MemoryDuplex {
    incoming: VecDeque<u8>,
    outgoing: VecDeque<u8>,
}

impl MemoryDuplex {
    pub fn new() -> MemoryDuplex {
        MemoryDuplex::default()
    }

    pub fn feed_incoming(&mut self, data: &[u8]) {
        self.incoming.extend(data);
    }

    pub fn take_outgoing(&mut self) -> Vec<u8> {
        self.outgoing.drain(..).collect()
    }
}

impl Read for MemoryDuplex {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no ciphertext buffered"));
        }
        let n = self.incoming.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(self.incoming.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for MemoryDuplex {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_reports_would_block_when_empty() {
        let mut d = MemoryDuplex::new();
        let mut buf = [0u8; 4];
        let err = d.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn write_then_take_outgoing_roundtrips() {
        let mut d = MemoryDuplex::new();
        d.write_all(b"hello").unwrap();
        assert_eq!(d.take_outgoing(), b"hello");
        assert!(d.take_outgoing().is_empty());
    }

    #[test]
    fn feed_then_read_roundtrips() {
        let mut d = MemoryDuplex::new();
        d.feed_incoming(b"world");
        let mut buf = [0u8; 5];
        let n = d.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }
}
