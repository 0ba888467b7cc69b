//! The byte sink/source migration streams flow over. Kept deliberately
//! thin and blocking -- the wire codec and scanner/receiver loops already
//! run on dedicated threads, so there is no benefit to an async trait here.

use std::io;

pub trait Transport: Send {
    fn put_byte(&mut self, b: u8) -> io::Result<()>;
    fn put_be16(&mut self, v: u16) -> io::Result<()>;
    fn put_be32(&mut self, v: u32) -> io::Result<()>;
    fn put_be64(&mut self, v: u64) -> io::Result<()>;
    fn put_bytes(&mut self, b: &[u8]) -> io::Result<()>;

    /// Hint that `b` may be queued rather than written synchronously; a
    /// transport that has no such optimization can forward to `put_bytes`.
    fn put_bytes_async(&mut self, b: &[u8]) -> io::Result<()> {
        self.put_bytes(b)
    }

    fn get_byte(&mut self) -> io::Result<u8>;
    fn get_be16(&mut self) -> io::Result<u16>;
    fn get_be32(&mut self) -> io::Result<u32>;
    fn get_be64(&mut self) -> io::Result<u64>;
    fn get_bytes(&mut self, n: usize) -> io::Result<Vec<u8>>;

    /// True if the configured rate limit for this period has been used up;
    /// the scanner checks this between pages to implement pacing.
    fn rate_limit_exceeded(&self) -> bool {
        false
    }

    fn get_error(&self) -> Option<&io::Error> {
        None
    }

    fn flush(&mut self) -> io::Result<()>;
}

/// An in-memory transport backed by a growable buffer, used by tests and
/// the example CLI to exercise the codec without a real socket.
pub struct MemTransport {
    buf: Vec<u8>,
    read_pos: usize,
}

impl MemTransport {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            read_pos: 0,
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            buf: bytes,
            read_pos: 0,
        }
    }
}

impl Default for MemTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemTransport {
    fn put_byte(&mut self, b: u8) -> io::Result<()> {
        self.buf.push(b);
        Ok(())
    }

    fn put_be16(&mut self, v: u16) -> io::Result<()> {
        self.buf.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn put_be32(&mut self, v: u32) -> io::Result<()> {
        self.buf.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn put_be64(&mut self, v: u64) -> io::Result<()> {
        self.buf.extend_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn put_bytes(&mut self, b: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(b);
        Ok(())
    }

    fn get_byte(&mut self) -> io::Result<u8> {
        let b = *self.buf.get(self.read_pos).ok_or_else(eof)?;
        self.read_pos += 1;
        Ok(b)
    }

    fn get_be16(&mut self) -> io::Result<u16> {
        let b = self.get_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn get_be32(&mut self) -> io::Result<u32> {
        let b = self.get_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_be64(&mut self) -> io::Result<u64> {
        let b = self.get_bytes(8)?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    fn get_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        if self.read_pos + n > self.buf.len() {
            return Err(eof());
        }
        let out = self.buf[self.read_pos..self.read_pos + n].to_vec();
        self.read_pos += n;
        Ok(out)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "MemTransport exhausted")
}
