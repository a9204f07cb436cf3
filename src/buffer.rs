//! Length-prefixed framing and big-endian field codec for SFTP packets.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{io, mem};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The largest frame accepted from the server (same limit as OpenSSH).
pub const MAX_FRAME_LEN: u32 = 256 * 1024;

const INIT_BUFFER_ALLOC: usize = 128;

/// A growable packet buffer.
///
/// Writers append fields at the back; readers consume from the front.
#[derive(Debug)]
pub struct Buffer {
    buf: BytesMut,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INIT_BUFFER_ALLOC),
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    // Grow by doubling so that repeated appends stay amortized.
    fn reserve(&mut self, additional: usize) {
        let spare = self.buf.capacity() - self.buf.len();
        if spare < additional {
            let grow = std::cmp::max(additional, self.buf.capacity());
            self.buf.reserve(grow);
        }
    }

    pub fn put_u8(&mut self, n: u8) {
        self.reserve(1);
        self.buf.put_u8(n);
    }

    pub fn put_u32(&mut self, n: u32) {
        self.reserve(4);
        self.buf.put_u32(n);
    }

    pub fn put_u64(&mut self, n: u64) {
        self.reserve(8);
        self.buf.put_u64(n);
    }

    /// Append a `u32` length followed by the raw bytes.
    pub fn put_block(&mut self, data: &[u8]) {
        self.reserve(4 + data.len());
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_block(s.as_bytes());
    }

    #[inline]
    fn ensure_remaining(&self, n: usize) -> Result<()> {
        if self.buf.remaining() >= n {
            Ok(())
        } else {
            Err(Error::protocol("too short data"))
        }
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.ensure_remaining(mem::size_of::<u8>())?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.ensure_remaining(mem::size_of::<u32>())?;
        Ok(self.buf.get_u32())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.ensure_remaining(mem::size_of::<u64>())?;
        Ok(self.buf.get_u64())
    }

    /// Consume a length-prefixed block.
    pub fn get_block(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        self.ensure_remaining(len)?;
        Ok(self.buf.split_to(len).freeze())
    }

    /// Consume a length-prefixed block as text, replacing invalid UTF-8.
    pub fn get_string(&mut self) -> Result<String> {
        let block = self.get_block()?;
        Ok(String::from_utf8_lossy(&block).into_owned())
    }

    /// Consume `len` raw bytes into `dst`.
    pub fn get_slice(&mut self, dst: &mut [u8]) -> Result<()> {
        self.ensure_remaining(dst.len())?;
        self.buf.copy_to_slice(dst);
        Ok(())
    }

    /// Write the accumulated payload as one frame and clear the buffer.
    pub async fn send<W>(&mut self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let length = self.buf.len() as u32;
        tracing::trace!(length, "sending frame");

        let mut frame = Vec::with_capacity(4 + self.buf.len());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&self.buf);
        w.write_all(&frame).await?;
        w.flush().await?;

        self.buf.clear();
        Ok(())
    }

    /// Replace the buffer contents with the payload of the next frame.
    pub async fn recv<R>(&mut self, r: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut len = [0u8; 4];
        r.read_exact(&mut len).await?;
        let length = u32::from_be_bytes(len);
        tracing::trace!(length, "receiving frame");

        if length > MAX_FRAME_LEN {
            return Err(Error::protocol(format!(
                "message length too long: {}",
                length
            )));
        }

        self.buf.clear();
        self.reserve(length as usize);
        self.buf.resize(length as usize, 0);
        r.read_exact(&mut self.buf[..]).await?;
        Ok(())
    }

    /// Like [`recv`](Self::recv), but bytes of a partially received frame
    /// stay in `inbox` when the future is dropped, so the next call picks
    /// up where this one stopped.
    pub async fn recv_buffered<R>(&mut self, r: &mut R, inbox: &mut BytesMut) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if inbox.len() >= 4 {
                let length = u32::from_be_bytes([inbox[0], inbox[1], inbox[2], inbox[3]]);
                if length > MAX_FRAME_LEN {
                    return Err(Error::protocol(format!(
                        "message length too long: {}",
                        length
                    )));
                }

                let frame_len = 4 + length as usize;
                if inbox.len() >= frame_len {
                    tracing::trace!(length, "receiving frame");
                    inbox.advance(4);
                    self.buf = inbox.split_to(length as usize);
                    return Ok(());
                }
                inbox.reserve(frame_len - inbox.len());
            }

            if r.read_buf(inbox).await? == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
        }
    }
}
