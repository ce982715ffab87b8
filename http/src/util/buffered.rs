//! Buffered io with pluggable write strategy.
//!
//! The read side is a single [BytesMut] with a soft limit acting as read
//! backpressure. The write side is either a flat buffer (single copy, single
//! `write` syscall) or a bounded list of owned buffers flushed with vectored
//! writes. The h1 dispatcher drives both through [BufferedIo].

use core::{
    future::{poll_fn, Future},
    pin::Pin,
};

use std::{collections::VecDeque, io};

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::io::{AsyncIo, Interest};

/// buffer state the dispatcher keys scheduling decisions off.
pub trait BufInterest {
    /// true while the buffer accepts more bytes from the producer.
    fn want_write_buf(&self) -> bool;

    /// true while the buffer holds bytes that must reach the io.
    fn want_write_io(&self) -> bool;
}

/// a write buffer drained into an [AsyncIo] endpoint.
pub trait BufWrite: BufInterest {
    /// write into the buffer through a fallible closure. on error the buffer
    /// reverts to its state before the call.
    fn write_buf<F, T, E>(&mut self, func: F) -> Result<T, E>
    where
        F: FnOnce(&mut BytesMut) -> Result<T, E>;

    /// try to move buffered bytes into the io. returns bytes written. a
    /// [io::ErrorKind::WouldBlock] outcome is absorbed.
    fn do_io<Io: AsyncIo>(&mut self, io: &mut Io) -> io::Result<usize>;
}

/// readable buffer with a soft capacity limit.
pub struct ReadBuf {
    buf: BytesMut,
    limit: usize,
}

impl ReadBuf {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// construct with bytes already read from the endpoint, e.g. by a
    /// detecting factory that peeked at the head of the stream.
    pub fn with_bytes(limit: usize, bytes: BytesMut) -> Self {
        Self { buf: bytes, limit }
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// split off everything read so far, e.g. to hand to an upgraded
    /// connection.
    #[inline]
    pub fn split(&mut self) -> BytesMut {
        self.buf.split()
    }

    #[inline]
    fn backpressure(&self) -> bool {
        self.buf.len() >= self.limit
    }
}

/// flat write buffer. everything is copied into one [BytesMut] and written
/// with plain writes.
pub struct WriteBuf {
    buf: BytesMut,
    limit: usize,
}

impl WriteBuf {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    #[cfg(test)]
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl BufInterest for WriteBuf {
    #[inline]
    fn want_write_buf(&self) -> bool {
        self.buf.len() < self.limit
    }

    #[inline]
    fn want_write_io(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl BufWrite for WriteBuf {
    fn write_buf<F, T, E>(&mut self, func: F) -> Result<T, E>
    where
        F: FnOnce(&mut BytesMut) -> Result<T, E>,
    {
        let len = self.buf.len();
        func(&mut self.buf).inspect_err(|_| self.buf.truncate(len))
    }

    fn do_io<Io: AsyncIo>(&mut self, io: &mut Io) -> io::Result<usize> {
        let mut written = 0;
        while !self.buf.is_empty() {
            match io.try_write(&self.buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    written += n;
                    self.buf.advance(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

/// buffered chunk of response data. static slices avoid copying fixed
/// protocol fragments.
pub enum EncodedBuf {
    Bytes(Bytes),
    Static(&'static [u8]),
}

impl EncodedBuf {
    #[inline]
    fn chunk(&self) -> &[u8] {
        match self {
            Self::Bytes(b) => b,
            Self::Static(s) => s,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.chunk().len()
    }
}

// list buffer is forced into backpressure at this queue length. 32 covers 16
// pipelined responses of head plus a single body chunk each.
const LIST_CAP: usize = 32;

// upper bound of io slices gathered per vectored write.
const IOVS: usize = 64;

/// vectored write buffer. head bytes and small chunks aggregate in a scratch
/// [BytesMut]; large chunks queue as owned buffers and flush with
/// `try_write_vectored`.
pub struct ListWriteBuf {
    scratch: BytesMut,
    list: VecDeque<EncodedBuf>,
    limit: usize,
    aggregation: usize,
}

impl ListWriteBuf {
    pub fn new(limit: usize, aggregation: usize) -> Self {
        Self {
            scratch: BytesMut::new(),
            list: VecDeque::new(),
            limit,
            aggregation,
        }
    }

    /// queue an owned buffer behind everything written so far.
    pub fn buffer(&mut self, buf: EncodedBuf) {
        self.split_scratch();
        self.list.push_back(buf);
    }

    /// copy small bytes into the aggregation scratch instead of queueing.
    pub fn aggregate(&mut self, bytes: &[u8]) {
        self.scratch.extend_from_slice(bytes);
    }

    #[inline]
    pub fn aggregation_size(&self) -> usize {
        self.aggregation
    }

    fn split_scratch(&mut self) {
        if !self.scratch.is_empty() {
            let bytes = self.scratch.split().freeze();
            self.list.push_back(EncodedBuf::Bytes(bytes));
        }
    }

    fn remaining(&self) -> usize {
        self.scratch.len() + self.list.iter().map(EncodedBuf::len).sum::<usize>()
    }
}

impl BufInterest for ListWriteBuf {
    #[inline]
    fn want_write_buf(&self) -> bool {
        self.remaining() < self.limit && self.list.len() < LIST_CAP
    }

    #[inline]
    fn want_write_io(&self) -> bool {
        !self.list.is_empty() || !self.scratch.is_empty()
    }
}

impl BufWrite for ListWriteBuf {
    fn write_buf<F, T, E>(&mut self, func: F) -> Result<T, E>
    where
        F: FnOnce(&mut BytesMut) -> Result<T, E>,
    {
        let len = self.scratch.len();
        func(&mut self.scratch).inspect_err(|_| self.scratch.truncate(len))
    }

    fn do_io<Io: AsyncIo>(&mut self, io: &mut Io) -> io::Result<usize> {
        self.split_scratch();

        let mut written = 0;
        while !self.list.is_empty() {
            let mut iovs = [io::IoSlice::new(&[]); IOVS];
            let mut len = 0;
            for buf in self.list.iter().take(IOVS) {
                iovs[len] = io::IoSlice::new(buf.chunk());
                len += 1;
            }

            match io.try_write_vectored(&iovs[..len]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(mut n) => {
                    written += n;
                    while n > 0 {
                        let front = self.list.front_mut().expect("write advanced past queued buffers");
                        if n >= front.len() {
                            n -= front.len();
                            self.list.pop_front();
                        } else {
                            match front {
                                EncodedBuf::Bytes(b) => b.advance(n),
                                EncodedBuf::Static(s) => *s = &s[n..],
                            }
                            n = 0;
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

/// io type paired with its read and write buffers plus transfer counters.
pub struct BufferedIo<'a, Io, W> {
    pub io: &'a mut Io,
    pub read_buf: ReadBuf,
    pub write_buf: W,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl<'a, Io, W> BufferedIo<'a, Io, W>
where
    Io: AsyncIo,
    W: BufWrite,
{
    pub fn new(io: &'a mut Io, read_buf: ReadBuf, write_buf: W) -> Self {
        Self {
            io,
            read_buf,
            write_buf,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// read until the io is blocked, EOF is met or the read buffer reaches
    /// its limit. `Ok(None)` means the io was not readable at all.
    pub fn try_read(&mut self) -> io::Result<Option<usize>> {
        let mut read = 0;
        loop {
            match self.io.try_read_buf(self.read_buf.inner_mut()) {
                Ok(0) => {
                    if read == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    break;
                }
                Ok(n) => {
                    read += n;
                    if self.read_buf.backpressure() {
                        trace!("read buffer limit reached. entering backpressure(no log event for recovery)");
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if read == 0 {
                        return Ok(None);
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.bytes_read += read as u64;
        Ok(Some(read))
    }

    /// write until the write buffer is emptied or the io is blocked.
    #[inline]
    pub fn try_write(&mut self) -> io::Result<()> {
        let written = self.write_buf.do_io(self.io)?;
        self.bytes_written += written as u64;
        Ok(())
    }

    /// wait for read readiness and read.
    pub async fn read(&mut self) -> io::Result<usize> {
        loop {
            self.io.ready(Interest::READABLE).await?;
            if let Some(read) = self.try_read()? {
                return Ok(read);
            }
        }
    }

    /// drain the write buffer completely.
    pub async fn drain_write(&mut self) -> io::Result<()> {
        while self.write_buf.want_write_io() {
            self.io.ready(Interest::WRITABLE).await?;
            self.try_write()?;
        }
        Ok(())
    }

    /// shut down the output direction of the io gracefully.
    pub fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> + '_ {
        poll_fn(|cx| Pin::new(&mut *self.io).poll_shutdown(cx))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::io::memory;

    #[test]
    fn flat_buf_revert_on_error() {
        let mut buf = WriteBuf::new(64);
        buf.write_buf(|b| {
            b.extend_from_slice(b"keep");
            Ok::<_, ()>(())
        })
        .unwrap();
        let _ = buf.write_buf(|b| {
            b.extend_from_slice(b"drop");
            Err::<(), ()>(())
        });
        assert_eq!(buf.bytes(), b"keep");
    }

    #[tokio::test]
    async fn list_buf_preserves_order() {
        let (mut io, handle) = memory::pair();

        let mut buf = ListWriteBuf::new(1024, 16);
        buf.aggregate(b"head");
        buf.buffer(EncodedBuf::Static(b" and "));
        buf.aggregate(b"tail");

        let mut buffered = BufferedIo::new(&mut io, ReadBuf::new(1024), buf);
        buffered.drain_write().await.unwrap();

        assert_eq!(&handle.output()[..], b"head and tail");
        assert_eq!(buffered.bytes_written, 13);
    }
}
