//! http/1 flavored additions on top of the plain write buffer traits.

use core::convert::Infallible;
use core::fmt::Write;

use bytes::{Bytes, BytesMut};

use crate::util::buffered::{BufWrite, EncodedBuf, ListWriteBuf, WriteBuf};

/// write http/1 framed data into a buffer implementing [BufWrite].
pub trait H1BufWrite: BufWrite {
    /// write a response head through a fallible closure. on the error path
    /// the buffer reverts to the state before the call.
    #[inline]
    fn write_head<F, T, E>(&mut self, func: F) -> Result<T, E>
    where
        F: FnOnce(&mut BytesMut) -> Result<T, E>,
    {
        self.write_buf(func)
    }

    /// write a static protocol fragment.
    fn write_static(&mut self, bytes: &'static [u8]) {
        let _ = self.write_buf(|buf| {
            buf.extend_from_slice(bytes);
            Ok::<_, Infallible>(())
        });
    }

    /// write body bytes as is.
    fn write_bytes(&mut self, bytes: Bytes) {
        let _ = self.write_buf(|buf| {
            buf.extend_from_slice(&bytes);
            Ok::<_, Infallible>(())
        });
    }

    /// write body bytes framed as a `transfer-encoding: chunked` chunk.
    fn write_chunked(&mut self, bytes: Bytes) {
        let _ = self.write_buf(|buf| {
            write_chunk_size(buf, bytes.len());
            buf.reserve(bytes.len() + 2);
            buf.extend_from_slice(&bytes);
            buf.extend_from_slice(b"\r\n");
            Ok::<_, Infallible>(())
        });
    }
}

fn write_chunk_size(buf: &mut BytesMut, len: usize) {
    struct Writer<'a>(&'a mut BytesMut);

    impl Write for Writer<'_> {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            self.0.extend_from_slice(s.as_bytes());
            Ok(())
        }
    }

    write!(Writer(buf), "{len:X}\r\n").unwrap();
}

impl H1BufWrite for WriteBuf {}

impl H1BufWrite for ListWriteBuf {
    // list buffer keeps head bytes in the aggregation scratch. anything
    // small joins them; large chunks queue for gather write.
    fn write_bytes(&mut self, bytes: Bytes) {
        if bytes.len() <= self.aggregation_size() {
            self.aggregate(&bytes);
        } else {
            self.buffer(EncodedBuf::Bytes(bytes));
        }
    }

    fn write_chunked(&mut self, bytes: Bytes) {
        let _ = self.write_buf(|buf| {
            write_chunk_size(buf, bytes.len());
            Ok::<_, Infallible>(())
        });
        if bytes.len() <= self.aggregation_size() {
            self.aggregate(&bytes);
            self.aggregate(b"\r\n");
        } else {
            self.buffer(EncodedBuf::Bytes(bytes));
            self.buffer(EncodedBuf::Static(b"\r\n"));
        }
    }

    fn write_static(&mut self, bytes: &'static [u8]) {
        self.buffer(EncodedBuf::Static(bytes));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunk_framing() {
        let mut buf = WriteBuf::new(1024);
        buf.write_chunked(Bytes::from_static(b"abc"));
        assert_eq!(buf.bytes(), b"3\r\nabc\r\n");
    }
}
