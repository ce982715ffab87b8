use core::{fmt, mem};

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};

use super::buf_write::H1BufWrite;
use super::error::ProtoError;

// upper bound of buffered trailer section bytes.
const TRAILER_SIZE_LIMIT: usize = 8 * 1024;

// upper bound of trailer field count.
const TRAILER_LIMIT: usize = 32;

/// Coder for the transfer encoding of a message body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferCoding {
    /// Default coder indicating the message does not have a body.
    Eof,
    /// Coder counting down a positive `content-length`.
    Length(u64),
    /// Decoder for `transfer-encoding: chunked` with trailer section capture.
    DecodeChunked(ChunkedState, u64, BytesMut),
    /// Encoder for `transfer-encoding: chunked`.
    EncodeChunked,
    /// Pass through coder for tunnelled or upgraded connections.
    Upgrade,
}

impl TransferCoding {
    #[inline]
    pub const fn eof() -> Self {
        Self::Eof
    }

    #[inline]
    pub const fn length(len: u64) -> Self {
        Self::Length(len)
    }

    #[inline]
    pub fn decode_chunked() -> Self {
        Self::DecodeChunked(ChunkedState::Size, 0, BytesMut::new())
    }

    #[inline]
    pub const fn encode_chunked() -> Self {
        Self::EncodeChunked
    }

    #[inline]
    pub const fn upgrade() -> Self {
        Self::Upgrade
    }

    /// true when the coder ended gracefully and can not produce any more
    /// body data.
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    #[inline]
    pub fn is_upgrade(&self) -> bool {
        matches!(self, Self::Upgrade)
    }

    /// transition the coder while decoding the request head. conflicting
    /// body framing headers are a hard protocol error.
    pub fn try_set(&mut self, other: Self) -> Result<(), ProtoError> {
        match (&self, &other) {
            // multiple upgrade sets are allowed. CONNECT method and
            // `Connection: upgrade` both request one.
            (TransferCoding::Upgrade, TransferCoding::Upgrade) => Ok(()),
            // a second framing header of any kind is a conflict.
            (TransferCoding::Upgrade, _) | (TransferCoding::DecodeChunked(..), _) | (TransferCoding::Length(..), _) => {
                Err(ProtoError::ContentLength)
            }
            _ => {
                *self = other;
                Ok(())
            }
        }
    }

    #[inline]
    pub fn set_eof(&mut self) {
        *self = Self::Eof;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

macro_rules! byte (
    ($rdr:ident) => ({
        if $rdr.len() > 0 {
            let b = $rdr[0];
            $rdr.advance(1);
            b
        } else {
            return Ok(None);
        }
    })
);

impl ChunkedState {
    fn step(
        self,
        body: &mut BytesMut,
        size: &mut u64,
        buf: &mut Option<Bytes>,
        trailer: &mut BytesMut,
    ) -> io::Result<Option<Self>> {
        match self {
            Self::Size => Self::read_size(body, size),
            Self::SizeLws => Self::read_size_lws(body),
            Self::Extension => Self::read_extension(body),
            Self::SizeLf => Self::read_size_lf(body, size),
            Self::Body => Self::read_body(body, size, buf),
            Self::BodyCr => Self::read_body_cr(body),
            Self::BodyLf => Self::read_body_lf(body),
            Self::Trailer => Self::read_trailer(body, trailer),
            Self::TrailerLf => Self::read_trailer_lf(body, trailer),
            Self::EndCr => Self::read_end_cr(body, trailer),
            Self::EndLf => Self::read_end_lf(body),
            Self::End => Ok(Some(Self::End)),
        }
    }

    fn read_size(rdr: &mut BytesMut, size: &mut u64) -> io::Result<Option<Self>> {
        macro_rules! or_overflow {
            ($e:expr) => (
                match $e {
                    Some(val) => val,
                    None => return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid chunk size: overflow",
                    )),
                }
            )
        }

        let radix = 16;
        match byte!(rdr) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Ok(Some(Self::SizeLws)),
            b';' => return Ok(Some(Self::Extension)),
            b'\r' => return Ok(Some(Self::SizeLf)),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid chunk size line: invalid size",
                ));
            }
        }

        Ok(Some(Self::Size))
    }

    fn read_size_lws(rdr: &mut BytesMut) -> io::Result<Option<Self>> {
        match byte!(rdr) {
            // LWS can follow the chunk size, but no more digits can come.
            b'\t' | b' ' => Ok(Some(Self::SizeLws)),
            b';' => Ok(Some(Self::Extension)),
            b'\r' => Ok(Some(Self::SizeLf)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid chunk size linear white space",
            )),
        }
    }

    fn read_extension(rdr: &mut BytesMut) -> io::Result<Option<Self>> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::SizeLf)),
            b'\n' => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk extension contains newline",
            )),
            // no supported extensions.
            _ => Ok(Some(Self::Extension)),
        }
    }

    fn read_size_lf(rdr: &mut BytesMut, size: &mut u64) -> io::Result<Option<Self>> {
        match byte!(rdr) {
            b'\n' if *size > 0 => Ok(Some(Self::Body)),
            b'\n' if *size == 0 => Ok(Some(Self::EndCr)),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid chunk size LF")),
        }
    }

    fn read_body(rdr: &mut BytesMut, rem: &mut u64, buf: &mut Option<Bytes>) -> io::Result<Option<Self>> {
        if rdr.is_empty() {
            Ok(None)
        } else {
            *buf = Some(bounded_split(rem, rdr));
            if *rem > 0 {
                Ok(Some(Self::Body))
            } else {
                Ok(Some(Self::BodyCr))
            }
        }
    }

    fn read_body_cr(rdr: &mut BytesMut) -> io::Result<Option<Self>> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::BodyLf)),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid chunk body CR")),
        }
    }

    fn read_body_lf(rdr: &mut BytesMut) -> io::Result<Option<Self>> {
        match byte!(rdr) {
            b'\n' => Ok(Some(Self::Size)),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid chunk body LF")),
        }
    }

    fn read_trailer(rdr: &mut BytesMut, trailer: &mut BytesMut) -> io::Result<Option<Self>> {
        let b = byte!(rdr);
        push_trailer(trailer, b)?;
        match b {
            b'\r' => Ok(Some(Self::TrailerLf)),
            _ => Ok(Some(Self::Trailer)),
        }
    }

    fn read_trailer_lf(rdr: &mut BytesMut, trailer: &mut BytesMut) -> io::Result<Option<Self>> {
        match byte!(rdr) {
            b'\n' => {
                push_trailer(trailer, b'\n')?;
                Ok(Some(Self::EndCr))
            }
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid trailer end LF")),
        }
    }

    fn read_end_cr(rdr: &mut BytesMut, trailer: &mut BytesMut) -> io::Result<Option<Self>> {
        let b = byte!(rdr);
        match b {
            b'\r' => Ok(Some(Self::EndLf)),
            _ => {
                // first byte of a trailer field line.
                push_trailer(trailer, b)?;
                Ok(Some(Self::Trailer))
            }
        }
    }

    fn read_end_lf(rdr: &mut BytesMut) -> io::Result<Option<Self>> {
        match byte!(rdr) {
            b'\n' => Ok(Some(Self::End)),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid chunk end LF")),
        }
    }
}

fn push_trailer(trailer: &mut BytesMut, b: u8) -> io::Result<()> {
    if trailer.len() >= TRAILER_SIZE_LIMIT {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "trailer section too large"));
    }
    trailer.extend_from_slice(&[b]);
    Ok(())
}

// trailer fields that must not appear after the body: message framing,
// routing and hop-by-hop headers. offending fields are dropped while the
// request itself still completes.
fn forbidden_trailer(name: &HeaderName) -> bool {
    use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};

    matches!(
        *name,
        TRANSFER_ENCODING | CONTENT_LENGTH | TRAILER | CONNECTION | UPGRADE | TE | HOST
    ) || matches!(
        name.as_str(),
        "keep-alive" | "proxy-connection" | "proxy-authenticate" | "proxy-authorization"
    )
}

fn parse_trailers(mut buf: BytesMut) -> io::Result<Option<HeaderMap>> {
    if buf.is_empty() {
        return Ok(None);
    }

    // the state machine validated the line structure. terminate the section
    // so the header parser sees a complete block.
    buf.extend_from_slice(b"\r\n");

    let mut headers = [httparse::EMPTY_HEADER; TRAILER_LIMIT];
    match httparse::parse_headers(&buf, &mut headers) {
        Ok(httparse::Status::Complete((_, parsed))) => {
            let mut map = HeaderMap::with_capacity(parsed.len());
            for header in parsed {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid trailer field name"))?;
                if forbidden_trailer(&name) {
                    continue;
                }
                let value = HeaderValue::from_bytes(header.value)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid trailer field value"))?;
                map.append(name, value);
            }
            Ok(Some(map))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "invalid trailer section")),
    }
}

impl TransferCoding {
    /// Encode a body chunk into the write buffer.
    pub fn encode<W>(&mut self, mut bytes: Bytes, buf: &mut W)
    where
        W: H1BufWrite,
    {
        // skip encoding empty bytes. avoids emitting an premature eof chunk
        // when the body stream produces empty items.
        if bytes.is_empty() {
            return;
        }

        match *self {
            Self::Upgrade => buf.write_bytes(bytes),
            Self::EncodeChunked => buf.write_chunked(bytes),
            Self::Length(ref mut rem) => {
                let len = bytes.len() as u64;
                if *rem >= len {
                    buf.write_bytes(bytes);
                    *rem -= len;
                } else {
                    let rem = mem::replace(rem, 0u64);
                    buf.write_bytes(bytes.split_to(rem as usize));
                }
            }
            Self::Eof => tracing::warn!(target: "h1_encode", "body bytes produced for a bodiless response"),
            _ => unreachable!("decode variant used for response encoding"),
        }
    }

    /// Finish body encoding.
    pub fn encode_eof<W>(&mut self, buf: &mut W)
    where
        W: H1BufWrite,
    {
        match *self {
            Self::Eof | Self::Upgrade | Self::Length(0) => {}
            Self::EncodeChunked => buf.write_static(b"0\r\n\r\n"),
            Self::Length(n) => unreachable!("unexpected eof for length body with {n} bytes remaining"),
            _ => unreachable!("decode variant used for response encoding"),
        }
    }

    /// Decode body bytes from the read buffer. See [ChunkResult] for the
    /// possible outcomes.
    pub fn decode(&mut self, src: &mut BytesMut) -> ChunkResult {
        match *self {
            // eof is a distinct one time event so the caller knows the exact
            // moment the body (and its trailer section) completed.
            Self::Length(0) => {
                *self = Self::Eof;
                ChunkResult::Eof(None)
            }
            Self::DecodeChunked(ChunkedState::End, _, ref mut trailer) => {
                let trailer = mem::take(trailer);
                *self = Self::Eof;
                match parse_trailers(trailer) {
                    Ok(map) => ChunkResult::Eof(map),
                    Err(e) => ChunkResult::Err(e),
                }
            }
            Self::Eof => ChunkResult::AlreadyEof,
            ref _this if src.is_empty() => ChunkResult::InsufficientData,
            Self::Length(ref mut rem) => ChunkResult::Ok(bounded_split(rem, src)),
            Self::Upgrade => ChunkResult::Ok(src.split().freeze()),
            Self::DecodeChunked(ref mut state, ref mut size, ref mut trailer) => {
                loop {
                    let mut buf = None;
                    // advance the chunked state machine.
                    *state = match state.step(src, size, &mut buf, trailer) {
                        Ok(Some(state)) => state,
                        Ok(None) => return ChunkResult::InsufficientData,
                        Err(e) => return ChunkResult::Err(e),
                    };

                    if matches!(state, ChunkedState::End) {
                        return self.decode(src);
                    }

                    if let Some(buf) = buf {
                        return ChunkResult::Ok(buf);
                    }
                }
            }
            _ => unreachable!("encode variant used for request decoding"),
        }
    }
}

/// outcome of one [TransferCoding::decode] call.
pub enum ChunkResult {
    /// non empty chunk of body data.
    Ok(Bytes),
    /// io error that bubbles to the connection.
    Err(io::Error),
    /// more input bytes required.
    InsufficientData,
    /// body completed. chunked bodies may carry a trailer field set.
    Eof(Option<HeaderMap>),
    /// body already completed earlier. hints the caller to stop feeding.
    AlreadyEof,
}

impl fmt::Display for ChunkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Ok(_) => f.write_str("chunked data."),
            Self::InsufficientData => f.write_str("no sufficient data. more input bytes required."),
            Self::Eof(_) => f.write_str("coder reached EOF state. no more chunk can be produced."),
            Self::AlreadyEof => f.write_str("coder already reached EOF state. no more chunk can be produced."),
            Self::Err(ref e) => fmt::Display::fmt(e, f),
        }
    }
}

fn bounded_split(rem: &mut u64, buf: &mut BytesMut) -> Bytes {
    let len = buf.len() as u64;
    if *rem >= len {
        *rem -= len;
        buf.split().freeze()
    } else {
        let rem = mem::replace(rem, 0);
        buf.split_to(rem as usize).freeze()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::util::buffered::WriteBuf;

    fn buf_from(s: &str) -> BytesMut {
        BytesMut::from(s.as_bytes())
    }

    #[test]
    fn read_chunk_size() {
        use std::io::ErrorKind::{InvalidData, InvalidInput, UnexpectedEof};

        fn read(s: &str) -> u64 {
            let mut state = ChunkedState::Size;
            let rdr = &mut buf_from(s);
            let mut size = 0;
            let mut trailer = BytesMut::new();
            loop {
                let result = state.step(rdr, &mut size, &mut None, &mut trailer);
                state = result.unwrap_or_else(|_| panic!("read_size failed for {s:?}")).unwrap();
                if state == ChunkedState::Body || state == ChunkedState::EndCr {
                    break;
                }
            }
            size
        }

        fn read_err(s: &str, expected_err: std::io::ErrorKind) {
            let mut state = ChunkedState::Size;
            let rdr = &mut buf_from(s);
            let mut size = 0;
            let mut trailer = BytesMut::new();
            loop {
                let result = state.step(rdr, &mut size, &mut None, &mut trailer);
                state = match result {
                    Ok(Some(s)) => s,
                    Ok(None) => return assert_eq!(expected_err, UnexpectedEof),
                    Err(e) => {
                        assert_eq!(expected_err, e.kind(), "reading {s:?}");
                        return;
                    }
                };
                if state == ChunkedState::Body || state == ChunkedState::End {
                    panic!("was Ok. expected Err for {s:?}");
                }
            }
        }

        assert_eq!(1, read("1\r\n"));
        assert_eq!(1, read("01\r\n"));
        assert_eq!(0, read("0\r\n"));
        assert_eq!(10, read("A\r\n"));
        assert_eq!(10, read("a\r\n"));
        assert_eq!(255, read("Ff\r\n"));
        assert_eq!(255, read("Ff   \r\n"));
        // missing LF or CRLF
        read_err("F\rF", InvalidInput);
        read_err("F", UnexpectedEof);
        // invalid hex digit
        read_err("X\r\n", InvalidInput);
        read_err("1X\r\n", InvalidInput);
        read_err("-\r\n", InvalidInput);
        // extensions do not influence the size
        assert_eq!(1, read("1;extension\r\n"));
        assert_eq!(10, read("a;ext name=value\r\n"));
        assert_eq!(1, read("1;;;  ;\r\n"));
        assert_eq!(3, read("3   ; extension=123\r\n"));
        // invalid extensions cause an error
        read_err("1 invalid extension\r\n", InvalidInput);
        read_err("1;no CRLF", UnexpectedEof);
        read_err("1;reject\nnewlines\r\n", InvalidData);
        // overflow
        read_err("f0000000000000003\r\n", InvalidData);
    }

    #[test]
    fn read_chunked_single_read() {
        let mock_buf = &mut buf_from("10\r\n1234567890abcdef\r\n0\r\n");

        match TransferCoding::decode_chunked().decode(mock_buf) {
            ChunkResult::Ok(buf) => {
                assert_eq!(16, buf.len());
                assert_eq!(&buf[..], b"1234567890abcdef");
            }
            state => panic!("{state}"),
        }
    }

    #[test]
    fn read_chunked_after_eof() {
        let mock_buf = &mut buf_from("10\r\n1234567890abcdef\r\n0\r\n\r\n");
        let mut decoder = TransferCoding::decode_chunked();

        // normal read
        match decoder.decode(mock_buf) {
            ChunkResult::Ok(buf) => assert_eq!(&buf[..], b"1234567890abcdef"),
            state => panic!("{state}"),
        }

        // eof read. no trailer section.
        match decoder.decode(mock_buf) {
            ChunkResult::Eof(None) => {}
            state => panic!("{state}"),
        }

        // already met eof
        match decoder.decode(mock_buf) {
            ChunkResult::AlreadyEof => {}
            state => panic!("{state}"),
        }
    }

    #[test]
    fn read_chunked_trailers() {
        let mock_buf = &mut buf_from("3\r\nfoo\r\n0\r\nx-checksum: abc\r\ncontent-length: 3\r\n\r\n");
        let mut decoder = TransferCoding::decode_chunked();

        match decoder.decode(mock_buf) {
            ChunkResult::Ok(buf) => assert_eq!(&buf[..], b"foo"),
            state => panic!("{state}"),
        }

        match decoder.decode(mock_buf) {
            ChunkResult::Eof(Some(trailers)) => {
                assert_eq!(trailers.get("x-checksum").unwrap(), "abc");
                // framing fields are dropped from the trailer set.
                assert!(trailers.get("content-length").is_none());
            }
            state => panic!("{state}"),
        }
    }

    #[test]
    fn read_chunked_trailer_with_missing_lf() {
        let mock_buf = &mut buf_from("10\r\n1234567890abcdef\r\n0\r\nbad\r\r\n");
        let mut decoder = TransferCoding::decode_chunked();

        match decoder.decode(mock_buf) {
            ChunkResult::Ok(_) => {}
            state => panic!("{state}"),
        }

        match decoder.decode(mock_buf) {
            ChunkResult::Err(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
            state => panic!("{state}"),
        }
    }

    #[test]
    fn length_decode_conflict() {
        let mut coding = TransferCoding::length(3);
        assert!(coding.try_set(TransferCoding::decode_chunked()).is_err());

        let mut coding = TransferCoding::decode_chunked();
        assert!(coding.try_set(TransferCoding::length(3)).is_err());
    }

    #[test]
    fn encode_chunked() {
        let mut encoder = TransferCoding::encode_chunked();
        let dst = &mut WriteBuf::new(1024);

        encoder.encode(Bytes::from("foo bar"), dst);
        assert_eq!(dst.bytes(), b"7\r\nfoo bar\r\n");

        encoder.encode(Bytes::from("baz quux herp"), dst);
        assert_eq!(dst.bytes(), b"7\r\nfoo bar\r\nD\r\nbaz quux herp\r\n");

        encoder.encode_eof(dst);
        assert_eq!(dst.bytes(), b"7\r\nfoo bar\r\nD\r\nbaz quux herp\r\n0\r\n\r\n");
    }

    #[test]
    fn encode_length() {
        let max_len = 8;
        let mut encoder = TransferCoding::length(max_len as u64);
        let dst = &mut WriteBuf::new(1024);

        encoder.encode(Bytes::from("foo bar"), dst);
        assert_eq!(dst.bytes(), b"foo bar");

        for _ in 0..8 {
            encoder.encode(Bytes::from("baz"), dst);
            assert_eq!(dst.bytes().len(), max_len);
            assert_eq!(dst.bytes(), b"foo barb");
        }

        encoder.encode_eof(dst);
        assert_eq!(dst.bytes(), b"foo barb");
    }
}
