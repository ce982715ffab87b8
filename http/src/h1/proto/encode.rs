use bytes::BytesMut;
use http::{
    header::{HeaderMap, CONNECTION, CONTENT_LENGTH, DATE, SERVER, SET_COOKIE, TE, TRANSFER_ENCODING},
    response::Parts,
    StatusCode, Version,
};
use tracing::{debug, error};

use crate::{
    body::BodySize,
    config::HttpConfig,
    date::{DateTime, DATE_VALUE_LENGTH},
};

use super::{
    buf_write::H1BufWrite,
    codec::TransferCoding,
    context::{ConnectionType, Context},
    error::ProtoError,
};

pub(crate) const CONTINUE: &[u8; 25] = b"HTTP/1.1 100 Continue\r\n\r\n";

const CHUNKED_HEADER: &[u8] = b"\r\ntransfer-encoding: chunked";
const CLOSE_HEADER: &[u8] = b"\r\nconnection: close";
const KEEP_ALIVE_HEADER: &[u8] = b"\r\nconnection: keep-alive";

const SERVER_NAME: &str = concat!("joist/", env!("CARGO_PKG_VERSION"));

impl<D> Context<'_, D>
where
    D: DateTime,
{
    /// write the interim continue response. not a committed response; the
    /// final head follows later.
    pub fn encode_continue<W>(&mut self, buf: &mut W)
    where
        W: H1BufWrite,
    {
        buf.write_static(CONTINUE);
    }

    pub fn encode_head<W>(
        &mut self,
        parts: Parts,
        size: BodySize,
        cfg: &HttpConfig,
        buf: &mut W,
    ) -> Result<TransferCoding, ProtoError>
    where
        W: H1BufWrite,
    {
        buf.write_head(|buf| self.encode_head_inner(parts, size, cfg, buf))
    }

    fn encode_head_inner(
        &mut self,
        parts: Parts,
        size: BodySize,
        cfg: &HttpConfig,
        buf: &mut BytesMut,
    ) -> Result<TransferCoding, ProtoError> {
        let Parts {
            mut headers,
            version,
            status,
            ..
        } = parts;

        // decide whether body framing headers would be skipped entirely.
        let skip_framing = match status {
            StatusCode::SWITCHING_PROTOCOLS => true,
            // framing headers on a successful CONNECT are forbidden.
            s if self.is_connect_method() && s.is_success() => true,
            s if s.is_informational() => {
                error!(target: "h1_encode", "interim response with 1xx status code not supported");
                return Err(ProtoError::Status);
            }
            s if s == StatusCode::NO_CONTENT || s == StatusCode::NOT_MODIFIED => true,
            _ => false,
        };

        let start = buf.len();

        encode_version_status_reason(buf, version, status);

        let encoding = self.encode_headers(&mut headers, size, version, cfg, buf, skip_framing)?;

        if buf.len() - start > cfg.response_header_size {
            return Err(ProtoError::Status);
        }

        // hand the drained header map back for the next response.
        headers.clear();
        self.replace_headers(headers);

        Ok(encoding)
    }

    fn encode_headers(
        &mut self,
        headers: &mut HeaderMap,
        size: BodySize,
        version: Version,
        cfg: &HttpConfig,
        buf: &mut BytesMut,
        mut skip_framing: bool,
    ) -> Result<TransferCoding, ProtoError> {
        let mut skip_date = false;
        let mut skip_server = false;

        // drain yields `None` for values continuing the previous name. use
        // the shortest header name as the initial placeholder.
        let mut name = TE;

        let mut encoding = TransferCoding::eof();

        for (next_name, value) in headers.drain() {
            let mut is_continuation = next_name
                .map(|next_name| {
                    name = next_name;
                    false
                })
                .unwrap_or(true);

            match name {
                CONNECTION => {
                    if self.ctype() == ConnectionType::Close {
                        // the close header is written once at the end.
                        continue;
                    }
                    let mut close = false;
                    for val in value.to_str().map_err(|_| ProtoError::HeaderValue)?.split(',') {
                        close |= val.trim().eq_ignore_ascii_case("close");
                    }
                    if close {
                        self.set_ctype(ConnectionType::Close);
                        continue;
                    }
                }
                DATE => skip_date = true,
                SERVER => skip_server = true,
                CONTENT_LENGTH => {
                    let len = value
                        .to_str()
                        .ok()
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .ok_or(ProtoError::ContentLength)?;
                    encoding = TransferCoding::length(len);
                    skip_framing = true;
                }
                TRANSFER_ENCODING => {
                    for val in value.to_str().map_err(|_| ProtoError::HeaderValue)?.split(',') {
                        if val.trim().eq_ignore_ascii_case("chunked") {
                            encoding = TransferCoding::encode_chunked();
                            skip_framing = true;
                        }
                    }
                }
                // multiple header lines for set-cookie are the norm.
                SET_COOKIE => is_continuation = false,
                _ => {}
            }

            let value = value.as_bytes();

            if is_continuation {
                buf.reserve(value.len() + 2);
                buf.extend_from_slice(b", ");
                buf.extend_from_slice(value);
            } else {
                let name = name.as_str().as_bytes();
                buf.reserve(name.len() + value.len() + 4);
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(name);
                buf.extend_from_slice(b": ");
                buf.extend_from_slice(value);
            }
        }

        if self.is_head_method() {
            // a response to HEAD keeps its framing headers but never a body.
            if !skip_framing {
                match size {
                    BodySize::None | BodySize::Sized(0) => write_length_header(buf, 0),
                    BodySize::Sized(size) => write_length_header(buf, size),
                    BodySize::Stream => buf.extend_from_slice(CHUNKED_HEADER),
                }
            }
            encoding = TransferCoding::eof();
        } else if !skip_framing {
            match size {
                BodySize::None | BodySize::Sized(0) => {
                    write_length_header(buf, 0);
                    encoding = TransferCoding::eof();
                }
                BodySize::Sized(size) => {
                    write_length_header(buf, size);
                    encoding = TransferCoding::length(size as u64);
                }
                BodySize::Stream => {
                    if version == Version::HTTP_10 {
                        // chunked does not exist on http/1.0. stream until
                        // close instead.
                        self.set_ctype(ConnectionType::Close);
                        encoding = TransferCoding::upgrade();
                    } else {
                        encoding = TransferCoding::encode_chunked();
                        buf.extend_from_slice(CHUNKED_HEADER);
                    }
                }
            }
        }

        match self.ctype() {
            ConnectionType::Close => buf.extend_from_slice(CLOSE_HEADER),
            // persistence is implicit on http/1.1. only 1.0 needs it spelled.
            ConnectionType::KeepAlive if version == Version::HTTP_10 => buf.extend_from_slice(KEEP_ALIVE_HEADER),
            _ => {}
        }

        if cfg.send_server_version && !skip_server {
            buf.reserve(SERVER_NAME.len() + 10);
            buf.extend_from_slice(b"\r\nserver: ");
            buf.extend_from_slice(SERVER_NAME.as_bytes());
        }

        if cfg.send_x_powered_by {
            buf.extend_from_slice(b"\r\nx-powered-by: joist");
        }

        if cfg.send_date_header && !skip_date {
            buf.reserve(DATE_VALUE_LENGTH + 8);
            buf.extend_from_slice(b"\r\ndate: ");
            self.date.with_date(|slice| buf.extend_from_slice(slice));
        }

        buf.extend_from_slice(b"\r\n\r\n");

        Ok(encoding)
    }
}

fn encode_version_status_reason(buf: &mut BytesMut, version: Version, status: StatusCode) {
    match (version, status) {
        // happy path shortcut.
        (Version::HTTP_11, StatusCode::OK) => {
            buf.extend_from_slice(b"HTTP/1.1 200 OK");
            return;
        }
        (Version::HTTP_11, _) => {
            buf.extend_from_slice(b"HTTP/1.1 ");
        }
        (Version::HTTP_10, _) => {
            buf.extend_from_slice(b"HTTP/1.0 ");
        }
        _ => {
            debug!(target: "h1_encode", "response with unexpected version. falling back to http/1.1");
            buf.extend_from_slice(b"HTTP/1.1 ");
        }
    }

    // a reason must be written. many parsers expect one.
    let reason = status.canonical_reason().unwrap_or("<none>").as_bytes();
    let status = status.as_str().as_bytes();
    buf.reserve(status.len() + reason.len() + 1);
    buf.extend_from_slice(status);
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(reason);
}

pub(crate) fn write_length_header(buf: &mut BytesMut, size: usize) {
    let mut buffer = itoa::Buffer::new();
    let formatted = buffer.format(size).as_bytes();

    buf.reserve(formatted.len() + 18);
    buf.extend_from_slice(b"\r\ncontent-length: ");
    buf.extend_from_slice(formatted);
}
