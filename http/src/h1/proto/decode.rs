use bytes::{Buf, Bytes, BytesMut};
use http::{
    header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, EXPECT, HOST, TRANSFER_ENCODING, UPGRADE},
    uri::{Authority, Scheme},
    Method, Request, Uri, Version,
};
use httparse::Status;

use crate::config::{HttpCompliance, HttpConfig};

use super::{
    codec::TransferCoding,
    context::{ConnectionType, Context},
    error::ProtoError,
};

// client side connection preface of http/2. a client talking http/2 without
// prior negotiation opens with this instead of a request line.
const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// outcome of decoding the head of the read buffer.
pub enum Decoded {
    /// a complete http/1 request head with its body decoder.
    Head(Request<()>, TransferCoding),
    /// the connection opened with the http/2 preface. the preface bytes are
    /// left in the buffer for the next protocol.
    H2Preface,
}

impl<D> Context<'_, D> {
    /// decode a request head and derive the body decoder from it.
    pub fn decode_head(&mut self, buf: &mut BytesMut, cfg: &HttpConfig) -> Result<Option<Decoded>, ProtoError> {
        if buf.starts_with(b"PRI ") || (!buf.is_empty() && H2_PREFACE.starts_with(&buf[..])) {
            return if buf.len() >= H2_PREFACE.len() {
                if &buf[..H2_PREFACE.len()] == H2_PREFACE {
                    Ok(Some(Decoded::H2Preface))
                } else {
                    Err(ProtoError::UpgradeRequired)
                }
            } else if H2_PREFACE.starts_with(&buf[..]) {
                // incomplete preface. read more.
                Ok(None)
            } else {
                Err(ProtoError::UpgradeRequired)
            };
        }

        let mut headers = vec![httparse::EMPTY_HEADER; cfg.header_limit];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(buf)? {
            Status::Complete(len) => {
                if len > cfg.request_header_size {
                    return Err(ProtoError::HeaderTooLarge);
                }

                // reset request scoped state for the new head.
                self.reset();

                let method = Method::from_bytes(req.method.unwrap().as_bytes())?;

                // body decoder default derived from the method.
                let mut decoder = match method {
                    Method::CONNECT => {
                        self.set_connect_method();
                        TransferCoding::upgrade()
                    }
                    Method::HEAD => {
                        self.set_head_method();
                        TransferCoding::eof()
                    }
                    _ => TransferCoding::eof(),
                };

                // persistence default from the version, refined by the
                // connection header below.
                let version = if req.version.unwrap() == 1 {
                    self.set_ctype(if cfg.persistent_connections_enabled {
                        ConnectionType::KeepAlive
                    } else {
                        ConnectionType::Close
                    });
                    Version::HTTP_11
                } else {
                    self.set_ctype(ConnectionType::Close);
                    Version::HTTP_10
                };

                // record offsets of the request target and header fields so
                // both can borrow from the split off head bytes.
                let path = req.path.unwrap();
                let path_head = path.as_ptr() as usize - buf.as_ptr() as usize;
                let path_len = path.len();

                let header_idx = record_header_indices(buf, req.headers);
                let slice = buf.split_to(len).freeze();

                let mut uri = Uri::from_maybe_shared(slice.slice(path_head..path_head + path_len))?.into_parts();

                let mut header_map = self.take_headers();
                header_map.reserve(header_idx.len());

                for idx in &header_idx {
                    self.try_write_header(&mut header_map, &mut decoder, idx, &slice, version, cfg)?;
                }

                // a zero content-length took part in the conflict checks
                // above but means no body at all.
                if matches!(decoder, TransferCoding::Length(0)) {
                    decoder = TransferCoding::eof();
                }

                // CONNECT tunnels end http/1 processing on this connection.
                if self.is_connect_method() {
                    self.set_ctype(ConnectionType::Close);
                }

                // fall back to the host header for the authority part.
                if uri.authority.is_none() {
                    if let Some(host) = header_map.get(HOST) {
                        uri.authority = Some(Authority::try_from(host.as_bytes()).map_err(ProtoError::Uri)?);
                    }
                }

                // authority-form targets (CONNECT) have no path to hang a
                // scheme on.
                if uri.authority.is_some() && uri.scheme.is_none() && uri.path_and_query.is_some() {
                    uri.scheme = Some(if self.is_tls { Scheme::HTTPS } else { Scheme::HTTP });
                }

                let uri = Uri::from_parts(uri)?;

                let mut request = Request::new(());
                *request.method_mut() = method;
                *request.version_mut() = version;
                *request.uri_mut() = uri;
                *request.headers_mut() = header_map;

                Ok(Some(Decoded::Head(request, decoder)))
            }

            Status::Partial => {
                if buf.remaining() >= cfg.request_header_size {
                    Err(ProtoError::HeaderTooLarge)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn try_write_header(
        &mut self,
        headers: &mut HeaderMap,
        decoder: &mut TransferCoding,
        idx: &HeaderIndex,
        slice: &Bytes,
        version: Version,
        cfg: &HttpConfig,
    ) -> Result<(), ProtoError> {
        let name = HeaderName::from_bytes(&slice[idx.name.0..idx.name.1]).map_err(|_| ProtoError::HeaderName)?;
        let value =
            HeaderValue::from_maybe_shared(slice.slice(idx.value.0..idx.value.1)).map_err(|_| ProtoError::HeaderValue)?;

        match name {
            TRANSFER_ENCODING => {
                if version != Version::HTTP_11 {
                    return Err(ProtoError::HeaderName);
                }
                for val in value.to_str().map_err(|_| ProtoError::HeaderValue)?.split(',') {
                    if val.trim().eq_ignore_ascii_case("chunked") {
                        decoder.try_set(TransferCoding::decode_chunked())?;
                    }
                }
            }
            CONTENT_LENGTH => {
                let len = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or(ProtoError::ContentLength)?;

                // identical repeated lengths collapse in legacy mode. every
                // other combination of framing headers, zero valued lengths
                // included, must pass the conflict check.
                let duplicate_identical = matches!(*decoder, TransferCoding::Length(l) if l == len);
                if !(duplicate_identical && cfg.http_compliance == HttpCompliance::Legacy) {
                    decoder.try_set(TransferCoding::length(len))?;
                }
            }
            CONNECTION => {
                for val in value.to_str().map_err(|_| ProtoError::HeaderValue)?.split(',') {
                    let val = val.trim();
                    if val.eq_ignore_ascii_case("keep-alive") {
                        if cfg.persistent_connections_enabled {
                            self.set_ctype(ConnectionType::KeepAlive);
                        }
                    } else if val.eq_ignore_ascii_case("close") {
                        self.set_ctype(ConnectionType::Close);
                    } else if val.eq_ignore_ascii_case("upgrade") {
                        self.set_connection_upgrade();
                    }
                }
            }
            EXPECT => {
                let val = value.to_str().map_err(|_| ProtoError::HeaderValue)?.trim();
                if val.eq_ignore_ascii_case("100-continue") {
                    // an expectation is an http/1.1 construct. 1.0 clients
                    // sending one are ignored.
                    if version == Version::HTTP_11 {
                        self.set_expect_header();
                    }
                } else if !val.eq_ignore_ascii_case("102-processing")
                    && version == Version::HTTP_11
                    && cfg.http_compliance == HttpCompliance::Strict
                {
                    return Err(ProtoError::UnknownExpectation);
                }
            }
            UPGRADE => {
                // upgrades are only defined for http/1.1.
                if version == Version::HTTP_11 {
                    self.set_upgrade_candidate();
                }
            }
            _ => {}
        }

        headers.append(name, value);

        Ok(())
    }
}

#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

// record pointer offsets of parsed headers relative to the buffer they
// borrow from, so the values can be re-sliced from the frozen head bytes.
fn record_header_indices(buf: &[u8], headers: &[httparse::Header<'_>]) -> Vec<HeaderIndex> {
    let base = buf.as_ptr() as usize;
    headers
        .iter()
        .map(|header| {
            let name_start = header.name.as_ptr() as usize - base;
            let value_start = header.value.as_ptr() as usize - base;
            HeaderIndex {
                name: (name_start, name_start + header.name.len()),
                value: (value_start, value_start + header.value.len()),
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx() -> Context<'static, ()> {
        Context::new(crate::unspecified_socket_addr(), &(), false)
    }

    fn decode(ctx: &mut Context<'_, ()>, cfg: &HttpConfig, head: &[u8]) -> Result<Option<Decoded>, ProtoError> {
        let mut buf = BytesMut::from(head);
        ctx.decode_head(&mut buf, cfg)
    }

    fn decode_ok(ctx: &mut Context<'_, ()>, cfg: &HttpConfig, head: &[u8]) -> (Request<()>, TransferCoding) {
        match decode(ctx, cfg, head) {
            Ok(Some(Decoded::Head(req, decoder))) => (req, decoder),
            _ => panic!("expected a complete request head"),
        }
    }

    #[test]
    fn persistence_by_version_and_connection_header() {
        let cfg = HttpConfig::new();
        let mut ctx = ctx();

        decode_ok(&mut ctx, &cfg, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(ctx.ctype(), ConnectionType::KeepAlive);

        decode_ok(&mut ctx, &cfg, b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
        assert_eq!(ctx.ctype(), ConnectionType::Close);

        decode_ok(&mut ctx, &cfg, b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(ctx.ctype(), ConnectionType::Close);

        decode_ok(&mut ctx, &cfg, b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(ctx.ctype(), ConnectionType::KeepAlive);

        // keep-alive is not honored when persistent connections are off.
        let cfg = HttpConfig::new().persistent_connections_enabled(false);
        decode_ok(&mut ctx, &cfg, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(ctx.ctype(), ConnectionType::Close);
    }

    #[test]
    fn connect_is_never_persistent() {
        let cfg = HttpConfig::new();
        let mut ctx = ctx();

        let (_, decoder) = decode_ok(&mut ctx, &cfg, b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert!(decoder.is_upgrade());
        assert!(ctx.is_connect_method());
        assert_eq!(ctx.ctype(), ConnectionType::Close);
    }

    #[test]
    fn content_length_conflicts_chunked() {
        let cfg = HttpConfig::new();
        let mut ctx = ctx();

        let res = decode(
            &mut ctx,
            &cfg,
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(matches!(res, Err(ProtoError::ContentLength)));
    }

    #[test]
    fn duplicate_content_length() {
        let mut ctx = ctx();

        let head: &[u8] = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nContent-Length: 3\r\n\r\n";

        let res = decode(&mut ctx, &HttpConfig::new(), head);
        assert!(matches!(res, Err(ProtoError::ContentLength)));

        let cfg = HttpConfig::new().http_compliance(HttpCompliance::Legacy);
        let (_, decoder) = decode_ok(&mut ctx, &cfg, head);
        assert_eq!(decoder, TransferCoding::length(3));
    }

    #[test]
    fn differing_content_length_with_zero() {
        let mut ctx = ctx();

        // differing duplicate lengths are invalid framing even when one of
        // them is zero, in either order and in both compliance modes.
        let zero_first: &[u8] = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\nContent-Length: 5\r\n\r\n";
        let zero_last: &[u8] = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nContent-Length: 0\r\n\r\n";

        for head in [zero_first, zero_last] {
            let res = decode(&mut ctx, &HttpConfig::new(), head);
            assert!(matches!(res, Err(ProtoError::ContentLength)));

            let cfg = HttpConfig::new().http_compliance(HttpCompliance::Legacy);
            let res = decode(&mut ctx, &cfg, head);
            assert!(matches!(res, Err(ProtoError::ContentLength)));
        }

        // a lone zero length still means no body.
        let (_, decoder) = decode_ok(
            &mut ctx,
            &HttpConfig::new(),
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(decoder.is_eof());

        // and a zero length conflicts with chunked framing like any other.
        let res = decode(
            &mut ctx,
            &HttpConfig::new(),
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(matches!(res, Err(ProtoError::ContentLength)));
    }

    #[test]
    fn unknown_expectation() {
        let cfg = HttpConfig::new();
        let mut ctx = ctx();

        let res = decode(&mut ctx, &cfg, b"GET / HTTP/1.1\r\nHost: x\r\nExpect: the-cheese\r\n\r\n");
        assert!(matches!(res, Err(ProtoError::UnknownExpectation)));

        // recognized tokens pass.
        decode_ok(&mut ctx, &cfg, b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 1\r\nExpect: 100-continue\r\n\r\n");
        assert!(ctx.is_expect_header());

        // 1.0 requests carry no expectations.
        decode_ok(&mut ctx, &cfg, b"GET / HTTP/1.0\r\nExpect: the-cheese\r\n\r\n");
    }

    #[test]
    fn upgrade_request_flags() {
        let cfg = HttpConfig::new();
        let mut ctx = ctx();

        decode_ok(
            &mut ctx,
            &cfg,
            b"GET / HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n",
        );
        assert!(ctx.is_upgrade_request());

        // without the connection token the upgrade header is inert.
        decode_ok(&mut ctx, &cfg, b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: h2c\r\n\r\n");
        assert!(!ctx.is_upgrade_request());
    }

    #[test]
    fn header_size_boundary() {
        let mut ctx = ctx();

        let head = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";

        // exactly at the limit is accepted.
        let cfg = HttpConfig::new().request_header_size(head.len());
        decode_ok(&mut ctx, &cfg, head);

        // one byte short of fitting answers 431.
        let cfg = HttpConfig::new().request_header_size(head.len() - 1);
        let res = decode(&mut ctx, &cfg, head);
        assert!(matches!(res, Err(ProtoError::HeaderTooLarge)));
    }

    #[test]
    fn h2_preface_detected() {
        let cfg = HttpConfig::new();
        let mut ctx = ctx();

        let mut buf = BytesMut::from(&b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"[..]);
        assert!(matches!(ctx.decode_head(&mut buf, &cfg), Ok(Some(Decoded::H2Preface))));
        // preface bytes stay in the buffer for the next protocol.
        assert_eq!(buf.len(), 24);

        // a partial preface asks for more bytes.
        let mut buf = BytesMut::from(&b"PRI * HT"[..]);
        assert!(matches!(ctx.decode_head(&mut buf, &cfg), Ok(None)));
    }

    #[test]
    fn authority_from_host_header() {
        let cfg = HttpConfig::new();
        let mut ctx = Context::new(crate::unspecified_socket_addr(), &(), true);

        let (req, _) = decode_ok(&mut ctx, &cfg, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(req.uri().scheme(), Some(&Scheme::HTTPS));
        assert_eq!(req.uri().authority(), Some(&Authority::from_static("example.com")));
    }

    #[test]
    fn transfer_encoding_list_value() {
        let cfg = HttpConfig::new();
        let mut ctx = ctx();

        let (_, decoder) = decode_ok(
            &mut ctx,
            &cfg,
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
        );
        assert!(matches!(decoder, TransferCoding::DecodeChunked(..)));

        // transfer-encoding is not a thing on http/1.0.
        let res = decode(&mut ctx, &cfg, b"POST / HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert!(matches!(res, Err(ProtoError::HeaderName)));
    }
}
