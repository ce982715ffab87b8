//! Connector identity and wire protocol detection.
//!
//! A [Connector] names one listening endpoint, carries its configuration and
//! its statistics counter group. Protocol negotiation on "auto" endpoints
//! runs a [Detect] chain over the first bytes of a connection before any of
//! them is consumed by a protocol.

use std::{io, sync::Arc};

use bytes::BytesMut;
use tracing::trace;

use crate::{
    config::HttpConfig,
    io::{AsyncIo, Interest},
    stats::ConnectorStats,
};

/// named listening endpoint identity shared by every worker serving it.
pub struct Connector {
    name: String,
    cfg: HttpConfig,
    stats: Arc<ConnectorStats>,
}

impl Connector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cfg: HttpConfig::new(),
            stats: Arc::new(ConnectorStats::new()),
        }
    }

    pub fn config(mut self, cfg: HttpConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn http_config(&self) -> &HttpConfig {
        &self.cfg
    }

    pub fn stats(&self) -> Arc<ConnectorStats> {
        self.stats.clone()
    }
}

/// outcome of one [Detect::detect] probe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Detection {
    Recognized,
    NotRecognized,
    /// undecidable on the bytes seen so far.
    NeedMoreBytes,
}

/// wire protocol probe looking at the initial bytes of a connection
/// without consuming them.
pub trait Detect {
    /// protocol name the probe recognizes.
    fn protocol(&self) -> &'static str;

    fn detect(&self, bytes: &[u8]) -> Detection;
}

/// recognizes a tls client hello.
#[derive(Clone, Copy, Default)]
pub struct TlsDetect;

impl Detect for TlsDetect {
    fn protocol(&self) -> &'static str {
        "tls"
    }

    fn detect(&self, bytes: &[u8]) -> Detection {
        match bytes.first() {
            // tls handshake record type.
            Some(0x16) => Detection::Recognized,
            Some(_) => Detection::NotRecognized,
            None => Detection::NeedMoreBytes,
        }
    }
}

/// recognizes the direct http/2 client preface.
#[derive(Clone, Copy, Default)]
pub struct H2PrefaceDetect;

const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

impl Detect for H2PrefaceDetect {
    fn protocol(&self) -> &'static str {
        "h2c"
    }

    fn detect(&self, bytes: &[u8]) -> Detection {
        if bytes.len() >= H2_PREFACE.len() {
            if bytes.starts_with(H2_PREFACE) {
                Detection::Recognized
            } else {
                Detection::NotRecognized
            }
        } else if H2_PREFACE.starts_with(bytes) {
            Detection::NeedMoreBytes
        } else {
            Detection::NotRecognized
        }
    }
}

/// recognizes the start of a plausible http/1 request line: ascii token
/// bytes followed by a space.
#[derive(Clone, Copy, Default)]
pub struct H1Detect;

impl Detect for H1Detect {
    fn protocol(&self) -> &'static str {
        "http/1.1"
    }

    fn detect(&self, bytes: &[u8]) -> Detection {
        for (idx, &b) in bytes.iter().enumerate() {
            match b {
                b' ' if idx > 0 => return Detection::Recognized,
                b'A'..=b'Z' | b'a'..=b'z' | b'-' => {}
                _ => return Detection::NotRecognized,
            }
        }
        Detection::NeedMoreBytes
    }
}

/// run a detect chain over the given bytes. the first recognizing probe
/// wins. `None` with `need_more` true asks for more input.
pub fn detect_chain(chain: &[&dyn Detect], bytes: &[u8]) -> (Option<&'static str>, bool) {
    let mut need_more = false;
    for detect in chain {
        match detect.detect(bytes) {
            Detection::Recognized => return (Some(detect.protocol()), false),
            Detection::NeedMoreBytes => need_more = true,
            Detection::NotRecognized => {}
        }
    }
    (None, need_more)
}

/// peek at the head of an endpoint until a probe of the chain recognizes
/// its protocol. returns the protocol name and the bytes read so far, which
/// must be handed to the selected protocol as already read input.
///
/// an endpoint nothing recognizes within `limit` bytes is a protocol error.
pub async fn detect<Io>(io: &mut Io, chain: &[&dyn Detect], limit: usize) -> io::Result<(&'static str, BytesMut)>
where
    Io: AsyncIo,
{
    let mut bytes = BytesMut::new();

    loop {
        let (recognized, need_more) = detect_chain(chain, &bytes);

        if let Some(protocol) = recognized {
            trace!(target: "detect", "recognized protocol {protocol}");
            return Ok((protocol, bytes));
        }
        if !need_more || bytes.len() >= limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "initial bytes match no known protocol",
            ));
        }

        io.ready(Interest::READABLE).await?;
        match io.try_read_buf(&mut bytes) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::io::memory;

    #[test]
    fn connector_identity_and_stats() {
        let connector = Connector::new("https").config(HttpConfig::new().request_header_size(4096));

        assert_eq!(connector.name(), "https");
        assert_eq!(connector.http_config().request_header_size, 4096);

        let stats = connector.stats();
        stats.connection_opened();
        assert_eq!(connector.stats().snapshot().connections_open, 1);
    }

    #[test]
    fn chain_first_recognition_wins() {
        let tls = TlsDetect;
        let h2 = H2PrefaceDetect;
        let h1 = H1Detect;
        let chain: [&dyn Detect; 3] = [&tls, &h2, &h1];

        assert_eq!(detect_chain(&chain, &[0x16, 0x03, 0x01]), (Some("tls"), false));
        assert_eq!(detect_chain(&chain, b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"), (Some("h2c"), false));
        assert_eq!(detect_chain(&chain, b"GET / HTTP/1.1\r\n"), (Some("http/1.1"), false));

        // a short http/1 prefix is also a valid h2 preface prefix.
        assert_eq!(detect_chain(&chain, b"PRI"), (None, true));

        assert_eq!(detect_chain(&chain, &[0x00, 0x01]), (None, false));
    }

    #[tokio::test]
    async fn detect_reads_until_recognized() {
        let (mut io, handle) = memory::pair();
        handle.write(b"GE");

        let tls = TlsDetect;
        let h1 = H1Detect;
        let chain: [&dyn Detect; 2] = [&tls, &h1];

        handle.write(b"T / HTTP/1.1\r\n\r\n");
        let (protocol, bytes) = detect(&mut io, &chain, 8192).await.unwrap();
        assert_eq!(protocol, "http/1.1");
        assert_eq!(&bytes[..], b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn unrecognized_input_is_an_error() {
        let (mut io, handle) = memory::pair();
        handle.write(&[0x00, 0x00, 0x00]);

        let h1 = H1Detect;
        let chain: [&dyn Detect; 1] = [&h1];

        let err = detect(&mut io, &chain, 8192).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
