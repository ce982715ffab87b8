//! Request customizers applied in configuration order before handler
//! dispatch. later customizers observe the effects of earlier ones.

use core::net::{IpAddr, SocketAddr};

use http::{
    header::{HeaderValue, HOST},
    uri::{Authority, Scheme, Uri},
    Request, Version,
};
use tracing::debug;

use crate::config::HttpConfig;

/// transport level facts about the connection a request arrived on. stored
/// in the request extensions by the dispatcher.
#[derive(Clone, Debug)]
pub struct ConnectInfo {
    pub peer_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
    pub secure: bool,
    pub tls: Option<TlsInfo>,
}

impl ConnectInfo {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            local_addr: None,
            secure: false,
            tls: None,
        }
    }
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self::new(crate::unspecified_socket_addr())
    }
}

/// negotiated tls session facts attached to requests on secure connections.
#[derive(Clone, Debug, Default)]
pub struct TlsInfo {
    pub cipher_suite: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
    pub server_name: Option<String>,
}

/// pre dispatch hook rewriting the request in place.
pub trait Customizer<ReqB> {
    fn customize(&self, cfg: &HttpConfig, req: &mut Request<ReqB>);
}

/// attach tls session attributes to requests on secure connections and fix
/// up the request scheme.
#[derive(Clone, Copy, Default)]
pub struct SecureRequestCustomizer;

impl<ReqB> Customizer<ReqB> for SecureRequestCustomizer {
    fn customize(&self, _: &HttpConfig, req: &mut Request<ReqB>) {
        let Some(info) = req.extensions().get::<ConnectInfo>() else {
            return;
        };
        if !info.secure {
            return;
        }

        let tls = info.tls.clone();
        with_uri(req, |parts| {
            if parts.authority.is_some() {
                parts.scheme = Some(Scheme::HTTPS);
            }
        });
        if let Some(tls) = tls {
            req.extensions_mut().insert(tls);
        }
    }
}

/// synthesize a `host` header for requests that legally miss one, from the
/// configured server authority or the local address of the connection.
#[derive(Clone, Copy, Default)]
pub struct HostHeaderCustomizer;

impl<ReqB> Customizer<ReqB> for HostHeaderCustomizer {
    fn customize(&self, cfg: &HttpConfig, req: &mut Request<ReqB>) {
        if req.version() != Version::HTTP_10 || req.headers().contains_key(HOST) {
            return;
        }

        let authority = cfg.server_authority.clone().or_else(|| {
            req.extensions()
                .get::<ConnectInfo>()
                .and_then(|info| info.local_addr)
                .and_then(|addr| Authority::try_from(addr.to_string().as_str()).ok())
        });

        let Some(authority) = authority else { return };

        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            req.headers_mut().insert(HOST, value);
        }
        with_uri(req, |parts| {
            if parts.authority.is_none() {
                parts.authority = Some(authority);
            }
        });
    }
}

/// honor `x-forwarded-*` headers set by a trusted downstream proxy. the
/// left-most value of a comma separated list is the farthest downstream
/// client.
#[derive(Clone, Debug)]
pub struct ForwardedRequestCustomizer {
    for_header: &'static str,
    host_header: &'static str,
    proto_header: &'static str,
}

impl Default for ForwardedRequestCustomizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardedRequestCustomizer {
    pub fn new() -> Self {
        Self {
            for_header: "x-forwarded-for",
            host_header: "x-forwarded-host",
            proto_header: "x-forwarded-proto",
        }
    }

    pub fn for_header(mut self, name: &'static str) -> Self {
        self.for_header = name;
        self
    }

    pub fn host_header(mut self, name: &'static str) -> Self {
        self.host_header = name;
        self
    }

    pub fn proto_header(mut self, name: &'static str) -> Self {
        self.proto_header = name;
        self
    }
}

impl<ReqB> Customizer<ReqB> for ForwardedRequestCustomizer {
    fn customize(&self, _: &HttpConfig, req: &mut Request<ReqB>) {
        let mut info = match req.extensions().get::<ConnectInfo>() {
            Some(info) => info.clone(),
            None => return,
        };
        let mut info_changed = false;

        if let Some(client) = leftmost(req.headers().get(self.for_header)) {
            match parse_forwarded_addr(&client) {
                Some(addr) => {
                    info.peer_addr = addr;
                    info_changed = true;
                }
                None => debug!("unparseable forwarded client address: {client}"),
            }
        }

        if let Some(proto) = leftmost(req.headers().get(self.proto_header)) {
            let secure = proto.eq_ignore_ascii_case("https");
            info.secure = secure;
            info_changed = true;
            with_uri(req, |parts| {
                if parts.authority.is_some() {
                    parts.scheme = Some(if secure { Scheme::HTTPS } else { Scheme::HTTP });
                }
            });
        }

        if let Some(host) = leftmost(req.headers().get(self.host_header)) {
            if let Ok(authority) = Authority::try_from(host.as_str()) {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    req.headers_mut().insert(HOST, value);
                }
                with_uri(req, |parts| {
                    parts.authority = Some(authority);
                });
            }
        }

        if info_changed {
            req.extensions_mut().insert(info);
        }
    }
}

fn leftmost(value: Option<&HeaderValue>) -> Option<String> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_forwarded_addr(value: &str) -> Option<SocketAddr> {
    value
        .parse::<SocketAddr>()
        .ok()
        .or_else(|| value.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 0)))
}

// rebuild the request uri through its parts. an edit producing an invalid
// uri is discarded.
fn with_uri<ReqB, F>(req: &mut Request<ReqB>, func: F)
where
    F: FnOnce(&mut http::uri::Parts),
{
    let mut parts = req.uri().clone().into_parts();
    func(&mut parts);
    if parts.authority.is_some() && parts.scheme.is_none() {
        parts.scheme = Some(Scheme::HTTP);
    }
    match Uri::from_parts(parts) {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => debug!("discarding invalid uri rewrite: {e}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(uri: &str) -> Request<()> {
        let mut req = Request::new(());
        *req.uri_mut() = Uri::try_from(uri).unwrap();
        req.extensions_mut().insert(ConnectInfo::new("10.0.0.1:40000".parse().unwrap()));
        req
    }

    #[test]
    fn secure_request_sets_scheme_and_tls_info() {
        let cfg = HttpConfig::new();
        let mut req = request("http://example.com/");
        {
            let info = req.extensions_mut().get_mut::<ConnectInfo>().unwrap();
            info.secure = true;
            info.tls = Some(TlsInfo {
                cipher_suite: Some("TLS13_AES_128_GCM_SHA256".into()),
                ..TlsInfo::default()
            });
        }

        SecureRequestCustomizer.customize(&cfg, &mut req);

        assert_eq!(req.uri().scheme(), Some(&Scheme::HTTPS));
        assert!(req.extensions().get::<TlsInfo>().is_some());
    }

    #[test]
    fn host_header_synthesized_for_http10() {
        let cfg = HttpConfig::new().server_authority(Authority::from_static("srv.example:8080"));

        let mut req = request("/index.html");
        *req.version_mut() = Version::HTTP_10;

        HostHeaderCustomizer.customize(&cfg, &mut req);

        assert_eq!(req.headers().get(HOST).unwrap(), "srv.example:8080");
        assert_eq!(req.uri().authority().map(|a| a.as_str()), Some("srv.example:8080"));

        // present host headers are left alone.
        let mut req = request("/");
        *req.version_mut() = Version::HTTP_10;
        req.headers_mut().insert(HOST, HeaderValue::from_static("other.example"));
        HostHeaderCustomizer.customize(&cfg, &mut req);
        assert_eq!(req.headers().get(HOST).unwrap(), "other.example");
    }

    #[test]
    fn forwarded_leftmost_wins() {
        let cfg = HttpConfig::new();
        let mut req = request("http://internal.example/");
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.9"));
        req.headers_mut()
            .insert("x-forwarded-host", HeaderValue::from_static("public.example"));
        req.headers_mut()
            .insert("x-forwarded-proto", HeaderValue::from_static("https"));

        ForwardedRequestCustomizer::new().customize(&cfg, &mut req);

        let info = req.extensions().get::<ConnectInfo>().unwrap();
        assert_eq!(info.peer_addr.ip().to_string(), "203.0.113.7");
        assert!(info.secure);
        assert_eq!(req.headers().get(HOST).unwrap(), "public.example");
        assert_eq!(req.uri().scheme(), Some(&Scheme::HTTPS));
        assert_eq!(req.uri().authority().map(|a| a.as_str()), Some("public.example"));
    }
}
