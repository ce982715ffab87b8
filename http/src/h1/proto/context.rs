//! Per connection channel state, reused across pipelined requests.

use core::net::SocketAddr;

use http::header::HeaderMap;

/// lifetime of a connection as far as request/response ordering is
/// concerned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionType {
    /// no request decoded yet on this connection.
    Init,
    /// connection persists after the in flight response.
    KeepAlive,
    /// connection closes after the in flight response.
    Close,
    /// connection leaves http/1 after the in flight response.
    Upgrade,
}

// request scoped flags, reset when a new head is decoded.
struct Flags(u8);

impl Flags {
    // `Expect: 100-continue` pending.
    const EXPECT: u8 = 0b_0000_0001;
    // CONNECT method request.
    const CONNECT: u8 = 0b_0000_0010;
    // HEAD method request.
    const HEAD: u8 = 0b_0000_0100;
    // `Upgrade:` header present on an http/1.1 request.
    const UPGRADE_CANDIDATE: u8 = 0b_0000_1000;
    // `Connection:` header contains the upgrade token.
    const CONNECTION_UPGRADE: u8 = 0b_0001_0000;

    const fn new() -> Self {
        Self(0)
    }

    fn insert(&mut self, flag: u8) {
        self.0 |= flag;
    }

    const fn contains(&self, flag: u8) -> bool {
        (self.0 & flag) == flag
    }
}

/// connection specific state driving decode and encode decisions.
pub struct Context<'a, D> {
    addr: SocketAddr,
    ctype: ConnectionType,
    flags: Flags,
    // header map recycled into the next decoded request.
    header_cache: Option<HeaderMap>,
    pub(crate) date: &'a D,
    pub(crate) is_tls: bool,
}

impl<'a, D> Context<'a, D> {
    pub fn new(addr: SocketAddr, date: &'a D, is_tls: bool) -> Self {
        Self {
            addr,
            ctype: ConnectionType::Init,
            flags: Flags::new(),
            header_cache: None,
            date,
            is_tls,
        }
    }

    #[inline]
    pub fn ctype(&self) -> ConnectionType {
        self.ctype
    }

    #[inline]
    pub fn set_ctype(&mut self, ctype: ConnectionType) {
        self.ctype = ctype;
    }

    /// reset request scoped state for the next decoded head.
    pub(super) fn reset(&mut self) {
        self.flags = Flags::new();
    }

    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    /// take the recycled header map or construct a fresh one.
    pub(super) fn take_headers(&mut self) -> HeaderMap {
        self.header_cache.take().unwrap_or_default()
    }

    /// hand a drained header map back for the next request.
    pub(super) fn replace_headers(&mut self, headers: HeaderMap) {
        debug_assert!(headers.is_empty());
        self.header_cache = Some(headers);
    }

    pub(super) fn set_expect_header(&mut self) {
        self.flags.insert(Flags::EXPECT)
    }

    pub(super) fn set_connect_method(&mut self) {
        self.flags.insert(Flags::CONNECT)
    }

    pub(super) fn set_head_method(&mut self) {
        self.flags.insert(Flags::HEAD)
    }

    pub(super) fn set_upgrade_candidate(&mut self) {
        self.flags.insert(Flags::UPGRADE_CANDIDATE)
    }

    pub(super) fn set_connection_upgrade(&mut self) {
        self.flags.insert(Flags::CONNECTION_UPGRADE)
    }

    #[inline]
    pub fn is_expect_header(&self) -> bool {
        self.flags.contains(Flags::EXPECT)
    }

    #[inline]
    pub fn is_connect_method(&self) -> bool {
        self.flags.contains(Flags::CONNECT)
    }

    #[inline]
    pub fn is_head_method(&self) -> bool {
        self.flags.contains(Flags::HEAD)
    }

    /// true when the request asks for a protocol upgrade: an `Upgrade:`
    /// header on http/1.1 with the matching `Connection: upgrade` token.
    #[inline]
    pub fn is_upgrade_request(&self) -> bool {
        self.flags.contains(Flags::UPGRADE_CANDIDATE | Flags::CONNECTION_UPGRADE)
    }
}
