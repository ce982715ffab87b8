//! Embeddable http/1.x server core.
//!
//! joist-http drives the http/1.0 and 1.1 wire state machine over accepted
//! endpoints and hands parsed requests to a composable [handler] tree. The
//! connection machinery (buffers, decode, encode, pipelining, expectations,
//! upgrades) lives in [h1]; [connector] carries endpoint identity, protocol
//! detection and statistics; [customize] rewrites requests before dispatch.

#![forbid(unsafe_code)]

mod builder;

pub mod body;
pub mod config;
pub mod connector;
pub mod customize;
pub mod date;
pub mod error;
pub mod form;
pub mod h1;
pub mod handler;
pub mod io;
pub mod stats;
pub mod tls;
pub mod upgrade;
pub mod util;

pub use self::body::{BodyError, BodySize, ResponseBody};
pub use self::builder::HttpServiceBuilder;
pub use self::config::{HttpCompliance, HttpConfig};
pub use self::connector::Connector;
pub use self::error::HttpServiceError;
pub use self::h1::RequestBody;
pub use self::handler::HandlerDispatch;

pub(crate) fn unspecified_socket_addr() -> core::net::SocketAddr {
    core::net::SocketAddr::V4(core::net::SocketAddrV4::new(core::net::Ipv4Addr::UNSPECIFIED, 0))
}
