//! listener and stream types crossing between the accept loops and the
//! per connection services.

use std::{io, net};

use tracing::info;

/// an accepted endpoint. carried as a std stream so the receiving service
/// registers it with its own runtime.
pub enum Stream {
    Tcp(net::TcpStream, net::SocketAddr),
}

/// delayed conversion into a bound, non blocking listener so bind and
/// registration errors surface from server start.
pub trait IntoListener: Send {
    fn into_listener(&mut self) -> io::Result<net::TcpListener>;
}

impl IntoListener for Option<net::TcpListener> {
    fn into_listener(&mut self) -> io::Result<net::TcpListener> {
        let listener = self
            .take()
            .ok_or_else(|| io::Error::other("listener already consumed"))?;
        listener.set_nonblocking(true)?;
        info!("started tcp listening on: {:?}", listener.local_addr().ok());
        Ok(listener)
    }
}
