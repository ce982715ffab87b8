use std::{collections::HashMap, io, net, time::Duration};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::{
    net::IntoListener,
    server::{
        service::{BuildServiceFn, Factory, ServiceFactory},
        Server, ServerFuture,
    },
};

pub struct Builder {
    pub(crate) worker_threads: usize,
    pub(crate) listeners: HashMap<String, Vec<Box<dyn IntoListener>>>,
    pub(crate) factories: HashMap<String, Box<dyn ServiceFactory>>,
    pub(crate) enable_signal: bool,
    pub(crate) shutdown_timeout: Duration,
    backlog: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism().map(|size| size.get()).unwrap_or(1),
            listeners: HashMap::new(),
            factories: HashMap::new(),
            enable_signal: true,
            shutdown_timeout: Duration::from_secs(30),
            backlog: 2048,
        }
    }

    /// number of worker threads, each running its own accept loop per
    /// listener and serving the connections it accepted.
    ///
    /// default is the available logical cpu count.
    ///
    /// # Panics
    /// when receiving 0 as worker thread count.
    pub fn worker_threads(mut self, num: usize) -> Self {
        assert_ne!(num, 0, "there must be at least one worker thread");
        self.worker_threads = num;
        self
    }

    /// disable os signal handling. the server then stops through
    /// [ServerHandle](crate::server::ServerHandle) only.
    pub fn disable_signal(mut self) -> Self {
        self.enable_signal = false;
        self
    }

    /// window for graceful worker shutdown in seconds. connections alive
    /// past it are force dropped.
    ///
    /// default is 30 seconds.
    pub fn shutdown_timeout(mut self, secs: u64) -> Self {
        self.shutdown_timeout = Duration::from_secs(secs);
        self
    }

    /// accept queue length of subsequently bound listeners.
    pub fn backlog(mut self, num: u32) -> Self {
        self.backlog = num;
        self
    }

    /// serve connections of a pre bound listener with services built by
    /// `factory`. `factory` runs once per worker thread.
    pub fn listen<N, F>(mut self, name: N, listener: net::TcpListener, factory: F) -> Self
    where
        N: AsRef<str>,
        F: BuildServiceFn,
    {
        self.listeners
            .entry(name.as_ref().to_string())
            .or_default()
            .push(Box::new(Some(listener)));

        self.factories
            .insert(name.as_ref().to_string(), Factory::new_boxed(factory));

        self
    }

    /// bind to the address and serve its connections. port 0 binds an
    /// ephemeral port.
    pub fn bind<N, A, F>(self, name: N, addr: A, factory: F) -> io::Result<Self>
    where
        N: AsRef<str>,
        A: net::ToSocketAddrs,
        F: BuildServiceFn,
    {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "can not resolve socket address"))?;

        let socket = if addr.is_ipv4() {
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?
        } else {
            Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?
        };
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(self.backlog as _)?;

        let listener = net::TcpListener::from(socket);

        Ok(self.listen(name, listener, factory))
    }

    pub fn build(self) -> ServerFuture {
        let enable_signal = self.enable_signal;
        match Server::new(self) {
            Ok(server) => ServerFuture::Init { server, enable_signal },
            Err(e) => ServerFuture::Error(e),
        }
    }
}
