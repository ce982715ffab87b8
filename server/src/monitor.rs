//! line protocol control socket for stopping registered servers from
//! outside the process.
//!
//! The protocol is two newline terminated lines: the shared key followed by
//! a command out of `stop`, `forcestop`, `stopexit`, `exit` and `status`.
//! A wrong key closes the connection silently. Binding port 0 picks an
//! ephemeral port and prints `STOP.PORT=<n>` on standard output so wrapper
//! scripts can find it.

use std::{
    io::{self, BufRead, BufReader, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    thread,
};

use tracing::{error, info, warn};

use crate::server::ServerHandle;

/// control socket accepting stop commands for the servers registered with
/// it. modelled as an explicit value: the embedder constructs one and
/// threads handles in, nothing is process global.
pub struct ShutdownMonitor {
    host: IpAddr,
    port: u16,
    key: String,
    // (handle, stops_on_plain_stop)
    registered: Vec<(ServerHandle, bool)>,
}

impl ShutdownMonitor {
    pub fn new(port: u16, key: impl Into<String>) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            key: key.into(),
            registered: Vec::new(),
        }
    }

    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// register a server stopped by the `stop` command (and every stronger
    /// one).
    pub fn register(mut self, handle: ServerHandle) -> Self {
        self.registered.push((handle, true));
        self
    }

    /// register a server only `forcestop` touches.
    pub fn register_manual(mut self, handle: ServerHandle) -> Self {
        self.registered.push((handle, false));
        self
    }

    /// bind the control socket and serve commands on a background thread.
    pub fn start(self) -> io::Result<MonitorHandle> {
        let listener = TcpListener::bind(SocketAddr::new(self.host, self.port))?;
        let port = listener.local_addr()?.port();

        if self.port == 0 {
            // contract with wrapper scripts looking for the ephemeral port.
            println!("STOP.PORT={port}");
        }

        info!("shutdown monitor listening on port {port}");

        let thread = thread::Builder::new()
            .name("joist-shutdown-monitor".into())
            .spawn(move || self.serve(listener))?;

        Ok(MonitorHandle { port, thread })
    }

    fn serve(self, listener: TcpListener) {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!("shutdown monitor accept error: {e}");
                    continue;
                }
            };

            match self.handle_connection(stream) {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!("shutdown monitor connection error: {e}"),
            }
        }
    }

    // returns true when the monitor should stop serving.
    fn handle_connection(&self, stream: TcpStream) -> io::Result<bool> {
        let mut reader = BufReader::new(stream);

        let mut key = String::new();
        reader.read_line(&mut key)?;
        if key.trim_end() != self.key {
            // wrong key. close without a reply.
            return Ok(false);
        }

        let mut command = String::new();
        reader.read_line(&mut command)?;
        let command = command.trim_end();

        info!("shutdown monitor received command: {command}");

        match command {
            "status" => {
                let mut stream = reader.into_inner();
                stream.write_all(b"OK\r\n")?;
                stream.flush()?;
                Ok(false)
            }
            "stop" => {
                self.stop_registered(false);
                Ok(true)
            }
            "forcestop" => {
                self.stop_registered(true);
                Ok(true)
            }
            "stopexit" => {
                self.stop_registered(false);
                drop(reader);
                std::process::exit(0);
            }
            "exit" => {
                drop(reader);
                std::process::exit(0);
            }
            unknown => {
                warn!("shutdown monitor ignoring unknown command: {unknown}");
                Ok(false)
            }
        }
    }

    fn stop_registered(&self, force: bool) {
        for (handle, stops_on_stop) in &self.registered {
            if force || *stops_on_stop {
                handle.stop(!force);
            }
        }
    }
}

/// running monitor. dropping the handle leaves the background thread
/// serving until a stop command arrives.
pub struct MonitorHandle {
    port: u16,
    thread: thread::JoinHandle<()>,
}

impl MonitorHandle {
    /// port the control socket is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// block until the monitor thread ends (a stop command arrived).
    pub fn join(self) {
        let _ = self.thread.join();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Read;

    use tokio::sync::mpsc::unbounded_channel;

    fn handle() -> (ServerHandle, tokio::sync::mpsc::UnboundedReceiver<crate::server::Command>) {
        let (tx, rx) = unbounded_channel();
        (ServerHandle { tx }, rx)
    }

    fn send(port: u16, key: &str, command: &str) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(format!("{key}\n{command}\n").as_bytes()).unwrap();
        stream
    }

    #[test]
    fn status_and_stop() {
        let (server_handle, mut rx) = handle();

        let monitor = ShutdownMonitor::new(0, "secret").register(server_handle);
        let running = monitor.start().unwrap();
        let port = running.port();

        // status replies OK and keeps the monitor alive.
        let mut stream = send(port, "secret", "status");
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "OK\r\n");

        // wrong key closes silently without a reply.
        let mut stream = send(port, "wrong", "status");
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "");

        // stop reaches the registered server and ends the monitor.
        let _ = send(port, "secret", "stop");
        running.join();

        assert!(matches!(rx.try_recv(), Ok(crate::server::Command::GracefulStop)));
    }
}
