//! Multi threaded tcp server runtime: listener binding, per worker accept
//! loops, graceful shutdown and an external shutdown control socket.

#![forbid(unsafe_code)]

mod builder;
mod signals;
mod worker;

pub mod monitor;
pub mod net;
pub mod server;

pub use builder::Builder;
pub use server::{BuildServiceFn, ServerFuture, ServerHandle};

#[cfg(test)]
mod test {
    use joist_service::fn_build;

    #[test]
    fn builder_binds_ephemeral_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let mut server = crate::Builder::new()
            .worker_threads(1)
            .disable_signal()
            .listen("test", listener, || {
                fn_build(|| async {
                    Ok::<_, core::convert::Infallible>(joist_service::fn_service(
                        |(_, _): (crate::net::Stream, tokio_util::sync::CancellationToken)| async { Ok::<_, ()>(()) },
                    ))
                })
            })
            .build();

        let handle = server.handle().unwrap();
        handle.stop(true);
        server.wait().unwrap();
    }
}
