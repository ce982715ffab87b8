//! Per connector configuration shared read-only by every connection.

use core::time::Duration;

use http::{uri::Authority, Method};

/// strictness of wire level request handling.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HttpCompliance {
    /// reject protocol violations: duplicate content-length headers and
    /// unknown `Expect:` tokens (answered with 417) are errors.
    Strict,
    /// tolerate common legacy client behaviour: identical duplicate
    /// content-length headers collapse, unknown expectations are ignored.
    Legacy,
}

/// configuration knobs of the http/1 connection machinery. every field has a
/// single effect, documented on its setter.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub(crate) request_header_size: usize,
    pub(crate) response_header_size: usize,
    pub(crate) read_buf_size: usize,
    pub(crate) write_buf_size: usize,
    pub(crate) output_aggregation_size: usize,
    pub(crate) header_limit: usize,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) request_head_timeout: Duration,
    pub(crate) tls_accept_timeout: Duration,
    pub(crate) delay_dispatch_until_content: bool,
    pub(crate) persistent_connections_enabled: bool,
    pub(crate) send_server_version: bool,
    pub(crate) send_date_header: bool,
    pub(crate) send_x_powered_by: bool,
    pub(crate) max_error_dispatches: usize,
    pub(crate) min_request_data_rate: u64,
    pub(crate) min_response_data_rate: u64,
    pub(crate) secure_scheme: &'static str,
    pub(crate) secure_port: u16,
    pub(crate) server_authority: Option<Authority>,
    pub(crate) form_encoded_methods: Vec<Method>,
    pub(crate) http_compliance: HttpCompliance,
    pub(crate) vectored_write: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpConfig {
    pub fn new() -> Self {
        Self {
            request_header_size: 8 * 1024,
            response_header_size: 8 * 1024,
            read_buf_size: 64 * 1024,
            write_buf_size: 32 * 1024,
            output_aggregation_size: 8 * 1024,
            header_limit: 96,
            keep_alive_timeout: Duration::from_secs(30),
            request_head_timeout: Duration::from_secs(5),
            tls_accept_timeout: Duration::from_secs(3),
            delay_dispatch_until_content: true,
            persistent_connections_enabled: true,
            send_server_version: true,
            send_date_header: true,
            send_x_powered_by: false,
            max_error_dispatches: 10,
            min_request_data_rate: 0,
            min_response_data_rate: 0,
            secure_scheme: "https",
            secure_port: 443,
            server_authority: None,
            form_encoded_methods: vec![Method::POST, Method::PUT],
            http_compliance: HttpCompliance::Strict,
            vectored_write: true,
        }
    }

    /// max bytes of request line plus headers. one byte over answers 431.
    pub fn request_header_size(mut self, size: usize) -> Self {
        self.request_header_size = size;
        self
    }

    /// max bytes of a generated response head.
    pub fn response_header_size(mut self, size: usize) -> Self {
        self.response_header_size = size;
        self
    }

    /// read buffer size. reads past it enter backpressure.
    pub fn read_buf_size(mut self, size: usize) -> Self {
        self.read_buf_size = size.max(self.request_header_size);
        self
    }

    /// write buffer size. response body production pauses past it.
    /// aggregation size follows at a quarter of the buffer.
    pub fn write_buf_size(mut self, size: usize) -> Self {
        self.write_buf_size = size;
        self.output_aggregation_size = size / 4;
        self
    }

    /// body chunks at or under this size are copied into the write buffer
    /// instead of queued for gather write.
    pub fn output_aggregation_size(mut self, size: usize) -> Self {
        self.output_aggregation_size = size;
        self
    }

    /// max count of parsed request headers.
    pub fn header_limit(mut self, limit: usize) -> Self {
        self.header_limit = limit;
        self
    }

    /// endpoint idle timeout between requests on a persistent connection.
    pub fn keep_alive_timeout(mut self, dur: Duration) -> Self {
        self.keep_alive_timeout = dur;
        self
    }

    /// time window for receiving the first complete request head.
    pub fn request_head_timeout(mut self, dur: Duration) -> Self {
        self.request_head_timeout = dur;
        self
    }

    /// time window for finishing the tls handshake.
    pub fn tls_accept_timeout(mut self, dur: Duration) -> Self {
        self.tls_accept_timeout = dur;
        self
    }

    /// defer handler invocation until the first body byte arrived for
    /// requests that declare a body. enabled by default.
    pub fn delay_dispatch_until_content(mut self, enabled: bool) -> Self {
        self.delay_dispatch_until_content = enabled;
        self
    }

    /// honor keep-alive. when disabled every response carries
    /// `connection: close`.
    pub fn persistent_connections_enabled(mut self, enabled: bool) -> Self {
        self.persistent_connections_enabled = enabled;
        self
    }

    /// emit the `server` response header.
    pub fn send_server_version(mut self, enabled: bool) -> Self {
        self.send_server_version = enabled;
        self
    }

    /// emit the `date` response header.
    pub fn send_date_header(mut self, enabled: bool) -> Self {
        self.send_date_header = enabled;
        self
    }

    /// emit the `x-powered-by` response header.
    pub fn send_x_powered_by(mut self, enabled: bool) -> Self {
        self.send_x_powered_by = enabled;
        self
    }

    /// cap of error dispatches per request before short circuiting to a
    /// minimal 500.
    pub fn max_error_dispatches(mut self, max: usize) -> Self {
        self.max_error_dispatches = max;
        self
    }

    /// minimal acceptable request body receive rate in bytes per second.
    /// 0 disables the check.
    pub fn min_request_data_rate(mut self, rate: u64) -> Self {
        self.min_request_data_rate = rate;
        self
    }

    /// minimal acceptable response write rate in bytes per second. 0
    /// disables the check.
    pub fn min_response_data_rate(mut self, rate: u64) -> Self {
        self.min_response_data_rate = rate;
        self
    }

    /// scheme and port a secure redirect would target.
    pub fn secure(mut self, scheme: &'static str, port: u16) -> Self {
        self.secure_scheme = scheme;
        self.secure_port = port;
        self
    }

    /// authority used when synthesizing a `host` header for requests
    /// missing one.
    pub fn server_authority(mut self, authority: Authority) -> Self {
        self.server_authority = Some(authority);
        self
    }

    /// methods whose `application/x-www-form-urlencoded` bodies the form
    /// helper decodes.
    pub fn form_encoded_methods(mut self, methods: Vec<Method>) -> Self {
        self.form_encoded_methods = methods;
        self
    }

    pub fn http_compliance(mut self, compliance: HttpCompliance) -> Self {
        self.http_compliance = compliance;
        self
    }

    /// gather response buffers into vectored writes when the endpoint
    /// supports them.
    pub fn vectored_write(mut self, enabled: bool) -> Self {
        self.vectored_write = enabled;
        self
    }

    pub fn is_form_encoded_method(&self, method: &Method) -> bool {
        self.form_encoded_methods.contains(method)
    }
}
