use core::fmt;

use http::StatusCode;
use httparse::Error as HttparseError;

/// http/1 protocol level failure. transformed into an error response with
/// [ProtoError::status] and the connection is marked non persistent.
#[derive(Debug)]
pub enum ProtoError {
    Method,
    Uri(http::uri::InvalidUri),
    Version,
    HeaderName,
    HeaderValue,
    /// request line plus headers do not fit the configured size.
    HeaderTooLarge,
    /// conflicting or malformed body framing headers.
    ContentLength,
    /// `Expect:` carries a token other than `100-continue`/`102-processing`.
    UnknownExpectation,
    /// direct http/2 preface received without an h2c capable factory.
    UpgradeRequired,
    /// response head construction failed.
    Status,
    HttpParse(httparse::Error),
}

impl ProtoError {
    /// the response status this failure maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::HeaderTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Self::Version => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            Self::UnknownExpectation => StatusCode::EXPECTATION_FAILED,
            Self::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            Self::Status => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<HttparseError> for ProtoError {
    fn from(e: HttparseError) -> Self {
        match e {
            // header count overflow is handled the same as oversized headers.
            HttparseError::TooManyHeaders => Self::HeaderTooLarge,
            HttparseError::HeaderName => Self::HeaderName,
            HttparseError::HeaderValue => Self::HeaderValue,
            HttparseError::Version => Self::Version,
            e => Self::HttpParse(e),
        }
    }
}

impl From<http::method::InvalidMethod> for ProtoError {
    fn from(_: http::method::InvalidMethod) -> Self {
        Self::Method
    }
}

impl From<http::uri::InvalidUri> for ProtoError {
    fn from(e: http::uri::InvalidUri) -> Self {
        Self::Uri(e)
    }
}

impl From<http::uri::InvalidUriParts> for ProtoError {
    fn from(_: http::uri::InvalidUriParts) -> Self {
        Self::Status
    }
}
