use crate::{http::request::ParseErrorKind, StatusCode};
use std::io;
use thiserror::Error;

/// Everything that can stop a connection before the dispatcher runs.
///
/// Each variant has a canned HTTP response (see [`ErrorKind::as_http`]),
/// written to the socket instead of a dispatched one.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("unrecognized HTTP method")]
    UnrecognizedMethod,
    #[error("unsupported HTTP version")]
    VersionMismatch,
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("request head is not valid UTF-8")]
    InvalidEncoding,

    #[error("request header block exceeds {0} bytes")]
    HeaderBlockTooLarge(usize),
    #[error("declared body of {declared} bytes exceeds limit of {limit}")]
    BodyTooLarge { declared: usize, limit: usize },
    #[error("timed out after {received} of {expected} bytes")]
    ReadTimeout { received: usize, expected: usize },

    #[error("io: {0}")]
    Io(#[source] io::Error),
}

macro_rules! http_errors {
    ($($name:ident: $status:ident, $status_line:literal, $len:literal => $json:literal; )*) => {
        /// Complete response bytes for this error, ready to be written.
        pub(crate) fn as_http(&self, json: bool) -> &'static [u8] {
            match (json, self) { $(
                (true, Self::$name { .. }) => concat!(
                    "HTTP/1.1 ", $status_line, "\r\n",
                    "Connection: close\r\n",
                    "Content-Length: ", $len, "\r\n",
                    "Content-Type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }) => concat!(
                    "HTTP/1.1 ", $status_line, "\r\n",
                    "Connection: close\r\n",
                    "Content-Length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }

        pub(crate) fn status(&self) -> StatusCode {
            match self { $(
                Self::$name { .. } => StatusCode::$status,
            )* }
        }
    };
}

impl ErrorKind {
    http_errors! {
        MalformedRequestLine: BadRequest, "400 Bad Request", "66"
            => r#"{"error":"Malformed request line","code":"MALFORMED_REQUEST_LINE"}"#;
        UnrecognizedMethod: BadRequest, "400 Bad Request", "65"
            => r#"{"error":"Unrecognized HTTP method","code":"UNRECOGNIZED_METHOD"}"#;
        VersionMismatch: BadRequest, "400 Bad Request", "62"
            => r#"{"error":"Unsupported HTTP version","code":"VERSION_MISMATCH"}"#;
        InvalidContentLength: BadRequest, "400 Bad Request", "66"
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        InvalidEncoding: BadRequest, "400 Bad Request", "69"
            => r#"{"error":"Request head is not valid UTF-8","code":"INVALID_ENCODING"}"#;

        HeaderBlockTooLarge: BadRequest, "400 Bad Request", "74"
            => r#"{"error":"Request header block too large","code":"HEADER_BLOCK_TOO_LARGE"}"#;
        BodyTooLarge: PayloadTooLarge, "413 Payload Too Large", "58"
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
        ReadTimeout: RequestTimeout, "408 Request Timeout", "59"
            => r#"{"error":"Timed out reading request","code":"READ_TIMEOUT"}"#;

        Io: InternalServerError, "500 Internal Server Error", "48"
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
    }
}

impl From<ParseErrorKind> for ErrorKind {
    fn from(kind: ParseErrorKind) -> Self {
        match kind {
            ParseErrorKind::MalformedRequestLine => ErrorKind::MalformedRequestLine,
            ParseErrorKind::UnrecognizedMethod => ErrorKind::UnrecognizedMethod,
            ParseErrorKind::VersionMismatch => ErrorKind::VersionMismatch,
            ParseErrorKind::InvalidContentLength => ErrorKind::InvalidContentLength,
            ParseErrorKind::InvalidEncoding => ErrorKind::InvalidEncoding,
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(err)
    }
}

/// Failure reported by a route handler or the management endpoint.
///
/// Either way the client sees `500 Internal Server Error`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed<M: Into<String>>(message: M) -> Self {
        HandlerError::Failed(message.into())
    }
}
