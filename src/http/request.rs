use crate::{
    http::types::{self, HTTP_VERSION},
    query::Query,
    HeaderMap, Method,
};
use memchr::{memchr, memmem};
use thiserror::Error;

/// `Connection` header semantics.
///
/// A request without the header has neither mode: callers see `None`
/// from [`Request::connection`] and must not read that as either value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    KeepAlive,
    Close,
}

/// Why a request could not be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    /// The request line does not hold three space-separated tokens
    /// terminated by `CRLF`.
    #[error("malformed request line")]
    MalformedRequestLine,
    /// The method token is none of `GET`, `POST`, `PUT`, `DELETE`.
    #[error("unrecognized method")]
    UnrecognizedMethod,
    /// The version token is not `HTTP/1.1`.
    #[error("version mismatch")]
    VersionMismatch,
    /// `Content-Length` is present but not a decimal number.
    #[error("invalid Content-Length")]
    InvalidContentLength,
    /// The request line or header block is not UTF-8.
    #[error("request head is not UTF-8")]
    InvalidEncoding,
}

/// A failed parse.
///
/// For every kind except [`MalformedRequestLine`](ParseErrorKind::MalformedRequestLine)
/// and [`InvalidEncoding`](ParseErrorKind::InvalidEncoding), parsing ran to
/// the end and the partially trusted request is kept for diagnostics.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub request: Option<Box<Request>>,
}

impl ParseError {
    fn bare(kind: ParseErrorKind) -> Self {
        Self {
            kind,
            request: None,
        }
    }
}

/// Parsed HTTP request.
///
/// Owned by the thread serving the connection; every string, map and the
/// body are released together when the request is dropped.
///
/// # Input format
///
/// ```text
/// [METHOD] SP [PATH] SP HTTP/1.1 CRLF
/// ([NAME] ":" *SP [VALUE] CRLF)*
/// CRLF
/// [BODY]
/// ```
///
/// - Header names are stored as sent and looked up exact-case. A repeated
///   name overwrites the earlier value. Lines without a colon are skipped.
/// - Everything after `?` in the path becomes [`params`](Request::params).
/// - The body is whatever follows the blank line; the parser does not wait
///   for `Content-Length` bytes, that is the connection's job.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Request {
    method: Option<Method>,
    path: String,
    version: String,

    headers: HeaderMap,
    params: HeaderMap,
    pub(crate) data: HeaderMap,

    body: Vec<u8>,
    content_length: usize,
    connection: Option<ConnectionMode>,
    websocket: bool,

    // Bytes up to and including the blank line. Zero if no blank line was seen.
    pub(crate) head_len: usize,
}

// Public API
impl Request {
    /// Parses a buffer holding at least the full header block.
    ///
    /// The returned `Err` must be inspected before the request is used:
    /// an unrecognized method or a version mismatch never yields `Ok`.
    ///
    /// # Examples
    /// ```
    /// use modserve::{Method, Request};
    ///
    /// let req = Request::parse(b"GET /p?a=1 HTTP/1.1\r\nHost: x\r\n\r\n", false).unwrap();
    ///
    /// assert_eq!(req.method(), Some(Method::Get));
    /// assert_eq!(req.path(), "/p");
    /// assert_eq!(req.params().get("a"), Some("1"));
    /// assert_eq!(req.header("Host"), Some("x"));
    /// ```
    pub fn parse(buf: &[u8], decode: bool) -> Result<Request, ParseError> {
        let line_end = memmem::find(buf, b"\r\n")
            .ok_or(ParseError::bare(ParseErrorKind::MalformedRequestLine))?;

        let (head_end, head_len) = match memmem::find(buf, b"\r\n\r\n") {
            Some(pos) => (pos, pos + 4),
            None => (line_end, 0),
        };

        let head = simdutf8::basic::from_utf8(&buf[..head_end])
            .map_err(|_| ParseError::bare(ParseErrorKind::InvalidEncoding))?;

        let mut req = Request {
            head_len,
            ..Request::default()
        };
        let mut failure = None;

        // First line
        {
            let first_line = &head[..line_end.min(head.len())];
            let (method, rest) = first_line
                .split_once(' ')
                .ok_or(ParseError::bare(ParseErrorKind::MalformedRequestLine))?;
            let (target, version) = rest
                .split_once(' ')
                .ok_or(ParseError::bare(ParseErrorKind::MalformedRequestLine))?;

            req.method = Method::from_bytes(method.as_bytes());
            if req.method.is_none() {
                failure = Some(ParseErrorKind::UnrecognizedMethod);
            }

            req.version = version.to_owned();
            if version != HTTP_VERSION {
                failure = failure.or(Some(ParseErrorKind::VersionMismatch));
            }

            match target.split_once('?') {
                Some((path, query)) => {
                    req.path = path.to_owned();
                    Query::parse_into(&mut req.params, query.as_bytes(), decode);
                }
                None => req.path = target.to_owned(),
            }
        }

        // Headers
        if head_len != 0 && head_end > line_end {
            for line in head[line_end + 2..].split("\r\n") {
                let Some(colon) = memchr(b':', line.as_bytes()) else {
                    continue;
                };

                let value = line[colon + 1..].trim_start_matches(' ');
                req.headers.insert(&line[..colon], value);
            }
        }

        // Body
        if head_len != 0 {
            req.body = buf[head_len..].to_vec();
        }

        if let Some(value) = req.headers.get("Content-Length") {
            match types::slice_to_usize(value.trim().as_bytes()) {
                Some(len) => req.content_length = len,
                None => failure = failure.or(Some(ParseErrorKind::InvalidContentLength)),
            }
        }

        req.connection = req.headers.get("Connection").and_then(|value| {
            if value.eq_ignore_ascii_case("keep-alive") {
                Some(ConnectionMode::KeepAlive)
            } else if value.eq_ignore_ascii_case("close") {
                Some(ConnectionMode::Close)
            } else {
                None
            }
        });

        match failure {
            Some(kind) => Err(ParseError {
                kind,
                request: Some(Box::new(req)),
            }),
            None => Ok(req),
        }
    }

    /// `None` only on a request kept for diagnostics after an
    /// [`UnrecognizedMethod`](ParseErrorKind::UnrecognizedMethod) failure.
    #[inline(always)]
    pub const fn method(&self) -> Option<Method> {
        self.method
    }

    /// Path without the query suffix.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline(always)]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[inline(always)]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Exact-case header lookup.
    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Query parameters, not percent-decoded unless
    /// [`ReqLimits::percent_decode`](crate::limits::ReqLimits::percent_decode) is set.
    #[inline(always)]
    pub const fn params(&self) -> &HeaderMap {
        &self.params
    }

    /// Decoded form fields; empty unless the body was form data.
    #[inline(always)]
    pub const fn data(&self) -> &HeaderMap {
        &self.data
    }

    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Value of `Content-Length`, `0` when absent.
    #[inline(always)]
    pub const fn content_length(&self) -> usize {
        self.content_length
    }

    #[inline(always)]
    pub const fn connection(&self) -> Option<ConnectionMode> {
        self.connection
    }

    #[inline(always)]
    pub fn is_keep_alive(&self) -> bool {
        self.connection == Some(ConnectionMode::KeepAlive)
    }

    #[inline(always)]
    pub fn is_close(&self) -> bool {
        self.connection == Some(ConnectionMode::Close)
    }

    /// `true` once a [`WebSocket`](crate::WebSocket) collaborator confirmed the upgrade.
    #[inline(always)]
    pub const fn is_websocket(&self) -> bool {
        self.websocket
    }

    /// Marks the connection as upgraded. The server then hands the socket
    /// to [`WebSocket::confirm_open`](crate::WebSocket::confirm_open)
    /// instead of closing it.
    #[inline(always)]
    pub fn confirm_websocket(&mut self) {
        self.websocket = true;
    }
}

impl Request {
    /// Replaces the body with everything after the header block of the
    /// now complete `buf`.
    #[inline]
    pub(crate) fn reload_body(&mut self, buf: &[u8]) {
        if self.head_len != 0 && self.head_len <= buf.len() {
            self.body.clear();
            self.body.extend_from_slice(&buf[self.head_len..]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(raw: &str) -> Request {
        Request::parse(raw.as_bytes(), false).unwrap()
    }

    fn err(raw: &str) -> ParseError {
        Request::parse(raw.as_bytes(), false).unwrap_err()
    }

    #[test]
    fn parse_valid_request() {
        #[rustfmt::skip]
        let cases = [
            (
                "GET / HTTP/1.1\r\n\r\n",
                (Method::Get, "/", vec![], b"" as &[u8]),
            ),
            (
                "POST /test HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                (Method::Post, "/test", vec![("Host", "127.0.0.1")], b""),
            ),
            (
                "PUT /qwe HTTP/1.1\r\nHoSt: 127.0.0.1\r\nUser-Agent: curl\r\n\r\n",
                (Method::Put, "/qwe", vec![("HoSt", "127.0.0.1"), ("User-Agent", "curl")], b""),
            ),
            (
                "DELETE /file HTTP/1.1\r\nContent-Length: 12\r\n\r\nHello world!",
                (Method::Delete, "/file", vec![("Content-Length", "12")], b"Hello world!"),
            ),
            (
                "GET /empty HTTP/1.1\r\nX-Empty:\r\nX-Space:    v  \r\n\r\n",
                (Method::Get, "/empty", vec![("X-Empty", ""), ("X-Space", "v  ")], b""),
            ),
        ];

        for (raw, (method, path, headers, body)) in cases {
            let req = ok(raw);

            assert_eq!(req.method(), Some(method));
            assert_eq!(req.path(), path);
            assert_eq!(req.version(), HTTP_VERSION);
            assert_eq!(req.headers().iter().collect::<Vec<_>>(), headers);
            assert_eq!(req.body(), body);
        }
    }

    #[test]
    fn duplicate_headers_overwrite() {
        let req = ok("GET / HTTP/1.1\r\nX-A: 1\r\nX-B: b\r\nX-A: 2\r\n\r\n");

        assert_eq!(req.header("X-A"), Some("2"));
        assert_eq!(req.headers().len(), 2);
    }

    #[test]
    fn header_lookup_is_exact_case() {
        let req = ok("GET / HTTP/1.1\r\nContent-Type: text/plain\r\n\r\n");

        assert_eq!(req.header("Content-Type"), Some("text/plain"));
        assert_eq!(req.header("content-type"), None);
    }

    #[test]
    fn header_without_colon_is_skipped() {
        let req = ok("GET / HTTP/1.1\r\nValid: ok\r\nInvalidname\r\nNext: value\r\n\r\n");

        assert_eq!(
            req.headers().iter().collect::<Vec<_>>(),
            vec![("Valid", "ok"), ("Next", "value")]
        );
    }

    #[test]
    fn query_parameters() {
        let req = ok("GET /p?a=1&b=&c HTTP/1.1\r\n\r\n");

        assert_eq!(req.path(), "/p");
        assert_eq!(
            req.params().iter().collect::<Vec<_>>(),
            vec![("a", "1"), ("b", "")]
        );
    }

    #[test]
    fn query_is_verbatim() {
        let req = ok("GET /s?q=a%20b+c HTTP/1.1\r\n\r\n");
        assert_eq!(req.params().get("q"), Some("a%20b+c"));

        let req = Request::parse(b"GET /s?q=a%20b+c HTTP/1.1\r\n\r\n", true).unwrap();
        assert_eq!(req.params().get("q"), Some("a b c"));
    }

    #[test]
    fn connection_header_three_states() {
        #[rustfmt::skip]
        let cases = [
            ("Connection: keep-alive\r\n", Some(ConnectionMode::KeepAlive), true,  false),
            ("Connection: Keep-Alive\r\n", Some(ConnectionMode::KeepAlive), true,  false),
            ("Connection: CLOSE\r\n",      Some(ConnectionMode::Close),     false, true),
            ("Connection: upgrade\r\n",    None,                            false, false),
            ("",                           None,                            false, false),
        ];

        for (header, mode, keep_alive, close) in cases {
            let req = ok(&format!("GET / HTTP/1.1\r\n{header}\r\n"));

            assert_eq!(req.connection(), mode);
            assert_eq!(req.is_keep_alive(), keep_alive);
            assert_eq!(req.is_close(), close);
        }
    }

    #[test]
    fn content_length() {
        assert_eq!(ok("GET / HTTP/1.1\r\n\r\n").content_length(), 0);
        assert_eq!(
            ok("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort").content_length(),
            10
        );

        let e = err("POST / HTTP/1.1\r\nContent-Length: 12abc\r\n\r\n");
        assert_eq!(e.kind, ParseErrorKind::InvalidContentLength);
    }

    #[test]
    fn partial_body_is_kept() {
        let req = ok("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort");

        assert_eq!(req.body(), b"short");
        assert_eq!(req.head_len, 39);

        let mut req = req;
        req.reload_body(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort+more");
        assert_eq!(req.body(), b"short+more");
    }

    #[test]
    fn parse_invalid_request() {
        #[rustfmt::skip]
        let cases = [
            ("GET",                                ParseErrorKind::MalformedRequestLine),
            ("GET / HTTP/1.1",                     ParseErrorKind::MalformedRequestLine),
            ("GET/\r\n\r\n",                       ParseErrorKind::MalformedRequestLine),
            ("GET /\r\n\r\n",                      ParseErrorKind::MalformedRequestLine),
            ("PATCH / HTTP/1.1\r\n\r\n",           ParseErrorKind::UnrecognizedMethod),
            ("get / HTTP/1.1\r\n\r\n",             ParseErrorKind::UnrecognizedMethod),
            ("PATCH / HTTP/2.0\r\n\r\n",           ParseErrorKind::UnrecognizedMethod),
            ("GET / HTTP/1.0\r\n\r\n",             ParseErrorKind::VersionMismatch),
            ("GET / HTTP/1.1 \r\n\r\n",            ParseErrorKind::VersionMismatch),
        ];

        for (raw, kind) in cases {
            assert_eq!(err(raw).kind, kind, "{raw:?}");
        }
    }

    #[test]
    fn malformed_line_keeps_nothing() {
        let e = err("GARBAGE\r\nHost: x\r\n\r\n");

        assert_eq!(e.kind, ParseErrorKind::MalformedRequestLine);
        assert!(e.request.is_none());
    }

    #[test]
    fn unrecognized_method_keeps_diagnostics() {
        let e = err("PATCH /items?id=7 HTTP/1.1\r\nX-Trace: 1\r\n\r\nbody");
        let req = e.request.unwrap();

        assert_eq!(req.method(), None);
        assert_eq!(req.path(), "/items");
        assert_eq!(req.params().get("id"), Some("7"));
        assert_eq!(req.header("X-Trace"), Some("1"));
        assert_eq!(req.body(), b"body");
    }

    #[test]
    fn version_mismatch_keeps_diagnostics() {
        let e = err("GET /old HTTP/1.0\r\nHost: x\r\n\r\n");
        let req = e.request.unwrap();

        assert_eq!(e.kind, ParseErrorKind::VersionMismatch);
        assert_eq!(req.method(), Some(Method::Get));
        assert_eq!(req.version(), "HTTP/1.0");
        assert_eq!(req.header("Host"), Some("x"));
    }

    #[test]
    fn non_utf8_head() {
        let e = Request::parse(b"GET /\xff HTTP/1.1\r\n\r\n", false).unwrap_err();
        assert_eq!(e.kind, ParseErrorKind::InvalidEncoding);
    }

    #[test]
    fn binary_body_is_untouched() {
        let raw = b"POST /bin HTTP/1.1\r\nContent-Length: 4\r\n\r\n\x00\xff\r\n";
        let req = Request::parse(raw, false).unwrap();

        assert_eq!(req.body(), b"\x00\xff\r\n");
    }
}
