//! Response builder and wire serializer.

use crate::{limits::RespLimits, HeaderMap, StatusCode};
use std::{borrow::Cow, io, sync::Arc};

/// HTTP response filled in by the dispatcher and its handlers.
///
/// Handlers set a status, add headers and write into a bounded body
/// buffer. `Content-Length` and `Connection` are added by the server when
/// the response is serialized and should not be set by hand.
///
/// # Examples
/// ```
/// use modserve::{Response, StatusCode};
///
/// fn handle(resp: &mut Response) {
///     resp.status(StatusCode::Ok)
///         .header("Content-Type", "text/html")
///         .write("<h1>Hello World</h1>");
/// }
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: BodyBuffer,
}

impl Response {
    #[inline(always)]
    pub(crate) fn new(limits: &RespLimits) -> Self {
        Self {
            status: StatusCode::Ok,
            headers: HeaderMap::new(),
            body: BodyBuffer::new(limits.body_capacity),
        }
    }

    #[inline]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    /// Adds a header. A repeated name replaces the earlier value.
    ///
    /// ```
    /// # use modserve::{Response, StatusCode};
    /// # fn handle(resp: &mut Response) {
    /// resp.status(StatusCode::Ok)
    ///     .header("Content-Type", "text/plain") // &str
    ///     .header("X-Request-Id", 128)          // integer
    ///     .header("X-Cached", false);           // bool
    /// # }
    /// ```
    #[inline]
    pub fn header<V: WriteBuffer>(&mut self, name: &str, value: V) -> &mut Self {
        let mut buf = Vec::new();
        value.write_to(&mut buf);
        self.headers
            .insert(name, String::from_utf8_lossy(&buf).into_owned());
        self
    }

    /// Appends to the body. Data past the body capacity is dropped.
    #[inline]
    pub fn write<T: WriteBuffer>(&mut self, data: T) -> &mut Self {
        let mut buf = Vec::new();
        data.write_to(&mut buf);
        self.body.push(&buf);
        self
    }

    /// Gives direct access to the body buffer, e.g. for [`write!`].
    ///
    /// ```
    /// # use modserve::{Response, StatusCode};
    /// use std::io::Write;
    ///
    /// # fn handle(resp: &mut Response) {
    /// resp.status(StatusCode::Ok).body_with(|w| {
    ///     let _ = write!(w, "{} + {} = {}", 2, 2, 4);
    /// });
    /// # }
    /// ```
    #[inline]
    pub fn body_with<F: FnOnce(&mut BodyBuffer)>(&mut self, f: F) -> &mut Self {
        f(&mut self.body);
        self
    }

    #[inline(always)]
    pub const fn status_code(&self) -> StatusCode {
        self.status
    }

    #[inline(always)]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        self.body.as_slice()
    }
}

impl Response {
    /// Drops everything a handler may have written and sets `status`.
    #[inline]
    pub(crate) fn reset(&mut self, status: StatusCode) {
        self.status = status;
        self.headers.clear();
        self.body.clear();
    }

    /// Serializes the response into the bytes written to the socket.
    ///
    /// Layout: status line, headers in insertion order (capped at
    /// `header_capacity` and at what `max_response_size` leaves after the
    /// status line), `Connection: close` unless the connection was
    /// upgraded, `Content-Length`, blank line, body. The whole response
    /// is capped at `max_response_size` by shortening the body, and
    /// `Content-Length` always matches the bytes actually sent.
    pub(crate) fn serialize(&self, websocket: bool, limits: &RespLimits) -> Vec<u8> {
        let status_line = self.status.as_first_line().as_bytes();
        // Headers never push the response past its cap on their own.
        let header_room = limits.header_capacity.min(
            limits
                .max_response_size
                .saturating_sub(status_line.len() + content_length_line(0)),
        );

        let mut head = Vec::with_capacity(header_room.min(1024));
        let connection = (!websocket).then_some(("Connection", "close"));

        for (name, value) in self.headers.iter().chain(connection) {
            let line = name.len() + value.len() + 4;

            if head.len() + line > header_room {
                tracing::warn!(
                    capacity = header_room,
                    header = name,
                    "response headers truncated"
                );
                break;
            }

            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }

        let body = self.body.as_slice();

        let base = status_line.len() + head.len() + content_length_line(0) - 1;
        let mut sent = body.len();

        if base + digits(sent) + sent > limits.max_response_size {
            // Content-Length digits shrink with the body they describe.
            let room = limits.max_response_size.saturating_sub(base);
            sent = room.saturating_sub(1);
            while sent > 0 && digits(sent) + sent > room {
                sent -= 1;
            }
        }

        if sent < body.len() {
            tracing::warn!(
                limit = limits.max_response_size,
                body = body.len(),
                sent,
                "response truncated"
            );
        }

        let mut out = Vec::with_capacity(
            status_line.len() + head.len() + content_length_line(sent) + sent,
        );
        out.extend_from_slice(status_line);
        out.extend_from_slice(&head);
        out.extend_from_slice(b"Content-Length: ");
        sent.write_to(&mut out);
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(&body[..sent]);
        out
    }
}

/// Length of `Content-Length: N\r\n\r\n`.
#[inline(always)]
fn content_length_line(n: usize) -> usize {
    "Content-Length: ".len() + digits(n) + 4
}

#[inline(always)]
fn digits(n: usize) -> usize {
    n.checked_ilog10().map_or(1, |d| d as usize + 1)
}

/// Bounded response body.
///
/// Writes past the capacity are silently shortened; the first truncation
/// is logged. As an [`io::Write`] it always reports the full input as
/// written so `write!` keeps working on a full buffer.
#[derive(Debug)]
pub struct BodyBuffer {
    data: Vec<u8>,
    capacity: usize,
    truncated: bool,
}

impl BodyBuffer {
    #[inline]
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity.min(1024)),
            capacity,
            truncated: false,
        }
    }

    /// Appends as much of `bytes` as fits, returns the number kept.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let room = self.capacity - self.data.len();
        let kept = bytes.len().min(room);

        self.data.extend_from_slice(&bytes[..kept]);

        if kept < bytes.len() && !self.truncated {
            self.truncated = true;
            tracing::warn!(capacity = self.capacity, "response body truncated");
        }
        kept
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub const fn is_truncated(&self) -> bool {
        self.truncated
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.truncated = false;
    }
}

impl io::Write for BodyBuffer {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Values that can be written as a header value or body chunk.
///
/// Implemented for strings, byte slices, integers, `bool` and `char`.
/// Floats are left out on purpose: pick the formatting yourself.
///
/// ```
/// use modserve::WriteBuffer;
///
/// struct UserId(u64);
///
/// impl WriteBuffer for UserId {
///     fn write_to(&self, buffer: &mut Vec<u8>) {
///         buffer.extend_from_slice(b"user-");
///         self.0.write_to(buffer);
///     }
/// }
/// ```
pub trait WriteBuffer {
    fn write_to(&self, buffer: &mut Vec<u8>);
}

macro_rules! impl_write_buffer {
    (str => $($t:ty),*) => {
        $(impl WriteBuffer for $t {
            #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                let value: &str = self.as_ref();
                buffer.extend_from_slice(value.as_bytes());
            }
        })*
    };
    (bytes => $($t:ty),*) => {
        $(impl WriteBuffer for $t {
            #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                let value: &[u8] = self.as_ref();
                buffer.extend_from_slice(value);
            }
        })*
    };
    (display => $($t:ty),*) => {
        $(impl WriteBuffer for $t {
            #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                use std::io::Write;
                // Writing into a Vec cannot fail.
                let _ = write!(buffer, "{self}");
            }
        })*
    };
}

impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
    #[inline]
    fn write_to(&self, buffer: &mut Vec<u8>) {
        T::write_to(*self, buffer);
    }
}
impl<const N: usize> WriteBuffer for [u8; N] {
    #[inline]
    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(self);
    }
}
impl_write_buffer!(str => str, String, Box<str>, Cow<'_, str>, Arc<str>);
impl_write_buffer!(bytes => [u8], Vec<u8>, Box<[u8]>, Cow<'_, [u8]>, Arc<[u8]>);
impl_write_buffer!(display => u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, bool, char);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;
    use std::io::Write;

    fn limits(body: usize, headers: usize, total: usize) -> RespLimits {
        RespLimits {
            body_capacity: body,
            header_capacity: headers,
            max_response_size: total,
        }
    }

    #[test]
    fn full_sequence() {
        let limits = RespLimits::default();
        let mut resp = Response::new(&limits);

        resp.status(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .header("X-Count", 3)
            .header("X-Flag", true)
            .write("Hello, ")
            .write(b"World")
            .write('!');

        assert_eq!(
            str_op(&resp.serialize(false, &limits)),
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain\r\n\
             X-Count: 3\r\n\
             X-Flag: true\r\n\
             Connection: close\r\n\
             Content-Length: 13\r\n\r\n\
             Hello, World!"
        );
    }

    #[test]
    fn websocket_has_no_connection_close() {
        let limits = RespLimits::default();
        let mut resp = Response::new(&limits);
        resp.status(StatusCode::SwitchingProtocols)
            .header("Upgrade", "websocket");

        assert_eq!(
            str_op(&resp.serialize(true, &limits)),
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn status_line_per_code() {
        #[rustfmt::skip]
        let cases = [
            (StatusCode::Ok,                  "HTTP/1.1 200 OK\r\n"),
            (StatusCode::Found,               "HTTP/1.1 302 Found\r\n"),
            (StatusCode::BadRequest,          "HTTP/1.1 400 Bad Request\r\n"),
            (StatusCode::Forbidden,           "HTTP/1.1 403 Forbidden\r\n"),
            (StatusCode::NotFound,            "HTTP/1.1 404 Not Found\r\n"),
            (StatusCode::InternalServerError, "HTTP/1.1 500 Internal Server Error\r\n"),
        ];

        for (status, line) in cases {
            let limits = RespLimits::default();
            let mut resp = Response::new(&limits);
            resp.status(status);

            assert!(str_op(&resp.serialize(false, &limits)).starts_with(line));
        }
    }

    #[test]
    fn body_truncated_at_capacity() {
        let limits = limits(8, 4096, 8192);
        let mut resp = Response::new(&limits);

        resp.write("0123456").write("789abc");

        assert_eq!(resp.body(), b"01234567");
        assert!(resp.body.is_truncated());
        assert!(str_op(&resp.serialize(false, &limits)).ends_with("Content-Length: 8\r\n\r\n01234567"));
    }

    #[test]
    fn body_writer_macro() {
        let limits = limits(5, 4096, 8192);
        let mut resp = Response::new(&limits);

        resp.body_with(|w| {
            write!(w, "{}-{}", 12, 345678).unwrap();
        });

        assert_eq!(resp.body(), b"12-34");
    }

    #[test]
    fn headers_truncated_at_capacity() {
        // "A: 1\r\n" is 6 bytes, room for two lines only.
        let limits = limits(64, 12, 8192);
        let mut resp = Response::new(&limits);
        resp.header("A", 1).header("B", 2).header("C", 3);

        assert_eq!(
            str_op(&resp.serialize(false, &limits)),
            "HTTP/1.1 200 OK\r\nA: 1\r\nB: 2\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn oversized_response_is_prefix_of_full() {
        let body = "x".repeat(300);
        let full = limits(1024, 1024, 8192);
        let mut resp = Response::new(&full);
        resp.status(StatusCode::Ok).header("Content-Type", "text/plain").write(&body);

        let untruncated = resp.serialize(false, &full);

        #[rustfmt::skip]
        let caps = [100, 128, 200, 256, 300];

        for cap in caps {
            let capped = limits(1024, 1024, cap);
            let out = resp.serialize(false, &capped);
            let text = str_op(&out);
            let (head, sent) = text.split_once("\r\n\r\n").unwrap();
            let declared: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .unwrap()
                .parse()
                .unwrap();

            assert!(out.len() <= cap && out.len() >= cap - 1, "cap {cap}");
            assert_eq!(declared, sent.len());
            assert!(body.starts_with(sent));
            assert!(untruncated.len() > out.len());
        }
    }

    #[test]
    fn headers_never_exceed_response_cap() {
        #[rustfmt::skip]
        let cases = [
            (60, "HTTP/1.1 200 OK\r\nA: 1\r\nB: 2\r\nC: 3\r\nContent-Length: 4\r\n\r\nhell"),
            (40, "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhe"),
        ];

        for (cap, expected) in cases {
            let limits = limits(64, 4096, cap);
            let mut resp = Response::new(&limits);
            resp.header("A", 1).header("B", 2).header("C", 3).write("hello world");

            let out = resp.serialize(false, &limits);
            assert_eq!(str_op(&out), expected, "cap {cap}");
            assert!(out.len() <= cap);
        }
    }

    #[test]
    fn reset_discards_handler_output() {
        let limits = RespLimits::default();
        let mut resp = Response::new(&limits);
        resp.status(StatusCode::Ok).header("X-Partial", "1").write("half");

        resp.reset(StatusCode::InternalServerError);

        assert_eq!(
            str_op(&resp.serialize(false, &limits)),
            "HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn content_length_line_width() {
        #[rustfmt::skip]
        let cases = [(0, 21), (9, 21), (10, 22), (999, 23), (1000, 24)];

        for (n, len) in cases {
            assert_eq!(content_length_line(n), len);
            assert_eq!(format!("Content-Length: {n}\r\n\r\n").len(), len);
        }
    }
}
