use crate::{
    errors::ErrorKind,
    http::form,
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    Gateway, Request, Response,
};
use memchr::memmem;
use std::{
    io::{self, Read},
    net::TcpStream,
    sync::Arc,
    time::Instant,
};

#[derive(Debug, Clone, Default)]
pub(crate) struct AllLimits {
    pub(crate) server: ServerLimits,
    pub(crate) conn: ConnLimits,
    pub(crate) req: ReqLimits,
    pub(crate) resp: RespLimits,
}

/// Serves one accepted socket from first read to close.
#[derive(Clone)]
pub(crate) struct HttpConnection {
    gateway: Gateway,
    limits: Arc<AllLimits>,
}

impl HttpConnection {
    pub(crate) fn new(gateway: Gateway, limits: Arc<AllLimits>) -> Self {
        Self { gateway, limits }
    }

    pub(crate) fn run(&self, mut stream: TcpStream) {
        let started = Instant::now();

        if let Err(err) = self.configure(&stream) {
            tracing::debug!(error = %err, "cannot configure socket");
            return;
        }

        let mut req = match reader::read_request(&mut stream, &self.limits.req) {
            Ok(Some(req)) => req,
            Ok(None) => {
                tracing::debug!("connection closed before any data");
                return;
            }
            Err(ErrorKind::Io(err)) => {
                tracing::debug!(error = %err, "read failed");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, status = err.status() as u16, "rejected request");
                writer::send_error(&mut stream, &err, self.limits.server.json_errors);
                writer::close(&stream);
                return;
            }
        };

        if let Err(err) = form::decode(&mut req, self.limits.req.percent_decode) {
            tracing::warn!(path = req.path(), error = %err, "form body not decoded");
        }

        let mut resp = Response::new(&self.limits.resp);
        // Handler failures are logged by the gateway and already turned into a 500.
        let _ = self.gateway.dispatch(&mut stream, &mut req, &mut resp);

        let bytes = resp.serialize(req.is_websocket(), &self.limits.resp);
        if let Err(err) = writer::write_bytes(&mut stream, &bytes) {
            tracing::debug!(error = %err, "write failed");
        }

        tracing::info!(
            method = req.method().map_or("-", |m| m.as_str()),
            path = req.path(),
            status = resp.status_code() as u16,
            elapsed = ?started.elapsed(),
            "request served"
        );

        if req.is_websocket() {
            self.gateway.websocket().confirm_open(stream, &req);
        } else {
            writer::close(&stream);
        }
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        let conn = &self.limits.conn;

        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(conn.socket_read_timeout).filter(|d| !d.is_zero()))?;
        stream.set_write_timeout(Some(conn.socket_write_timeout).filter(|d| !d.is_zero()))
    }
}

pub(crate) mod reader {
    use super::*;

    /// Reads one request: first read, rest of the header block, then the
    /// body up to the declared `Content-Length`.
    ///
    /// `Ok(None)` means the peer sent nothing.
    pub(crate) fn read_request<R: Read>(
        reader: &mut R,
        limits: &ReqLimits,
    ) -> Result<Option<Request>, ErrorKind> {
        let mut buf = Vec::with_capacity(limits.buffer_size);

        match read_chunk(reader, &mut buf, limits.buffer_size) {
            Ok(0) | Err(_) => return Ok(None),
            Ok(_) => {}
        }

        // Header block
        while memmem::find(&buf, b"\r\n\r\n").is_none() {
            if buf.len() >= limits.header_block_size {
                return Err(ErrorKind::HeaderBlockTooLarge(limits.header_block_size));
            }

            let room = limits.header_block_size - buf.len();
            match read_chunk(reader, &mut buf, room) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if is_timeout(&err) => {
                    return Err(ErrorKind::ReadTimeout {
                        received: buf.len(),
                        expected: 0,
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut req =
            Request::parse(&buf, limits.percent_decode).map_err(|err| ErrorKind::from(err.kind))?;

        if req.head_len == 0 {
            return Ok(Some(req));
        }

        let expected = req.content_length();
        if expected > limits.max_body_size {
            return Err(ErrorKind::BodyTooLarge {
                declared: expected,
                limit: limits.max_body_size,
            });
        }

        // Body
        let target = req.head_len + expected;
        if buf.len() < target {
            while buf.len() < target {
                let received = buf.len() - req.head_len;
                let want = target - buf.len();

                match read_chunk(reader, &mut buf, want) {
                    Ok(0) => {
                        return Err(ErrorKind::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("body ended after {received} of {expected} bytes"),
                        )))
                    }
                    Ok(_) => {}
                    Err(err) if is_timeout(&err) => {
                        return Err(ErrorKind::ReadTimeout { received, expected })
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            req.reload_body(&buf);
        }

        Ok(Some(req))
    }

    /// Appends at most `max` bytes read from `reader` to `buf`.
    fn read_chunk<R: Read>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<usize> {
        let start = buf.len();
        buf.resize(start + max, 0);

        let result = loop {
            match reader.read(&mut buf[start..]) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        buf.truncate(start + *result.as_ref().unwrap_or(&0));
        result
    }

    #[inline(always)]
    fn is_timeout(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        )
    }
}

pub(crate) mod writer {
    use crate::errors::ErrorKind;
    use std::{
        io::{self, Write},
        net::{Shutdown, TcpStream},
    };

    #[inline(always)]
    pub(crate) fn send_error(stream: &mut TcpStream, error: &ErrorKind, json: bool) {
        if let Err(err) = write_bytes(stream, error.as_http(json)) {
            tracing::debug!(error = %err, "cannot send error response");
        }
    }

    #[inline(always)]
    pub(crate) fn write_bytes<W: Write>(stream: &mut W, response: &[u8]) -> io::Result<()> {
        stream.write_all(response)?;
        stream.flush()
    }

    #[inline(always)]
    pub(crate) fn close(stream: &TcpStream) {
        // The peer may already be gone.
        let _ = stream.shutdown(Shutdown::Both);
    }
}
