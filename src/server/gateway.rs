use crate::{
    errors::HandlerError, Request, Response, Router, StatusCode, WebSocketInfo,
};
use std::{
    any::Any,
    net::TcpStream,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// Path prefix served by the [`Management`] collaborator.
pub const MANAGEMENT_PREFIX: &str = "/mgnt";

const FAVICON: &str = "/favicon.ico";
const NOT_FOUND: &str = "404 Not Found\n";

/// Websocket upgrade collaborator.
///
/// Handshake, framing and the message loop live behind this trait. The
/// server only asks whether a request wants an upgrade, hands over the
/// socket for the session, and after the response was written gives the
/// socket away for good if the session confirmed the upgrade with
/// [`Request::confirm_websocket`].
pub trait WebSocket: Send + Sync + 'static {
    /// Upgrade signal, usually `Upgrade: websocket` plus a handshake key.
    fn is_upgrade(&self, req: &Request) -> bool;

    /// Runs the handshake for a matched websocket route.
    fn handle_client(
        &self,
        stream: &mut TcpStream,
        req: &mut Request,
        resp: &mut Response,
        info: &WebSocketInfo,
    );

    /// Receives the socket of a confirmed upgrade instead of it being closed.
    fn confirm_open(&self, stream: TcpStream, req: &Request);
}

/// Websocket collaborator for servers without websocket support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWebSocket;

impl WebSocket for NoWebSocket {
    #[inline(always)]
    fn is_upgrade(&self, _: &Request) -> bool {
        false
    }

    fn handle_client(&self, _: &mut TcpStream, _: &mut Request, _: &mut Response, _: &WebSocketInfo) {}

    fn confirm_open(&self, _: TcpStream, _: &Request) {}
}

/// Handler for everything under [`MANAGEMENT_PREFIX`].
///
/// `Ok` answers `200`, any `Err` answers `500`.
pub trait Management: Send + Sync + 'static {
    fn handle(&self, req: &Request, resp: &mut Response) -> Result<(), HandlerError>;
}

/// Runs `f`, turning a panic into [`HandlerError::Panicked`].
///
/// ```
/// use modserve::{safe_execute, HandlerError};
///
/// let result = safe_execute(|| -> Result<(), HandlerError> { panic!("boom") });
/// assert!(matches!(result, Err(HandlerError::Panicked(msg)) if msg == "boom"));
/// ```
pub fn safe_execute<F>(f: F) -> Result<(), HandlerError>
where
    F: FnOnce() -> Result<(), HandlerError>,
{
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => match payload.downcast_ref::<&'static str>() {
            Some(msg) => (*msg).to_owned(),
            None => "non-string panic payload".to_owned(),
        },
    }
}

/// Decides who answers a parsed request.
///
/// In order:
/// 1. `/favicon.ico` gets a `404` without touching the route table
/// 2. [`MANAGEMENT_PREFIX`] goes to the [`Management`] collaborator
/// 3. upgrade requests go to the [`WebSocket`] collaborator
/// 4. everything else is looked up in the [`Router`]
///
/// A handler failure never escapes: the response becomes a bare `500` and
/// the lookup token is still released exactly once.
#[derive(Clone)]
pub struct Gateway {
    router: Arc<dyn Router>,
    websocket: Arc<dyn WebSocket>,
    management: Option<Arc<dyn Management>>,
}

impl Gateway {
    pub fn new(
        router: Arc<dyn Router>,
        websocket: Arc<dyn WebSocket>,
        management: Option<Arc<dyn Management>>,
    ) -> Self {
        Self {
            router,
            websocket,
            management,
        }
    }

    #[inline(always)]
    pub(crate) fn websocket(&self) -> &dyn WebSocket {
        self.websocket.as_ref()
    }

    /// Fills `resp` for `req`.
    ///
    /// The `Err` of a failed handler is returned after the response was
    /// already turned into a `500`.
    pub fn dispatch(
        &self,
        stream: &mut TcpStream,
        req: &mut Request,
        resp: &mut Response,
    ) -> Result<(), HandlerError> {
        let path = req.path();

        if path == FAVICON {
            resp.status(StatusCode::NotFound).write(NOT_FOUND);
            return Ok(());
        }

        if is_management(path) {
            let Some(management) = &self.management else {
                resp.status(StatusCode::NotFound).write(NOT_FOUND);
                return Ok(());
            };

            let req = &*req;
            return match safe_execute(|| management.handle(req, resp)) {
                Ok(()) => {
                    resp.status(StatusCode::Ok);
                    Ok(())
                }
                Err(err) => Err(fail(resp, req, err)),
            };
        }

        if self.websocket.is_upgrade(req) {
            let Some((info, token)) = self.router.find_websocket_route(path) else {
                resp.status(StatusCode::NotFound).write(NOT_FOUND);
                return Ok(());
            };

            let result = safe_execute(|| {
                self.websocket.handle_client(stream, req, resp, &info);
                Ok(())
            });
            token.release();

            return result.map_err(|err| fail(resp, req, err));
        }

        let Some(method) = req.method() else {
            resp.status(StatusCode::NotFound).write(NOT_FOUND);
            return Ok(());
        };
        let Some((entry, token)) = self.router.find_route(path, method) else {
            resp.status(StatusCode::NotFound).write(NOT_FOUND);
            return Ok(());
        };

        let req = &*req;
        let result = safe_execute(|| entry.call(req, resp));
        token.release();

        result.map_err(|err| fail(resp, req, err))
    }
}

#[inline(always)]
fn is_management(path: &str) -> bool {
    match path.strip_prefix(MANAGEMENT_PREFIX) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn fail(resp: &mut Response, req: &Request, err: HandlerError) -> HandlerError {
    tracing::error!(path = req.path(), error = %err, "handler failed");
    resp.reset(StatusCode::InternalServerError);
    err
}
