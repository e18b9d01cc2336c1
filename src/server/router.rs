//! Route table shared between connection threads.
//!
//! Lookups take the table's read lock and hand it back to the caller as a
//! [`LockToken`]; loading or unloading a module takes the write lock and so
//! waits for every in-flight handler to finish.

use crate::{
    errors::HandlerError, limits::ModuleLimits, Management, Method, Request, Response,
    StatusCode, MANAGEMENT_PREFIX,
};
use crossbeam::sync::ShardedLock;
use std::{
    fmt::{self, Write as _},
    sync::{Arc, PoisonError},
};
use thiserror::Error;

type HandlerFn = dyn Fn(&Request, &mut Response) -> Result<(), HandlerError> + Send + Sync;
type OnOpen = Arc<dyn Fn(&Request) + Send + Sync>;
type OnMessage = Arc<dyn Fn(&Request, &[u8]) + Send + Sync>;
type OnClose = Arc<dyn Fn(&Request) + Send + Sync>;

/// Handler entry point of a route.
#[derive(Clone)]
pub struct Entry(Arc<HandlerFn>);

impl Entry {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Request, &mut Response) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self(Arc::new(handler))
    }

    #[inline(always)]
    pub fn call(&self, req: &Request, resp: &mut Response) -> Result<(), HandlerError> {
        (self.0)(req, resp)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Entry(..)")
    }
}

/// Binds `(path, method)` to a handler.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub path: String,
    pub method: Method,
    pub entry: Entry,
    pub flags: u32,
}

/// Binds a path to the three optional websocket lifecycle callbacks.
///
/// ```
/// use modserve::WebSocketInfo;
///
/// let chat = WebSocketInfo::new("/chat")
///     .on_open(|req| println!("joined from {}", req.path()))
///     .on_message(|_, msg| println!("{} bytes", msg.len()));
///
/// assert!(chat.on_close.is_none());
/// ```
#[derive(Clone)]
pub struct WebSocketInfo {
    pub path: String,
    pub on_open: Option<OnOpen>,
    pub on_message: Option<OnMessage>,
    pub on_close: Option<OnClose>,
}

impl WebSocketInfo {
    pub fn new<P: Into<String>>(path: P) -> Self {
        Self {
            path: path.into(),
            on_open: None,
            on_message: None,
            on_close: None,
        }
    }

    pub fn on_open<F: Fn(&Request) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_message<F: Fn(&Request, &[u8]) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_close<F: Fn(&Request) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for WebSocketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketInfo")
            .field("path", &self.path)
            .field("on_open", &self.on_open.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// A named unit of routes and websocket endpoints, loaded and unloaded as
/// a whole.
///
/// ```
/// use modserve::{Method, Module, StatusCode, WebSocketInfo};
///
/// let module = Module::new("users", "core-team")
///     .route("/users", Method::Get, |_, resp| {
///         resp.status(StatusCode::Ok).write("[]");
///         Ok(())
///     })
///     .websocket(WebSocketInfo::new("/users/live"));
///
/// assert_eq!(module.routes.len(), 1);
/// assert_eq!(module.websockets.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub author: String,
    pub routes: Vec<RouteInfo>,
    pub websockets: Vec<WebSocketInfo>,
}

impl Module {
    pub fn new<N: Into<String>, A: Into<String>>(name: N, author: A) -> Self {
        Self {
            name: name.into(),
            author: author.into(),
            routes: Vec::new(),
            websockets: Vec::new(),
        }
    }

    pub fn route<P, F>(self, path: P, method: Method, handler: F) -> Self
    where
        P: Into<String>,
        F: Fn(&Request, &mut Response) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.route_with_flags(path, method, 0, handler)
    }

    pub fn route_with_flags<P, F>(mut self, path: P, method: Method, flags: u32, handler: F) -> Self
    where
        P: Into<String>,
        F: Fn(&Request, &mut Response) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.routes.push(RouteInfo {
            path: path.into(),
            method,
            entry: Entry::new(handler),
            flags,
        });
        self
    }

    pub fn websocket(mut self, info: WebSocketInfo) -> Self {
        self.websockets.push(info);
        self
    }

    fn validate(&self, limits: &ModuleLimits) -> Result<(), RouteError> {
        if self.routes.len() > limits.max_routes {
            return Err(RouteError::TooManyRoutes {
                module: self.name.clone(),
                count: self.routes.len(),
                limit: limits.max_routes,
            });
        }
        if self.websockets.len() > limits.max_websockets {
            return Err(RouteError::TooManyWebSockets {
                module: self.name.clone(),
                count: self.websockets.len(),
                limit: limits.max_websockets,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("module `{module}` declares {count} routes, limit is {limit}")]
    TooManyRoutes {
        module: String,
        count: usize,
        limit: usize,
    },
    #[error("module `{module}` declares {count} websocket routes, limit is {limit}")]
    TooManyWebSockets {
        module: String,
        count: usize,
        limit: usize,
    },
    #[error("{method} {path} is already served by module `{owner}`")]
    DuplicateRoute {
        method: &'static str,
        path: String,
        owner: String,
    },
    #[error("websocket {path} is already served by module `{owner}`")]
    DuplicateWebSocket { path: String, owner: String },
    #[error("module `{0}` is not loaded")]
    NotLoaded(String),
}

trait Held {}
impl<T> Held for T {}

/// Read access obtained by a successful route lookup.
///
/// Holding the token keeps the route table from being modified. It is
/// released exactly once: by [`release`](LockToken::release) or on drop.
#[must_use = "dropping the token releases the lookup immediately"]
pub struct LockToken<'a> {
    _guard: Box<dyn Held + 'a>,
}

impl<'a> LockToken<'a> {
    /// Wraps a guard whose drop releases the lock.
    pub fn new<G: 'a>(guard: G) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }

    #[inline(always)]
    pub fn release(self) {}
}

impl fmt::Debug for LockToken<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LockToken")
    }
}

/// Lookup side of a route table, as seen by the dispatcher.
pub trait Router: Send + Sync {
    fn find_route(&self, path: &str, method: Method) -> Option<(Entry, LockToken<'_>)>;

    fn find_websocket_route(&self, path: &str) -> Option<(WebSocketInfo, LockToken<'_>)>;
}

/// In-process route table.
///
/// Paths match exactly. Every request thread reads concurrently; module
/// loads and unloads are exclusive.
///
/// ```
/// use modserve::{Method, Module, RouteTable, Router};
///
/// let table = RouteTable::default();
/// table.load(Module::new("ping", "ops").route("/ping", Method::Get, |_, _| Ok(()))).unwrap();
///
/// assert!(table.find_route("/ping", Method::Get).is_some());
/// assert!(table.find_route("/ping", Method::Post).is_none());
///
/// table.unload("ping").unwrap();
/// assert!(table.find_route("/ping", Method::Get).is_none());
/// ```
#[derive(Debug, Default)]
pub struct RouteTable {
    modules: ShardedLock<Vec<Module>>,
    limits: ModuleLimits,
}

impl RouteTable {
    pub fn new(limits: ModuleLimits) -> Self {
        Self {
            modules: ShardedLock::new(Vec::new()),
            limits,
        }
    }

    /// Adds `module`, replacing a loaded module of the same name.
    ///
    /// Blocks until no lookup token is held.
    pub fn load(&self, module: Module) -> Result<(), RouteError> {
        module.validate(&self.limits)?;

        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = conflict(&modules, &module) {
            return Err(err);
        }

        tracing::info!(
            module = %module.name,
            author = %module.author,
            routes = module.routes.len(),
            websockets = module.websockets.len(),
            "module loaded"
        );

        match modules.iter_mut().find(|m| m.name == module.name) {
            Some(slot) => *slot = module,
            None => modules.push(module),
        }
        Ok(())
    }

    /// Removes a module and returns it.
    pub fn unload(&self, name: &str) -> Result<Module, RouteError> {
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        let index = modules
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| RouteError::NotLoaded(name.to_owned()))?;

        tracing::info!(module = name, "module unloaded");
        Ok(modules.remove(index))
    }

    /// `(method, path, module)` for every ordinary route, in load order.
    pub fn routes(&self) -> Vec<(Method, String, String)> {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);

        modules
            .iter()
            .flat_map(|m| {
                m.routes
                    .iter()
                    .map(|r| (r.method, r.path.clone(), m.name.clone()))
            })
            .collect()
    }

    /// `(name, author, routes, websockets)` for every loaded module.
    pub fn modules(&self) -> Vec<(String, String, usize, usize)> {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);

        modules
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    m.author.clone(),
                    m.routes.len(),
                    m.websockets.len(),
                )
            })
            .collect()
    }
}

/// First route or websocket path of `module` already served by another module.
fn conflict(loaded: &[Module], module: &Module) -> Option<RouteError> {
    for other in loaded.iter().filter(|m| m.name != module.name) {
        let route = module.routes.iter().find(|r| {
            other
                .routes
                .iter()
                .any(|o| o.path == r.path && o.method == r.method)
        });
        if let Some(route) = route {
            return Some(RouteError::DuplicateRoute {
                method: route.method.as_str(),
                path: route.path.clone(),
                owner: other.name.clone(),
            });
        }

        let ws = module
            .websockets
            .iter()
            .find(|w| other.websockets.iter().any(|o| o.path == w.path));
        if let Some(ws) = ws {
            return Some(RouteError::DuplicateWebSocket {
                path: ws.path.clone(),
                owner: other.name.clone(),
            });
        }
    }

    None
}

impl Router for RouteTable {
    fn find_route(&self, path: &str, method: Method) -> Option<(Entry, LockToken<'_>)> {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);

        let entry = modules
            .iter()
            .flat_map(|m| &m.routes)
            .find(|r| r.method == method && r.path == path)?
            .entry
            .clone();

        Some((entry, LockToken::new(modules)))
    }

    fn find_websocket_route(&self, path: &str) -> Option<(WebSocketInfo, LockToken<'_>)> {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);

        let info = modules
            .iter()
            .flat_map(|m| &m.websockets)
            .find(|w| w.path == path)?
            .clone();

        Some((info, LockToken::new(modules)))
    }
}

/// Management endpoint answering from a [`RouteTable`].
///
/// | Path            | Answer                                   |
/// |-----------------|------------------------------------------|
/// | `/mgnt/routes`  | one `METHOD path (module)` line per route |
/// | `/mgnt/modules` | one line per loaded module               |
/// | `/mgnt/help`    | the command list                         |
///
/// Anything else is an error, answered with `500`.
#[derive(Debug, Clone)]
pub struct RouteListing {
    table: Arc<RouteTable>,
}

impl RouteListing {
    pub const COMMANDS: [&'static str; 3] = ["routes", "modules", "help"];

    pub fn new(table: Arc<RouteTable>) -> Self {
        Self { table }
    }
}

impl Management for RouteListing {
    fn handle(&self, req: &Request, resp: &mut Response) -> Result<(), HandlerError> {
        let command = req
            .path()
            .strip_prefix(MANAGEMENT_PREFIX)
            .unwrap_or_default()
            .trim_matches('/');

        let mut out = String::new();
        match command {
            "routes" => {
                for (method, path, module) in self.table.routes() {
                    let _ = writeln!(out, "{} {path} ({module})", method.as_str());
                }
            }
            "modules" => {
                for (name, author, routes, websockets) in self.table.modules() {
                    let _ = writeln!(
                        out,
                        "{name} by {author}: {routes} routes, {websockets} websockets"
                    );
                }
            }
            "help" => {
                for command in Self::COMMANDS {
                    let _ = writeln!(out, "{MANAGEMENT_PREFIX}/{command}");
                }
            }
            other => {
                return Err(HandlerError::failed(format!(
                    "unknown management command `{other}`"
                )))
            }
        }

        resp.status(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .write(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::RespLimits;
    use std::{
        sync::mpsc,
        thread,
        time::Duration,
    };

    fn ok(_: &Request, _: &mut Response) -> Result<(), HandlerError> {
        Ok(())
    }

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes(), false).unwrap()
    }

    fn table() -> RouteTable {
        let table = RouteTable::default();
        table
            .load(
                Module::new("users", "alice")
                    .route("/users", Method::Get, |_, resp| {
                        resp.status(StatusCode::Ok).write("list");
                        Ok(())
                    })
                    .route("/users", Method::Post, ok)
                    .websocket(WebSocketInfo::new("/users/live")),
            )
            .unwrap();
        table
            .load(Module::new("health", "bob").route("/health", Method::Get, ok))
            .unwrap();
        table
    }

    #[test]
    fn lookup() {
        let table = table();

        #[rustfmt::skip]
        let cases = [
            ("/users",   Method::Get,    true),
            ("/users",   Method::Post,   true),
            ("/users",   Method::Delete, false),
            ("/users/",  Method::Get,    false),
            ("/health",  Method::Get,    true),
            ("/missing", Method::Get,    false),
        ];

        for (path, method, found) in cases {
            assert_eq!(table.find_route(path, method).is_some(), found, "{path} {method:?}");
        }

        assert!(table.find_websocket_route("/users/live").is_some());
        assert!(table.find_websocket_route("/users").is_none());
    }

    #[test]
    fn entry_runs_handler() {
        let table = table();
        let (entry, token) = table.find_route("/users", Method::Get).unwrap();

        let mut resp = Response::new(&RespLimits::default());
        entry.call(&request("GET /users HTTP/1.1\r\n\r\n"), &mut resp).unwrap();
        token.release();

        assert_eq!(resp.body(), b"list");
    }

    #[test]
    fn module_limits() {
        let table = RouteTable::new(ModuleLimits {
            max_routes: 1,
            max_websockets: 0,
        });

        let err = table
            .load(Module::new("big", "x").route("/a", Method::Get, ok).route("/b", Method::Get, ok))
            .unwrap_err();
        assert_eq!(
            err,
            RouteError::TooManyRoutes { module: "big".into(), count: 2, limit: 1 }
        );

        let err = table
            .load(Module::new("ws", "x").websocket(WebSocketInfo::new("/ws")))
            .unwrap_err();
        assert_eq!(
            err,
            RouteError::TooManyWebSockets { module: "ws".into(), count: 1, limit: 0 }
        );

        assert!(table.modules().is_empty());
    }

    #[test]
    fn duplicate_route_in_other_module() {
        let table = table();

        let err = table
            .load(Module::new("shadow", "eve").route("/health", Method::Get, ok))
            .unwrap_err();
        assert_eq!(
            err,
            RouteError::DuplicateRoute {
                method: "GET",
                path: "/health".into(),
                owner: "health".into(),
            }
        );

        let err = table
            .load(Module::new("shadow", "eve").websocket(WebSocketInfo::new("/users/live")))
            .unwrap_err();
        assert!(matches!(err, RouteError::DuplicateWebSocket { .. }));
    }

    #[test]
    fn reload_replaces_module() {
        let table = table();

        table
            .load(Module::new("health", "bob").route("/health/v2", Method::Get, ok))
            .unwrap();

        assert!(table.find_route("/health", Method::Get).is_none());
        assert!(table.find_route("/health/v2", Method::Get).is_some());
        assert_eq!(table.modules().len(), 2);
    }

    #[test]
    fn unload() {
        let table = table();

        assert_eq!(table.unload("health").unwrap().name, "health");
        assert_eq!(table.unload("health").unwrap_err(), RouteError::NotLoaded("health".into()));
        assert!(table.find_route("/health", Method::Get).is_none());
    }

    #[test]
    fn writer_waits_for_token() {
        let table = Arc::new(table());
        let (entry, token) = table.find_route("/health", Method::Get).unwrap();

        let (tx, rx) = mpsc::channel();
        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.unload("health").unwrap();
                tx.send(()).unwrap();
            })
        };

        // Still blocked while the lookup is held.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(entry);
        token.release();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
        assert!(table.find_route("/health", Method::Get).is_none());
    }

    #[test]
    fn token_owns_its_guard() {
        struct Flag<'a>(&'a std::cell::Cell<u32>);

        impl Drop for Flag<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let dropped = std::cell::Cell::new(0);

        let token = LockToken::new(Flag(&dropped));
        assert_eq!(dropped.get(), 0);
        token.release();
        assert_eq!(dropped.get(), 1);

        drop(LockToken::new(Flag(&dropped)));
        assert_eq!(dropped.get(), 2);
    }

    #[test]
    fn concurrent_readers() {
        let table = table();

        let (_, first) = table.find_route("/users", Method::Get).unwrap();
        let (_, second) = table.find_route("/health", Method::Get).unwrap();
        let (_, third) = table.find_websocket_route("/users/live").unwrap();

        first.release();
        second.release();
        drop(third);
    }

    #[test]
    fn listing() {
        let listing = RouteListing::new(Arc::new(table()));

        #[rustfmt::skip]
        let cases = [
            ("/mgnt/routes",  "GET /users (users)\nPOST /users (users)\nGET /health (health)\n"),
            ("/mgnt/modules", "users by alice: 2 routes, 1 websockets\nhealth by bob: 1 routes, 0 websockets\n"),
            ("/mgnt/help",    "/mgnt/routes\n/mgnt/modules\n/mgnt/help\n"),
        ];

        for (path, body) in cases {
            let mut resp = Response::new(&RespLimits::default());
            let req = request(&format!("GET {path} HTTP/1.1\r\n\r\n"));

            listing.handle(&req, &mut resp).unwrap();
            assert_eq!(crate::tools::str_op(resp.body()), body);
        }
    }

    #[test]
    fn listing_rejects_unknown_command() {
        let listing = RouteListing::new(Arc::new(table()));

        for path in ["/mgnt", "/mgnt/", "/mgnt/shutdown", "/mgnt/reload"] {
            let mut resp = Response::new(&RespLimits::default());
            let req = request(&format!("GET {path} HTTP/1.1\r\n\r\n"));

            assert!(listing.handle(&req, &mut resp).is_err(), "{path}");
        }
    }
}
