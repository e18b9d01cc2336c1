use crate::{
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    server::connection::{AllLimits, HttpConnection},
    Gateway, Management, NoWebSocket, Router, WebSocket,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// Blocking HTTP/1.1 server, one OS thread per connection.
///
/// Every accepted socket gets its own thread that reads a single request,
/// dispatches it and closes the socket (or hands it to the websocket
/// collaborator). There is no pool and no keep-alive reuse.
///
/// # Examples
///
/// ```no_run
/// use modserve::{Method, Module, RouteTable, Server, StatusCode};
/// use std::sync::Arc;
///
/// let routes = Arc::new(RouteTable::default());
/// routes
///     .load(Module::new("hello", "ops").route("/", Method::Get, |_, resp| {
///         resp.status(StatusCode::Ok).write("Hello world!");
///         Ok(())
///     }))
///     .unwrap();
///
/// let server = Server::builder()
///     .router(routes)
///     .bind("127.0.0.1:8080")
///     .unwrap();
///
/// let handle = server.shutdown_handle();
/// std::thread::spawn(move || {
///     std::thread::sleep(std::time::Duration::from_secs(60));
///     handle.shutdown();
/// });
///
/// server.launch();
/// ```
pub struct Server {
    listener: TcpListener,
    connection: HttpConnection,
    stopped: Arc<AtomicBool>,
}

impl Server {
    #[inline(always)]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            router: None,
            websocket: None,
            management: None,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
        }
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that stops [`launch`](Server::launch) from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stopped: Arc::clone(&self.stopped),
            wake: self.listener.local_addr().ok().map(reachable),
        }
    }

    /// Accepts connections until a [`ShutdownHandle`] fires.
    ///
    /// The flag is checked after each `accept` returns; connections already
    /// being served finish on their own threads.
    pub fn launch(self) {
        let addr = self.listener.local_addr().ok();
        tracing::info!(addr = ?addr, "listening");

        loop {
            let accepted = self.listener.accept();

            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };

            let conn = self.connection.clone();
            let spawned = thread::Builder::new()
                .name("modserve-conn".into())
                .spawn(move || conn.run(stream));

            if let Err(err) = spawned {
                tracing::error!(peer = %peer, error = %err, "cannot spawn connection thread");
            }
        }

        tracing::info!(addr = ?addr, "listener stopped");
    }
}

/// Stops a running [`Server`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stopped: Arc<AtomicBool>,
    wake: Option<SocketAddr>,
}

impl ShutdownHandle {
    /// Sets the stop flag and wakes the blocked `accept`.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(addr) = self.wake {
            // The accept loop only needs to return once.
            let _ = TcpStream::connect_timeout(&addr, Duration::from_secs(1));
        }
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Loopback equivalent of a wildcard listen address.
fn reachable(mut addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => addr.set_ip(Ipv4Addr::LOCALHOST.into()),
        IpAddr::V6(ip) if ip.is_unspecified() => addr.set_ip(Ipv6Addr::LOCALHOST.into()),
        _ => {}
    }
    addr
}

/// Builder for [`Server`].
///
/// A [`Router`] is required; everything else has defaults:
/// [`NoWebSocket`], no management endpoint and the [`limits`](crate::limits)
/// defaults.
pub struct ServerBuilder {
    router: Option<Arc<dyn Router>>,
    websocket: Option<Arc<dyn WebSocket>>,
    management: Option<Arc<dyn Management>>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
}

impl ServerBuilder {
    /// Route table used for every ordinary and websocket lookup.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    #[inline(always)]
    pub fn websocket(mut self, websocket: Arc<dyn WebSocket>) -> Self {
        self.websocket = Some(websocket);
        self
    }

    /// Enables the endpoint under [`MANAGEMENT_PREFIX`](crate::MANAGEMENT_PREFIX).
    ///
    /// ```no_run
    /// use modserve::{RouteListing, RouteTable, Server};
    /// use std::sync::Arc;
    ///
    /// let routes = Arc::new(RouteTable::default());
    ///
    /// Server::builder()
    ///     .router(routes.clone())
    ///     .management(Arc::new(RouteListing::new(routes)))
    ///     .bind("127.0.0.1:8080")
    ///     .unwrap()
    ///     .launch();
    /// ```
    #[inline(always)]
    pub fn management(mut self, management: Arc<dyn Management>) -> Self {
        self.management = Some(management);
        self
    }

    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Creates the listening socket.
    ///
    /// This is the only fatal error of the server: a missing router, an
    /// address that does not resolve, or a failing `bind`/`listen`.
    pub fn bind<A: ToSocketAddrs>(self, addr: A) -> io::Result<Server> {
        let router = self.router.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "a router is required")
        })?;
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "address did not resolve")
        })?;

        let limits = AllLimits {
            server: self.server_limits.unwrap_or_default(),
            conn: self.connection_limits.unwrap_or_default(),
            req: self.request_limits.unwrap_or_default(),
            resp: self.response_limits.unwrap_or_default(),
        };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(limits.server.backlog)?;

        let gateway = Gateway::new(
            router,
            self.websocket.unwrap_or_else(|| Arc::new(NoWebSocket)),
            self.management,
        );

        Ok(Server {
            listener: socket.into(),
            connection: HttpConnection::new(gateway, Arc::new(limits)),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }
}
