//! modserve - embeddable HTTP/1.1 server core for module-provided handlers
//!
//! The crate owns the transport and protocol work of a host process whose
//! request handlers live in separately registered units ("modules"):
//!
//! - **Message parsing** of untrusted, partially-buffered request bytes
//!   into a [`Request`] (method, path, headers, query parameters, body)
//! - **Form decoding** of `multipart/form-data` and
//!   `application/x-www-form-urlencoded` bodies
//! - **Connection lifecycle** with one OS thread per accepted socket:
//!   bounded read, parse, dispatch, serialize, write, release
//! - **Dispatching** to a route table, a websocket collaborator or a
//!   management endpoint ([`Gateway`])
//! - **Service location**, handing modules typed references to the
//!   host's cache, scheduler and database ([`services`])
//!
//! # Examples
//!
//! ```no_run
//! use modserve::{Module, RouteTable, Server, StatusCode, Method};
//! use std::sync::Arc;
//!
//! let routes = Arc::new(RouteTable::default());
//! routes
//!     .load(Module::new("hello", "ops").route("/hello", Method::Get, |_, resp| {
//!         resp.status(StatusCode::Ok).write("Hello world!");
//!         Ok(())
//!     }))
//!     .unwrap();
//!
//! Server::builder()
//!     .router(routes)
//!     .bind("127.0.0.1:8080")
//!     .unwrap()
//!     .launch();
//! ```
//!
//! Limits are adjusted through the builder, see [`limits`]:
//!
//! ```no_run
//! use modserve::{Server, RouteTable, limits::{ConnLimits, ReqLimits}};
//! use std::{sync::Arc, time::Duration};
//!
//! Server::builder()
//!     .router(Arc::new(RouteTable::default()))
//!     .request_limits(ReqLimits {
//!         max_body_size: 64 * 1024,
//!         ..ReqLimits::default()
//!     })
//!     .connection_limits(ConnLimits {
//!         socket_read_timeout: Duration::from_secs(2),
//!         ..ConnLimits::default()
//!     })
//!     .bind("127.0.0.1:8080")
//!     .unwrap()
//!     .launch();
//! ```

pub(crate) mod http {
    pub(crate) mod form;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod gateway;
    pub(crate) mod router;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;
pub mod services;

pub use crate::{
    errors::{ErrorKind, HandlerError},
    http::{
        form::FormError,
        query,
        request::{ConnectionMode, ParseError, ParseErrorKind, Request},
        response::{BodyBuffer, Response, WriteBuffer},
        types::{HeaderMap, Method, StatusCode, HTTP_VERSION},
    },
    server::{
        gateway::{safe_execute, Gateway, Management, NoWebSocket, WebSocket, MANAGEMENT_PREFIX},
        router::{
            Entry, LockToken, Module, RouteError, RouteInfo, RouteListing, RouteTable, Router,
            WebSocketInfo,
        },
        server_impl::{Server, ServerBuilder, ShutdownHandle},
    },
};
