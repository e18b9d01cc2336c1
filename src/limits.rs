//! Server configuration limits and timeouts
//!
//! Every buffer the server allocates per connection is bounded by one of
//! the values below. Nothing here is a hard array size: the defaults mirror
//! a small, conservative host and can be raised through the builder.
//!
//! # Memory Consumption
//!
//! Each active connection consumes roughly:
//!
//! `Total` = [`Request Buffer`](ReqLimits#request-buffer) +
//!           [`Response Buffers`](RespLimits#response-buffers) +
//!           `Thread stack`
//!
//! # Examples
//!
//! ```no_run
//! use modserve::{Server, RouteTable, limits::{ConnLimits, ReqLimits, RespLimits}};
//! use std::{sync::Arc, time::Duration};
//!
//! Server::builder()
//!     .router(Arc::new(RouteTable::default()))
//!     .connection_limits(ConnLimits {
//!         socket_read_timeout: Duration::from_secs(2),
//!         ..ConnLimits::default()
//!     })
//!     .request_limits(ReqLimits {
//!         max_body_size: 64 * 1024, // Larger uploads
//!         ..ReqLimits::default()
//!     })
//!     .response_limits(RespLimits {
//!         max_response_size: 32 * 1024,
//!         ..RespLimits::default()
//!     })
//!     .bind("127.0.0.1:8080")
//!     .unwrap()
//!     .launch();
//! ```

use std::time::Duration;

/// Listener-level settings.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Pending connection queue passed to `listen(2)` (default: `128`).
    pub backlog: i32,

    /// Format for error responses (default: `true`)
    ///
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// Connection: close\r
    /// Content-Length: 65\r
    /// Content-Type: application/json\r
    /// \r
    /// {"error":"Unrecognized HTTP method","code":"UNRECOGNIZED_METHOD"}
    /// ```
    /// If `false`, the same status line is sent with an empty body.
    pub json_errors: bool,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            backlog: 128,
            json_errors: true,
        }
    }
}

/// Connection-level timeouts
///
/// A connection is served by exactly one thread from accept to close, so
/// these deadlines are what keeps a slow or silent client from pinning a
/// thread forever.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Deadline for every single socket read (default: `5 seconds`)
    ///
    /// Applies to the first read and to each read of the body loop. A
    /// client that declares a `Content-Length` and stops sending gets a
    /// `408 Request Timeout`.
    pub socket_read_timeout: Duration,

    /// Deadline for writing the response (default: `5 seconds`)
    pub socket_write_timeout: Duration,
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(5),
            socket_write_timeout: Duration::from_secs(5),
        }
    }
}

/// Request reading and parsing limits
///
/// # Request Buffer
///
/// The first read goes into a buffer of `buffer_size` bytes. If the header
/// block is not complete yet, reading continues up to `header_block_size`.
/// Once the header block is known, the buffer grows to hold the declared
/// `Content-Length`, which may not exceed `max_body_size`.
///
/// | Component     | Default  | Error when exceeded         |
/// |---------------|----------|-----------------------------|
/// | First read    | 8 KiB    | -                           |
/// | Header block  | 8 KiB    | `400 Bad Request`           |
/// | Body          | 1 MiB    | `413 Payload Too Large`     |
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Capacity of the initial read (default: `8 KiB`)
    pub buffer_size: usize,

    /// Maximum size of request line plus headers, including the blank
    /// line terminating them (default: `8 KiB`)
    pub header_block_size: usize,

    /// Maximum declared `Content-Length` (default: `1 MiB`)
    pub max_body_size: usize,

    /// Percent-decode query and url-encoded form values (default: `false`)
    ///
    /// When enabled, `%XX` escapes are decoded and `+` becomes a space.
    /// Values that do not decode to UTF-8 are kept verbatim.
    pub percent_decode: bool,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            header_block_size: 8 * 1024,
            max_body_size: 1024 * 1024,
            percent_decode: false,
        }
    }
}

/// Response buffer limits
///
/// # Response Buffers
///
/// Handlers write into a body buffer of `body_capacity` bytes; anything
/// beyond that is dropped. Headers are serialized into at most
/// `header_capacity` bytes, and the complete response (status line,
/// headers, `Content-Length`, blank line and body) is cut at
/// `max_response_size`. Every truncation is logged at `warn` level.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Response body capacity (default: `8 KiB`)
    pub body_capacity: usize,
    /// Serialized header block capacity (default: `4 KiB`)
    pub header_capacity: usize,
    /// Capacity of the assembled response written to the socket (default: `8 KiB`)
    pub max_response_size: usize,
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            body_capacity: 8 * 1024,
            header_capacity: 4 * 1024,
            max_response_size: 8 * 1024,
        }
    }
}

/// Bounds applied when a [`Module`](crate::Module) is loaded into a
/// [`RouteTable`](crate::RouteTable).
#[derive(Debug, Clone)]
pub struct ModuleLimits {
    /// Maximum ordinary routes per module (default: `10`)
    pub max_routes: usize,
    /// Maximum websocket routes per module (default: `10`)
    pub max_websockets: usize,
}

impl Default for ModuleLimits {
    fn default() -> Self {
        Self {
            max_routes: 10,
            max_websockets: 10,
        }
    }
}
