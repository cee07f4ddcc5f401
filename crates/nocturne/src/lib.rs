// src/lib.rs
//! Static file server on Linux `epoll`.
//!
//! One reactor thread accepts connections and moves bytes; a fixed pool of
//! workers parses HTTP/1.1 GET requests and maps the requested files.
//!
//! ```rust,no_run
//! use nocturne::Server;
//!
//! Server::bind("0.0.0.0", 8080)
//!     .doc_root("./resources")
//!     .workers(8)
//!     .serve()
//!     .unwrap();
//! ```

pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod response;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod timer;
pub mod worker;

// Re-exports for users
pub use config::ServerConfig;
pub use error::{NocturneError, NocturneResult};
pub use http::{HttpCode, Method};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use reactor::{Reactor, ShutdownHandle};
pub use server::Server;
