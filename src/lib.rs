// HTTP/2 connection-to-service adapter
//
// A byte stream goes in, a tower `Service` comes out: the client role turns a
// connection into `Service<Request<B>>`, the server role feeds accepted
// streams to services produced by a factory.

// Payloads and the outbound pump
pub mod body;
mod flush;

// Connection establishment and background driving
pub mod driver;
pub mod handshake;

// Client and server roles
pub mod client;
pub mod server;

// Ambient concerns
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;

// Re-export main types
pub use body::{Body, BoxBody, RecvBody, StreamBody, to_bytes};
pub use config::{ConfigBuilder, Http2Config};
pub use driver::{ConnectionId, ConnectionStats, ConnectionStatus, Driver};
pub use error::{BoxError, Error, ErrorKind, Fatal, Result};
pub use executor::{Executor, TokioExecutor};
pub use server::{ConnectionContext, Server};

pub mod prelude {
    pub use crate::body::{Body, BoxBody, RecvBody, StreamBody};
    pub use crate::client::{Connection, ResponseFuture};
    pub use crate::config::Http2Config;
    pub use crate::driver::{ConnectionStats, ConnectionStatus};
    pub use crate::error::{Error, ErrorKind, Fatal};
    pub use crate::executor::TokioExecutor;
    pub use crate::server::{ConnectionContext, Modify, Server};
}
