//! The node daemon: TCP server, request dispatch, and lifecycle.

pub mod handlers;
pub mod node;
pub mod server;

pub use handlers::Handlers;
pub use node::{NodeDaemon, NodeHandle};
pub use server::{BoundServer, ServerConfig, ServerHandle};
