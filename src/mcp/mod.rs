//! MCP protocol engine and transports

pub mod dispatcher;
pub mod protocol;
pub mod server;

pub use dispatcher::{Connection, ConnectionState, Dispatcher};
pub use server::McpServer;
