//! portier - container entrypoint that waits for dependencies, applies
//! migrations once, then supervises the server as the foreground process.

pub mod bootstrap;
pub mod config;
pub mod server;
pub mod supervisor;
