//! Plugin discovery, the sandbox child, and the agent-side proxy to it.

pub mod command;
pub mod host;
pub mod loader;
pub mod manifest;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod snapshot;

pub use loader::{Generation, PluginLoader};
pub use sandbox::{ProcessSandboxFactory, Sandbox, SandboxFactory};
