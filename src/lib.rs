//! Host metrics agent.
//!
//! Built-in checks read `/proc` and `/sys` directly. Plugin checks and
//! declarative slices are described by TOML manifests and only ever run in a
//! sandbox child process that is rebuilt when the plugin directory changes or
//! its memory use crosses a ceiling.

pub mod check;
pub mod config;
pub mod error;
pub mod logging;
pub mod payload;
pub mod plugin;
pub mod poster;
pub mod scheduler;
pub mod selector;
pub mod slice;
pub mod telemetry;
