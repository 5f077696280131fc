//! weave-cli: authoring tools for weave plugins
//!
//! The `weave` binary is a thin shell over [`commands`]; logging setup lives
//! in [`tracing_support`].

pub mod commands;
pub mod tracing_support;

pub use commands::{Issue, Report};
pub use tracing_support::{init_subscriber, init_subscriber_with_config, TracingConfig, TracingFormat};
