//! CLI command modules.

pub mod http;
pub mod jobs;
pub mod status;
pub mod watch;
