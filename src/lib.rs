//! file2ai: HTTP API and command line front ends for the `file2ai-core`
//! job pipeline.

pub mod cli;
pub mod config;
pub mod error;
pub mod load_config;
pub mod router;
pub mod routes;
pub mod state;

pub use cli::{run, Cli, Commands};
pub use router::build_app_router;
pub use state::AppState;
