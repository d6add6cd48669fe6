//! CLI command implementations.

pub mod emit;
pub mod replay;
pub mod search;
pub mod serve;
pub mod subscribe;

/// Shared context for client subcommands.
pub struct Context {
    /// Base URL of the PCAS server.
    pub server_url: String,
    /// Verbose output flag.
    #[allow(dead_code)]
    pub verbose: bool,
}
