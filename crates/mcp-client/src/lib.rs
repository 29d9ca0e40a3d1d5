//! `tarsy-mcp` — MCP (Model Context Protocol) client.
//!
//! Each alert session gets its own [`McpClient`], which manages one live
//! session per configured tool server. Transports:
//! - **stdio**: spawned subprocess, newline-delimited JSON-RPC.
//! - **http**: streamable HTTP — JSON-RPC over POST with a session header.
//! - **sse**: HTTP POST outbound, Server-Sent-Events inbound.
//!
//! Every operation runs under the recovery policy in [`recovery`]: one
//! retry, with a session re-initialization for lost-session and upstream
//! failures and a short randomized backoff for rate limits. Successful tool
//! results are masked and, when oversized, summarized before the agent
//! sees them.

pub mod client;
pub mod config;
pub mod protocol;
pub mod recovery;
pub mod transport;

pub use client::{McpClient, ResultSummarizer, SummarizationRequest, TransportFactory};
pub use config::McpRecoveryConfig;
pub use protocol::{McpTool, ToolCallResult};
pub use transport::{Transport, TransportError};

/// Errors specific to MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server not configured: {0}")]
    ServerNotFound(String),

    #[error("MCP session init failed for '{server}': {message}")]
    InitFailed { server: String, message: String },
}

impl From<McpError> for tarsy_domain::Error {
    fn from(e: McpError) -> Self {
        tarsy_domain::Error::Mcp(e.to_string())
    }
}
