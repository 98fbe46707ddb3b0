pub mod config;
pub mod mcp;

pub use config::{McpConfig, ResolvedServer, ServerConfig, Variables};
pub use mcp::{McpClient, McpError, ToolOutput};

// Re-export commonly used types from rmcp for convenience
pub use rmcp::model::Tool;
