/// Agent 層のエラー型
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("AWS Bedrock API error: {0}")]
    BedrockError(String),

    #[error("Message building error: {0}")]
    MessageBuildError(String),

    #[error("AWS SDK error: {0}")]
    AwsSdkError(String),

    #[error("MCP error: {0}")]
    McpError(#[from] mcp::McpError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Memory error: {0}")]
    MemoryError(String),

    #[error("Generation cancelled")]
    Cancelled,
}

impl From<aws_smithy_types::error::operation::BuildError> for AgentError {
    fn from(e: aws_smithy_types::error::operation::BuildError) -> Self {
        AgentError::MessageBuildError(e.to_string())
    }
}
