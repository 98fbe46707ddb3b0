use rmcp::{
    RmcpError,
    model::{CallToolRequestParam, Tool},
    service::{RoleClient, RunningService, ServiceError, ServiceExt},
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use serde_json::Value;
use tokio::process::Command;

use crate::config::ResolvedServer;

/// MCPクライアントのエラー型
#[derive(thiserror::Error, Debug)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    TransportError(String),

    #[error("MCP protocol error: {0}")]
    ProtocolError(#[from] RmcpError),

    #[error("MCP service error: {0}")]
    ServiceError(#[from] ServiceError),

    #[error("MCP client initialization error: {0}")]
    InitializationError(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Task join error: {0}")]
    TaskJoinError(#[from] tokio::task::JoinError),
}

/// ツール実行結果のテキスト表現
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// テキストコンテンツを改行で連結したもの
    pub text: String,
    /// サーバーがエラーとして返したかどうか
    pub is_error: bool,
}

impl ToolOutput {
    /// `CallToolResult` のJSON表現からテキストを取り出す
    ///
    /// テキスト以外のコンテンツ（画像など）はJSONのまま連結する。
    pub fn from_result(result: &Value) -> Self {
        let text = result
            .get("content")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .map(|part| match part.get("text").and_then(Value::as_str) {
                        Some(text) => text.to_string(),
                        None => part.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Self { text, is_error }
    }
}

/// ローカルMCPサーバーとの通信を管理するクライアント
///
/// このクライアントは以下の機能を提供します：
/// - ローカルプロセスとしてのMCPサーバーの起動と接続
/// - ツール情報の取得と実行
pub struct McpClient {
    /// 接続先のサーバー名（ログ用）
    name: String,
    /// MCP RPC サービスクライアント
    client: RunningService<RoleClient, ()>,
}

impl McpClient {
    /// 変数展開済みのサーバー設定からプロセスを起動して接続する
    ///
    /// # Examples
    /// ```no_run
    /// # use mcp::{McpClient, McpConfig, Variables};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = McpConfig::parse(r#"{ "servers": { "git": { "command": "uvx", "args": ["mcp-server-git"] } } }"#)?;
    /// let servers = config.resolve_all(&Variables::new())?;
    /// let client = McpClient::connect(&servers[0]).await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Returns
    /// * `Ok(McpClient)` - 接続に成功した場合
    /// * `Err(McpError)` - プロセス起動またはハンドシェイクに失敗した場合
    pub async fn connect(server: &ResolvedServer) -> Result<Self, McpError> {
        if server.command.trim().is_empty() {
            return Err(McpError::InvalidArguments(format!(
                "MCP server '{}' has an empty command",
                server.name
            )));
        }

        let transport = TokioChildProcess::new(Command::new(&server.command).configure(|cmd| {
            cmd.args(&server.args);
            cmd.envs(&server.env);
            if let Some(cwd) = &server.cwd {
                cmd.current_dir(cwd);
            }
        }))
        .map_err(|e| McpError::TransportError(e.to_string()))?;

        let client = ()
            .serve(transport)
            .await
            .map_err(|e| McpError::InitializationError(e.to_string()))?;

        tracing::info!(server = %server.name, "MCP server connected");

        Ok(Self {
            name: server.name.clone(),
            client,
        })
    }

    /// 接続先のサーバー名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 利用可能なツールの一覧を取得する
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        let response = self.client.list_tools(Default::default()).await?;
        Ok(response.tools)
    }

    /// 指定されたツールを実行する
    ///
    /// # Arguments
    /// * `tool_name` - 実行するツール名
    /// * `arguments` - ツールに渡す引数（JSONオブジェクト）
    ///
    /// # Returns
    /// * `Ok(Value)` - ツールの実行結果（`CallToolResult` のJSON表現）
    /// * `Err(McpError)` - 実行に失敗した場合
    pub async fn call_tool(
        &self,
        tool_name: String,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<Value, McpError> {
        let result = self
            .client
            .call_tool(CallToolRequestParam {
                name: tool_name.into(),
                arguments,
            })
            .await?;

        Ok(serde_json::to_value(&result).unwrap_or(Value::Null))
    }

    /// ツールを実行し、結果をテキストとして取得する
    ///
    /// 引数はJSONオブジェクトである必要がある（`null` は引数なしとして扱う）。
    pub async fn call_tool_text(&self, tool_name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(McpError::InvalidArguments(format!(
                    "tool '{}' expects an object, got {}",
                    tool_name, other
                )));
            }
        };

        let result = self.call_tool(tool_name.to_string(), arguments).await?;
        Ok(ToolOutput::from_result(&result))
    }

    /// MCPサーバーとの接続を切断する
    pub async fn disconnect(self) -> Result<(), McpError> {
        self.client.cancel().await?;
        Ok(())
    }
}
