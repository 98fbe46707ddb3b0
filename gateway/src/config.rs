//! 起動時に一度だけ読み込むゲートウェイの設定
//!
//! すべてコマンドライン引数または環境変数から取得する。リソースIDの有無は
//! ここでは検証せず、必要になった時点（セッション構築時）で失敗させる。

use std::net::SocketAddr;
use std::path::PathBuf;

use agent::AgentSettings;
use agent::prompt::{DEFAULT_MODEL_ID, DEFAULT_SYSTEM_PROMPT};
use clap::Parser;
use mcp::McpConfig;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::logging::LogFormat;
use crate::provider::SessionMode;

#[derive(Parser, Debug, Clone)]
#[command(name = "gateway")]
#[command(about = "Streaming agent gateway backed by AWS Bedrock", long_about = None)]
pub struct GatewayArgs {
    /// 待ち受けアドレス
    #[arg(long, env = "GATEWAY_ADDR", default_value = "0.0.0.0:8080")]
    pub address: SocketAddr,

    /// セッションの扱い方
    #[arg(long, env = "GATEWAY_SESSION_MODE", value_enum, default_value_t = SessionMode::Stateless)]
    pub session_mode: SessionMode,

    /// 使用するモデルID
    #[arg(long, env = "MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    /// リージョン（省略時はプロファイル設定または us-east-1）
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// 使用するAWSプロファイル名
    #[arg(long, env = "AWS_PROFILE")]
    pub aws_profile: Option<String>,

    /// 会話メモリのストアID
    #[arg(long, env = "BEDROCK_AGENTCORE_MEMORY_ID")]
    pub memory_id: Option<String>,

    /// コード実行環境のリソースID
    #[arg(long, env = "CODE_INTERPRETER_ID")]
    pub code_interpreter_id: Option<String>,

    /// ブラウザ環境のリソースID
    #[arg(long, env = "BROWSER_ID")]
    pub browser_id: Option<String>,

    /// MCP設定ファイル（省略時は .vscode/mcp.json を探す）
    #[arg(long, env = "MCP_CONFIG")]
    pub mcp_config: Option<PathBuf>,

    /// システムプロンプトを読み込むファイル
    #[arg(long, env = "SYSTEM_PROMPT_FILE")]
    pub system_prompt_file: Option<PathBuf>,

    /// 1ターンで許可するツール呼び出しの往復回数
    #[arg(long, default_value_t = agent::agent::DEFAULT_MAX_TOOL_ROUNDS)]
    pub max_tool_rounds: usize,

    /// 組み込みツール（current_time, rss）を無効にする
    #[arg(long)]
    pub no_builtin_tools: bool,

    /// モデルへ送るメッセージをデバッグログに出力する
    #[arg(long)]
    pub log_model_requests: bool,

    /// サーバーエラーの詳細をレスポンスに含める
    #[arg(long, env = "GATEWAY_EXPOSE_ERROR_DETAILS")]
    pub expose_error_details: bool,

    /// ログの出力形式
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// 読み込み済みのゲートウェイ設定
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub address: SocketAddr,
    pub session_mode: SessionMode,
    pub expose_error_details: bool,
    pub agent: AgentSettings,
}

impl GatewayArgs {
    /// 引数からゲートウェイ設定を組み立てる
    ///
    /// # Errors
    /// MCP設定ファイルやシステムプロンプトファイルが読み込めない場合
    pub fn into_config(self) -> Result<GatewayConfig, GatewayError> {
        let mcp = match &self.mcp_config {
            Some(path) => McpConfig::load_from_file(path).map_err(|e| {
                GatewayError::Config(format!("failed to load {}: {}", path.display(), e))
            })?,
            None => match McpConfig::load_default() {
                Ok(Some(config)) => config,
                Ok(None) => McpConfig::default(),
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable default MCP config");
                    McpConfig::default()
                }
            },
        };

        let system_prompt = match &self.system_prompt_file {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                GatewayError::Config(format!("failed to read {}: {}", path.display(), e))
            })?,
            None => DEFAULT_SYSTEM_PROMPT.to_string(),
        };

        info!(
            servers = ?mcp.server_names(),
            session_mode = ?self.session_mode,
            "configuration loaded"
        );

        let workspace_folder = std::env::current_dir()
            .ok()
            .map(|dir| dir.display().to_string());

        Ok(GatewayConfig {
            address: self.address,
            session_mode: self.session_mode,
            expose_error_details: self.expose_error_details,
            agent: AgentSettings {
                model_id: self.model_id,
                system_prompt,
                region: self.region,
                profile: self.aws_profile,
                memory_id: self.memory_id,
                code_interpreter_id: self.code_interpreter_id,
                browser_id: self.browser_id,
                workspace_folder,
                mcp,
                max_tool_rounds: self.max_tool_rounds,
                builtin_tools: !self.no_builtin_tools,
                log_model_requests: self.log_model_requests,
                ..AgentSettings::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> GatewayArgs {
        let mut argv = vec!["gateway"];
        argv.extend_from_slice(args);
        GatewayArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_explicit_arguments() {
        let args = parse(&[
            "--address",
            "127.0.0.1:9000",
            "--session-mode",
            "stateful",
            "--memory-id",
            "mem-1",
            "--no-builtin-tools",
        ]);

        assert_eq!(args.address, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(args.session_mode, SessionMode::Stateful);
        assert_eq!(args.memory_id.as_deref(), Some("mem-1"));
        assert!(args.no_builtin_tools);
    }

    #[test]
    fn test_config_from_files() {
        let dir = std::env::temp_dir().join(format!("gateway-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mcp_path = dir.join("mcp.json");
        std::fs::File::create(&mcp_path)
            .unwrap()
            .write_all(br#"{ "servers": { "time": { "command": "uvx", "args": ["mcp-server-time"] } } }"#)
            .unwrap();
        let prompt_path = dir.join("prompt.txt");
        std::fs::write(&prompt_path, "You are terse.").unwrap();

        let config = parse(&[
            "--mcp-config",
            mcp_path.to_str().unwrap(),
            "--system-prompt-file",
            prompt_path.to_str().unwrap(),
            "--no-builtin-tools",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.agent.system_prompt, "You are terse.");
        assert!(config.agent.mcp.servers.contains_key("time"));
        assert!(!config.agent.builtin_tools);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_prompt_file_is_an_error() {
        let result = parse(&["--system-prompt-file", "/nonexistent/prompt.txt"]).into_config();
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
