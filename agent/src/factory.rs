//! セッションの構築
//!
//! 検索ポリシー → メモリバインディング → ケイパビリティ → Bedrock セッションの順に組み立てる。
//! どこかで失敗した場合は `Err` を返し、途中まで作ったものはすべて破棄される。

use std::sync::Arc;

use async_trait::async_trait;
use mcp::{McpConfig, Variables};
use tracing::info;

use crate::agent::{BedrockAgent, ClientSettings, DEFAULT_MAX_TOOL_ROUNDS, load_client, turns_to_messages};
use crate::error::AgentError;
use crate::hooks::LoggingHook;
use crate::memory::{
    ConversationStore, InMemoryConversationStore, MemoryBinding, RetrievalConfig, RetryPolicy,
    SessionKey, normalize_turns,
};
use crate::prompt::{DEFAULT_MODEL_ID, DEFAULT_SYSTEM_PROMPT};
use crate::session::{AgentSession, SessionFactory, SessionIdentity};
use crate::tools::{CapabilitySet, CurrentTime, FeedReader, connect_mcp_capabilities};

/// セッション構築に使う設定（プロセス起動時に一度だけ読み込まれる）
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model_id: String,
    pub system_prompt: String,
    pub region: Option<String>,
    pub profile: Option<String>,
    /// 会話メモリのストアID
    pub memory_id: Option<String>,
    /// コード実行環境のリソースID（MCP設定の `${codeInterpreterId}` に展開される）
    pub code_interpreter_id: Option<String>,
    /// ブラウザ環境のリソースID（MCP設定の `${browserId}` に展開される）
    pub browser_id: Option<String>,
    pub workspace_folder: Option<String>,
    pub mcp: McpConfig,
    pub retrieval: RetrievalConfig,
    pub retry: RetryPolicy,
    pub max_tool_rounds: usize,
    pub builtin_tools: bool,
    pub log_model_requests: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            region: None,
            profile: None,
            memory_id: None,
            code_interpreter_id: None,
            browser_id: None,
            workspace_folder: None,
            mcp: McpConfig::default(),
            retrieval: RetrievalConfig::default(),
            retry: RetryPolicy::default(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            builtin_tools: true,
            log_model_requests: false,
        }
    }
}

impl AgentSettings {
    /// MCP設定の展開に使う変数
    pub fn variables(&self) -> Variables {
        Variables::new()
            .with("region", self.region.as_deref())
            .with("memoryId", self.memory_id.as_deref())
            .with("codeInterpreterId", self.code_interpreter_id.as_deref())
            .with("browserId", self.browser_id.as_deref())
            .with("workspaceFolder", self.workspace_folder.as_deref())
    }
}

/// Bedrock セッションを構築するファクトリ
pub struct BedrockSessionFactory {
    settings: AgentSettings,
    store: Arc<dyn ConversationStore>,
}

impl BedrockSessionFactory {
    /// プロセス内ストアを使うファクトリを作成する
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings,
            store: Arc::new(InMemoryConversationStore::new()),
        }
    }

    /// 会話履歴の保存先を差し替える
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// メモリバインディングを作成する
    ///
    /// 識別子のないセッションではメモリを使わない。識別子があるのに
    /// メモリストアIDが設定されていない場合は構築エラーにする。
    pub fn bind_memory(&self, identity: &SessionIdentity) -> Result<Option<MemoryBinding>, AgentError> {
        let (Some(session_id), Some(actor_id)) = (&identity.session_id, &identity.actor_id) else {
            return Ok(None);
        };

        let memory_id = self.settings.memory_id.as_deref().filter(|id| !id.is_empty()).ok_or_else(|| {
            AgentError::ConfigError("memory store id is not configured".to_string())
        })?;

        let key = SessionKey {
            memory_id: memory_id.to_string(),
            session_id: session_id.clone(),
            actor_id: actor_id.clone(),
        };

        Ok(Some(MemoryBinding::new(
            key,
            &self.settings.retrieval,
            self.store.clone(),
            self.settings.retry,
        )))
    }

    /// 組み込みツールとMCPサーバーのツールを集める
    pub async fn build_capabilities(&self) -> Result<CapabilitySet, AgentError> {
        let mut capabilities = CapabilitySet::new();

        if self.settings.builtin_tools {
            capabilities = capabilities.with(CurrentTime::new()).with(FeedReader::new());
        }

        let servers = self
            .settings
            .mcp
            .resolve_all(&self.settings.variables())
            .map_err(|e| AgentError::ConfigError(e.to_string()))?;

        for capability in connect_mcp_capabilities(&servers).await? {
            capabilities.push(capability);
        }

        Ok(capabilities)
    }
}

#[async_trait]
impl SessionFactory for BedrockSessionFactory {
    async fn create(&self, identity: &SessionIdentity) -> Result<Arc<dyn AgentSession>, AgentError> {
        info!(
            session_id = identity.session_id.as_deref().unwrap_or("-"),
            actor_id = identity.actor_id.as_deref().unwrap_or("-"),
            "agent initializing"
        );

        let memory = self.bind_memory(identity)?.map(Arc::new);
        let capabilities = self.build_capabilities().await?;

        let client = load_client(&ClientSettings {
            profile: self.settings.profile.clone(),
            region: self.settings.region.clone(),
            retry: self.settings.retry,
        })
        .await;

        let mut agent = BedrockAgent::new(client, &self.settings.model_id)
            .with_system_prompt(&self.settings.system_prompt)
            .with_capabilities(capabilities)
            .with_max_tool_rounds(self.settings.max_tool_rounds);

        if self.settings.log_model_requests {
            agent = agent.with_hook(Arc::new(LoggingHook));
        }

        if let Some(memory) = memory {
            let history = normalize_turns(memory.history().await?);
            info!(turns = history.len(), "conversation history restored");
            agent = agent
                .with_history(turns_to_messages(&history)?)
                .with_memory(memory);
        }

        info!(
            model_id = agent.model_id(),
            tools = ?agent.tool_names(),
            "agent initialized"
        );

        Ok(Arc::new(agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_identity_has_no_memory() {
        let factory = BedrockSessionFactory::new(AgentSettings::default());
        assert!(factory.bind_memory(&SessionIdentity::anonymous()).unwrap().is_none());
    }

    #[test]
    fn test_stateful_identity_requires_memory_id() {
        let factory = BedrockSessionFactory::new(AgentSettings::default());
        let err = factory
            .bind_memory(&SessionIdentity::new("s-1", "u-1"))
            .unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(_)));
    }

    #[test]
    fn test_memory_binding_scoped_to_identity() {
        let factory = BedrockSessionFactory::new(AgentSettings {
            memory_id: Some("mem-1".to_string()),
            ..AgentSettings::default()
        });

        let binding = factory
            .bind_memory(&SessionIdentity::new("s-1", "u-1"))
            .unwrap()
            .unwrap();

        assert_eq!(binding.key().memory_id, "mem-1");
        assert_eq!(binding.key().session_id, "s-1");
        assert!(binding.retrieval().contains_key("/preferences/u-1"));
    }

    #[tokio::test]
    async fn test_builtin_capabilities() {
        let factory = BedrockSessionFactory::new(AgentSettings::default());
        let capabilities = factory.build_capabilities().await.unwrap();
        assert_eq!(capabilities.names(), vec!["current_time", "rss"]);

        let factory = BedrockSessionFactory::new(AgentSettings {
            builtin_tools: false,
            ..AgentSettings::default()
        });
        assert!(factory.build_capabilities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_mcp_server_fails_construction() {
        let mcp = McpConfig::parse(
            r#"{ "servers": { "code": { "command": "nonexistent_command_12345", "args": ["${codeInterpreterId}"] } } }"#,
        )
        .unwrap();
        let factory = BedrockSessionFactory::new(AgentSettings {
            mcp,
            code_interpreter_id: Some("ci-1".to_string()),
            ..AgentSettings::default()
        });

        let result = factory.create(&SessionIdentity::anonymous()).await;
        assert!(result.is_err(), "起動できないMCPサーバーがある場合は構築に失敗するべき");
    }

    #[test]
    fn test_variables() {
        let settings = AgentSettings {
            region: Some("us-west-2".to_string()),
            browser_id: Some("br-1".to_string()),
            ..AgentSettings::default()
        };
        let vars = settings.variables();
        assert_eq!(vars.expand("${region}/${browserId}/${memoryId}"), "us-west-2/br-1/${memoryId}");
    }
}
