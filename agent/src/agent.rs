use std::sync::Arc;

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::retry::RetryConfig;
use aws_config::{self, BehaviorVersion};
use aws_sdk_bedrockruntime::Client;
use aws_sdk_bedrockruntime::error::DisplayErrorContext;
use aws_sdk_bedrockruntime::operation::converse_stream::ConverseStreamOutput as ConverseStreamResponse;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ContentBlockDelta, ContentBlockStart, ConversationRole, ConverseStreamOutput,
    Message, StopReason, SystemContentBlock, ToolConfiguration, ToolResultBlock,
    ToolResultContentBlock, ToolResultStatus, ToolUseBlock,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::document::{json_to_document, parse_tool_input};
use crate::error::AgentError;
use crate::hooks::ModelHook;
use crate::memory::{MemoryBinding, RetryPolicy, StoredTurn, TurnRole};
use crate::session::{self, AgentEvent, AgentSession, EventSender, EventStream};
use crate::tools::CapabilitySet;

/// イベントチャネルのバッファサイズ
const EVENT_BUFFER: usize = 32;

/// ツール呼び出しの往復回数の上限（デフォルト）
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

/// AWS クライアントの接続設定
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    /// 使用する AWS プロファイル名（`None` の場合はデフォルトの認証チェーン）
    pub profile: Option<String>,
    /// リージョン。指定しない場合はデフォルトプロファイルの設定またはus-east-1を使用
    pub region: Option<String>,
    /// SDK 呼び出しに適用するリトライ設定
    pub retry: RetryPolicy,
}

/// Bedrock Runtime クライアントを作成する
///
/// # Arguments
/// * `settings` - プロファイル・リージョン・リトライの設定
///
/// # Returns
/// 初期化された `Client`
pub async fn load_client(settings: &ClientSettings) -> Client {
    let region_provider =
        RegionProviderChain::first_try(settings.region.clone().map(aws_config::Region::new))
            .or_default_provider()
            .or_else(aws_config::Region::new("us-east-1"));

    let retry_config = RetryConfig::adaptive()
        .with_max_attempts(settings.retry.max_attempts.max(1))
        .with_initial_backoff(settings.retry.initial_backoff)
        .with_max_backoff(settings.retry.max_backoff);

    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(region_provider)
        .retry_config(retry_config);

    if let Some(profile) = &settings.profile {
        loader = loader.profile_name(profile);
    }

    Client::new(&loader.load().await)
}

/// モデルのストリームから読み取る1イベント
#[derive(Debug)]
enum ModelEvent {
    Text(String),
    ToolUseStart { tool_use_id: String, name: String },
    ToolUseInput(String),
    BlockStop,
    MessageStop(StopReason),
    Usage { input_tokens: i32, output_tokens: i32 },
}

/// 1回分のモデル呼び出し
struct ModelRequest {
    model_id: String,
    messages: Vec<Message>,
    tool_config: Option<ToolConfiguration>,
    system_prompt: Option<String>,
}

/// モデル呼び出しの境界
#[async_trait]
trait ModelBackend: Send + Sync {
    async fn converse(&self, request: ModelRequest) -> Result<Box<dyn ModelEvents>, AgentError>;
}

/// 応答イベントの読み取り口
#[async_trait]
trait ModelEvents: Send {
    /// 次のイベント。ストリームが終わると `None`
    async fn next_event(&mut self) -> Result<Option<ModelEvent>, AgentError>;
}

/// Bedrock ConverseStream による実装
struct BedrockBackend {
    client: Client,
}

#[async_trait]
impl ModelBackend for BedrockBackend {
    async fn converse(&self, request: ModelRequest) -> Result<Box<dyn ModelEvents>, AgentError> {
        let mut builder = self
            .client
            .converse_stream()
            .model_id(request.model_id)
            .set_messages(Some(request.messages))
            .set_tool_config(request.tool_config);

        if let Some(system_prompt) = request.system_prompt {
            builder = builder.system(SystemContentBlock::Text(system_prompt));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AgentError::AwsSdkError(DisplayErrorContext(&e).to_string()))?;

        Ok(Box::new(BedrockEvents { response }))
    }
}

struct BedrockEvents {
    response: ConverseStreamResponse,
}

#[async_trait]
impl ModelEvents for BedrockEvents {
    async fn next_event(&mut self) -> Result<Option<ModelEvent>, AgentError> {
        loop {
            let next = self
                .response
                .stream
                .recv()
                .await
                .map_err(|e| AgentError::BedrockError(DisplayErrorContext(&e).to_string()))?;

            let Some(output) = next else {
                return Ok(None);
            };
            if let Some(event) = model_event(output) {
                return Ok(Some(event));
            }
        }
    }
}

/// ConverseStream のイベントのうち、ターンの処理に必要なものだけを取り出す
fn model_event(output: ConverseStreamOutput) -> Option<ModelEvent> {
    match output {
        ConverseStreamOutput::ContentBlockStart(start) => match start.start {
            Some(ContentBlockStart::ToolUse(tool)) => Some(ModelEvent::ToolUseStart {
                tool_use_id: tool.tool_use_id,
                name: tool.name,
            }),
            _ => None,
        },
        ConverseStreamOutput::ContentBlockDelta(delta) => match delta.delta {
            Some(ContentBlockDelta::Text(text)) => Some(ModelEvent::Text(text)),
            Some(ContentBlockDelta::ToolUse(tool_delta)) => {
                Some(ModelEvent::ToolUseInput(tool_delta.input))
            }
            _ => None,
        },
        ConverseStreamOutput::ContentBlockStop(_) => Some(ModelEvent::BlockStop),
        ConverseStreamOutput::MessageStop(stop) => Some(ModelEvent::MessageStop(stop.stop_reason)),
        ConverseStreamOutput::Metadata(metadata) => metadata.usage.map(|usage| ModelEvent::Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        }),
        _ => None,
    }
}

/// Bedrock を使った会話セッション
///
/// AWS Bedrock との通信と会話履歴を管理する。1つのセッションで同時に実行される
/// ターンは1つだけで、後続のリクエストは前のターンのストリームが終わるまで待機する。
pub struct BedrockAgent {
    inner: Inner,
}

#[derive(Clone)]
struct Inner {
    backend: Arc<dyn ModelBackend>,
    model_id: String,
    system_prompt: String,
    capabilities: CapabilitySet,
    hooks: Vec<Arc<dyn ModelHook>>,
    memory: Option<Arc<MemoryBinding>>,
    messages: Arc<Mutex<Vec<Message>>>,
    max_tool_rounds: usize,
}

/// ストリーミング中に組み立てるツール呼び出し
#[derive(Debug, Default)]
struct PendingToolUse {
    tool_use_id: String,
    name: String,
    input: String,
}

/// 1回のモデル呼び出しの結果
#[derive(Debug, Default)]
struct RoundOutput {
    text: String,
    tool_uses: Vec<PendingToolUse>,
    stop_reason: Option<StopReason>,
}

impl RoundOutput {
    fn wants_tools(&self) -> bool {
        matches!(self.stop_reason, Some(StopReason::ToolUse)) && !self.tool_uses.is_empty()
    }

    /// アシスタントのメッセージを組み立てる
    fn assistant_message(&self) -> Result<Message, AgentError> {
        let mut builder = Message::builder().role(ConversationRole::Assistant);

        if !self.text.is_empty() {
            builder = builder.content(ContentBlock::Text(self.text.clone()));
        }

        for tool_use in &self.tool_uses {
            let input = parse_tool_input(&tool_use.input).map_err(|e| {
                AgentError::BedrockError(format!(
                    "invalid input for tool '{}': {}",
                    tool_use.name, e
                ))
            })?;
            let block = ToolUseBlock::builder()
                .tool_use_id(&tool_use.tool_use_id)
                .name(&tool_use.name)
                .input(json_to_document(&input))
                .build()?;
            builder = builder.content(ContentBlock::ToolUse(block));
        }

        builder.build().map_err(|e| {
            AgentError::MessageBuildError(format!("Failed to build message: {}", e))
        })
    }
}

/// テキストのみのメッセージを作成する
pub fn text_message(role: ConversationRole, text: &str) -> Result<Message, AgentError> {
    Message::builder()
        .role(role)
        .content(ContentBlock::Text(text.to_string()))
        .build()
        .map_err(|e| AgentError::MessageBuildError(format!("Failed to build message: {}", e)))
}

/// 保存済みの発話をメッセージ列に変換する
pub fn turns_to_messages(turns: &[StoredTurn]) -> Result<Vec<Message>, AgentError> {
    turns
        .iter()
        .map(|turn| {
            let role = match turn.role {
                TurnRole::User => ConversationRole::User,
                TurnRole::Assistant => ConversationRole::Assistant,
            };
            text_message(role, &turn.text)
        })
        .collect()
}

impl BedrockAgent {
    /// 新しい BedrockAgent を作成する
    ///
    /// # Arguments
    /// * `client` - Bedrock Runtime クライアント
    /// * `model_id` - 使用するモデルID
    pub fn new(client: Client, model_id: impl Into<String>) -> Self {
        Self::from_backend(Arc::new(BedrockBackend { client }), model_id)
    }

    fn from_backend(backend: Arc<dyn ModelBackend>, model_id: impl Into<String>) -> Self {
        Self {
            inner: Inner {
                backend,
                model_id: model_id.into(),
                system_prompt: String::new(),
                capabilities: CapabilitySet::new(),
                hooks: Vec::new(),
                memory: None,
                messages: Arc::new(Mutex::new(Vec::new())),
                max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            },
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.inner.system_prompt = system_prompt.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.inner.capabilities = capabilities;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn ModelHook>) -> Self {
        self.inner.hooks.push(hook);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryBinding>) -> Self {
        self.inner.memory = Some(memory);
        self
    }

    /// 会話履歴を復元する
    pub fn with_history(mut self, messages: Vec<Message>) -> Self {
        self.inner.messages = Arc::new(Mutex::new(messages));
        self
    }

    pub fn with_max_tool_rounds(mut self, max_tool_rounds: usize) -> Self {
        self.inner.max_tool_rounds = max_tool_rounds;
        self
    }

    /// 使用しているモデルIDを取得する
    pub fn model_id(&self) -> &str {
        &self.inner.model_id
    }

    /// 登録されているツール名の一覧
    pub fn tool_names(&self) -> Vec<&str> {
        self.inner.capabilities.names()
    }

    /// 現在の会話履歴の長さ
    pub async fn history_len(&self) -> usize {
        self.inner.messages.lock().await.len()
    }
}

#[async_trait]
impl AgentSession for BedrockAgent {
    /// ユーザーのメッセージを送信し、生成イベントのストリームを返す
    ///
    /// 生成はバックグラウンドタスクで進み、返されたストリームが破棄されると中断される。
    /// ターンが失敗またはキャンセルされた場合、会話履歴はターン開始前の状態に戻る。
    async fn stream(&self, prompt: &str) -> Result<EventStream, AgentError> {
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(AgentError::MessageBuildError("prompt is empty".to_string()));
        }

        let user_message = text_message(ConversationRole::User, &prompt)?;
        let (tx, events) = session::channel(EVENT_BUFFER);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut history = tokio::select! {
                guard = inner.messages.clone().lock_owned() => guard,
                _ = tx.cancelled() => return,
            };
            inner.run(&mut history, user_message, &prompt, &tx).await;
        });

        Ok(events)
    }
}

impl Inner {
    async fn run(
        &self,
        history: &mut OwnedMutexGuard<Vec<Message>>,
        user_message: Message,
        prompt: &str,
        tx: &EventSender,
    ) {
        let checkpoint = history.len();

        match self.run_turn(history, user_message, tx).await {
            Ok(reply) => {
                if let Err(e) = self.persist(prompt, &reply).await {
                    history.truncate(checkpoint);
                    error!(error = %e, "failed to persist conversation turn");
                    tx.fail(e).await;
                }
            }
            Err(AgentError::Cancelled) => {
                history.truncate(checkpoint);
                info!("generation cancelled by consumer");
            }
            Err(e) => {
                history.truncate(checkpoint);
                error!(error = %e, "agent turn failed");
                tx.fail(e).await;
            }
        }
    }

    async fn run_turn(
        &self,
        history: &mut Vec<Message>,
        user_message: Message,
        tx: &EventSender,
    ) -> Result<String, AgentError> {
        history.push(user_message);

        let tool_config = self.capabilities.tool_configuration()?;
        let mut reply = String::new();
        let mut round = 0;

        loop {
            for hook in &self.hooks {
                hook.before_model_invocation(&self.model_id, &history[..]);
            }

            let request = ModelRequest {
                model_id: self.model_id.clone(),
                messages: history.clone(),
                tool_config: tool_config.clone(),
                system_prompt: Some(self.system_prompt.clone())
                    .filter(|prompt| !prompt.trim().is_empty()),
            };

            let mut events = tokio::select! {
                events = self.backend.converse(request) => events?,
                _ = tx.cancelled() => return Err(AgentError::Cancelled),
            };

            let output = consume_stream(events.as_mut(), tx).await?;
            if output.text.is_empty() && output.tool_uses.is_empty() {
                return Err(AgentError::BedrockError(
                    "model returned an empty response".to_string(),
                ));
            }

            history.push(output.assistant_message()?);
            reply.push_str(&output.text);

            if !output.wants_tools() {
                return Ok(reply);
            }

            round += 1;
            if round > self.max_tool_rounds {
                return Err(AgentError::BedrockError(format!(
                    "tool use exceeded {} rounds",
                    self.max_tool_rounds
                )));
            }

            let results = self.run_tools(&output.tool_uses, tx).await?;
            history.push(
                Message::builder()
                    .role(ConversationRole::User)
                    .set_content(Some(results))
                    .build()
                    .map_err(|e| {
                        AgentError::MessageBuildError(format!("Failed to build message: {}", e))
                    })?,
            );
        }
    }

    /// 要求されたツールを順に実行し、結果ブロックを返す
    async fn run_tools(
        &self,
        tool_uses: &[PendingToolUse],
        tx: &EventSender,
    ) -> Result<Vec<ContentBlock>, AgentError> {
        let mut blocks = Vec::with_capacity(tool_uses.len());

        for tool_use in tool_uses {
            let input = parse_tool_input(&tool_use.input).unwrap_or_default();
            debug!(tool = %tool_use.name, tool_use_id = %tool_use.tool_use_id, "invoking tool");

            let result = tokio::select! {
                result = self.capabilities.invoke(&tool_use.name, input) => result,
                _ = tx.cancelled() => return Err(AgentError::Cancelled),
            };

            let delivered = tx
                .event(AgentEvent::ToolResult {
                    tool_use_id: tool_use.tool_use_id.clone(),
                    name: tool_use.name.clone(),
                    is_error: result.is_error,
                })
                .await;
            if !delivered {
                return Err(AgentError::Cancelled);
            }

            let status = if result.is_error {
                ToolResultStatus::Error
            } else {
                ToolResultStatus::Success
            };
            let block = ToolResultBlock::builder()
                .tool_use_id(&tool_use.tool_use_id)
                .content(ToolResultContentBlock::Text(result.text))
                .status(status)
                .build()?;
            blocks.push(ContentBlock::ToolResult(block));
        }

        Ok(blocks)
    }

    /// ターンの入出力をメモリに保存する
    async fn persist(&self, prompt: &str, reply: &str) -> Result<(), AgentError> {
        let Some(memory) = &self.memory else {
            return Ok(());
        };

        memory.record(TurnRole::User, prompt).await?;
        if !reply.is_empty() {
            memory.record(TurnRole::Assistant, reply).await?;
        }
        Ok(())
    }
}

/// モデルのイベントを読み取り、必要なものを `tx` に転送する
async fn consume_stream(
    events: &mut dyn ModelEvents,
    tx: &EventSender,
) -> Result<RoundOutput, AgentError> {
    let mut output = RoundOutput::default();
    let mut current_tool: Option<PendingToolUse> = None;

    loop {
        let next = tokio::select! {
            next = events.next_event() => next?,
            _ = tx.cancelled() => return Err(AgentError::Cancelled),
        };

        let Some(event) = next else {
            break;
        };

        let forwarded = match event {
            ModelEvent::ToolUseStart { tool_use_id, name } => {
                current_tool = Some(PendingToolUse {
                    tool_use_id: tool_use_id.clone(),
                    name: name.clone(),
                    input: String::new(),
                });
                Some(AgentEvent::ToolUse { tool_use_id, name })
            }
            ModelEvent::Text(text) => {
                output.text.push_str(&text);
                Some(AgentEvent::Data(text))
            }
            ModelEvent::ToolUseInput(input) => {
                if let Some(pending) = current_tool.as_mut() {
                    pending.input.push_str(&input);
                }
                None
            }
            ModelEvent::BlockStop => {
                if let Some(pending) = current_tool.take() {
                    output.tool_uses.push(pending);
                }
                None
            }
            ModelEvent::MessageStop(stop_reason) => {
                let event = AgentEvent::MessageStop {
                    stop_reason: stop_reason.as_str().to_string(),
                };
                output.stop_reason = Some(stop_reason);
                Some(event)
            }
            ModelEvent::Usage {
                input_tokens,
                output_tokens,
            } => Some(AgentEvent::Metadata {
                input_tokens,
                output_tokens,
            }),
        };

        if let Some(event) = forwarded
            && !tx.event(event).await
        {
            return Err(AgentError::Cancelled);
        }
    }

    // ContentBlockStop が届かずに終わった場合も取りこぼさない
    if let Some(pending) = current_tool.take() {
        output.tool_uses.push(pending);
    }

    Ok(output)
}
