//! セッションの抽象化
//!
//! ゲートウェイはここで定義されたトレイトだけに依存し、
//! 実際のモデル呼び出し（Bedrock）やテスト用のモックを差し替えられるようにする。

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;

/// セッションIDを運ぶトランスポートヘッダー名
pub const SESSION_ID_HEADER: &str = "X-Amzn-Bedrock-AgentCore-Runtime-Session-Id";

/// 生成ステップが出力する構造化イベント
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// クライアントへ転送するテキスト断片
    Data(String),
    /// モデルがツール呼び出しを開始した
    ToolUse { tool_use_id: String, name: String },
    /// ツールの実行が終わった
    ToolResult {
        tool_use_id: String,
        name: String,
        is_error: bool,
    },
    /// トークン使用量
    Metadata { input_tokens: i32, output_tokens: i32 },
    /// モデルの応答が終了した
    MessageStop { stop_reason: String },
}

impl AgentEvent {
    /// テキストペイロードを持つイベントであればその内容を返す
    pub fn data(&self) -> Option<&str> {
        match self {
            AgentEvent::Data(text) => Some(text),
            _ => None,
        }
    }
}

pub type EventItem = Result<AgentEvent, AgentError>;

/// イベントチャネルを作成する
///
/// 受信側（[`EventStream`]）が破棄されると送信側にキャンセルが伝わる。
pub fn channel(buffer: usize) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let cancel = CancellationToken::new();

    (
        EventSender {
            tx,
            cancel: cancel.clone(),
        },
        EventStream { rx, cancel },
    )
}

/// 生成ステップの出力を受け取る一方向・一回限りのストリーム
pub struct EventStream {
    rx: mpsc::Receiver<EventItem>,
    cancel: CancellationToken,
}

impl EventStream {
    /// あらかじめ用意したイベント列からストリームを作る
    pub fn from_items(items: Vec<EventItem>) -> Self {
        let (tx, stream) = channel(items.len());
        for item in items {
            // バッファは items.len() 以上あるので失敗しない
            let _ = tx.tx.try_send(item);
        }
        stream
    }

    /// 上流の生成処理にキャンセルを通知する
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for EventStream {
    type Item = EventItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// [`EventStream`] に対応する送信側
pub struct EventSender {
    tx: mpsc::Sender<EventItem>,
    cancel: CancellationToken,
}

impl EventSender {
    /// イベントを送信する
    ///
    /// # Returns
    /// 受信側がまだ存在し、キャンセルもされていなければ `true`
    pub async fn send(&self, item: EventItem) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    pub async fn event(&self, event: AgentEvent) -> bool {
        self.send(Ok(event)).await
    }

    pub async fn fail(&self, error: AgentError) -> bool {
        self.send(Err(error)).await
    }

    /// 受信側がキャンセルされるまで待機する
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// セッションを識別する値（どちらもリクエストから渡される不透明な文字列）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: Option<String>,
    pub actor_id: Option<String>,
}

impl SessionIdentity {
    pub fn new(session_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            actor_id: Some(actor_id.into()),
        }
    }

    /// 識別子を持たないセッション（ステートレスモード）
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// セッションIDとアクターIDが両方そろっているか
    pub fn is_stateful(&self) -> bool {
        self.session_id.is_some() && self.actor_id.is_some()
    }
}

/// 1つの会話セッション
///
/// `stream` はプロンプトを受け取り、生成結果をイベントとして遅延的に返す。
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn stream(&self, prompt: &str) -> Result<EventStream, AgentError>;
}

/// セッションを構築するファクトリ
///
/// 構築に失敗した場合は部分的なセッションを返さず、必ず `Err` を返す。
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, identity: &SessionIdentity) -> Result<Arc<dyn AgentSession>, AgentError>;
}
