//! 会話メモリとのバインディング
//!
//! 会話履歴の永続化と復元は外部のメモリサービスが担う。このモジュールは
//! その境界（[`ConversationStore`]）と、呼び出しに適用するリトライポリシー、
//! そしてストアへそのまま渡す検索ポリシーを定義する。

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::AgentError;

/// トピックごとの検索上限
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalPolicy {
    /// 取得する候補の最大数
    pub top_k: u32,
    /// 取得対象とする最小の関連度
    pub relevance_score: f32,
}

/// トピックパス → 検索ポリシーの対応表
///
/// パスには `{actorId}` と `{sessionId}` を含められる。
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    topics: BTreeMap<String, RetrievalPolicy>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self::new()
            .with_topic(
                "/facts/{actorId}",
                RetrievalPolicy {
                    top_k: 10,
                    relevance_score: 0.3,
                },
            )
            .with_topic(
                "/preferences/{actorId}",
                RetrievalPolicy {
                    top_k: 5,
                    relevance_score: 0.5,
                },
            )
            .with_topic(
                "/summaries/{actorId}/{sessionId}",
                RetrievalPolicy {
                    top_k: 5,
                    relevance_score: 0.5,
                },
            )
    }
}

impl RetrievalConfig {
    /// 空の設定を作る
    pub fn new() -> Self {
        Self {
            topics: BTreeMap::new(),
        }
    }

    pub fn with_topic(mut self, path: impl Into<String>, policy: RetrievalPolicy) -> Self {
        self.topics.insert(path.into(), policy);
        self
    }

    pub fn topics(&self) -> &BTreeMap<String, RetrievalPolicy> {
        &self.topics
    }

    /// プレースホルダーを展開した対応表を返す
    pub fn resolve(&self, actor_id: &str, session_id: &str) -> BTreeMap<String, RetrievalPolicy> {
        self.topics
            .iter()
            .map(|(path, policy)| {
                let path = path
                    .replace("{actorId}", actor_id)
                    .replace("{sessionId}", session_id);
                (path, *policy)
            })
            .collect()
    }
}

/// 会話履歴を一意に特定するキー
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub memory_id: String,
    pub session_id: String,
    pub actor_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// 保存された1発話
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTurn {
    pub role: TurnRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl StoredTurn {
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

/// 会話履歴の永続化先
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 履歴を古い順に返す。`retrieval` はストアにそのまま渡す
    async fn load(
        &self,
        key: &SessionKey,
        retrieval: &BTreeMap<String, RetrievalPolicy>,
    ) -> Result<Vec<StoredTurn>, AgentError>;

    async fn append(&self, key: &SessionKey, turn: StoredTurn) -> Result<(), AgentError>;
}

/// プロセス内に履歴を保持するストア
#[derive(Default)]
pub struct InMemoryConversationStore {
    turns: Mutex<HashMap<SessionKey, Vec<StoredTurn>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, key: &SessionKey) -> usize {
        self.turns.lock().await.get(key).map_or(0, Vec::len)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(
        &self,
        key: &SessionKey,
        _retrieval: &BTreeMap<String, RetrievalPolicy>,
    ) -> Result<Vec<StoredTurn>, AgentError> {
        Ok(self.turns.lock().await.get(key).cloned().unwrap_or_default())
    }

    async fn append(&self, key: &SessionKey, turn: StoredTurn) -> Result<(), AgentError> {
        self.turns
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .push(turn);
        Ok(())
    }
}

/// ストア呼び出しに適用する指数バックオフ付きリトライ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最初の呼び出しを含む試行回数の上限
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// `attempt` 回目の失敗後に待機する時間（1始まり）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// 操作を成功するか試行回数の上限に達するまで繰り返す
    ///
    /// # Errors
    /// すべての試行が失敗した場合は最後のエラーを含む `AgentError::MemoryError`
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => {
                    return Err(AgentError::MemoryError(format!(
                        "{} failed after {} attempts: {}",
                        operation, attempt, e
                    )));
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying memory call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// セッションに紐づいたメモリへのハンドル
pub struct MemoryBinding {
    key: SessionKey,
    retrieval: BTreeMap<String, RetrievalPolicy>,
    store: Arc<dyn ConversationStore>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for MemoryBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBinding")
            .field("key", &self.key)
            .field("retrieval", &self.retrieval)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl MemoryBinding {
    pub fn new(
        key: SessionKey,
        retrieval: &RetrievalConfig,
        store: Arc<dyn ConversationStore>,
        retry: RetryPolicy,
    ) -> Self {
        let retrieval = retrieval.resolve(&key.actor_id, &key.session_id);
        Self {
            key,
            retrieval,
            store,
            retry,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn retrieval(&self) -> &BTreeMap<String, RetrievalPolicy> {
        &self.retrieval
    }

    /// 保存済みの履歴を取得する
    pub async fn history(&self) -> Result<Vec<StoredTurn>, AgentError> {
        self.retry
            .run("load history", || self.store.load(&self.key, &self.retrieval))
            .await
    }

    /// 1発話を保存する
    pub async fn record(&self, role: TurnRole, text: &str) -> Result<(), AgentError> {
        let turn = StoredTurn::new(role, text);
        self.retry
            .run("append turn", || self.store.append(&self.key, turn.clone()))
            .await
    }
}

/// 復元した履歴をモデルに渡せる形に整える
///
/// 先頭はユーザー発話、以降は交互になるようにし、同じ役割が連続した場合は
/// 本文を連結する。末尾に残った応答のないユーザー発話は捨てる。
pub fn normalize_turns(turns: Vec<StoredTurn>) -> Vec<StoredTurn> {
    let mut normalized: Vec<StoredTurn> = Vec::with_capacity(turns.len());

    for turn in turns {
        if turn.text.trim().is_empty() {
            continue;
        }
        match normalized.last_mut() {
            None if turn.role == TurnRole::Assistant => continue,
            Some(last) if last.role == turn.role => {
                last.text.push('\n');
                last.text.push_str(&turn.text);
            }
            _ => normalized.push(turn),
        }
    }

    if normalized.last().is_some_and(|t| t.role == TurnRole::User) {
        normalized.pop();
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> SessionKey {
        SessionKey {
            memory_id: "mem-1".to_string(),
            session_id: "s-1".to_string(),
            actor_id: "u-1".to_string(),
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    /// 指定回数だけ失敗してから成功するストア
    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
        inner: InMemoryConversationStore,
    }

    #[async_trait]
    impl ConversationStore for FlakyStore {
        async fn load(
            &self,
            key: &SessionKey,
            retrieval: &BTreeMap<String, RetrievalPolicy>,
        ) -> Result<Vec<StoredTurn>, AgentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AgentError::MemoryError("throttled".to_string()));
            }
            self.inner.load(key, retrieval).await
        }

        async fn append(&self, key: &SessionKey, turn: StoredTurn) -> Result<(), AgentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AgentError::MemoryError("throttled".to_string()));
            }
            self.inner.append(key, turn).await
        }
    }

    #[test]
    fn test_retrieval_placeholders_resolved() {
        let resolved = RetrievalConfig::default().resolve("u-1", "s-1");

        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved["/facts/u-1"].top_k, 10);
        assert_eq!(resolved["/preferences/u-1"].relevance_score, 0.5);
        assert!(resolved.contains_key("/summaries/u-1/s-1"));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(30), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let store = Arc::new(FlakyStore {
            failures: 2,
            calls: AtomicU32::new(0),
            inner: InMemoryConversationStore::new(),
        });
        let binding = MemoryBinding::new(key(), &RetrievalConfig::default(), store.clone(), fast_retry(5));

        binding.record(TurnRole::User, "hello").await.unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        let history = binding.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "hello");
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let store = Arc::new(FlakyStore {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            inner: InMemoryConversationStore::new(),
        });
        let binding = MemoryBinding::new(key(), &RetrievalConfig::default(), store.clone(), fast_retry(3));

        let err = binding.history().await.unwrap_err();

        assert!(matches!(err, AgentError::MemoryError(ref msg) if msg.contains("after 3 attempts")));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_in_memory_store_is_keyed() {
        let store = InMemoryConversationStore::new();
        let other = SessionKey {
            session_id: "s-2".to_string(),
            ..key()
        };

        store.append(&key(), StoredTurn::new(TurnRole::User, "a")).await.unwrap();

        assert_eq!(store.len(&key()).await, 1);
        assert_eq!(store.len(&other).await, 0);
    }

    #[test]
    fn test_normalize_turns() {
        let turns = vec![
            StoredTurn::new(TurnRole::Assistant, "orphan"),
            StoredTurn::new(TurnRole::User, "q1"),
            StoredTurn::new(TurnRole::User, "q1 again"),
            StoredTurn::new(TurnRole::Assistant, "a1"),
            StoredTurn::new(TurnRole::Assistant, "   "),
            StoredTurn::new(TurnRole::User, "unanswered"),
        ];

        let normalized = normalize_turns(turns);

        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].role, TurnRole::User);
        assert_eq!(normalized[0].text, "q1\nq1 again");
        assert_eq!(normalized[1].text, "a1");
    }
}
