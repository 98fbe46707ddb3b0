use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use agent::{AgentSession, SessionFactory, SessionIdentity};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::GatewayError;

/// セッションの扱い方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SessionMode {
    /// 識別子を使わず、プロセスに1つのセッションを無条件に再利用する
    #[default]
    Stateless,
    /// セッションIDとユーザーIDを必須とし、最初に構築した識別子以外は拒否する
    Stateful,
}

struct SessionSlot {
    identity: SessionIdentity,
    session: Arc<dyn AgentSession>,
}

/// プロセスに1つだけのセッションを遅延構築して保持する
///
/// 確認から構築までの間はスロットのロックを保持するため、同時に届いた最初の
/// リクエストが二重にセッションを構築することはない。構築に失敗した場合スロットは
/// 空のまま残り、次のリクエストで再度構築を試みる。
pub struct SessionProvider {
    factory: Arc<dyn SessionFactory>,
    mode: SessionMode,
    slot: Mutex<Option<SessionSlot>>,
    constructed: AtomicUsize,
}

impl SessionProvider {
    pub fn new(factory: Arc<dyn SessionFactory>, mode: SessionMode) -> Self {
        Self {
            factory,
            mode,
            slot: Mutex::new(None),
            constructed: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// リクエストの値からセッション識別子を決める
    ///
    /// # Errors
    /// ステートフルモードでセッションIDまたはユーザーIDが欠けている場合
    pub fn identity_for(
        &self,
        session_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<SessionIdentity, GatewayError> {
        match self.mode {
            SessionMode::Stateless => Ok(SessionIdentity::anonymous()),
            SessionMode::Stateful => {
                let session_id = non_empty(session_id).ok_or_else(|| {
                    GatewayError::InvalidRequest(format!(
                        "missing {} header",
                        agent::SESSION_ID_HEADER
                    ))
                })?;
                let user_id = non_empty(user_id).ok_or_else(|| {
                    GatewayError::InvalidRequest("missing input.user_id".to_string())
                })?;
                Ok(SessionIdentity::new(session_id, user_id))
            }
        }
    }

    /// セッションを取得する。まだ存在しなければ構築する
    ///
    /// # Errors
    /// * `GatewayError::Initialization` - 構築に失敗した場合
    /// * `GatewayError::SessionConflict` - ステートフルモードで別の識別子のセッションが保持されている場合
    pub async fn acquire(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Arc<dyn AgentSession>, GatewayError> {
        let mut slot = self.slot.lock().await;

        if let Some(existing) = slot.as_ref() {
            if self.mode == SessionMode::Stateful && existing.identity != *identity {
                return Err(GatewayError::SessionConflict(
                    "this process is already bound to a different session".to_string(),
                ));
            }
            debug!("reusing existing agent session");
            return Ok(existing.session.clone());
        }

        let session = self
            .factory
            .create(identity)
            .await
            .map_err(GatewayError::Initialization)?;

        self.constructed.fetch_add(1, Ordering::SeqCst);
        *slot = Some(SessionSlot {
            identity: identity.clone(),
            session: session.clone(),
        });
        info!(mode = ?self.mode, "agent session stored");

        Ok(session)
    }

    /// これまでにセッションを構築した回数
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    pub async fn is_initialized(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
