//! HTTP サーフェス
//!
//! `POST /invocations` でプロンプトを受け取り、生成結果をSSEで返す。
//! `GET /ping` はセッションに依存しないヘルスチェック。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use agent::SESSION_ID_HEADER;
use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, Method, header},
    middleware::{self, Next},
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{ApiJson, ErrorResponse, GatewayError};
use crate::provider::SessionProvider;
use crate::streaming::event_to_sse_stream;

/// ハンドラー間で共有する状態
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<SessionProvider>,
    /// サーバーエラーの詳細をレスポンスに含めるか
    pub expose_error_details: bool,
}

impl AppState {
    pub fn new(provider: Arc<SessionProvider>) -> Self {
        Self {
            provider,
            expose_error_details: false,
        }
    }

    pub fn with_error_details(mut self, expose: bool) -> Self {
        self.expose_error_details = expose;
        self
    }

    fn reject(&self, error: GatewayError) -> ErrorResponse {
        error.to_response(self.expose_error_details)
    }
}

#[derive(Debug, Deserialize)]
pub struct InvocationRequest {
    pub input: InvocationInput,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvocationInput {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PingResponse {
    pub status: String,
}

/// ルーターを作成する
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/invocations", post(handle_invocation))
        .route("/ping", get(handle_ping))
        .layer(middleware::from_fn(access_log))
        .with_state(state)
}

/// プロンプトを処理し、テキスト断片をSSEで返す
///
/// 最初のイベントを受け取るまではステータスを確定させないため、
/// 生成開始前のエラーは 500 として返せる。
async fn handle_invocation(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<InvocationRequest>,
) -> Result<Response, ErrorResponse> {
    let prompt = payload
        .input
        .prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| state.reject(GatewayError::InvalidRequest("input.prompt is required".to_string())))?;

    let session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let identity = state
        .provider
        .identity_for(session_id, payload.input.user_id)
        .map_err(|e| state.reject(e))?;

    let session = state
        .provider
        .acquire(&identity)
        .await
        .map_err(|e| state.reject(e))?;

    info!(
        session_id = identity.session_id.as_deref().unwrap_or("-"),
        prompt_chars = prompt.chars().count(),
        "Invoking agent"
    );

    let mut events = session
        .stream(&prompt)
        .await
        .map_err(|e| state.reject(GatewayError::Processing(e)))?;

    let first = match events.next().await {
        Some(Err(e)) => return Err(state.reject(GatewayError::Processing(e))),
        other => other,
    };

    let stream = futures::stream::iter(first).chain(events);

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(event_to_sse_stream(stream)),
    )
        .into_response())
}

async fn handle_ping() -> Json<PingResponse> {
    Json(PingResponse {
        status: "healthy".to_string(),
    })
}

/// アクセスログを出力するミドルウェア
async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    if should_log(&method, &path) {
        info!(
            target: "gateway::access",
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
    }

    response
}

/// ヘルスチェックはアクセスログに残さない
pub fn should_log(method: &Method, path: &str) -> bool {
    !(method == Method::GET && path == "/ping")
}

/// サーバーを起動し、終了シグナルを受け取るまで待機する
pub async fn start_server(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
