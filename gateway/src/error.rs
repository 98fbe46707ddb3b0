use agent::AgentError;
use axum::{
    extract::{FromRequest, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// ゲートウェイのエラー型
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session conflict: {0}")]
    SessionConflict(String),

    #[error("Agent initialization failed: {0}")]
    Initialization(#[source] AgentError),

    #[error("Agent processing failed: {0}")]
    Processing(#[source] AgentError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::SessionConflict(_) => StatusCode::CONFLICT,
            GatewayError::Initialization(_)
            | GatewayError::Processing(_)
            | GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// クライアントに返すレスポンスへ変換する
    ///
    /// サーバーエラーの詳細は `expose_details` が有効な場合だけ含める。
    pub fn to_response(&self, expose_details: bool) -> ErrorResponse {
        let status = self.status();
        let detail = match self {
            GatewayError::Initialization(_) if !expose_details => {
                "Agent initialization failed".to_string()
            }
            GatewayError::Processing(_) if !expose_details => "Agent processing failed".to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }

        ErrorResponse::new(status, detail)
    }
}

/// エラーレスポンスのボディ（`{"detail": "..."}`）
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                detail: detail.into(),
            },
        }
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// JSONのデシリアライズ失敗を `ErrorResponse` (400) として返すエクストラクタ
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ErrorResponse))]
pub struct ApiJson<T>(pub T);

impl From<JsonRejection> for ErrorResponse {
    fn from(rejection: JsonRejection) -> Self {
        let message = rejection.body_text();
        warn!(error = %message, "JSON deserialization error");
        ErrorResponse::invalid_request(message)
    }
}
