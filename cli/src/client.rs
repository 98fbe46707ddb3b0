use anyhow::{Context, bail};
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde_json::{Value, json};

use crate::sse::{SseFrame, SseParser};

/// ゲートウェイがセッションを識別するヘッダー
const SESSION_ID_HEADER: &str = "X-Amzn-Bedrock-AgentCore-Runtime-Session-Id";

/// ゲートウェイの `/invocations` を呼び出すクライアント
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    session_id: Option<String>,
    user_id: Option<String>,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: None,
            user_id: None,
        }
    }

    /// セッションIDとユーザーIDを設定する（ステートフルモード用）
    pub fn with_identity(mut self, session_id: Option<String>, user_id: Option<String>) -> Self {
        self.session_id = session_id;
        self.user_id = user_id;
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// プロンプトを送り、テキスト断片が届くたびに `on_fragment` を呼ぶ
    ///
    /// # Errors
    /// ゲートウェイがエラーを返した場合、またはストリームが `event: error` で終わった場合
    pub async fn invoke<F>(&self, prompt: &str, mut on_fragment: F) -> anyhow::Result<()>
    where
        F: FnMut(&str) -> anyhow::Result<()>,
    {
        let response = self
            .request(prompt)
            .send()
            .await
            .with_context(|| format!("failed to connect to {}", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("gateway returned {}: {}", status, error_detail(&body));
        }

        let mut parser = SseParser::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("failed to read response stream")?;
            for frame in parser.push(&chunk) {
                handle_frame(frame, &mut on_fragment)?;
            }
        }

        if let Some(frame) = parser.finish() {
            handle_frame(frame, &mut on_fragment)?;
        }

        Ok(())
    }

    fn request(&self, prompt: &str) -> reqwest::RequestBuilder {
        let request = self
            .http
            .post(format!("{}/invocations", self.base_url))
            .header(ACCEPT, "text/event-stream")
            .json(&self.payload(prompt));

        match &self.session_id {
            Some(session_id) => request.header(SESSION_ID_HEADER, session_id),
            None => request,
        }
    }

    fn payload(&self, prompt: &str) -> Value {
        let mut input = json!({ "prompt": prompt });
        if let Some(user_id) = &self.user_id {
            input["user_id"] = json!(user_id);
        }
        json!({ "input": input })
    }
}

fn handle_frame<F>(frame: SseFrame, on_fragment: &mut F) -> anyhow::Result<()>
where
    F: FnMut(&str) -> anyhow::Result<()>,
{
    if frame.is_error() {
        bail!("stream failed: {}", frame.data);
    }
    on_fragment(&frame.data)
}

/// `{"detail": "..."}` 形式のエラーボディから本文を取り出す
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_includes_user_id_only_when_set() {
        let client = GatewayClient::new("http://localhost:8080/");
        assert_eq!(client.base_url, "http://localhost:8080");
        assert_eq!(client.payload("hi"), json!({ "input": { "prompt": "hi" } }));

        let client = client.with_identity(Some("s-1".to_string()), Some("u-1".to_string()));
        assert_eq!(
            client.payload("hi"),
            json!({ "input": { "prompt": "hi", "user_id": "u-1" } })
        );
    }

    #[test]
    fn test_session_header_is_attached() {
        let client = GatewayClient::new("http://localhost:8080")
            .with_identity(Some("s-1".to_string()), None);
        let request = client.request("hi").build().unwrap();

        assert_eq!(
            request.headers().get("x-amzn-bedrock-agentcore-runtime-session-id").unwrap(),
            "s-1"
        );
        assert_eq!(request.url().as_str(), "http://localhost:8080/invocations");

        let request = GatewayClient::new("http://localhost:8080").request("hi").build().unwrap();
        assert!(request.headers().get(SESSION_ID_HEADER).is_none());
    }

    #[test]
    fn test_error_detail() {
        assert_eq!(error_detail(r#"{"detail":"Agent initialization failed"}"#), "Agent initialization failed");
        assert_eq!(error_detail("plain text"), "plain text");
    }

    #[test]
    fn test_error_frame_stops_stream() {
        let mut seen = Vec::new();
        let mut collect = |text: &str| {
            seen.push(text.to_string());
            Ok(())
        };

        handle_frame(
            SseFrame {
                event: None,
                data: "ok".to_string(),
            },
            &mut collect,
        )
        .unwrap();
        let err = handle_frame(
            SseFrame {
                event: Some("error".to_string()),
                data: "Agent processing failed".to_string(),
            },
            &mut collect,
        )
        .unwrap_err();

        assert!(err.to_string().contains("Agent processing failed"));
        assert_eq!(seen, vec!["ok"]);
    }
}
