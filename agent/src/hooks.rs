use aws_sdk_bedrockruntime::types::{ContentBlock, ConversationRole, Message};
use serde_json::{Value, json};

use crate::document::document_to_json;

/// モデル呼び出しの前後に差し込むフック
pub trait ModelHook: Send + Sync {
    fn before_model_invocation(&self, model_id: &str, messages: &[Message]);
}

/// モデルへ送るメッセージ列を構造化ログとして出力するフック
///
/// ログは `agent::model` ターゲットの debug レベルで出力される。
pub struct LoggingHook;

impl ModelHook for LoggingHook {
    fn before_model_invocation(&self, model_id: &str, messages: &[Message]) {
        if !tracing::enabled!(target: "agent::model", tracing::Level::DEBUG) {
            return;
        }

        tracing::debug!(
            target: "agent::model",
            model_id,
            message_count = messages.len(),
            messages = %messages_to_json(messages),
            "before model invocation"
        );
    }
}

/// メッセージ列をログ出力用のJSONに変換する
pub fn messages_to_json(messages: &[Message]) -> Value {
    Value::Array(messages.iter().map(message_to_json).collect())
}

fn message_to_json(message: &Message) -> Value {
    let role = match message.role {
        ConversationRole::User => "user",
        ConversationRole::Assistant => "assistant",
        _ => "unknown",
    };

    let content: Vec<Value> = message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text(text) => json!({ "text": text }),
            ContentBlock::ToolUse(tool_use) => json!({
                "toolUse": {
                    "toolUseId": tool_use.tool_use_id,
                    "name": tool_use.name,
                    "input": document_to_json(&tool_use.input),
                }
            }),
            ContentBlock::ToolResult(result) => json!({
                "toolResult": {
                    "toolUseId": result.tool_use_id,
                    "status": result.status.as_ref().map(|s| s.as_str()),
                }
            }),
            _ => json!({ "other": true }),
        })
        .collect();

    json!({ "role": role, "content": content })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_to_json() {
        let message = Message::builder()
            .role(ConversationRole::User)
            .content(ContentBlock::Text("hello".to_string()))
            .build()
            .unwrap();

        let value = messages_to_json(&[message]);
        assert_eq!(value, json!([{ "role": "user", "content": [{ "text": "hello" }] }]));
    }
}
