//! `serde_json::Value` と `aws_smithy_types::Document` の相互変換
//!
//! Bedrock のツール入力スキーマやツール引数は `Document` で扱われる。

use aws_smithy_types::{Document, Number};
use serde_json::Value;

pub fn json_to_document(value: &Value) -> Document {
    match value {
        Value::Null => Document::Null,
        Value::Bool(b) => Document::Bool(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Document::Number(Number::PosInt(u))
            } else if let Some(i) = n.as_i64() {
                Document::Number(Number::NegInt(i))
            } else {
                Document::Number(Number::Float(n.as_f64().unwrap_or_default()))
            }
        }
        Value::String(s) => Document::String(s.clone()),
        Value::Array(items) => Document::Array(items.iter().map(json_to_document).collect()),
        Value::Object(map) => Document::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_document(v)))
                .collect(),
        ),
    }
}

pub fn document_to_json(document: &Document) -> Value {
    #[allow(unreachable_patterns)]
    match document {
        Document::Null => Value::Null,
        Document::Bool(b) => Value::Bool(*b),
        Document::Number(n) => match n {
            Number::PosInt(u) => Value::from(*u),
            Number::NegInt(i) => Value::from(*i),
            Number::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        Document::String(s) => Value::String(s.clone()),
        Document::Array(items) => Value::Array(items.iter().map(document_to_json).collect()),
        Document::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), document_to_json(v)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

/// ストリーミングで受け取ったツール入力（JSON文字列）をパースする
///
/// 入力が空の場合は空オブジェクトとして扱う。
pub fn parse_tool_input(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_conversion_keeps_structure() {
        let schema = json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "max_items": { "type": "integer", "minimum": 1 }
            },
            "required": ["url"]
        });

        let document = json_to_document(&schema);
        match &document {
            Document::Object(map) => {
                assert!(matches!(map.get("required"), Some(Document::Array(items)) if items.len() == 1));
            }
            other => panic!("Objectであるべき: {:?}", other),
        }
        assert_eq!(document_to_json(&document), schema);
    }

    #[test]
    fn test_number_variants() {
        assert!(matches!(
            json_to_document(&json!(-3)),
            Document::Number(Number::NegInt(-3))
        ));
        assert!(matches!(
            json_to_document(&json!(7)),
            Document::Number(Number::PosInt(7))
        ));
        assert_eq!(document_to_json(&Document::Number(Number::Float(0.5))), json!(0.5));
        assert_eq!(document_to_json(&Document::Number(Number::Float(f64::NAN))), Value::Null);
    }

    #[test]
    fn test_parse_tool_input() {
        assert_eq!(parse_tool_input("").unwrap(), json!({}));
        assert_eq!(parse_tool_input(r#"{"url":"x"}"#).unwrap(), json!({"url": "x"}));
        assert!(parse_tool_input("{\"url\":").is_err());
    }
}
