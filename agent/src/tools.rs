//! ケイパビリティ拡張（モデルが生成途中に呼び出せるツール）
//!
//! 組み込みの `current_time` と `rss` に加え、MCPサーバーが公開するツールを
//! 同じ [`Capability`] トレイトで扱う。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_bedrockruntime::types::{
    Tool, ToolConfiguration, ToolInputSchema, ToolSpecification,
};
use chrono::{DateTime, FixedOffset, Utc};
use mcp::{McpClient, ResolvedServer};
use quick_xml::escape::unescape;
use quick_xml::events::{BytesRef, BytesStart, Event};
use quick_xml::reader::Reader;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::document::json_to_document;
use crate::error::AgentError;

/// モデルから呼び出せる1つの機能
#[async_trait]
pub trait Capability: Send + Sync {
    /// Bedrock に登録するツール名（`[a-zA-Z0-9_-]{1,64}`）
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// 入力のJSONスキーマ
    fn input_schema(&self) -> Value;
    async fn invoke(&self, input: Value) -> Result<String, AgentError>;
}

/// ツール実行結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub text: String,
    pub is_error: bool,
}

/// セッションに登録されたケイパビリティの集合
#[derive(Clone, Default)]
pub struct CapabilitySet {
    capabilities: Vec<Arc<dyn Capability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, capability: impl Capability + 'static) -> Self {
        self.push(Arc::new(capability));
        self
    }

    /// ケイパビリティを追加する。同名のものが登録済みの場合は無視する
    pub fn push(&mut self, capability: Arc<dyn Capability>) {
        if self.find(capability.name()).is_some() {
            warn!(tool = capability.name(), "duplicate tool name ignored");
            return;
        }
        self.capabilities.push(capability);
    }

    pub fn names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.iter().find(|c| c.name() == name)
    }

    /// 名前でケイパビリティを呼び出す
    ///
    /// 失敗はターン全体を失敗させず、エラーとしてモデルに返す。
    pub async fn invoke(&self, name: &str, input: Value) -> ToolResult {
        let Some(capability) = self.find(name) else {
            return ToolResult {
                text: format!("Unknown tool: {}", name),
                is_error: true,
            };
        };

        match capability.invoke(input).await {
            Ok(text) => ToolResult {
                text,
                is_error: false,
            },
            Err(e) => {
                warn!(tool = name, error = %e, "tool invocation failed");
                ToolResult {
                    text: e.to_string(),
                    is_error: true,
                }
            }
        }
    }

    /// Bedrock の ToolConfiguration を構築する。ツールがなければ `None`
    pub fn tool_configuration(&self) -> Result<Option<ToolConfiguration>, AgentError> {
        if self.capabilities.is_empty() {
            return Ok(None);
        }

        let mut builder = ToolConfiguration::builder();
        for capability in &self.capabilities {
            let spec = ToolSpecification::builder()
                .name(capability.name())
                .description(capability.description())
                .input_schema(ToolInputSchema::Json(json_to_document(
                    &capability.input_schema(),
                )))
                .build()?;
            builder = builder.tools(Tool::ToolSpec(spec));
        }

        Ok(Some(builder.build()?))
    }
}

/// Bedrock のツール名として使えない文字を `_` に置き換え、64文字に切り詰める
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}

/// 現在時刻を返すツール
pub struct CurrentTime {
    clock: fn() -> DateTime<Utc>,
}

impl Default for CurrentTime {
    fn default() -> Self {
        Self { clock: Utc::now }
    }
}

impl CurrentTime {
    pub fn new() -> Self {
        Self::default()
    }

    /// 時刻の取得元を差し替える
    pub fn with_clock(clock: fn() -> DateTime<Utc>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Capability for CurrentTime {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in ISO 8601 format. Optionally shifted to a UTC offset such as +09:00."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "utc_offset": {
                    "type": "string",
                    "description": "UTC offset like +09:00 or -05:00. Defaults to UTC."
                }
            }
        })
    }

    async fn invoke(&self, input: Value) -> Result<String, AgentError> {
        let now = (self.clock)();

        let offset = match input.get("utc_offset").and_then(Value::as_str) {
            None | Some("") | Some("UTC") | Some("Z") => FixedOffset::east_opt(0),
            Some(raw) => Some(raw.parse::<FixedOffset>().map_err(|e| {
                AgentError::ToolError(format!("invalid utc_offset '{}': {}", raw, e))
            })?),
        }
        .ok_or_else(|| AgentError::ToolError("invalid utc_offset".to_string()))?;

        Ok(now.with_timezone(&offset).to_rfc3339())
    }
}

const DEFAULT_FEED_ITEMS: usize = 10;
const MAX_FEED_ITEMS: usize = 50;

/// フィードの1エントリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: Option<String>,
}

/// RSS / Atom フィードを取得してエントリ一覧を返すツール
pub struct FeedReader {
    http: reqwest::Client,
}

impl Default for FeedReader {
    fn default() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        Self { http }
    }
}

impl FeedReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// フィード本文からエントリを抽出する
    ///
    /// 壊れたXMLに出会った場合はそこまでに読めたエントリを返す。
    pub fn parse_feed(body: &str, max_items: usize) -> Vec<FeedItem> {
        let mut reader = Reader::from_str(body);
        reader.config_mut().check_end_names = false;

        let mut items = Vec::new();
        let mut current: Option<PartialItem> = None;
        let mut field: Option<FeedField> = None;

        while items.len() < max_items {
            let event = match reader.read_event() {
                Ok(Event::Eof) => break,
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, position = reader.buffer_position(), "Stopped reading malformed feed");
                    break;
                }
            };

            match event {
                Event::Start(tag) => match tag.local_name().as_ref() {
                    b"item" | b"entry" => {
                        current = Some(PartialItem::default());
                        field = None;
                    }
                    b"title" if current.as_ref().is_some_and(|item| item.title.is_empty()) => {
                        field = Some(FeedField::Title);
                    }
                    b"link" => {
                        if let Some(item) = current.as_mut() {
                            item.set_href(&tag);
                            field = Some(FeedField::Link);
                        }
                    }
                    _ => {}
                },
                Event::Empty(tag) if tag.local_name().as_ref() == b"link" => {
                    if let Some(item) = current.as_mut() {
                        item.set_href(&tag);
                    }
                }
                Event::Text(text) => {
                    if let Ok(text) = text.decode() {
                        append_text(&mut current, field, &text);
                    }
                }
                Event::CData(data) => append_text(&mut current, field, &String::from_utf8_lossy(&data)),
                Event::GeneralRef(reference) => {
                    append_text(&mut current, field, &resolve_reference(&reference));
                }
                Event::End(tag) => match tag.local_name().as_ref() {
                    b"title" | b"link" => field = None,
                    b"item" | b"entry" => {
                        if let Some(item) = current.take().and_then(PartialItem::finish) {
                            items.push(item);
                        }
                        field = None;
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        items
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedField {
    Title,
    Link,
}

/// 読み取り途中のエントリ
#[derive(Debug, Default)]
struct PartialItem {
    title: String,
    link: String,
    href: Option<String>,
}

impl PartialItem {
    /// Atom の `<link href="..."/>`（最初のものを採用）
    fn set_href(&mut self, tag: &BytesStart<'_>) {
        if self.href.is_some() {
            return;
        }
        let Ok(Some(attr)) = tag.try_get_attribute("href") else {
            return;
        };
        let raw = String::from_utf8_lossy(&attr.value);
        let value = match unescape(&raw) {
            Ok(value) => value.trim().to_string(),
            Err(_) => raw.trim().to_string(),
        };
        if !value.is_empty() {
            self.href = Some(value);
        }
    }

    fn finish(self) -> Option<FeedItem> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return None;
        }
        let link = Some(self.link.trim().to_string())
            .filter(|link| !link.is_empty())
            .or(self.href);
        Some(FeedItem { title, link })
    }
}

fn append_text(current: &mut Option<PartialItem>, field: Option<FeedField>, text: &str) {
    let Some(item) = current.as_mut() else {
        return;
    };
    match field {
        Some(FeedField::Title) => item.title.push_str(text),
        Some(FeedField::Link) => item.link.push_str(text),
        None => {}
    }
}

/// `&amp;` や `&#8217;` などの参照を文字に戻す（未知の実体参照はそのまま残す）
fn resolve_reference(reference: &BytesRef<'_>) -> String {
    let Ok(name) = reference.decode() else {
        return String::new();
    };
    let entity = format!("&{};", name);
    match unescape(&entity) {
        Ok(text) => text.into_owned(),
        Err(_) => entity.clone(),
    }
}

#[async_trait]
impl Capability for FeedReader {
    fn name(&self) -> &str {
        "rss"
    }

    fn description(&self) -> &str {
        "Fetch an RSS or Atom feed and list its latest entries with titles and links."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Feed URL (http or https)" },
                "max_items": { "type": "integer", "minimum": 1, "maximum": MAX_FEED_ITEMS }
            },
            "required": ["url"]
        })
    }

    async fn invoke(&self, input: Value) -> Result<String, AgentError> {
        let url = input
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::ToolError("missing 'url'".to_string()))?;

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AgentError::ToolError(format!("unsupported feed url: {}", url)));
        }

        let max_items = input
            .get("max_items")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_FEED_ITEMS, |n| (n as usize).clamp(1, MAX_FEED_ITEMS));

        let body = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AgentError::ToolError(format!("failed to fetch {}: {}", url, e)))?
            .text()
            .await
            .map_err(|e| AgentError::ToolError(format!("failed to read {}: {}", url, e)))?;

        let items = Self::parse_feed(&body, max_items);
        if items.is_empty() {
            return Ok(format!("No entries found in {}", url));
        }

        Ok(items
            .iter()
            .map(|item| match &item.link {
                Some(link) => format!("- {} ({})", item.title, link),
                None => format!("- {}", item.title),
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// MCPサーバーが公開するツール
pub struct McpCapability {
    client: Arc<McpClient>,
    name: String,
    tool_name: String,
    description: String,
    schema: Value,
}

impl McpCapability {
    /// ツール名は `<サーバー名>_<ツール名>` として登録する
    pub fn new(client: Arc<McpClient>, tool: &mcp::Tool) -> Self {
        let tool_name = tool.name.to_string();
        Self {
            name: sanitize_tool_name(&format!("{}_{}", client.name(), tool_name)),
            description: tool
                .description
                .as_deref()
                .filter(|d| !d.is_empty())
                .unwrap_or(tool_name.as_str())
                .to_string(),
            schema: Value::Object((*tool.input_schema).clone()),
            tool_name,
            client,
        }
    }
}

#[async_trait]
impl Capability for McpCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn invoke(&self, input: Value) -> Result<String, AgentError> {
        let output = self.client.call_tool_text(&self.tool_name, input).await?;
        if output.is_error {
            return Err(AgentError::ToolError(output.text));
        }
        Ok(output.text)
    }
}

/// MCPサーバーを起動し、公開されているツールをケイパビリティとして返す
///
/// # Errors
/// いずれかのサーバーの起動またはツール一覧の取得に失敗した場合
/// （それまでに起動したサーバーは切断してから返す）
pub async fn connect_mcp_capabilities(
    servers: &[ResolvedServer],
) -> Result<Vec<Arc<dyn Capability>>, AgentError> {
    let mut connected: Vec<(McpClient, Vec<mcp::Tool>)> = Vec::with_capacity(servers.len());

    for server in servers {
        match connect_server(server).await {
            Ok(entry) => connected.push(entry),
            Err(e) => {
                warn!(server = %server.name, error = %e, "MCP server failed to start");
                disconnect_all(connected.into_iter().map(|(client, _)| client)).await;
                return Err(e);
            }
        }
    }

    let mut capabilities: Vec<Arc<dyn Capability>> = Vec::new();
    for (client, tools) in connected {
        info!(server = %client.name(), tools = tools.len(), "MCP tools registered");
        let client = Arc::new(client);
        for tool in &tools {
            capabilities.push(Arc::new(McpCapability::new(client.clone(), tool)));
        }
    }

    Ok(capabilities)
}

async fn connect_server(server: &ResolvedServer) -> Result<(McpClient, Vec<mcp::Tool>), AgentError> {
    let client = McpClient::connect(server).await?;
    match client.list_tools().await {
        Ok(tools) => Ok((client, tools)),
        Err(e) => {
            disconnect_all([client]).await;
            Err(e.into())
        }
    }
}

async fn disconnect_all(clients: impl IntoIterator<Item = McpClient>) {
    for client in clients {
        let name = client.name().to_string();
        match client.disconnect().await {
            Ok(()) => info!(server = %name, "MCP server disconnected"),
            Err(e) => warn!(server = %name, error = %e, "Failed to disconnect MCP server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()
    }

    struct Failing;

    #[async_trait]
    impl Capability for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn invoke(&self, _input: Value) -> Result<String, AgentError> {
            Err(AgentError::ToolError("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn test_current_time_utc_and_offset() {
        let tool = CurrentTime::with_clock(fixed_clock);

        let utc = tool.invoke(json!({})).await.unwrap();
        assert_eq!(utc, "2025-01-02T03:04:05+00:00");

        let tokyo = tool.invoke(json!({ "utc_offset": "+09:00" })).await.unwrap();
        assert_eq!(tokyo, "2025-01-02T12:04:05+09:00");

        assert!(tool.invoke(json!({ "utc_offset": "tomorrow" })).await.is_err());
    }

    #[test]
    fn test_parse_rss_feed() {
        let body = r#"<?xml version="1.0"?>
        <rss><channel><title>Feed</title>
          <item><title><![CDATA[First & best]]></title><link>https://example.com/1</link></item>
          <item><title>Second &amp; more</title><link>https://example.com/2</link></item>
          <item><title>Third</title></item>
        </channel></rss>"#;

        let items = FeedReader::parse_feed(body, 2);

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "First & best");
        assert_eq!(items[0].link.as_deref(), Some("https://example.com/1"));
        assert_eq!(items[1].title, "Second & more");
    }

    #[test]
    fn test_parse_atom_feed() {
        let body = r#"<feed xmlns="http://www.w3.org/2005/Atom">
          <entry><title type="text">Atom entry</title><link rel="alternate" href="https://example.com/a"/></entry>
        </feed>"#;

        let items = FeedReader::parse_feed(body, 10);

        assert_eq!(
            items,
            vec![FeedItem {
                title: "Atom entry".to_string(),
                link: Some("https://example.com/a".to_string()),
            }]
        );
    }

    #[test]
    fn test_parse_feed_numeric_entities() {
        let body = r#"<rss><channel>
          <item><title>It&#8217;s &#x2014; here &amp; now</title><link>https://example.com/?a=1&amp;b=2</link></item>
          <item><title>Caf&#233; &nbsp;menu</title></item>
        </channel></rss>"#;

        let items = FeedReader::parse_feed(body, 10);

        assert_eq!(items[0].title, "It\u{2019}s \u{2014} here & now");
        assert_eq!(items[0].link.as_deref(), Some("https://example.com/?a=1&b=2"));
        // 未定義の実体参照は残す
        assert_eq!(items[1].title, "Café &nbsp;menu");
    }

    #[test]
    fn test_parse_feed_keeps_entries_before_malformed_xml() {
        let body = r#"<rss><channel>
          <item><title>Kept</title></item>
          <item><title>Broken <</title></item>"#;

        let items = FeedReader::parse_feed(body, 10);

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Kept");
    }

    #[tokio::test]
    async fn test_connect_mcp_capabilities_propagates_start_failure() {
        let config = mcp::McpConfig::parse(
            r#"{ "servers": {
                "a_missing": { "command": "nonexistent_command_12345" },
                "b_blank": { "command": " " }
            } }"#,
        )
        .unwrap();
        let servers = config.resolve_all(&mcp::Variables::new()).unwrap();

        let result = connect_mcp_capabilities(&servers).await;
        assert!(matches!(result, Err(AgentError::McpError(_))));

        assert!(connect_mcp_capabilities(&[]).await.unwrap().is_empty());
    }

    /// 先に起動したサーバーを切断してからエラーを返す（uvx mcp-server-time が必要）
    #[tokio::test]
    #[ignore]
    async fn test_connect_mcp_capabilities_disconnects_started_servers() {
        let config = mcp::McpConfig::parse(
            r#"{ "servers": {
                "a_time": { "command": "uvx", "args": ["mcp-server-time"] },
                "b_blank": { "command": " " }
            } }"#,
        )
        .unwrap();
        let servers = config.resolve_all(&mcp::Variables::new()).unwrap();

        let err = connect_mcp_capabilities(&servers).await.err().unwrap();
        assert!(matches!(err, AgentError::McpError(mcp::McpError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn test_feed_reader_rejects_non_http_url() {
        let err = FeedReader::new()
            .invoke(json!({ "url": "file:///etc/passwd" }))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolError(_)));
    }

    #[tokio::test]
    async fn test_capability_set_dispatch() {
        let set = CapabilitySet::new()
            .with(CurrentTime::with_clock(fixed_clock))
            .with(Failing)
            .with(CurrentTime::new());

        assert_eq!(set.names(), vec!["current_time", "failing"]);

        let ok = set.invoke("current_time", json!({})).await;
        assert!(!ok.is_error);

        let failed = set.invoke("failing", json!({})).await;
        assert_eq!(
            failed,
            ToolResult {
                text: "Tool error: boom".to_string(),
                is_error: true
            }
        );

        let unknown = set.invoke("missing", json!({})).await;
        assert!(unknown.is_error);
        assert!(unknown.text.contains("missing"));
    }

    #[test]
    fn test_tool_configuration() {
        assert!(CapabilitySet::new().tool_configuration().unwrap().is_none());

        let config = CapabilitySet::new()
            .with(CurrentTime::new())
            .with(FeedReader::new())
            .tool_configuration()
            .unwrap()
            .unwrap();
        assert_eq!(config.tools().len(), 2);
    }

    #[test]
    fn test_sanitize_tool_name() {
        assert_eq!(sanitize_tool_name("browser.navigate page"), "browser_navigate_page");
        assert_eq!(sanitize_tool_name(&"x".repeat(80)).len(), 64);
    }
}
