/// 使用するモデルIDのデフォルト値
pub const DEFAULT_MODEL_ID: &str = "us.anthropic.claude-haiku-4-5-20251001-v1:0";

/// デフォルトのシステムプロンプト（`rss` ツールで参照するフィード一覧）
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"
Hacker News - https://hnrss.org/frontpage
• Constantly updating tech discussions
• Great for summarization and trend analysis
• Rich comment data and voting scores

NASA Breaking News - https://www.nasa.gov/rss/dyn/breaking_news.rss
• Exciting space discoveries and missions
• Visual content opportunities
• Perfect for "What's new in space?" queries

TechCrunch - https://techcrunch.com/feed/
• Startup funding announcements
• Product launches and acquisitions
• Great for business intelligence demos

Atlas Obscura - https://www.atlasobscura.com/feeds/latest
• Unique places and stories
• Perfect for travel recommendations
• Engaging, unusual content
"#;
