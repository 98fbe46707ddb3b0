/// mcp.json設定ファイルの構造体定義
///
/// Visual Studio Codeの`.vscode/mcp.json`仕様に準拠した
/// MCP設定ファイルのパースと変数展開を提供します。
/// ゲートウェイはここで定義されたサーバーをケイパビリティ拡張として起動します。
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// mcp.jsonファイルのルート構造
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// MCPサーバーの設定マップ（起動順を安定させるためBTreeMap）
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// MCPサーバーの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// サーバータイプ（現在は"stdio"のみサポート）
    #[serde(rename = "type", default = "default_server_type")]
    pub server_type: String,

    /// 実行するコマンド
    pub command: String,

    /// コマンドライン引数（オプション）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// 環境変数（オプション）
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// 環境変数ファイルのパス（オプション）
    #[serde(rename = "envFile", skip_serializing_if = "Option::is_none")]
    pub env_file: Option<String>,

    /// 作業ディレクトリ（オプション）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

fn default_server_type() -> String {
    "stdio".to_string()
}

/// `${name}` 形式の変数展開に使う値の集合
///
/// 値が登録されていない変数はそのまま残る。
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// 変数を登録する。`value` が `None` の場合は何もしない
    pub fn with(mut self, name: &str, value: Option<&str>) -> Self {
        if let Some(value) = value {
            self.values.insert(name.to_string(), value.to_string());
        }
        self
    }

    /// 文字列中の `${name}` を登録済みの値で置換する
    ///
    /// 先頭から1回だけ走査するため、置換後の値に含まれる `${...}` は展開しない。
    pub fn expand(&self, input: &str) -> String {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];

            let Some(end) = after.find('}') else {
                rest = &rest[start..];
                break;
            };

            let name = &after[..end];
            match self.values.get(name) {
                Some(value) => output.push_str(value),
                None => output.push_str(&rest[start..start + 2 + end + 1]),
            }
            rest = &after[end + 1..];
        }

        output.push_str(rest);
        output
    }
}

/// 変数展開済みで、そのままプロセス起動に使えるサーバー設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServer {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl McpConfig {
    /// mcp.jsonファイルを読み込む
    ///
    /// # Arguments
    /// * `path` - mcp.jsonファイルのパス
    ///
    /// # Errors
    /// ファイルの読み込みやパースに失敗した場合
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self, std::io::Error> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    /// JSON文字列から設定をパースする
    pub fn parse(content: &str) -> Result<Self, std::io::Error> {
        serde_json::from_str(content).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse mcp.json: {}", e),
            )
        })
    }

    /// デフォルトの設定ファイルパスを取得
    ///
    /// 以下の順序で検索：
    /// 1. `.vscode/mcp.json`（VS Code規約）
    /// 2. `mcp.json`（カレントディレクトリ）
    pub fn default_path() -> Option<PathBuf> {
        let vscode_path = PathBuf::from(".vscode/mcp.json");
        if vscode_path.exists() {
            return Some(vscode_path);
        }

        let current_path = PathBuf::from("mcp.json");
        if current_path.exists() {
            return Some(current_path);
        }

        None
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// # Returns
    /// 設定が見つかった場合はSome(config)、見つからない場合はNone
    pub fn load_default() -> Result<Option<Self>, std::io::Error> {
        match Self::default_path() {
            Some(path) => Ok(Some(Self::load_from_file(path)?)),
            None => Ok(None),
        }
    }

    /// サーバー名のリストを取得（名前順）
    pub fn server_names(&self) -> Vec<&String> {
        self.servers.keys().collect()
    }

    /// すべてのサーバー設定を変数展開する
    pub fn resolve_all(&self, vars: &Variables) -> Result<Vec<ResolvedServer>, std::io::Error> {
        self.servers
            .iter()
            .map(|(name, server)| server.resolve(name, vars))
            .collect()
    }
}

impl ServerConfig {
    /// 変数を展開した実際のコマンドを取得
    pub fn resolve_command(&self, vars: &Variables) -> String {
        vars.expand(&self.command)
    }

    /// 変数を展開した引数リストを取得
    pub fn resolve_args(&self, vars: &Variables) -> Vec<String> {
        self.args.iter().map(|arg| vars.expand(arg)).collect()
    }

    /// 変数を展開した環境変数を取得する
    ///
    /// `envFile` が指定されている場合は先に読み込み、`env` の値で上書きする。
    ///
    /// # Errors
    /// `envFile` の読み込みに失敗した場合
    pub fn resolve_env(&self, vars: &Variables) -> Result<BTreeMap<String, String>, std::io::Error> {
        let mut env = BTreeMap::new();

        if let Some(env_file) = &self.env_file {
            let path = vars.expand(env_file);
            env.extend(parse_env_file(Path::new(&path))?);
        }

        for (key, value) in &self.env {
            env.insert(key.clone(), vars.expand(value));
        }

        Ok(env)
    }

    /// 起動に必要な値をすべて展開する
    ///
    /// # Errors
    /// サーバータイプが"stdio"以外の場合、または`envFile`が読めない場合
    pub fn resolve(&self, name: &str, vars: &Variables) -> Result<ResolvedServer, std::io::Error> {
        if self.server_type != "stdio" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!(
                    "MCP server '{}' uses unsupported type '{}'",
                    name, self.server_type
                ),
            ));
        }

        Ok(ResolvedServer {
            name: name.to_string(),
            command: self.resolve_command(vars),
            args: self.resolve_args(vars),
            env: self.resolve_env(vars)?,
            cwd: self.cwd.as_deref().map(|cwd| PathBuf::from(vars.expand(cwd))),
        })
    }
}

/// dotenv 形式の環境変数ファイルを読み込む
fn parse_env_file(path: &Path) -> Result<BTreeMap<String, String>, std::io::Error> {
    let to_io_error = |e: dotenvy::Error| match e {
        dotenvy::Error::Io(e) => e,
        other => std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to parse {}: {}", path.display(), other),
        ),
    };

    dotenvy::from_path_iter(path)
        .map_err(to_io_error)?
        .map(|item| item.map_err(to_io_error))
        .collect()
}
