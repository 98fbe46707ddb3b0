mod client;
mod sse;

use clap::{Parser, Subcommand};
use client::GatewayClient;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::Write;
use std::time::Duration;
use tokio::time::sleep;

// UI関連の設定
const USER_NAME: &str = "User";
const AGENT_NAME: &str = "Assistant";
const LOADING_ANIMATION_INTERVAL: u64 = 200;
const LOADING_ANIMATION_CHARACTER: &str = ".";
// ローディングアニメーションをクリアするためのスペース文字列
// (ローディング中に表示される可能性のある最大文字数を想定: 約30-40文字分のドット)
const CLEAR_LINE_SPACES: &str = "                                     "; // 37 spaces

// CLIの引数構造体定義
#[derive(Parser)]
#[command(name = "agent-cli")]
#[command(about = "A client for the streaming agent gateway", long_about = None)]
struct Cli {
    /// ゲートウェイのURL
    #[arg(long, global = true, env = "GATEWAY_URL", default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// プロンプトを1回送信し、応答を表示します
    Invoke {
        /// 送信するプロンプト
        #[arg(long, default_value = "What's the latest hot thing in tech?")]
        prompt: String,

        /// セッションID（ステートフルモードのゲートウェイで必要）
        #[arg(long)]
        session_id: Option<String>,

        /// ユーザーID（ステートフルモードのゲートウェイで必要）
        #[arg(long)]
        user_id: Option<String>,
    },
    /// 対話モードで起動します
    Chat {
        /// セッションID（省略時は生成）
        #[arg(long)]
        session_id: Option<String>,

        /// ユーザーID
        #[arg(long, default_value = "cli-user")]
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 引数の解析
    let cli = Cli::parse();

    match cli.command {
        Commands::Invoke {
            prompt,
            session_id,
            user_id,
        } => {
            let client = GatewayClient::new(cli.url).with_identity(session_id, user_id);
            run_invoke(&client, &prompt).await?;
        }
        Commands::Chat {
            session_id,
            user_id,
        } => {
            let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let client = GatewayClient::new(cli.url).with_identity(Some(session_id), Some(user_id));
            run_chat(&client).await?;
        }
    }

    Ok(())
}

/// プロンプトを1回送信し、届いた断片をそのまま表示する
async fn run_invoke(client: &GatewayClient, prompt: &str) -> anyhow::Result<()> {
    client
        .invoke(prompt, |text| {
            print!("{}", text);
            std::io::stdout().flush()?;
            Ok(())
        })
        .await?;
    println!();
    Ok(())
}

/// CLI対話モードを実行する
///
/// ユーザー入力の受け付け、ローディング表示、ストリーミングレスポンスの表示など、
/// すべてのUI/UX処理を担当する。会話履歴はゲートウェイ側のセッションが保持する。
async fn run_chat(client: &GatewayClient) -> anyhow::Result<()> {
    // rustylineエディタの初期化（UI層）
    let mut rl = DefaultEditor::new()?;

    println!("Session: {}", client.session_id().unwrap_or("-"));
    println!("+--------------------------------------------------+");
    println!("| AI Agent Started. Type 'exit' or 'quit' to stop. |");
    println!("+--------------------------------------------------+");

    loop {
        // ユーザー入力の受け付け
        let readline = rl.readline(&format!("{} > ", USER_NAME));
        match readline {
            Ok(line) => {
                let input = line.trim();

                // 空入力はスキップ
                if input.is_empty() {
                    continue;
                }

                // 終了コマンドの処理
                if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
                    break;
                }

                // 履歴に追加
                let _ = rl.add_history_entry(input);

                // アシスタントの応答開始を表示
                print!("{} > ", AGENT_NAME);
                std::io::stdout().flush()?;

                // ローディングアニメーション開始
                let loading_task = tokio::spawn(async {
                    loop {
                        sleep(Duration::from_millis(LOADING_ANIMATION_INTERVAL)).await;
                        print!("{}", LOADING_ANIMATION_CHARACTER);
                        if std::io::stdout().flush().is_err() {
                            break;
                        }
                    }
                });

                let mut loading_stopped = false;
                let result = client
                    .invoke(input, |text| {
                        // 最初の断片が届いたタイミングでローディングを消す
                        if !loading_stopped {
                            loading_task.abort();
                            clear_loading_animation();
                            loading_stopped = true;
                        }
                        print!("{}", text);
                        std::io::stdout().flush()?;
                        Ok(())
                    })
                    .await;

                if !loading_stopped {
                    // 断片が一つも来ずに終了した場合もローディングを消す
                    loading_task.abort();
                    clear_loading_animation();
                }

                match result {
                    Ok(()) => println!(),
                    Err(e) => println!("\n[Error] {:#}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// ローディングアニメーションをクリアしてカーソルを戻す
///
/// 行頭に戻り、スペースで上書きしてから再度行頭に戻り、プロンプトを表示する。
fn clear_loading_animation() {
    print!(
        "\r{} > {}\r{} > ",
        AGENT_NAME, CLEAR_LINE_SPACES, AGENT_NAME
    );
    let _ = std::io::stdout().flush();
}
