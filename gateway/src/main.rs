use std::sync::Arc;

use agent::BedrockSessionFactory;
use anyhow::Context;
use clap::Parser;
use gateway::{AppState, GatewayArgs, SessionProvider, logging, start_server};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = GatewayArgs::parse();
    logging::init(args.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "starting gateway");

    let config = args.into_config().context("failed to load gateway configuration")?;

    // セッションは最初のリクエストで構築する
    let factory = Arc::new(BedrockSessionFactory::new(config.agent));
    let provider = Arc::new(SessionProvider::new(factory, config.session_mode));
    let state = AppState::new(provider).with_error_details(config.expose_error_details);

    start_server(config.address, state)
        .await
        .context("gateway server failure")?;

    Ok(())
}
