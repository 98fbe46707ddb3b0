pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod provider;
pub mod streaming;

pub use config::{GatewayArgs, GatewayConfig};
pub use error::{ApiJson, ErrorResponse, GatewayError};
pub use http::{AppState, router, start_server};
pub use provider::{SessionMode, SessionProvider};
