pub mod agent;
pub mod document;
pub mod error;
pub mod factory;
pub mod hooks;
pub mod memory;
pub mod prompt;
pub mod session;
pub mod tools;

pub use agent::{BedrockAgent, ClientSettings, load_client};
pub use error::AgentError;
pub use factory::{AgentSettings, BedrockSessionFactory};
pub use memory::{ConversationStore, InMemoryConversationStore, RetrievalConfig, RetrievalPolicy, RetryPolicy};
pub use session::{
    AgentEvent, AgentSession, EventItem, EventSender, EventStream, SESSION_ID_HEADER, SessionFactory,
    SessionIdentity,
};
