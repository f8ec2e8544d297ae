pub mod backfill;
pub mod config;
pub mod directive;
pub mod generate;
pub mod llm_client;
pub mod persona;
pub mod prompt;
pub mod session;
pub mod store;
pub mod timemath;

pub use config::EngineConfig;
pub use generate::Generate;
pub use llm_client::LlmClient;
pub use persona::Persona;
pub use session::{ChatSession, SendOutcome, SessionEvent};
pub use store::PersonaStore;
