pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod format;
pub mod generator;
pub mod guard;
pub mod llm;
pub mod narrator;
pub mod session;
pub mod transcript;

pub use config::{AppConfig, LlmConfig, PipelineConfig};
pub use db::{ConnectionProfile, Database, PgDatabase, QueryResult, SchemaSnapshot};
pub use error::{ErrorKind, PipelineError};
pub use llm::{LanguageModel, OpenAiModel};
pub use session::{Session, TurnOutcome, TurnState};
pub use transcript::{ConversationTurn, Transcript};
