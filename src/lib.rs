// Core modules
pub mod broker;
pub mod config;
pub mod engine;
pub mod execution;
pub mod indicators;
pub mod messaging;
pub mod models;
pub mod persistence;
pub mod strategy;
pub mod telegram;

// Re-export commonly used types
pub use broker::Broker;
pub use config::BotConfig;
pub use engine::{DecisionEngine, EngineContext, EngineError, EngineState, TickOutcome};
pub use messaging::{ConfirmationGateway, Messenger, SessionId};
pub use models::*;
pub use persistence::{PositionReader, PositionStore};
