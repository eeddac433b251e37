// Core modules
pub mod config;
pub mod db;
pub mod decision;
pub mod error;
pub mod exchange;
pub mod indicators;
pub mod market;
pub mod models;
pub mod monitor;
pub mod pipeline;
pub mod signal;
pub mod sizing;

// Re-export commonly used types
pub use error::BotError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;
