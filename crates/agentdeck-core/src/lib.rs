//! # AgentDeck Core
//!
//! Error type and configuration shared by the AgentDeck crates.

pub mod config;
pub mod error;

pub use config::{DeckConfig, LogConfig, SchedulerConfig, StoreConfig};
pub use error::{DeckError, Result};
