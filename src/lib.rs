pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod notification;
pub mod providers;
pub mod storage;
pub mod types;
pub mod validation;

pub use config::Config;
pub use error::{CoordinationError, CoordinationResult};
pub use types::*;
