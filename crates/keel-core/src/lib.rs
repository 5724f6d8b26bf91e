pub mod config;
pub mod objects;
pub mod types;

pub use config::KeelConfig;
pub use types::*;
