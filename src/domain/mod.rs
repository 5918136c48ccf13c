pub mod crypto;
pub mod diagnose;
pub mod engine;
pub mod registry;
pub mod store;
pub mod types;
