pub mod api;
pub mod commands;
pub mod config;
pub mod domain;
pub mod server;
pub mod shell;
