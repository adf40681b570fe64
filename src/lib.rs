pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod prompt;
pub mod registry;
pub mod relay;
pub mod server;
