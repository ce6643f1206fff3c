pub mod error;
pub mod config;
pub mod security;
pub mod identity;
pub mod database;
pub mod oauth;
pub mod server;
