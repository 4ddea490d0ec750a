pub mod attachments;
pub mod config;
pub mod database;
pub mod delivery;
pub mod directory;
pub mod feed;
pub mod identity;
pub mod redis_relay;
pub mod service;
pub mod sqlite_store;
pub mod store;
pub mod websocket;
