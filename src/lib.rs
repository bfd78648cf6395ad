// Shared components
pub mod config;
pub mod error;
pub mod metrics;

// Connection lifecycle
pub mod auth;
pub mod connection_manager;
pub mod hub;
pub mod room;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod tasks;
