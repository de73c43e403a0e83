pub mod auth;
pub mod config;
pub mod error;
pub mod gray;
pub mod kv;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod routing;
pub mod server;
