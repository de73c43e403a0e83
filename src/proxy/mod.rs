pub mod client;
pub mod context;
pub mod filter;
mod handler;

pub use client::{build_upstream_client, UpstreamClient};
pub use context::BoxBody;
pub use handler::handle_request;
