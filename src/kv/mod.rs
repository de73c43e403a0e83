mod client;

pub use client::KvClient;

#[cfg(test)]
pub(crate) use client::tests::stalled_store;
