mod matcher;
pub mod pattern;

pub use matcher::{CompiledRoute, RouteTable};
