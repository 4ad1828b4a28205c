//! Back-office data hooks.
//!
//! Each admin screen reads a resource list or a single record through the
//! shared [`QueryClient`](crate::cache::QueryClient) and writes through
//! mutations that invalidate the resource and everything that embeds it.

mod resources;
mod service;
mod source;

pub use resources::AdminResource;
pub use service::AdminData;
pub use source::{Row, SourceError, TableSource};
