//! Backing resources, their providers, and template-to-source bindings.

mod pool;
mod postgres;
mod provider;

pub use pool::*;
pub use postgres::PgProvider;
pub use provider::{MemoryProvider, ResourceProvider, StatementExecutor};
