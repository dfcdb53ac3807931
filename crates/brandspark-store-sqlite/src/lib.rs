//! SQLite backend for the brandspark persistence gateway.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on dedicated
//! connection threads without blocking the async runtime.

mod encode;
mod pool;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use pool::DatabaseTarget;
pub use store::SqliteGateway;
