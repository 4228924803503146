//! `db` crate: pure persistence layer.
//!
//! Holds the connection pool, the instance row type and the repository functions
//! for the workflow instance table. No business logic lives here.

pub mod error;
pub mod models;
pub mod pool;
pub mod repository;

pub use error::DbError;
pub use pool::DbPool;
