//! Persistence layer — libSQL-backed storage for job instances and logs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{JobLog, JobRecord, JobStore};
