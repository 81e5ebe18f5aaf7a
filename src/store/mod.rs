//! Persistence layer: libSQL-backed storage for the catalog, contacted
//! addresses, and scheduled dispatches.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{OutreachStore, ScheduledDispatch, ScheduledStatus};
