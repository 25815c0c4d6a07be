//! Persistence layer: libSQL-backed storage for worker state and the
//! learner/question/usage collaborators.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, LearnerProfile, UsageStats};
