//! Shared `SQLite` infrastructure.
//!
//! - [`connection`]: mutex handling and connection configuration

mod connection;

pub use connection::{acquire_lock, configure_connection, is_busy};
