//! Metadata cache backends.

mod filesystem;
mod sqlite;

pub use filesystem::FilesystemCache;
pub use sqlite::{DATABASE_FILE, SqliteCache};
