//! reunite-store — Persistent gallery backed by SQLite.
//!
//! Records live in a single table; reference photos are kept as files under
//! a media root, named by content digest.

pub mod media;
pub mod sqlite;

pub use media::MediaDir;
pub use sqlite::{SqliteGallery, SqliteStoreError};
