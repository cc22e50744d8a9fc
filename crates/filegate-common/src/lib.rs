pub mod error;
pub mod path;
pub mod types;

pub use error::{FilegateError, Result};
pub use types::{CompletedPart, FileInfo, ObjectInfo, StorageUsage};
