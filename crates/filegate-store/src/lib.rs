pub mod memory;
pub mod mount;
pub mod s3;
pub mod stats;
pub mod traits;

pub use traits::{ObjectStore, PartWriteDiscipline};
