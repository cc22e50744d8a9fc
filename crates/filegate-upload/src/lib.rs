pub mod coordinator;
pub mod session;
pub mod sweeper;

pub use coordinator::{ChunkOutcome, InitiatedUpload, UploadCoordinator};
pub use session::{SessionRegistry, SessionState, UploadSession};
pub use sweeper::{SweeperHandle, UploadSweeper};
