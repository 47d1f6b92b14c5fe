//! Wire protocol shared by the upload server and its clients.

pub mod binary;
pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use binary::ChunkHeader;
pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use types::{UploadInfo, UploadState};
