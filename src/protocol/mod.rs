//! SMB2 wire codec

pub mod cursor;
pub mod header;
pub mod messages;
pub mod smb2_constants;

pub use header::{HeaderIds, Smb2Header, TransformHeader};
pub use messages::{FileId, SmbMessage};
pub use smb2_constants::{Smb2Command, Version};
