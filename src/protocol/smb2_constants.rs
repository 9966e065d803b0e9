//! SMB2/3 wire constants, command numbers and flag sets

use bitflags::bitflags;

/// Protocol id of a plain SMB2 message
pub const SMB2_MAGIC: [u8; 4] = [0xFE, b'S', b'M', b'B'];
/// Protocol id of an SMB3 transform (encrypted) message
pub const SMB2_TRANSFORM_MAGIC: [u8; 4] = [0xFD, b'S', b'M', b'B'];
/// Protocol id of a legacy SMB1 message
pub const SMB1_MAGIC: [u8; 4] = [0xFF, b'S', b'M', b'B'];
/// SMB1 NEGOTIATE command byte
pub const SMB1_NEGOTIATE: u8 = 0x72;

pub const SMB2_HEADER_SIZE: usize = 64;
/// Size of the big-endian stream protocol length prefix
pub const SMB2_SPL_SIZE: usize = 4;
pub const SMB2_TRANSFORM_HEADER_SIZE: usize = 52;
pub const SMB2_SIGNATURE_SIZE: usize = 16;
/// Upper bound on a single stream message
pub const SMB2_MAX_PDU_SIZE: usize = 16 * 1024 * 1024;

/// Bytes covered by one credit
pub const SMB2_CREDIT_UNIT: usize = 65536;
/// Credit pool the client asks the server to maintain
pub const MAX_CREDITS: u16 = 1024;

/// Message id carried by unsolicited oplock/lease break notifications
pub const NOTIFICATION_MESSAGE_ID: u64 = u64::MAX;
/// Process id sent in every synchronous request
pub const SMB2_PROCESS_ID: u32 = 0xFEFF;

pub const DEFAULT_PORT: u16 = 445;

/// Fixed structure sizes, as carried in each body's StructureSize field
pub mod structure_size {
    pub const HEADER: u16 = 64;
    pub const ERROR_REPLY: u16 = 9;
    pub const NEGOTIATE_REQUEST: u16 = 36;
    pub const NEGOTIATE_REPLY: u16 = 65;
    pub const SESSION_SETUP_REQUEST: u16 = 25;
    pub const SESSION_SETUP_REPLY: u16 = 9;
    pub const LOGOFF: u16 = 4;
    pub const TREE_CONNECT_REQUEST: u16 = 9;
    pub const TREE_CONNECT_REPLY: u16 = 16;
    pub const TREE_DISCONNECT: u16 = 4;
    pub const CREATE_REQUEST: u16 = 57;
    pub const CREATE_REPLY: u16 = 89;
    pub const CLOSE_REQUEST: u16 = 24;
    pub const CLOSE_REPLY: u16 = 60;
    pub const FLUSH_REQUEST: u16 = 24;
    pub const FLUSH_REPLY: u16 = 4;
    pub const READ_REQUEST: u16 = 49;
    pub const READ_REPLY: u16 = 17;
    pub const WRITE_REQUEST: u16 = 49;
    pub const WRITE_REPLY: u16 = 17;
    pub const LOCK_REQUEST: u16 = 48;
    pub const LOCK_REPLY: u16 = 4;
    pub const IOCTL_REQUEST: u16 = 57;
    pub const IOCTL_REPLY: u16 = 49;
    pub const CANCEL: u16 = 4;
    pub const ECHO: u16 = 4;
    pub const QUERY_DIRECTORY_REQUEST: u16 = 33;
    pub const QUERY_DIRECTORY_REPLY: u16 = 9;
    pub const CHANGE_NOTIFY_REQUEST: u16 = 32;
    pub const CHANGE_NOTIFY_REPLY: u16 = 9;
    pub const QUERY_INFO_REQUEST: u16 = 41;
    pub const QUERY_INFO_REPLY: u16 = 9;
    pub const SET_INFO_REQUEST: u16 = 33;
    pub const SET_INFO_REPLY: u16 = 2;
    pub const OPLOCK_BREAK: u16 = 24;
    pub const LEASE_BREAK_NOTIFICATION: u16 = 44;
    pub const LEASE_BREAK_ACK: u16 = 36;
}

/// SMB2 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Smb2Command {
    Negotiate = 0x00,
    SessionSetup = 0x01,
    Logoff = 0x02,
    TreeConnect = 0x03,
    TreeDisconnect = 0x04,
    Create = 0x05,
    Close = 0x06,
    Flush = 0x07,
    Read = 0x08,
    Write = 0x09,
    Lock = 0x0A,
    Ioctl = 0x0B,
    Cancel = 0x0C,
    Echo = 0x0D,
    QueryDirectory = 0x0E,
    ChangeNotify = 0x0F,
    QueryInfo = 0x10,
    SetInfo = 0x11,
    OplockBreak = 0x12,
}

impl TryFrom<u16> for Smb2Command {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Negotiate,
            0x01 => Self::SessionSetup,
            0x02 => Self::Logoff,
            0x03 => Self::TreeConnect,
            0x04 => Self::TreeDisconnect,
            0x05 => Self::Create,
            0x06 => Self::Close,
            0x07 => Self::Flush,
            0x08 => Self::Read,
            0x09 => Self::Write,
            0x0A => Self::Lock,
            0x0B => Self::Ioctl,
            0x0C => Self::Cancel,
            0x0D => Self::Echo,
            0x0E => Self::QueryDirectory,
            0x0F => Self::ChangeNotify,
            0x10 => Self::QueryInfo,
            0x11 => Self::SetInfo,
            0x12 => Self::OplockBreak,
            _ => {
                return Err(crate::Error::InvalidHeader(format!(
                    "Invalid SMB2 command: 0x{:04x}",
                    value
                )))
            }
        })
    }
}

impl Smb2Command {
    pub fn name(self) -> &'static str {
        match self {
            Self::Negotiate => "NEGOTIATE",
            Self::SessionSetup => "SESSION_SETUP",
            Self::Logoff => "LOGOFF",
            Self::TreeConnect => "TREE_CONNECT",
            Self::TreeDisconnect => "TREE_DISCONNECT",
            Self::Create => "CREATE",
            Self::Close => "CLOSE",
            Self::Flush => "FLUSH",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Lock => "LOCK",
            Self::Ioctl => "IOCTL",
            Self::Cancel => "CANCEL",
            Self::Echo => "ECHO",
            Self::QueryDirectory => "QUERY_DIRECTORY",
            Self::ChangeNotify => "CHANGE_NOTIFY",
            Self::QueryInfo => "QUERY_INFO",
            Self::SetInfo => "SET_INFO",
            Self::OplockBreak => "OPLOCK_BREAK",
        }
    }

    /// Commands that are never bound to a tree connect.
    pub fn uses_tree_id(self) -> bool {
        !matches!(
            self,
            Self::Negotiate | Self::SessionSetup | Self::Logoff | Self::Echo | Self::TreeConnect
        )
    }

    /// StructureSize of the request body for this command.
    pub fn request_struct_size(self) -> u16 {
        use structure_size::*;
        match self {
            Self::Negotiate => NEGOTIATE_REQUEST,
            Self::SessionSetup => SESSION_SETUP_REQUEST,
            Self::Logoff => LOGOFF,
            Self::TreeConnect => TREE_CONNECT_REQUEST,
            Self::TreeDisconnect => TREE_DISCONNECT,
            Self::Create => CREATE_REQUEST,
            Self::Close => CLOSE_REQUEST,
            Self::Flush => FLUSH_REQUEST,
            Self::Read => READ_REQUEST,
            Self::Write => WRITE_REQUEST,
            Self::Lock => LOCK_REQUEST,
            Self::Ioctl => IOCTL_REQUEST,
            Self::Cancel => CANCEL,
            Self::Echo => ECHO,
            Self::QueryDirectory => QUERY_DIRECTORY_REQUEST,
            Self::ChangeNotify => CHANGE_NOTIFY_REQUEST,
            Self::QueryInfo => QUERY_INFO_REQUEST,
            Self::SetInfo => SET_INFO_REQUEST,
            Self::OplockBreak => OPLOCK_BREAK,
        }
    }

    /// StructureSize of the successful reply body for this command.
    pub fn reply_struct_size(self) -> u16 {
        use structure_size::*;
        match self {
            Self::Negotiate => NEGOTIATE_REPLY,
            Self::SessionSetup => SESSION_SETUP_REPLY,
            Self::Logoff => LOGOFF,
            Self::TreeConnect => TREE_CONNECT_REPLY,
            Self::TreeDisconnect => TREE_DISCONNECT,
            Self::Create => CREATE_REPLY,
            Self::Close => CLOSE_REPLY,
            Self::Flush => FLUSH_REPLY,
            Self::Read => READ_REPLY,
            Self::Write => WRITE_REPLY,
            Self::Lock => LOCK_REPLY,
            Self::Ioctl => IOCTL_REPLY,
            Self::Cancel => CANCEL,
            Self::Echo => ECHO,
            Self::QueryDirectory => QUERY_DIRECTORY_REPLY,
            Self::ChangeNotify => CHANGE_NOTIFY_REPLY,
            Self::QueryInfo => QUERY_INFO_REPLY,
            Self::SetInfo => SET_INFO_REPLY,
            Self::OplockBreak => OPLOCK_BREAK,
        }
    }
}

/// Dialect revisions
pub mod dialect {
    pub const SMB2_02: u16 = 0x0202;
    pub const SMB2_10: u16 = 0x0210;
    pub const SMB3_00: u16 = 0x0300;
    pub const SMB3_02: u16 = 0x0302;
    pub const SMB3_11: u16 = 0x0311;
    /// Wildcard dialect answered to an SMB1 negotiate
    pub const SMB2_WILDCARD: u16 = 0x02FF;
}

/// Protocol version a client asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    /// Any dialect from 2.0.2 through 3.1.1
    #[default]
    Any,
    /// Any SMB 2.x dialect
    Any2,
    /// Any SMB 3.x dialect
    Any3,
    V0202,
    V0210,
    V0300,
    V0302,
    V0311,
}

impl Version {
    /// Dialects offered in the NEGOTIATE request.
    pub fn dialects(self) -> Vec<u16> {
        use dialect::*;
        match self {
            Version::Any => vec![SMB2_02, SMB2_10, SMB3_00, SMB3_02, SMB3_11],
            Version::Any2 => vec![SMB2_02, SMB2_10],
            Version::Any3 => vec![SMB3_00, SMB3_02, SMB3_11],
            Version::V0202 => vec![SMB2_02],
            Version::V0210 => vec![SMB2_10],
            Version::V0300 => vec![SMB3_00],
            Version::V0302 => vec![SMB3_02],
            Version::V0311 => vec![SMB3_11],
        }
    }

    /// Whether the ENCRYPTION capability is offered for this version.
    pub fn offers_encryption(self) -> bool {
        matches!(
            self,
            Version::Any | Version::Any3 | Version::V0300 | Version::V0302 | Version::V0311
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "2" => Version::Any2,
            "3" => Version::Any3,
            "2.02" | "202" => Version::V0202,
            "2.10" | "210" => Version::V0210,
            "3.0" | "3.00" | "300" => Version::V0300,
            "3.02" | "302" => Version::V0302,
            "3.1.1" | "311" => Version::V0311,
            "any" => Version::Any,
            _ => return None,
        })
    }
}

bitflags! {
    /// Header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Smb2HeaderFlags: u32 {
        const SERVER_TO_REDIR = 0x0000_0001;
        const ASYNC_COMMAND = 0x0000_0002;
        const RELATED_OPERATIONS = 0x0000_0004;
        const SIGNED = 0x0000_0008;
        const PRIORITY_MASK = 0x0000_0070;
        const DFS_OPERATIONS = 0x1000_0000;
        const REPLAY_OPERATION = 0x2000_0000;
    }
}

bitflags! {
    /// Negotiate/session-setup security mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SecurityMode: u16 {
        const SIGNING_ENABLED = 0x0001;
        const SIGNING_REQUIRED = 0x0002;
    }
}

bitflags! {
    /// Global capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        const DFS = 0x0000_0001;
        const LEASING = 0x0000_0002;
        const LARGE_MTU = 0x0000_0004;
        const MULTI_CHANNEL = 0x0000_0008;
        const PERSISTENT_HANDLES = 0x0000_0010;
        const DIRECTORY_LEASING = 0x0000_0020;
        const ENCRYPTION = 0x0000_0040;
    }
}

/// Negotiate context types and algorithm ids
pub mod negotiate_context {
    pub const PREAUTH_INTEGRITY_CAPABILITIES: u16 = 0x0001;
    pub const ENCRYPTION_CAPABILITIES: u16 = 0x0002;
    pub const HASH_SHA_512: u16 = 0x0001;
    pub const CIPHER_AES_128_CCM: u16 = 0x0001;
    pub const CIPHER_AES_128_GCM: u16 = 0x0002;
    pub const PREAUTH_SALT_SIZE: usize = 32;
}

bitflags! {
    /// SESSION_SETUP reply flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u16 {
        const IS_GUEST = 0x0001;
        const IS_NULL = 0x0002;
        const ENCRYPT_DATA = 0x0004;
    }
}

/// TREE_CONNECT reply share types
pub mod share_type {
    pub const DISK: u8 = 0x01;
    pub const PIPE: u8 = 0x02;
    pub const PRINT: u8 = 0x03;
}

bitflags! {
    /// File attributes (MS-FSCC 2.6)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0000_0001;
        const HIDDEN = 0x0000_0002;
        const SYSTEM = 0x0000_0004;
        const DIRECTORY = 0x0000_0010;
        const ARCHIVE = 0x0000_0020;
        const NORMAL = 0x0000_0080;
        const TEMPORARY = 0x0000_0100;
        const SPARSE_FILE = 0x0000_0200;
        const REPARSE_POINT = 0x0000_0400;
        const COMPRESSED = 0x0000_0800;
        const OFFLINE = 0x0000_1000;
        const NOT_CONTENT_INDEXED = 0x0000_2000;
        const ENCRYPTED = 0x0000_4000;
    }
}

bitflags! {
    /// Access mask for CREATE
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DesiredAccess: u32 {
        const FILE_READ_DATA = 0x0000_0001;
        const FILE_LIST_DIRECTORY = 0x0000_0001;
        const FILE_WRITE_DATA = 0x0000_0002;
        const FILE_APPEND_DATA = 0x0000_0004;
        const FILE_READ_EA = 0x0000_0008;
        const FILE_WRITE_EA = 0x0000_0010;
        const FILE_EXECUTE = 0x0000_0020;
        const FILE_DELETE_CHILD = 0x0000_0040;
        const FILE_READ_ATTRIBUTES = 0x0000_0080;
        const FILE_WRITE_ATTRIBUTES = 0x0000_0100;
        const DELETE = 0x0001_0000;
        const READ_CONTROL = 0x0002_0000;
        const WRITE_DAC = 0x0004_0000;
        const WRITE_OWNER = 0x0008_0000;
        const SYNCHRONIZE = 0x0010_0000;
        const ACCESS_SYSTEM_SECURITY = 0x0100_0000;
        const MAXIMUM_ALLOWED = 0x0200_0000;
        const GENERIC_ALL = 0x1000_0000;
        const GENERIC_EXECUTE = 0x2000_0000;
        const GENERIC_WRITE = 0x4000_0000;
        const GENERIC_READ = 0x8000_0000;
    }
}

bitflags! {
    /// Share access for CREATE
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ShareAccess: u32 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
        const DELETE = 0x0000_0004;
    }
}

/// CREATE disposition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum CreateDisposition {
    Supersede = 0,
    #[default]
    Open = 1,
    Create = 2,
    OpenIf = 3,
    Overwrite = 4,
    OverwriteIf = 5,
}

impl TryFrom<u32> for CreateDisposition {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Supersede,
            1 => Self::Open,
            2 => Self::Create,
            3 => Self::OpenIf,
            4 => Self::Overwrite,
            5 => Self::OverwriteIf,
            _ => {
                return Err(crate::Error::parse(format!(
                    "Invalid create disposition: {}",
                    value
                )))
            }
        })
    }
}

bitflags! {
    /// CREATE options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CreateOptions: u32 {
        const DIRECTORY_FILE = 0x0000_0001;
        const WRITE_THROUGH = 0x0000_0002;
        const SEQUENTIAL_ONLY = 0x0000_0004;
        const NO_INTERMEDIATE_BUFFERING = 0x0000_0008;
        const SYNCHRONOUS_IO_ALERT = 0x0000_0010;
        const SYNCHRONOUS_IO_NONALERT = 0x0000_0020;
        const NON_DIRECTORY_FILE = 0x0000_0040;
        const COMPLETE_IF_OPLOCKED = 0x0000_0100;
        const NO_EA_KNOWLEDGE = 0x0000_0200;
        const RANDOM_ACCESS = 0x0000_0800;
        const DELETE_ON_CLOSE = 0x0000_1000;
        const OPEN_BY_FILE_ID = 0x0000_2000;
        const OPEN_FOR_BACKUP_INTENT = 0x0000_4000;
        const NO_COMPRESSION = 0x0000_8000;
        const OPEN_REPARSE_POINT = 0x0020_0000;
    }
}

/// CREATE reply actions
pub mod create_action {
    pub const SUPERSEDED: u32 = 0;
    pub const OPENED: u32 = 1;
    pub const CREATED: u32 = 2;
    pub const OVERWRITTEN: u32 = 3;
}

pub mod impersonation_level {
    pub const ANONYMOUS: u32 = 0;
    pub const IDENTIFICATION: u32 = 1;
    pub const IMPERSONATION: u32 = 2;
    pub const DELEGATE: u32 = 3;
}

pub mod oplock_level {
    pub const NONE: u8 = 0x00;
    pub const II: u8 = 0x01;
    pub const EXCLUSIVE: u8 = 0x08;
    pub const BATCH: u8 = 0x09;
    pub const LEASE: u8 = 0xFF;
}

bitflags! {
    /// CLOSE flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CloseFlags: u16 {
        const POSTQUERY_ATTRIB = 0x0001;
    }
}

bitflags! {
    /// LOCK element flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LockFlags: u32 {
        const SHARED = 0x0000_0001;
        const EXCLUSIVE = 0x0000_0002;
        const UNLOCK = 0x0000_0004;
        const FAIL_IMMEDIATELY = 0x0000_0010;
    }
}

bitflags! {
    /// QUERY_DIRECTORY flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryDirectoryFlags: u8 {
        const RESTART_SCANS = 0x01;
        const RETURN_SINGLE_ENTRY = 0x02;
        const INDEX_SPECIFIED = 0x04;
        const REOPEN = 0x10;
    }
}

bitflags! {
    /// CHANGE_NOTIFY completion filter
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NotifyFilter: u32 {
        const FILE_NAME = 0x0000_0001;
        const DIR_NAME = 0x0000_0002;
        const ATTRIBUTES = 0x0000_0004;
        const SIZE = 0x0000_0008;
        const LAST_WRITE = 0x0000_0010;
        const LAST_ACCESS = 0x0000_0020;
        const CREATION = 0x0000_0040;
        const EA = 0x0000_0080;
        const SECURITY = 0x0000_0100;
        const STREAM_NAME = 0x0000_0200;
        const STREAM_SIZE = 0x0000_0400;
        const STREAM_WRITE = 0x0000_0800;
    }
}

/// CHANGE_NOTIFY request flag
pub const CHANGE_NOTIFY_WATCH_TREE: u16 = 0x0001;

/// IOCTL control codes
pub mod fsctl {
    pub const DFS_GET_REFERRALS: u32 = 0x0006_0194;
    pub const PIPE_PEEK: u32 = 0x0011_400C;
    pub const PIPE_WAIT: u32 = 0x0011_0018;
    pub const PIPE_TRANSCEIVE: u32 = 0x0011_C017;
    pub const SET_REPARSE_POINT: u32 = 0x0009_00A4;
    pub const GET_REPARSE_POINT: u32 = 0x0009_00A8;
    pub const VALIDATE_NEGOTIATE_INFO: u32 = 0x0014_0204;
    pub const QUERY_NETWORK_INTERFACE_INFO: u32 = 0x0014_01FC;
}

/// IOCTL request flag: the control code is an FSCTL
pub const IOCTL_IS_FSCTL: u32 = 0x0000_0001;

/// QUERY_INFO / SET_INFO info types
pub mod info_type {
    pub const FILE: u8 = 0x01;
    pub const FILESYSTEM: u8 = 0x02;
    pub const SECURITY: u8 = 0x03;
    pub const QUOTA: u8 = 0x04;
}

/// File information classes (MS-FSCC 2.4)
pub mod file_info_class {
    pub const DIRECTORY: u8 = 1;
    pub const FULL_DIRECTORY: u8 = 2;
    pub const BOTH_DIRECTORY: u8 = 3;
    pub const BASIC: u8 = 4;
    pub const STANDARD: u8 = 5;
    pub const INTERNAL: u8 = 6;
    pub const EA: u8 = 7;
    pub const ACCESS: u8 = 8;
    pub const NAME: u8 = 9;
    pub const RENAME: u8 = 10;
    pub const NAMES: u8 = 12;
    pub const DISPOSITION: u8 = 13;
    pub const POSITION: u8 = 14;
    pub const MODE: u8 = 16;
    pub const ALIGNMENT: u8 = 17;
    pub const ALL: u8 = 18;
    pub const ALLOCATION: u8 = 19;
    pub const END_OF_FILE: u8 = 20;
    pub const STREAM: u8 = 22;
    pub const ID_BOTH_DIRECTORY: u8 = 37;
    pub const ID_FULL_DIRECTORY: u8 = 38;
}

/// File system information classes (MS-FSCC 2.5)
pub mod fs_info_class {
    pub const VOLUME: u8 = 1;
    pub const SIZE: u8 = 3;
    pub const DEVICE: u8 = 4;
    pub const ATTRIBUTE: u8 = 5;
    pub const FULL_SIZE: u8 = 7;
}

/// Security information selectors for QUERY_INFO(SECURITY)
pub mod security_information {
    pub const OWNER: u32 = 0x0000_0001;
    pub const GROUP: u32 = 0x0000_0002;
    pub const DACL: u32 = 0x0000_0004;
    pub const SACL: u32 = 0x0000_0008;
}

/// Reparse tags
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip_numbers() {
        for n in 0u16..=0x12 {
            let cmd = Smb2Command::try_from(n).unwrap();
            assert_eq!(cmd as u16, n);
        }
        assert!(Smb2Command::try_from(0x13).is_err());
    }

    #[test]
    fn test_tree_id_commands() {
        assert!(!Smb2Command::Negotiate.uses_tree_id());
        assert!(!Smb2Command::TreeConnect.uses_tree_id());
        assert!(!Smb2Command::Echo.uses_tree_id());
        assert!(Smb2Command::Create.uses_tree_id());
        assert!(Smb2Command::TreeDisconnect.uses_tree_id());
    }

    #[test]
    fn test_version_dialects() {
        assert_eq!(Version::Any.dialects().len(), 5);
        assert_eq!(Version::Any2.dialects(), vec![0x0202, 0x0210]);
        assert_eq!(Version::Any3.dialects(), vec![0x0300, 0x0302, 0x0311]);
        assert_eq!(Version::V0302.dialects(), vec![0x0302]);
        assert!(!Version::Any2.offers_encryption());
        assert!(Version::V0311.offers_encryption());
    }

    #[test]
    fn test_struct_sizes() {
        assert_eq!(Smb2Command::Create.request_struct_size(), 57);
        assert_eq!(Smb2Command::Create.reply_struct_size(), 89);
        assert_eq!(Smb2Command::SetInfo.reply_struct_size(), 2);
        assert_eq!(Smb2Command::Lock.request_struct_size(), 48);
    }
}
