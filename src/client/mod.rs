//! Client command surface
//!
//! Every operation comes as an `*_async` method on [`Context`] that queues
//! its commands and completes through a callback fired from
//! [`Context::service`]. The blocking forms in [`sync`] drive the context
//! with `poll(2)` until that callback has run.
//!
//! An `*_async` method that returns `Err` has not queued anything and will
//! never invoke its callback.

mod connect;
mod dir;
mod file;
mod path;
pub mod sync;
mod url;

pub use dir::{DirEntry, Directory};
pub use file::{FileHandle, OpenFlags, Whence};
pub use url::SmbUrl;

use crate::protocol::messages::file_info::{
    filetime_to_datetime, filetime_to_unix, FileAllInformation, FileFsFullSizeInformation,
    FileIdFullDirectoryInformation, FileTimes,
};
use crate::protocol::smb2_constants::FileAttributes;
use chrono::{DateTime, Utc};

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    #[default]
    File,
    Directory,
    Link,
}

impl FileType {
    fn from_attributes(attrs: FileAttributes) -> Self {
        if attrs.contains(FileAttributes::REPARSE_POINT) {
            FileType::Link
        } else if attrs.contains(FileAttributes::DIRECTORY) {
            FileType::Directory
        } else {
            FileType::File
        }
    }
}

/// Seconds and nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    fn from_filetime(ft: u64) -> Self {
        let (sec, nsec) = filetime_to_unix(ft);
        Self { sec, nsec }
    }
}

/// File metadata as returned by `stat`/`fstat`/`readdir`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub file_type: FileType,
    pub nlink: u32,
    pub ino: u64,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub btime: Timespec,
    /// Raw FILETIME values, for callers that want `chrono` types
    times: FileTimes,
}

impl Stat {
    fn with_times(mut self, times: FileTimes) -> Self {
        self.atime = Timespec::from_filetime(times.last_access);
        self.mtime = Timespec::from_filetime(times.last_write);
        self.ctime = Timespec::from_filetime(times.change);
        self.btime = Timespec::from_filetime(times.creation);
        self.times = times;
        self
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        filetime_to_datetime(self.times.last_write)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        filetime_to_datetime(self.times.creation)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

impl From<&FileAllInformation> for Stat {
    fn from(info: &FileAllInformation) -> Self {
        Stat {
            file_type: FileType::from_attributes(info.basic.file_attributes),
            nlink: info.standard.number_of_links,
            ino: info.index_number,
            size: info.standard.end_of_file,
            ..Default::default()
        }
        .with_times(info.basic.times)
    }
}

impl From<&FileIdFullDirectoryInformation> for Stat {
    fn from(entry: &FileIdFullDirectoryInformation) -> Self {
        Stat {
            file_type: FileType::from_attributes(entry.file_attributes),
            ino: entry.file_id,
            size: entry.end_of_file,
            ..Default::default()
        }
        .with_times(entry.times)
    }
}

/// File system statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatVfs {
    pub bsize: u32,
    pub frsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub namemax: u32,
}

impl From<&FileFsFullSizeInformation> for StatVfs {
    fn from(info: &FileFsFullSizeInformation) -> Self {
        let unit = info
            .sectors_per_allocation_unit
            .saturating_mul(info.bytes_per_sector);
        StatVfs {
            bsize: unit,
            frsize: unit,
            blocks: info.total_allocation_units,
            bfree: info.actual_available_allocation_units,
            bavail: info.caller_available_allocation_units,
            namemax: 255,
        }
    }
}

/// Share-relative path in wire form: no leading separator, backslashes.
pub(crate) fn smb_path(path: &str) -> String {
    path.trim_start_matches(['/', '\\']).replace('/', "\\")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::file_info::{FileBasicInformation, FileStandardInformation};

    #[test]
    fn test_smb_path() {
        assert_eq!(smb_path("/dir/file.txt"), "dir\\file.txt");
        assert_eq!(smb_path("file"), "file");
        assert_eq!(smb_path("/"), "");
        assert_eq!(smb_path("\\a\\b"), "a\\b");
    }

    #[test]
    fn test_stat_from_all_information() {
        let info = FileAllInformation {
            basic: FileBasicInformation {
                times: FileTimes::all(116_444_736_000_000_000 + 10_000_000),
                file_attributes: FileAttributes::DIRECTORY,
            },
            standard: FileStandardInformation {
                end_of_file: 42,
                number_of_links: 1,
                ..Default::default()
            },
            index_number: 7,
            ..Default::default()
        };
        let st = Stat::from(&info);
        assert!(st.is_dir());
        assert_eq!(st.size, 42);
        assert_eq!(st.ino, 7);
        assert_eq!(st.mtime, Timespec { sec: 1, nsec: 0 });
        assert_eq!(st.modified().map(|d| d.timestamp()), Some(1));
    }

    #[test]
    fn test_statvfs_block_size() {
        let vfs = StatVfs::from(&FileFsFullSizeInformation {
            total_allocation_units: 100,
            caller_available_allocation_units: 40,
            actual_available_allocation_units: 50,
            sectors_per_allocation_unit: 8,
            bytes_per_sector: 512,
        });
        assert_eq!(vfs.bsize, 4096);
        assert_eq!(vfs.bavail, 40);
        assert_eq!(vfs.bfree, 50);
    }

    #[test]
    fn test_reparse_point_is_link() {
        assert_eq!(
            FileType::from_attributes(FileAttributes::REPARSE_POINT | FileAttributes::DIRECTORY),
            FileType::Link
        );
        assert_eq!(FileType::from_attributes(FileAttributes::ARCHIVE), FileType::File);
    }
}
