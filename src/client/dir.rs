//! Directory listing and change notification

use super::{smb_path, Stat};
use crate::connection::{close_then, Chain, Context, Pdu};
use crate::error::{NtStatus, Result};
use crate::protocol::messages::file_info::{
    parse_id_full_directory, parse_notify_chain, FileNotifyInformation,
};
use crate::protocol::messages::{
    FileId, Smb2ChangeNotifyRequest, Smb2ChangeNotifyResponse, Smb2CreateRequest,
    Smb2CreateResponse, Smb2QueryDirectoryRequest, Smb2QueryDirectoryResponse,
};
use crate::protocol::smb2_constants::{
    CreateOptions, DesiredAccess, NotifyFilter, ShareAccess, CHANGE_NOTIFY_WATCH_TREE,
};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// One entry of a listed directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: Stat,
}

/// A directory read in full at open time, walked with a cursor.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    entries: Vec<DirEntry>,
    pos: usize,
}

impl Directory {
    pub(crate) fn new(entries: Vec<DirEntry>) -> Self {
        Self { entries, pos: 0 }
    }

    /// Next entry, or `None` at the end.
    pub fn readdir(&mut self) -> Option<&DirEntry> {
        let entry = self.entries.get(self.pos)?;
        self.pos += 1;
        Some(entry)
    }

    pub fn rewinddir(&mut self) {
        self.pos = 0;
    }

    pub fn telldir(&self) -> usize {
        self.pos
    }

    /// Move the cursor; positions past the end read as end of directory.
    pub fn seekdir(&mut self, pos: usize) {
        self.pos = pos.min(self.entries.len());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Release the listing. The server handle was closed by `opendir`, so
    /// this never touches the connection.
    pub fn closedir(self) {}
}

fn open_dir_request(path: &str) -> Smb2CreateRequest {
    let mut req = Smb2CreateRequest::new(smb_path(path));
    req.desired_access = DesiredAccess::FILE_LIST_DIRECTORY | DesiredAccess::FILE_READ_ATTRIBUTES;
    req.share_access = ShareAccess::READ | ShareAccess::WRITE | ShareAccess::DELETE;
    req.create_options = CreateOptions::DIRECTORY_FILE;
    req
}

type Listing = Rc<RefCell<Vec<DirEntry>>>;

impl Context {
    /// Open `path` and read every entry; the handle is closed before the
    /// callback runs. `.` and `..` are included as the server reports them.
    pub fn opendir_async(
        &mut self,
        path: &str,
        callback: impl FnOnce(&mut Context, Result<Directory>) + 'static,
    ) -> Result<()> {
        let done = Chain::new(callback);
        let next = done.clone();
        let pdu = Pdu::new(&open_dir_request(path), move |ctx, result| {
            match result.and_then(|reply| reply.decode::<Smb2CreateResponse>()) {
                Ok(rep) => {
                    let listing: Listing = Rc::default();
                    ctx.query_directory_round(rep.file_id, listing, next);
                }
                Err(e) => next.finish(ctx, Err(e)),
            }
        })?;
        self.queue(pdu)?;
        Ok(())
    }

    fn query_directory_round(&mut self, file_id: FileId, listing: Listing, done: Chain<Directory>) {
        let next = done.clone();
        done.step(self, move |ctx| {
            let req = Smb2QueryDirectoryRequest::new(file_id, "*");
            let pdu = Pdu::new(&req, move |ctx, result| {
                let reply = match result {
                    Ok(reply) => reply,
                    Err(e) => return close_then(ctx, file_id, None, next, Err(e)),
                };
                if reply.status() == NtStatus::NO_MORE_FILES {
                    let entries = std::mem::take(&mut *listing.borrow_mut());
                    debug!(entries = entries.len(), "directory listed");
                    return close_then(ctx, file_id, None, next, Ok(Directory::new(entries)));
                }
                let parsed = reply
                    .decode::<Smb2QueryDirectoryResponse>()
                    .and_then(|rep| parse_id_full_directory(&rep.output_buffer));
                match parsed {
                    Ok(batch) => {
                        listing
                            .borrow_mut()
                            .extend(batch.iter().map(|info| DirEntry {
                                name: info.name.clone(),
                                stat: Stat::from(info),
                            }));
                        ctx.query_directory_round(file_id, listing, next);
                    }
                    Err(e) => close_then(ctx, file_id, None, next, Err(e)),
                }
            })?;
            ctx.queue(pdu)?;
            Ok(())
        });
    }

    /// Wait for one batch of changes under `path`. The server holds the
    /// request until something changes; the handle is closed afterwards.
    pub fn notify_change_async(
        &mut self,
        path: &str,
        watch_tree: bool,
        filter: NotifyFilter,
        callback: impl FnOnce(&mut Context, Result<Vec<FileNotifyInformation>>) + 'static,
    ) -> Result<()> {
        let done = Chain::new(callback);
        let next = done.clone();
        let pdu = Pdu::new(&open_dir_request(path), move |ctx, result| {
            let file_id = match result.and_then(|reply| reply.decode::<Smb2CreateResponse>()) {
                Ok(rep) => rep.file_id,
                Err(e) => return next.finish(ctx, Err(e)),
            };
            let after = next.clone();
            next.step(ctx, move |ctx| {
                let req = Smb2ChangeNotifyRequest {
                    flags: if watch_tree { CHANGE_NOTIFY_WATCH_TREE } else { 0 },
                    output_buffer_length: 65535,
                    file_id,
                    completion_filter: filter,
                };
                let pdu = Pdu::new(&req, move |ctx, result| {
                    let changes = result.and_then(|reply| {
                        if reply.status() == NtStatus::NOTIFY_ENUM_DIR {
                            return Ok(Vec::new());
                        }
                        let rep: Smb2ChangeNotifyResponse = reply.decode()?;
                        parse_notify_chain(&rep.output_buffer)
                    });
                    close_then(ctx, file_id, None, after, changes);
                })?;
                ctx.queue(pdu)?;
                Ok(())
            });
        })?;
        self.queue(pdu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(names: &[&str]) -> Directory {
        Directory::new(
            names
                .iter()
                .map(|n| DirEntry {
                    name: n.to_string(),
                    stat: Stat::default(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_readdir_walks_then_ends() {
        let mut d = dir(&[".", "..", "a.txt"]);
        assert_eq!(d.readdir().map(|e| e.name.as_str()), Some("."));
        assert_eq!(d.readdir().map(|e| e.name.as_str()), Some(".."));
        assert_eq!(d.readdir().map(|e| e.name.as_str()), Some("a.txt"));
        assert!(d.readdir().is_none());
        assert_eq!(d.telldir(), 3);
    }

    #[test]
    fn test_seekdir_rewinddir() {
        let mut d = dir(&["x", "y", "z"]);
        d.seekdir(2);
        assert_eq!(d.readdir().map(|e| e.name.as_str()), Some("z"));
        d.seekdir(10);
        assert_eq!(d.telldir(), 3);
        assert!(d.readdir().is_none());
        d.rewinddir();
        assert_eq!(d.readdir().map(|e| e.name.as_str()), Some("x"));
    }

    #[test]
    fn test_open_dir_request() {
        let req = open_dir_request("/sub/dir");
        assert_eq!(req.name, "sub\\dir");
        assert!(req.create_options.contains(CreateOptions::DIRECTORY_FILE));
        assert!(req
            .desired_access
            .contains(DesiredAccess::FILE_LIST_DIRECTORY));
    }
}
