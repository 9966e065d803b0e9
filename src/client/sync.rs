//! Blocking forms of the client operations
//!
//! Each call issues the async operation with a private callback that parks
//! the result in a shared slot, then polls the context's descriptor until
//! the slot is filled. A slot left behind by an abandoned wait is only
//! reachable from the callback, so a late completion writes into memory the
//! callback still owns.

use super::{Directory, FileHandle, OpenFlags, Stat, StatVfs, Whence};
use crate::connection::Context;
use crate::dcerpc::srvsvc::ShareInfo;
use crate::error::Result;
use crate::protocol::messages::file_info::FileNotifyInformation;
use crate::protocol::smb2_constants::NotifyFilter;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// Longest single poll; bounds how late a command timeout is noticed.
const POLL_INTERVAL_MS: i32 = 1000;

type Slot<T> = Rc<RefCell<Option<Result<T>>>>;

/// Issue an async operation and service the context until it completes.
pub(crate) fn wait<T, R, F>(ctx: &mut Context, issue: F) -> Result<T>
where
    T: 'static,
    F: FnOnce(&mut Context, Box<dyn FnOnce(&mut Context, Result<T>)>) -> Result<R>,
{
    let slot: Slot<T> = Rc::new(RefCell::new(None));
    let s = slot.clone();
    issue(
        ctx,
        Box::new(move |_, result| {
            *s.borrow_mut() = Some(result);
        }),
    )?;
    loop {
        if let Some(result) = slot.borrow_mut().take() {
            return result;
        }
        if let Err(e) = ctx.poll_once(POLL_INTERVAL_MS) {
            trace!(error = %e, "poll loop ended");
            // the failure may itself have completed the operation
            return slot.borrow_mut().take().unwrap_or(Err(e));
        }
    }
}

impl Context {
    pub fn connect_share(&mut self, server: &str, share: &str, user: Option<&str>) -> Result<()> {
        wait(self, |ctx, cb| ctx.connect_share_async(server, share, user, cb))
    }

    pub fn disconnect_share(&mut self) -> Result<()> {
        wait(self, |ctx, cb| ctx.disconnect_share_async(cb))
    }

    pub fn echo(&mut self) -> Result<()> {
        wait(self, |ctx, cb| ctx.echo_async(cb))
    }

    pub fn logoff(&mut self) -> Result<()> {
        wait(self, |ctx, cb| ctx.logoff_async(cb))
    }

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        wait(self, |ctx, cb| ctx.open_async(path, flags, cb))
    }

    pub fn close(&mut self, fh: &FileHandle) -> Result<()> {
        wait(self, |ctx, cb| ctx.close_async(fh, cb))
    }

    /// Read into `buf` at `offset`; returns the byte count, 0 at end of file.
    pub fn pread(&mut self, fh: &FileHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
        let count = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let data = wait(self, |ctx, cb| ctx.pread_async(fh, count, offset, cb))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    pub fn pwrite(&mut self, fh: &FileHandle, data: &[u8], offset: u64) -> Result<usize> {
        wait(self, |ctx, cb| ctx.pwrite_async(fh, data, offset, cb)).map(|n| n as usize)
    }

    pub fn read(&mut self, fh: &FileHandle, buf: &mut [u8]) -> Result<usize> {
        let count = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let data = wait(self, |ctx, cb| ctx.read_async(fh, count, cb))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    pub fn write(&mut self, fh: &FileHandle, data: &[u8]) -> Result<usize> {
        wait(self, |ctx, cb| ctx.write_async(fh, data, cb)).map(|n| n as usize)
    }

    pub fn lseek(&mut self, fh: &FileHandle, offset: i64, whence: Whence) -> Result<u64> {
        wait(self, |ctx, cb| ctx.lseek_async(fh, offset, whence, cb))
    }

    pub fn fsync(&mut self, fh: &FileHandle) -> Result<()> {
        wait(self, |ctx, cb| ctx.fsync_async(fh, cb))
    }

    pub fn fstat(&mut self, fh: &FileHandle) -> Result<Stat> {
        wait(self, |ctx, cb| ctx.fstat_async(fh, cb))
    }

    pub fn ftruncate(&mut self, fh: &FileHandle, length: u64) -> Result<()> {
        wait(self, |ctx, cb| ctx.ftruncate_async(fh, length, cb))
    }

    pub fn stat(&mut self, path: &str) -> Result<Stat> {
        wait(self, |ctx, cb| ctx.stat_async(path, cb))
    }

    pub fn truncate(&mut self, path: &str, length: u64) -> Result<()> {
        wait(self, |ctx, cb| ctx.truncate_async(path, length, cb))
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        wait(self, |ctx, cb| ctx.rename_async(old, new, cb))
    }

    pub fn unlink(&mut self, path: &str) -> Result<()> {
        wait(self, |ctx, cb| ctx.unlink_async(path, cb))
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        wait(self, |ctx, cb| ctx.mkdir_async(path, cb))
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        wait(self, |ctx, cb| ctx.rmdir_async(path, cb))
    }

    pub fn readlink(&mut self, path: &str) -> Result<String> {
        wait(self, |ctx, cb| ctx.readlink_async(path, cb))
    }

    pub fn statvfs(&mut self, path: &str) -> Result<StatVfs> {
        wait(self, |ctx, cb| ctx.statvfs_async(path, cb))
    }

    pub fn opendir(&mut self, path: &str) -> Result<Directory> {
        wait(self, |ctx, cb| ctx.opendir_async(path, cb))
    }

    pub fn notify_change(
        &mut self,
        path: &str,
        watch_tree: bool,
        filter: NotifyFilter,
    ) -> Result<Vec<FileNotifyInformation>> {
        wait(self, |ctx, cb| {
            ctx.notify_change_async(path, watch_tree, filter, cb)
        })
    }

    pub fn share_enum(&mut self) -> Result<Vec<ShareInfo>> {
        wait(self, |ctx, cb| ctx.share_enum_async(cb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ContextConfig;
    use crate::error::Error;

    #[test]
    fn test_issue_failure_returns_without_polling() {
        let mut ctx = Context::new(ContextConfig::default());
        let result: Result<()> = wait(&mut ctx, |_, _cb| -> Result<()> {
            Err(Error::InvalidParameter("rejected".into()))
        });
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_immediate_completion_skips_poll() {
        let mut ctx = Context::new(ContextConfig::default());
        let result = wait(&mut ctx, |ctx, cb| -> Result<()> {
            cb(ctx, Ok(7u32));
            Ok(())
        });
        assert_eq!(result.ok(), Some(7));
    }

    #[test]
    fn test_disconnected_context_surfaces_poll_error() {
        let mut ctx = Context::new(ContextConfig::default());
        let result: Result<()> = wait(&mut ctx, |_, _cb| -> Result<()> { Ok(()) });
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[test]
    fn test_lseek_set_is_synchronous() {
        let mut ctx = Context::new(ContextConfig::default());
        let fh = ctx.fh_from_file_id(Default::default());
        assert_eq!(ctx.lseek(&fh, 100, Whence::Set).ok(), Some(100));
        assert_eq!(ctx.lseek(&fh, -40, Whence::Cur).ok(), Some(60));
    }
}
