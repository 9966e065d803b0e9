use super::share::{DISK_SHARE, PASSWORD, USER};
use super::*;
use crate::client::{FileType, OpenFlags};
use crate::connection::{Context, ContextConfig};
use crate::dcerpc::srvsvc::share_type;
use crate::error::{Error, NtStatus};
use crate::protocol::smb2_constants::{dialect, Version};
use crate::transport::reactor;
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;
use tempfile::TempDir;

fn populated() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(dir.path().join("hello.bin"), &data).unwrap();
    fs::create_dir(dir.path().join("docs")).unwrap();
    fs::write(dir.path().join("docs").join("readme.txt"), b"read me").unwrap();
    dir
}

#[test]
fn test_connect_read_and_disconnect() {
    let dir = populated();
    let server = TestServer::start(dir.path().to_path_buf());
    let mut ctx = connected(&server, DISK_SHARE, Version::V0302);
    assert_eq!(ctx.dialect(), dialect::SMB3_02);
    assert_ne!(ctx.session_id(), 0);

    let fh = ctx.open("hello.bin", OpenFlags::READ).unwrap();
    assert_eq!(fh.end_of_file(), 10_000);
    let mut buf = vec![0u8; 4096];
    let n = ctx.pread(&fh, &mut buf, 0).unwrap();
    assert_eq!(n, 4096);
    assert_eq!(buf[250], 250);
    assert_eq!(buf[251], 0);

    // short read at the tail, then end of file
    let n = ctx.pread(&fh, &mut buf, 8192).unwrap();
    assert_eq!(n, 10_000 - 8192);
    assert_eq!(ctx.pread(&fh, &mut buf, 10_000).unwrap(), 0);

    ctx.close(&fh).unwrap();
    ctx.disconnect_share().unwrap();
    assert!(!ctx.is_connected());
    server.join().unwrap();
}

#[test]
fn test_highest_common_dialect_is_selected() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        version: Version::Any2,
        ..ServerConfig::default()
    };
    let server = TestServer::start_with(dir.path().to_path_buf(), config);
    let ctx = connected(&server, DISK_SHARE, Version::Any);
    assert_eq!(ctx.dialect(), dialect::SMB2_10);
    assert!(ctx.max_read_size() > 65536);
    drop(ctx);
    server.join().unwrap();
}

#[test]
fn test_write_then_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path().to_path_buf());
    let mut ctx = connected(&server, DISK_SHARE, Version::Any);

    let fh = ctx
        .open("new.txt", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE)
        .unwrap();
    assert_eq!(ctx.write(&fh, b"hello ").unwrap(), 6);
    assert_eq!(ctx.write(&fh, b"world").unwrap(), 5);
    assert_eq!(fh.offset(), 11);
    let mut buf = [0u8; 32];
    let n = ctx.pread(&fh, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"hello world");
    ctx.close(&fh).unwrap();

    assert_eq!(fs::read(dir.path().join("new.txt")).unwrap(), b"hello world");
    ctx.disconnect_share().unwrap();
    server.join().unwrap();
}

#[test]
fn test_compound_stat_and_unlink() {
    let dir = populated();
    let server = TestServer::start(dir.path().to_path_buf());
    let mut ctx = connected(&server, DISK_SHARE, Version::Any);

    // CREATE + QUERY_INFO + CLOSE on the related-operation file id
    let st = ctx.stat("hello.bin").unwrap();
    assert_eq!(st.size, 10_000);
    assert_eq!(st.file_type, FileType::File);
    let st = ctx.stat("docs").unwrap();
    assert_eq!(st.file_type, FileType::Directory);

    // a failed CREATE fails the rest of the chain with its own status
    assert!(matches!(
        ctx.stat("missing"),
        Err(Error::Status(NtStatus::OBJECT_NAME_NOT_FOUND))
    ));
    assert!(matches!(
        ctx.unlink("missing"),
        Err(Error::Status(NtStatus::OBJECT_NAME_NOT_FOUND))
    ));

    ctx.unlink("hello.bin").unwrap();
    assert!(!dir.path().join("hello.bin").exists());

    ctx.mkdir("made").unwrap();
    assert!(dir.path().join("made").is_dir());
    ctx.rmdir("made").unwrap();
    assert!(!dir.path().join("made").exists());

    ctx.disconnect_share().unwrap();
    server.join().unwrap();
}

#[test]
fn test_directory_listing() {
    let dir = populated();
    let server = TestServer::start(dir.path().to_path_buf());
    let mut ctx = connected(&server, DISK_SHARE, Version::Any);

    let mut listing = ctx.opendir("").unwrap();
    let names: Vec<String> = listing.entries().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec!["docs".to_string(), "hello.bin".to_string()]);
    let first = listing.readdir().unwrap();
    assert_eq!(first.stat.file_type, FileType::Directory);

    let docs = ctx.opendir("docs").unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs.entries()[0].stat.size, 7);
    docs.closedir();

    ctx.disconnect_share().unwrap();
    server.join().unwrap();
}

#[test]
fn test_share_enum_over_ipc() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path().to_path_buf());
    let mut ctx = connected(&server, "IPC$", Version::Any);

    let shares = ctx.share_enum().unwrap();
    assert_eq!(shares.len(), 2);
    assert_eq!(shares[0].name, DISK_SHARE);
    assert_eq!(shares[0].share_type, share_type::DISKTREE);
    assert_eq!(shares[1].name, "IPC$");
    assert!(shares[1].is_hidden());

    ctx.disconnect_share().unwrap();
    server.join().unwrap();
}

#[test]
fn test_bad_password_is_a_logon_failure() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path().to_path_buf());
    let config = ContextConfig::new().credentials("alice", "wrong", "WORKGROUP");
    let mut ctx = Context::new(config);
    let err = ctx.connect_share(&server.addr, DISK_SHARE, None).unwrap_err();
    assert!(matches!(err, Error::Status(NtStatus::LOGON_FAILURE)));
    drop(ctx);
    server.join().unwrap();
}

#[test]
fn test_failed_logon_then_retry_on_same_context() {
    let dir = populated();
    let server = TestServer::serving(dir.path().to_path_buf(), ServerConfig::default(), 2);
    let config = client_config(Version::Any).credentials(USER, "wrong", "WORKGROUP");
    let mut ctx = Context::new(config);
    let err = ctx.connect_share(&server.addr, DISK_SHARE, None).unwrap_err();
    assert!(matches!(err, Error::Status(NtStatus::LOGON_FAILURE)));
    assert_eq!(ctx.session_id(), 0);
    assert_eq!(ctx.dialect(), 0);

    ctx.config_mut().unwrap().password = PASSWORD.to_string();
    ctx.connect_share(&server.addr, DISK_SHARE, None).unwrap();
    assert_ne!(ctx.session_id(), 0);
    assert_eq!(ctx.stat("hello.bin").unwrap().size, 10_000);
    ctx.disconnect_share().unwrap();
    server.join().unwrap();
}

#[test]
fn test_reconnect_after_disconnect() {
    let dir = populated();
    let server = TestServer::serving(dir.path().to_path_buf(), ServerConfig::default(), 2);
    let mut ctx = connected(&server, DISK_SHARE, Version::V0302);
    let first_session = ctx.session_id();
    ctx.disconnect_share().unwrap();
    assert_eq!(ctx.session_id(), 0);
    assert!(ctx.tree_ids().is_empty());

    ctx.connect_share(&server.addr, DISK_SHARE, None).unwrap();
    assert_eq!(ctx.dialect(), dialect::SMB3_02);
    assert_ne!(ctx.session_id(), first_session);
    assert_eq!(ctx.tree_ids().len(), 1);
    let fh = ctx.open("hello.bin", OpenFlags::READ).unwrap();
    ctx.close(&fh).unwrap();
    ctx.disconnect_share().unwrap();
    server.join().unwrap();
}

#[test]
fn test_anonymous_logon_needs_server_consent() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path().to_path_buf());
    let mut ctx = Context::new(ContextConfig::new().credentials("", "", ""));
    let err = ctx.connect_share(&server.addr, DISK_SHARE, None).unwrap_err();
    assert!(matches!(err, Error::Status(NtStatus::LOGON_FAILURE)));
    drop(ctx);
    server.join().unwrap();

    let config = ServerConfig {
        allow_anonymous: true,
        ..ServerConfig::default()
    };
    let server = TestServer::start_with(dir.path().to_path_buf(), config);
    let mut ctx = Context::new(ContextConfig::new().credentials("", "", ""));
    ctx.connect_share(&server.addr, "IPC$", None).unwrap();
    assert_eq!(ctx.share_enum().unwrap().len(), 2);
    ctx.disconnect_share().unwrap();
    server.join().unwrap();
}

#[test]
fn test_unknown_share_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path().to_path_buf());
    let mut ctx = Context::new(client_config(Version::Any));
    let err = ctx.connect_share(&server.addr, "nope", None).unwrap_err();
    assert!(matches!(err, Error::Status(NtStatus::BAD_NETWORK_NAME)));
    drop(ctx);
    server.join().unwrap();
}

#[tokio::test]
async fn test_reactor_driven_connect_and_echo() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path().to_path_buf());
    let mut ctx = Context::new(client_config(Version::V0311));

    let connected: Rc<RefCell<Option<crate::Result<()>>>> = Rc::default();
    let c = connected.clone();
    ctx.connect_share_async(&server.addr, DISK_SHARE, None, move |_, r| {
        *c.borrow_mut() = Some(r)
    })
    .unwrap();
    reactor::drive(&mut ctx, |_| connected.borrow().is_some())
        .await
        .unwrap();
    assert!(connected.borrow_mut().take().unwrap().is_ok());
    assert_eq!(ctx.dialect(), dialect::SMB3_11);

    let echoed: Rc<RefCell<Option<crate::Result<()>>>> = Rc::default();
    let e = echoed.clone();
    ctx.echo_async(move |_, r| *e.borrow_mut() = Some(r)).unwrap();
    reactor::drive(&mut ctx, |_| echoed.borrow().is_some())
        .await
        .unwrap();
    assert!(echoed.borrow_mut().take().unwrap().is_ok());

    drop(ctx);
    server.join().unwrap();
}
