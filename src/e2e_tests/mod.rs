//! Client and server roles of the engine talking over loopback TCP

mod client_server;
mod share;

use crate::connection::{Context, ContextConfig};
use crate::error::Result;
use crate::protocol::smb2_constants::Version;
use crate::server::{bind_and_listen, ServerConfig, ServerConnection};
use share::{TestShare, PASSWORD, USER};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

/// A server thread answering a fixed number of connections in turn.
pub(crate) struct TestServer {
    pub(crate) addr: String,
    thread: Option<JoinHandle<Result<()>>>,
}

impl TestServer {
    pub(crate) fn start(root: PathBuf) -> Self {
        Self::start_with(root, ServerConfig::default())
    }

    pub(crate) fn start_with(root: PathBuf, config: ServerConfig) -> Self {
        Self::serving(root, config, 1)
    }

    pub(crate) fn serving(root: PathBuf, config: ServerConfig, connections: usize) -> Self {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind_and_listen(any, 4).unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // the config holds Rc-based providers, so only its plain parts cross
        let version = config.version;
        let require_signing = config.require_signing;
        let allow_anonymous = config.allow_anonymous;
        let thread = thread::spawn(move || {
            for _ in 0..connections {
                let (stream, _) = listener.accept()?;
                let config = ServerConfig {
                    version,
                    require_signing,
                    allow_anonymous,
                    ..ServerConfig::default()
                };
                let mut conn =
                    ServerConnection::accept(stream, TestShare::new(root.clone()), config)?;
                conn.run()?;
            }
            Ok(())
        });
        Self {
            addr,
            thread: Some(thread),
        }
    }

    /// Wait for the connections to finish and return how they ended.
    pub(crate) fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap(),
            None => Ok(()),
        }
    }
}

pub(crate) fn client_config(version: Version) -> ContextConfig {
    ContextConfig::new()
        .version(version)
        .credentials(USER, PASSWORD, "WORKGROUP")
}

pub(crate) fn connected(server: &TestServer, share: &str, version: Version) -> Context {
    let mut ctx = Context::new(client_config(version));
    ctx.connect_share(&server.addr, share, None).unwrap();
    ctx
}
